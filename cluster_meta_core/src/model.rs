//! Cluster topology model
//!
//! Addresses, replicas, instances and the versioned [`ClusterMeta`] root
//! aggregate, plus the event payloads delivered by the instance directory.
//! All mutation rules that decide whether the version moves live here so
//! they can be exercised without any I/O.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::net::{IpAddr, SocketAddr};

use crate::error::{MetaError, Result};

/// Upper bound accepted for the per-instance failover timers.
pub const MAX_TUNING_MS: u64 = 24 * 60 * 60 * 1000;

/// Reachable endpoint. Port is never 0 and the IP always parses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "RawAddress", into = "RawAddress")]
pub struct Address {
    ip: IpAddr,
    port: u16,
}

/// Unchecked address as it arrives from callers and from persisted JSON.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawAddress {
    pub ip: String,
    pub port: u32,
}

impl Address {
    pub fn new(ip: &str, port: u32) -> Result<Self> {
        let ip: IpAddr = ip
            .trim()
            .parse()
            .map_err(|_| MetaError::Validation(format!("illegal ip address {:?}", ip)))?;
        if port == 0 || port > u16::MAX as u32 {
            return Err(MetaError::Validation(format!("illegal port {}", port)));
        }
        Ok(Self { ip, port: port as u16 })
    }

    pub fn ip(&self) -> IpAddr {
        self.ip
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.ip, self.port)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.socket_addr())
    }
}

impl TryFrom<RawAddress> for Address {
    type Error = MetaError;

    fn try_from(raw: RawAddress) -> Result<Self> {
        Address::new(&raw.ip, raw.port)
    }
}

impl From<Address> for RawAddress {
    fn from(addr: Address) -> Self {
        RawAddress {
            ip: addr.ip.to_string(),
            port: addr.port as u32,
        }
    }
}

/// A replica as last observed by the instance directory.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Replica {
    pub addr: Address,
    pub available: bool,
}

impl Replica {
    pub fn new(addr: Address, available: bool) -> Self {
        Self { addr, available }
    }
}

/// One master/replica group tracked by the quorum layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Instance {
    pub name: String,
    pub master: Option<Address>,
    #[serde(default)]
    pub replicas: Vec<Replica>,
    #[serde(default)]
    pub epoch: u64,
    #[serde(default)]
    pub subjective_down_timeout_ms: u64,
    #[serde(default)]
    pub failover_timeout_ms: u64,
}

impl Instance {
    pub fn new(name: impl Into<String>, master: Option<Address>) -> Self {
        Self {
            name: name.into(),
            master,
            replicas: Vec::new(),
            epoch: 0,
            subjective_down_timeout_ms: 0,
            failover_timeout_ms: 0,
        }
    }

    pub fn with_replicas(mut self, replicas: Vec<Replica>) -> Self {
        self.replicas = replicas;
        self
    }

    /// Drop every replica the directory reported as unavailable.
    pub fn retain_available(&mut self) {
        self.replicas.retain(|replica| replica.available);
    }

    /// Value equality over the parts reconciliation cares about: the master
    /// address and the replica set, regardless of replica order.
    pub fn same_topology(&self, other: &Instance) -> bool {
        if self.name != other.name || self.master != other.master {
            return false;
        }
        if self.replicas.len() != other.replicas.len() {
            return false;
        }
        let mut mine = self.replicas.clone();
        let mut theirs = other.replicas.clone();
        mine.sort();
        theirs.sort();
        mine == theirs
    }

    /// No master and no replicas left: the instance is retired from the topology.
    pub fn is_retired(&self) -> bool {
        self.master.is_none() && self.replicas.is_empty()
    }
}

impl fmt::Display for Instance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let master = self
            .master
            .map(|addr| addr.to_string())
            .unwrap_or_else(|| "-".to_string());
        write!(
            f,
            "{}{{master:{}, replicas:{}}}",
            self.name,
            master,
            self.replicas.len()
        )
    }
}

/// Role of an endpoint named in a subjective-down notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    Master,
    Replica,
}

/// Master promotion for a named instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MasterSwitchInfo {
    pub name: String,
    pub old_master: Option<Address>,
    pub new_master: Address,
}

/// A single observer believes `addr` (acting as `role` for `name`) is unreachable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SdownInfo {
    pub name: String,
    pub role: Role,
    pub addr: Address,
}

/// Result of applying a subjective-down notification to the snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SdownOutcome {
    /// No instance with that name is tracked.
    UnknownInstance,
    /// The address does not match the instance's master or any replica.
    NoMatch,
    /// The endpoint was removed and the instance kept.
    Reduced,
    /// The endpoint was the last one; the instance was deleted.
    Retired,
}

impl SdownOutcome {
    pub fn changed(self) -> bool {
        matches!(self, SdownOutcome::Reduced | SdownOutcome::Retired)
    }
}

/// Persisted list of the instance names held in a snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceNameList {
    pub list: Vec<String>,
}

/// Versioned topology snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterMeta {
    pub version: u32,
    pub instances: HashMap<String, Instance>,
}

impl ClusterMeta {
    pub fn new() -> Self {
        Self::default()
    }

    /// Version the next mutation will carry. Fails once the counter is
    /// exhausted so a change is never published under a repeated version.
    fn next_version(&self) -> Result<u32> {
        self.version
            .checked_add(1)
            .ok_or(MetaError::VersionExhausted(self.version))
    }

    pub fn get(&self, name: &str) -> Option<&Instance> {
        self.instances.get(name)
    }

    /// Whether `candidate` differs from what is currently tracked under its name.
    pub fn needs_update(&self, candidate: &Instance) -> bool {
        match self.instances.get(&candidate.name) {
            Some(existing) => !existing.same_topology(candidate),
            None => true,
        }
    }

    /// Apply staged reconciliation changes. Each candidate is compared again
    /// against the current entry so a decision is never based on a read taken
    /// outside this call. Bumps the version once if anything was applied.
    pub fn merge_changed(&mut self, candidates: Vec<Instance>) -> Result<usize> {
        let changed: Vec<Instance> = candidates
            .into_iter()
            .filter(|candidate| self.needs_update(candidate))
            .collect();
        if changed.is_empty() {
            return Ok(0);
        }
        let version = self.next_version()?;

        let applied = changed.len();
        for instance in changed {
            self.instances.insert(instance.name.clone(), instance);
        }
        self.version = version;
        Ok(applied)
    }

    /// Install `new_master` for `name` and replace its replicas with the
    /// available subset of `replicas`. Returns false when the instance is
    /// unknown or already has exactly this topology.
    pub fn switch_master(&mut self, name: &str, new_master: Address, replicas: Vec<Replica>) -> Result<bool> {
        let candidate = match self.instances.get(name) {
            Some(existing) => Instance {
                master: Some(new_master),
                replicas: replicas.into_iter().filter(|r| r.available).collect(),
                ..existing.clone()
            },
            None => return Ok(false),
        };
        if !self.needs_update(&candidate) {
            return Ok(false);
        }
        let version = self.next_version()?;

        self.instances.insert(candidate.name.clone(), candidate);
        self.version = version;
        Ok(true)
    }

    /// Remove the endpoint named by `info`, retiring the instance when nothing
    /// reachable is left.
    pub fn mark_subjectively_down(&mut self, info: &SdownInfo) -> Result<SdownOutcome> {
        let instance = match self.instances.get(&info.name) {
            Some(instance) => instance,
            None => return Ok(SdownOutcome::UnknownInstance),
        };

        let mut reduced = instance.clone();
        let removed = match info.role {
            Role::Master => {
                if reduced.master == Some(info.addr) {
                    reduced.master = None;
                    true
                } else {
                    false
                }
            }
            Role::Replica => match reduced.replicas.iter().position(|r| r.addr == info.addr) {
                Some(idx) => {
                    reduced.replicas.remove(idx);
                    true
                }
                None => false,
            },
        };
        if !removed {
            return Ok(SdownOutcome::NoMatch);
        }
        let version = self.next_version()?;

        let outcome = if reduced.is_retired() {
            self.instances.remove(&info.name);
            SdownOutcome::Retired
        } else {
            self.instances.insert(info.name.clone(), reduced);
            SdownOutcome::Reduced
        };
        self.version = version;
        Ok(outcome)
    }

    pub fn instance_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.instances.keys().cloned().collect();
        names.sort();
        names
    }
}

/// Instance definition submitted by an administrator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawInstance {
    pub name: String,
    pub addr: RawAddress,
    #[serde(default)]
    pub epoch: u64,
    pub subjective_down_timeout_ms: u64,
    pub failover_timeout_ms: u64,
}

impl RawInstance {
    /// Check the definition and return its parsed master address.
    pub fn validate(&self) -> Result<Address> {
        let name = self.name.trim();
        if name.is_empty() {
            return Err(MetaError::Validation("instance name is empty".to_string()));
        }
        if name.len() != self.name.len() || name.chars().any(char::is_whitespace) {
            return Err(MetaError::Validation(format!(
                "instance name {:?} contains whitespace",
                self.name
            )));
        }
        if self.subjective_down_timeout_ms == 0 || self.subjective_down_timeout_ms > MAX_TUNING_MS {
            return Err(MetaError::Validation(format!(
                "subjective down timeout {}ms out of range (1..={})",
                self.subjective_down_timeout_ms, MAX_TUNING_MS
            )));
        }
        if self.failover_timeout_ms == 0 || self.failover_timeout_ms > MAX_TUNING_MS {
            return Err(MetaError::Validation(format!(
                "failover timeout {}ms out of range (1..={})",
                self.failover_timeout_ms, MAX_TUNING_MS
            )));
        }
        Address::try_from(self.addr.clone())
    }
}
