//! Sentinel-backed instance directory
//!
//! Queries go to the first reachable sentinel; administrative commands are
//! applied on every known sentinel. Each watch runs on its own connection,
//! subscribed to one event channel, and reconnects to the next known
//! sentinel when that connection drops.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{event_channel, EventSender, EventSubscription, InstanceDirectory};
use crate::config::SentinelConfig;
use crate::error::{MetaError, Result};
use crate::model::{Address, Instance, MasterSwitchInfo, RawInstance, Replica, Role, SdownInfo};
use crate::resp::{RespConnection, RespValue};

pub const SWITCH_MASTER_CHANNEL: &str = "+switch-master";
pub const SDOWN_CHANNEL: &str = "+sdown";

const DOWN_FLAGS: [&str; 3] = ["s_down", "o_down", "disconnected"];

#[derive(Debug, Clone)]
struct ConnectSettings {
    connect_timeout: Duration,
    command_timeout: Duration,
    reconnect_delay: Duration,
}

impl ConnectSettings {
    async fn open(&self, addr: &str) -> Result<RespConnection> {
        RespConnection::connect(addr, self.connect_timeout, self.command_timeout).await
    }
}

pub struct SentinelDirectory {
    sentinels: Arc<RwLock<Vec<String>>>,
    settings: ConnectSettings,
    quorum: u32,
    queue_capacity: usize,
    shutdown: CancellationToken,
    watchers: Mutex<Vec<JoinHandle<()>>>,
}

impl SentinelDirectory {
    pub fn new(config: &SentinelConfig) -> Self {
        Self {
            sentinels: Arc::new(RwLock::new(config.addresses.clone())),
            settings: ConnectSettings {
                connect_timeout: config.connect_timeout(),
                command_timeout: config.command_timeout(),
                reconnect_delay: config.reconnect_delay(),
            },
            quorum: config.quorum,
            queue_capacity: config.event_queue_capacity,
            shutdown: CancellationToken::new(),
            watchers: Mutex::new(Vec::new()),
        }
    }

    /// Sentinels currently used for commands, seeds first.
    pub async fn known_sentinels(&self) -> Vec<String> {
        self.sentinels.read().await.clone()
    }

    /// Run a read-only command on the first sentinel that answers.
    async fn query(&self, args: &[&str]) -> Result<RespValue> {
        let sentinels = self.known_sentinels().await;
        let mut last_err = MetaError::Directory("no sentinel configured".to_string());
        for addr in &sentinels {
            let mut conn = match self.settings.open(addr).await {
                Ok(conn) => conn,
                Err(e) => {
                    warn!("sentinel {} unreachable: {}", addr, e);
                    last_err = e;
                    continue;
                }
            };
            return match conn.command(args).await? {
                RespValue::Error(e) => Err(MetaError::Directory(e)),
                reply => Ok(reply),
            };
        }
        Err(last_err)
    }

    /// Run a sequence of commands on every known sentinel, stopping at the
    /// first failure and returning the sentinel's error as is.
    async fn broadcast(&self, commands: &[Vec<String>]) -> Result<()> {
        let sentinels = self.known_sentinels().await;
        if sentinels.is_empty() {
            return Err(MetaError::Directory("no sentinel configured".to_string()));
        }
        for addr in &sentinels {
            let mut conn = self.settings.open(addr).await?;
            for args in commands {
                match conn.command(args).await? {
                    RespValue::Error(e) => {
                        warn!("sentinel {} rejected {:?}: {}", addr, args, e);
                        return Err(MetaError::Directory(e));
                    }
                    reply => debug!("sentinel {} {:?} -> {:?}", addr, args, reply),
                }
            }
        }
        Ok(())
    }

    async fn subscribe<T, F>(&self, channel: &'static str, parse: F) -> Result<EventSubscription<T>>
    where
        T: Send + 'static,
        F: Fn(&str) -> Result<Option<T>> + Send + Sync + 'static,
    {
        let conn = open_subscription(&self.settings, &self.known_sentinels().await, channel).await?;
        let (sender, subscription) = event_channel(self.queue_capacity, self.shutdown.child_token());
        let task = tokio::spawn(run_subscription(
            self.sentinels.clone(),
            self.settings.clone(),
            channel,
            conn,
            sender,
            parse,
        ));
        self.watchers.lock().await.push(task);
        info!("subscribed to sentinel channel {}", channel);
        Ok(subscription)
    }
}

#[async_trait::async_trait]
impl InstanceDirectory for SentinelDirectory {
    async fn get_instances(&self) -> Result<Vec<Instance>> {
        let masters = self.query(&["SENTINEL", "MASTERS"]).await?;
        let masters = masters
            .into_array()
            .ok_or_else(|| MetaError::Protocol("SENTINEL MASTERS did not return an array".to_string()))?;

        let mut instances = Vec::with_capacity(masters.len());
        for entry in masters {
            let mut instance = parse_master(&field_map(entry))?;
            instance.replicas = self.get_replicas_of(&instance.name).await?;
            instances.push(instance);
        }
        Ok(instances)
    }

    async fn discover_sentinels(&self, name: &str, seeds: &[String]) -> Result<()> {
        let peers = self.query(&["SENTINEL", "SENTINELS", name]).await?;
        let peers = peers
            .into_array()
            .ok_or_else(|| MetaError::Protocol("SENTINEL SENTINELS did not return an array".to_string()))?;

        let mut sentinels = self.sentinels.write().await;
        for peer in peers {
            let fields = field_map(peer);
            let (ip, port) = match (fields.get("ip"), fields.get("port")) {
                (Some(ip), Some(port)) => (ip, port),
                _ => continue,
            };
            if seeds.iter().any(|seed| seed == ip) {
                continue;
            }
            let addr = format!("{}:{}", ip, port);
            if !sentinels.contains(&addr) {
                info!("discovered sentinel {} monitoring {}", addr, name);
                sentinels.push(addr);
            }
        }
        Ok(())
    }

    async fn get_replicas_of(&self, name: &str) -> Result<Vec<Replica>> {
        let reply = self.query(&["SENTINEL", "SLAVES", name]).await?;
        let entries = reply
            .into_array()
            .ok_or_else(|| MetaError::Protocol("SENTINEL SLAVES did not return an array".to_string()))?;
        entries.into_iter().map(|entry| parse_replica(&field_map(entry))).collect()
    }

    async fn watch_master_switch(&self) -> Result<EventSubscription<MasterSwitchInfo>> {
        self.subscribe(SWITCH_MASTER_CHANNEL, |payload| parse_switch_master(payload).map(Some))
            .await
    }

    async fn watch_subjective_down(&self) -> Result<EventSubscription<SdownInfo>> {
        self.subscribe(SDOWN_CHANNEL, parse_sdown).await
    }

    async fn add_instance(&self, raw: &RawInstance) -> Result<()> {
        let master = raw.validate()?;
        let name = raw.name.clone();
        let commands = vec![
            vec![
                "SENTINEL".to_string(),
                "MONITOR".to_string(),
                name.clone(),
                master.ip().to_string(),
                master.port().to_string(),
                self.quorum.to_string(),
            ],
            vec![
                "SENTINEL".to_string(),
                "SET".to_string(),
                name,
                "down-after-milliseconds".to_string(),
                raw.subjective_down_timeout_ms.to_string(),
                "failover-timeout".to_string(),
                raw.failover_timeout_ms.to_string(),
            ],
        ];
        self.broadcast(&commands).await
    }

    async fn remove_instance(&self, name: &str) -> Result<()> {
        let commands = vec![vec!["SENTINEL".to_string(), "REMOVE".to_string(), name.to_string()]];
        self.broadcast(&commands).await
    }

    async fn close(&self) {
        self.shutdown.cancel();
        let tasks: Vec<JoinHandle<()>> = self.watchers.lock().await.drain(..).collect();
        for task in tasks {
            if let Err(e) = task.await {
                warn!("sentinel subscription task ended abnormally: {}", e);
            }
        }
        info!("sentinel directory closed");
    }
}

/// Connect to the first reachable sentinel and subscribe to `channel`.
async fn open_subscription(settings: &ConnectSettings, sentinels: &[String], channel: &str) -> Result<RespConnection> {
    let mut last_err = MetaError::Directory("no sentinel configured".to_string());
    for addr in sentinels {
        match subscribe_on(settings, addr, channel).await {
            Ok(conn) => return Ok(conn),
            Err(e) => {
                warn!("cannot subscribe to {} on {}: {}", channel, addr, e);
                last_err = e;
            }
        }
    }
    Err(last_err)
}

async fn subscribe_on(settings: &ConnectSettings, addr: &str, channel: &str) -> Result<RespConnection> {
    let mut conn = settings.open(addr).await?;
    // SUBSCRIBE is acknowledged with ["subscribe", channel, count].
    match conn.command(&["SUBSCRIBE", channel]).await? {
        RespValue::Array(items) if items.first().and_then(RespValue::as_str) == Some("subscribe") => Ok(conn),
        RespValue::Error(e) => Err(MetaError::Directory(e)),
        other => Err(MetaError::Protocol(format!("unexpected SUBSCRIBE reply: {:?}", other))),
    }
}

/// Pump pushed messages into the queue until the subscription is closed,
/// reconnecting after `reconnect_delay` whenever the connection drops.
async fn run_subscription<T, F>(
    sentinels: Arc<RwLock<Vec<String>>>,
    settings: ConnectSettings,
    channel: &'static str,
    conn: RespConnection,
    sender: EventSender<T>,
    parse: F,
) where
    T: Send + 'static,
    F: Fn(&str) -> Result<Option<T>> + Send + Sync + 'static,
{
    let mut conn = Some(conn);
    let mut next_sentinel = 0usize;

    loop {
        if let Some(mut active) = conn.take() {
            match pump(&mut active, channel, &sender, &parse).await {
                Ok(()) => break,
                Err(e) => warn!("subscription to {} on {} lost: {}", channel, active.peer(), e),
            }
        }

        tokio::select! {
            _ = tokio::time::sleep(settings.reconnect_delay) => {}
            _ = sender.closed() => break,
        }

        let candidates = sentinels.read().await.clone();
        if candidates.is_empty() {
            continue;
        }
        let addr = &candidates[next_sentinel % candidates.len()];
        next_sentinel = next_sentinel.wrapping_add(1);
        match subscribe_on(&settings, addr, channel).await {
            Ok(fresh) => {
                info!("resubscribed to {} on {}", channel, addr);
                conn = Some(fresh);
            }
            Err(e) => warn!("resubscribe to {} on {} failed: {}", channel, addr, e),
        }
    }
    debug!("subscription to {} finished", channel);
}

/// Returns `Ok` when the subscriber side went away and `Err` when the
/// connection failed.
async fn pump<T, F>(conn: &mut RespConnection, channel: &str, sender: &EventSender<T>, parse: &F) -> Result<()>
where
    T: Send,
    F: Fn(&str) -> Result<Option<T>>,
{
    loop {
        let pushed = tokio::select! {
            pushed = conn.next_push() => pushed?,
            _ = sender.closed() => return Ok(()),
        };
        let payload = match pushed {
            Some(value) => match message_payload(value, channel) {
                Some(payload) => payload,
                None => continue,
            },
            None => {
                return Err(MetaError::Io(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "sentinel closed the connection",
                )))
            }
        };
        match parse(&payload) {
            Ok(Some(event)) => {
                if !sender.send(event).await {
                    return Ok(());
                }
            }
            Ok(None) => debug!("ignoring {} event {:?}", channel, payload),
            Err(e) => warn!("dropping malformed {} event {:?}: {}", channel, payload, e),
        }
    }
}

/// Extract the payload of a `["message", channel, payload]` push.
fn message_payload(value: RespValue, channel: &str) -> Option<String> {
    let items = value.into_array()?;
    match items.as_slice() {
        [kind, from, payload] if kind.as_str() == Some("message") && from.as_str() == Some(channel) => {
            payload.as_str().map(str::to_string)
        }
        _ => None,
    }
}

fn field_map(value: RespValue) -> HashMap<String, String> {
    value.into_pairs().into_iter().collect()
}

fn required<'a>(fields: &'a HashMap<String, String>, key: &str) -> Result<&'a str> {
    fields
        .get(key)
        .map(String::as_str)
        .ok_or_else(|| MetaError::Protocol(format!("sentinel reply is missing {:?}", key)))
}

fn numeric<N: std::str::FromStr>(fields: &HashMap<String, String>, key: &str) -> Result<N> {
    let raw = required(fields, key)?;
    raw.parse()
        .map_err(|_| MetaError::Protocol(format!("field {:?} is not a number: {:?}", key, raw)))
}

fn address(fields: &HashMap<String, String>) -> Result<Address> {
    Address::new(required(fields, "ip")?, numeric(fields, "port")?)
}

fn is_down(fields: &HashMap<String, String>) -> bool {
    fields
        .get("flags")
        .map(|flags| flags.split(',').any(|flag| DOWN_FLAGS.contains(&flag)))
        .unwrap_or(false)
}

/// One entry of `SENTINEL MASTERS`. A master flagged down has no address.
fn parse_master(fields: &HashMap<String, String>) -> Result<Instance> {
    let name = required(fields, "name")?;
    let master = if is_down(fields) { None } else { Some(address(fields)?) };
    let mut instance = Instance::new(name, master);
    instance.epoch = numeric(fields, "config-epoch").unwrap_or(0);
    instance.subjective_down_timeout_ms = numeric(fields, "down-after-milliseconds").unwrap_or(0);
    instance.failover_timeout_ms = numeric(fields, "failover-timeout").unwrap_or(0);
    Ok(instance)
}

/// One entry of `SENTINEL SLAVES`.
fn parse_replica(fields: &HashMap<String, String>) -> Result<Replica> {
    let link_ok = fields.get("master-link-status").map(String::as_str) == Some("ok");
    Ok(Replica::new(address(fields)?, link_ok && !is_down(fields)))
}

/// `<name> <old-ip> <old-port> <new-ip> <new-port>`
pub fn parse_switch_master(payload: &str) -> Result<MasterSwitchInfo> {
    let parts: Vec<&str> = payload.split_whitespace().collect();
    let [name, old_ip, old_port, new_ip, new_port] = parts.as_slice() else {
        return Err(MetaError::Protocol(format!("malformed +switch-master payload {:?}", payload)));
    };
    Ok(MasterSwitchInfo {
        name: name.to_string(),
        old_master: parse_port(old_port).and_then(|port| Address::new(old_ip, port).ok()),
        new_master: Address::new(new_ip, parse_port(new_port).unwrap_or(0))?,
    })
}

/// `<type> <id> <ip> <port> [@ <master-name> <master-ip> <master-port>]`.
/// Sentinel and other non data-node types yield `None`.
pub fn parse_sdown(payload: &str) -> Result<Option<SdownInfo>> {
    let parts: Vec<&str> = payload.split_whitespace().collect();
    if parts.len() < 4 {
        return Err(MetaError::Protocol(format!("malformed +sdown payload {:?}", payload)));
    }
    let addr = Address::new(parts[2], parse_port(parts[3]).unwrap_or(0))?;

    match parts[0] {
        "master" => Ok(Some(SdownInfo {
            name: parts[1].to_string(),
            role: Role::Master,
            addr,
        })),
        "slave" => match parts.get(4..6) {
            Some(["@", master_name]) => Ok(Some(SdownInfo {
                name: master_name.to_string(),
                role: Role::Replica,
                addr,
            })),
            _ => Err(MetaError::Protocol(format!("+sdown for a replica without its master {:?}", payload))),
        },
        _ => Ok(None),
    }
}

fn parse_port(raw: &str) -> Option<u32> {
    raw.parse().ok()
}
