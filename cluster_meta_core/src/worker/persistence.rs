//! Snapshot persistence
//!
//! A snapshot is staged field by field into a fresh temporary hash, then
//! swapped over the canonical key with `RENAME` inside a `WATCH`ed
//! transaction so readers only ever see a complete hash. Losing the watch
//! to a concurrent writer is reported as [`MetaError::Conflict`] and left to
//! the next trigger.

use chrono::Utc;
use rand::distributions::Alphanumeric;
use rand::Rng;
use std::collections::HashMap;
use std::time::Instant;
use tracing::{debug, error, info, warn};

use super::ClusterMetaWorker;
use crate::config::MetaStoreConfig;
use crate::error::{MetaError, Result};
use crate::log::log_meta_operation;
use crate::metrics;
use crate::model::{Address, ClusterMeta, Instance, InstanceNameList};
use crate::store::{ExecOutcome, MetaConnection};

/// Field/value pairs ready to be written, in write order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedSnapshot {
    pub version: u32,
    pub fields: Vec<(String, String)>,
    /// Instances left out of this snapshot.
    pub skipped: Vec<String>,
}

/// Lay out `meta` as hash fields: the version, one JSON field per instance,
/// then the list of instance names actually written.
pub fn encode_snapshot(meta: &ClusterMeta, layout: &MetaStoreConfig) -> EncodedSnapshot {
    let mut fields = Vec::with_capacity(meta.instances.len() + 2);
    let mut names = InstanceNameList::default();
    let mut skipped = Vec::new();

    fields.push((layout.version_field.clone(), meta.version.to_string()));
    for name in meta.instance_names() {
        if layout.is_reserved_field(&name) {
            warn!("instance {} collides with a bookkeeping field, not persisted", name);
            skipped.push(name);
            continue;
        }
        let encoded = meta
            .get(&name)
            .ok_or_else(|| MetaError::NotFound(name.clone()))
            .and_then(|instance| serde_json::to_string(instance).map_err(MetaError::from));
        match encoded {
            Ok(json) => {
                fields.push((name.clone(), json));
                names.list.push(name);
            }
            Err(e) => {
                error!("failed to encode instance {}: {}", name, e);
                skipped.push(name);
            }
        }
    }

    match serde_json::to_string(&names) {
        Ok(json) => fields.push((layout.instance_names_field.clone(), json)),
        Err(e) => error!("failed to encode instance name list: {}", e),
    }

    EncodedSnapshot {
        version: meta.version,
        fields,
        skipped,
    }
}

/// Rebuild a snapshot from the fields of the canonical hash. Any malformed
/// field fails the whole load.
pub fn decode_snapshot(fields: HashMap<String, String>, layout: &MetaStoreConfig) -> Result<ClusterMeta> {
    let mut meta = ClusterMeta::new();
    for (field, value) in fields {
        if field == layout.version_field {
            meta.version = value
                .trim()
                .parse()
                .map_err(|_| MetaError::Store(format!("malformed snapshot version {:?}", value)))?;
        } else if field == layout.instance_names_field {
            continue;
        } else {
            let instance: Instance = serde_json::from_str(&value).map_err(|e| {
                error!("malformed snapshot field {}: {}", field, e);
                MetaError::from(e)
            })?;
            meta.instances.insert(field, instance);
        }
    }
    Ok(meta)
}

fn temp_key(hash_key: &str) -> String {
    let suffix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(8)
        .map(char::from)
        .collect();
    format!("{}-{}-{}", hash_key, Utc::now().format("%Y%m%d-%H%M%S"), suffix)
}

impl ClusterMetaWorker {
    /// Persist the current snapshot. Attempts from this process run one at
    /// a time and each encodes whatever is current once it gets its turn.
    pub async fn store_snapshot(&self) -> Result<()> {
        let _turn = self.persist_lock.lock().await;
        let started = Instant::now();

        let (target, snapshot) = {
            let meta = self.meta.read().await;
            let target = self.store_target(&meta)?;
            (target, encode_snapshot(&meta, &self.config.meta_store))
        };
        for _ in &snapshot.skipped {
            metrics::record_skipped_instance();
        }

        let result = self.write_snapshot(&target, &snapshot).await;
        metrics::record_persist(&result);
        log_meta_operation(
            "store_snapshot",
            &self.config.meta_store.hash_key,
            result.is_ok(),
            started.elapsed(),
            snapshot.version,
        );
        match &result {
            Ok(()) => info!("stored snapshot version {} on {}", snapshot.version, target),
            Err(e) if e.is_conflict() => warn!("snapshot version {} not stored: {}", snapshot.version, e),
            Err(e) => error!("failed to store snapshot version {}: {}", snapshot.version, e),
        }
        result
    }

    /// Master of the metadata-store instance as currently tracked.
    fn store_target(&self, meta: &ClusterMeta) -> Result<Address> {
        if meta.instances.is_empty() {
            return Err(MetaError::Config("cluster instance pool is empty".to_string()));
        }
        let name = &self.config.meta_store.instance_name;
        meta.get(name)
            .ok_or_else(|| MetaError::Config(format!("metadata-store instance {} is not tracked", name)))?
            .master
            .ok_or_else(|| MetaError::Config(format!("metadata-store instance {} has no master", name)))
    }

    async fn write_snapshot(&self, target: &Address, snapshot: &EncodedSnapshot) -> Result<()> {
        let mut conn = self.store.connect(target).await?;
        let result = self.swap_snapshot(conn.as_mut(), snapshot).await;
        if result.is_err() {
            if let Err(e) = conn.discard().await {
                debug!("discard after failed store: {}", e);
            }
        }
        result
    }

    async fn swap_snapshot(&self, conn: &mut dyn MetaConnection, snapshot: &EncodedSnapshot) -> Result<()> {
        let canonical = &self.config.meta_store.hash_key;
        let staging = temp_key(canonical);

        for (field, value) in &snapshot.fields {
            conn.hset(&staging, field, value).await?;
        }

        conn.watch(canonical).await?;
        conn.multi().await?;
        conn.rename(&staging, canonical).await?;
        match conn.exec().await? {
            ExecOutcome::Committed => Ok(()),
            ExecOutcome::Aborted => Err(MetaError::Conflict { key: canonical.clone() }),
        }
    }

    /// Read the snapshot stored on `target`. A missing hash yields an
    /// empty snapshot at version 0.
    pub async fn load_snapshot(&self, target: &Address) -> Result<ClusterMeta> {
        let started = Instant::now();
        let mut conn = self.store.connect(target).await?;
        let fields = conn.hgetall(&self.config.meta_store.hash_key).await?;
        drop(conn);

        let result = decode_snapshot(fields, &self.config.meta_store);
        let version = result.as_ref().map(|meta| meta.version).unwrap_or(0);
        log_meta_operation(
            "load_snapshot",
            &self.config.meta_store.hash_key,
            result.is_ok(),
            started.elapsed(),
            version,
        );
        result
    }
}
