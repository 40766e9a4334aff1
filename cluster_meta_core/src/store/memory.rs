//! In-memory metadata store
//!
//! Keeps hashes in a shared map and implements WATCH by remembering a
//! per-key modification counter, the way a real server invalidates a
//! watched key on any write. Used by tests and for local runs without a
//! store.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;

use super::{ExecOutcome, MetaConnection, MetaStore};
use crate::error::{MetaError, Result};
use crate::model::Address;

#[derive(Debug, Default)]
struct Keyspace {
    hashes: HashMap<String, HashMap<String, String>>,
    revisions: HashMap<String, u64>,
}

impl Keyspace {
    fn touch(&mut self, key: &str) {
        *self.revisions.entry(key.to_string()).or_insert(0) += 1;
    }

    fn revision(&self, key: &str) -> u64 {
        self.revisions.get(key).copied().unwrap_or(0)
    }

    fn rename(&mut self, src: &str, dst: &str) -> Result<()> {
        let hash = self
            .hashes
            .remove(src)
            .ok_or_else(|| MetaError::Store("ERR no such key".to_string()))?;
        self.hashes.insert(dst.to_string(), hash);
        self.touch(src);
        self.touch(dst);
        Ok(())
    }
}

/// Shared in-memory keyspace. Clones see the same data.
#[derive(Debug, Clone, Default)]
pub struct MemoryMetaStore {
    keyspace: Arc<RwLock<Keyspace>>,
    fail_connect: Arc<AtomicBool>,
    connects: Arc<AtomicUsize>,
    /// Key to touch right after the next `MULTI`, simulating a concurrent writer.
    interfere: Arc<std::sync::Mutex<Option<String>>>,
}

impl MemoryMetaStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn hash(&self, key: &str) -> Option<HashMap<String, String>> {
        self.keyspace.read().await.hashes.get(key).cloned()
    }

    pub async fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.keyspace.read().await.hashes.keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Write a field as an outside client would.
    pub async fn hset(&self, key: &str, field: &str, value: &str) {
        let mut keyspace = self.keyspace.write().await;
        keyspace
            .hashes
            .entry(key.to_string())
            .or_default()
            .insert(field.to_string(), value.to_string());
        keyspace.touch(key);
    }

    pub fn set_fail_connect(&self, fail: bool) {
        self.fail_connect.store(fail, Ordering::SeqCst);
    }

    pub fn connect_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    /// Make the next transaction lose its WATCH on `key`.
    pub fn interfere_once(&self, key: &str) {
        if let Ok(mut slot) = self.interfere.lock() {
            *slot = Some(key.to_string());
        }
    }

    fn take_interference(&self) -> Option<String> {
        self.interfere.lock().ok().and_then(|mut slot| slot.take())
    }
}

#[async_trait::async_trait]
impl MetaStore for MemoryMetaStore {
    async fn connect(&self, addr: &Address) -> Result<Box<dyn MetaConnection>> {
        if self.fail_connect.load(Ordering::SeqCst) {
            return Err(MetaError::Store(format!("connection to {} refused", addr)));
        }
        self.connects.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MemoryConnection {
            store: self.clone(),
            watched: HashMap::new(),
            queued: None,
        }))
    }
}

enum Queued {
    Rename { src: String, dst: String },
}

struct MemoryConnection {
    store: MemoryMetaStore,
    watched: HashMap<String, u64>,
    queued: Option<Vec<Queued>>,
}

#[async_trait::async_trait]
impl MetaConnection for MemoryConnection {
    async fn hgetall(&mut self, key: &str) -> Result<HashMap<String, String>> {
        Ok(self.store.hash(key).await.unwrap_or_default())
    }

    async fn hset(&mut self, key: &str, field: &str, value: &str) -> Result<()> {
        if self.queued.is_some() {
            return Err(MetaError::Store("HSET is not queued by this store".to_string()));
        }
        self.store.hset(key, field, value).await;
        Ok(())
    }

    async fn rename(&mut self, src: &str, dst: &str) -> Result<()> {
        match self.queued.as_mut() {
            Some(queue) => {
                queue.push(Queued::Rename {
                    src: src.to_string(),
                    dst: dst.to_string(),
                });
                Ok(())
            }
            None => self.store.keyspace.write().await.rename(src, dst),
        }
    }

    async fn watch(&mut self, key: &str) -> Result<()> {
        let revision = self.store.keyspace.read().await.revision(key);
        self.watched.insert(key.to_string(), revision);
        Ok(())
    }

    async fn multi(&mut self) -> Result<()> {
        if self.queued.is_some() {
            return Err(MetaError::Store("ERR MULTI calls can not be nested".to_string()));
        }
        self.queued = Some(Vec::new());
        if let Some(key) = self.store.take_interference() {
            self.store.keyspace.write().await.touch(&key);
        }
        Ok(())
    }

    async fn exec(&mut self) -> Result<ExecOutcome> {
        let queue = self
            .queued
            .take()
            .ok_or_else(|| MetaError::Store("ERR EXEC without MULTI".to_string()))?;
        let watched = std::mem::take(&mut self.watched);

        let mut keyspace = self.store.keyspace.write().await;
        if watched.iter().any(|(key, rev)| keyspace.revision(key) != *rev) {
            return Ok(ExecOutcome::Aborted);
        }
        for op in queue {
            match op {
                Queued::Rename { src, dst } => keyspace.rename(&src, &dst)?,
            }
        }
        Ok(ExecOutcome::Committed)
    }

    async fn discard(&mut self) -> Result<()> {
        self.queued = None;
        self.watched.clear();
        Ok(())
    }
}
