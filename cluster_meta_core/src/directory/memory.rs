//! In-memory instance directory with event injection

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;

use super::{event_channel, EventSender, EventSubscription, InstanceDirectory};
use crate::error::{MetaError, Result};
use crate::model::{Instance, MasterSwitchInfo, RawInstance, Replica, SdownInfo};

#[derive(Default)]
struct Counters {
    get_instances: AtomicUsize,
    discover: AtomicUsize,
    replicas: AtomicUsize,
    add: AtomicUsize,
    remove: AtomicUsize,
}

#[derive(Default)]
struct Failures {
    get_instances: AtomicBool,
    discover: AtomicBool,
    replicas: AtomicBool,
}

#[derive(Default)]
struct Subscribers {
    switch: Vec<EventSender<MasterSwitchInfo>>,
    sdown: Vec<EventSender<SdownInfo>>,
}

/// Directory double. Clones share state, so a test keeps one handle while
/// the worker owns another.
#[derive(Clone)]
pub struct MemoryDirectory {
    instances: Arc<Mutex<BTreeMap<String, Instance>>>,
    subscribers: Arc<Mutex<Subscribers>>,
    counters: Arc<Counters>,
    failures: Arc<Failures>,
    queue_capacity: usize,
    shutdown: CancellationToken,
}

impl Default for MemoryDirectory {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryDirectory {
    pub fn new() -> Self {
        Self::with_capacity(64)
    }

    pub fn with_capacity(queue_capacity: usize) -> Self {
        Self {
            instances: Arc::new(Mutex::new(BTreeMap::new())),
            subscribers: Arc::new(Mutex::new(Subscribers::default())),
            counters: Arc::new(Counters::default()),
            failures: Arc::new(Failures::default()),
            queue_capacity,
            shutdown: CancellationToken::new(),
        }
    }

    fn lock_instances(&self) -> Result<std::sync::MutexGuard<'_, BTreeMap<String, Instance>>> {
        self.instances
            .lock()
            .map_err(|_| MetaError::Directory("directory state poisoned".to_string()))
    }

    /// Insert or replace an instance as the quorum layer would report it.
    pub fn set_instance(&self, instance: Instance) {
        if let Ok(mut instances) = self.instances.lock() {
            instances.insert(instance.name.clone(), instance);
        }
    }

    pub fn set_replicas(&self, name: &str, replicas: Vec<Replica>) {
        if let Ok(mut instances) = self.instances.lock() {
            if let Some(instance) = instances.get_mut(name) {
                instance.replicas = replicas;
            }
        }
    }

    pub fn drop_instance(&self, name: &str) {
        if let Ok(mut instances) = self.instances.lock() {
            instances.remove(name);
        }
    }

    pub fn fail_get_instances(&self, fail: bool) {
        self.failures.get_instances.store(fail, Ordering::SeqCst);
    }

    pub fn fail_discover(&self, fail: bool) {
        self.failures.discover.store(fail, Ordering::SeqCst);
    }

    pub fn fail_replicas(&self, fail: bool) {
        self.failures.replicas.store(fail, Ordering::SeqCst);
    }

    pub fn add_calls(&self) -> usize {
        self.counters.add.load(Ordering::SeqCst)
    }

    pub fn remove_calls(&self) -> usize {
        self.counters.remove.load(Ordering::SeqCst)
    }

    pub fn discover_calls(&self) -> usize {
        self.counters.discover.load(Ordering::SeqCst)
    }

    pub fn get_instances_calls(&self) -> usize {
        self.counters.get_instances.load(Ordering::SeqCst)
    }

    pub fn replica_calls(&self) -> usize {
        self.counters.replicas.load(Ordering::SeqCst)
    }

    /// Deliver a master-switch event to every open subscription. Returns the
    /// number of subscriptions that accepted it.
    pub async fn emit_master_switch(&self, info: MasterSwitchInfo) -> usize {
        let senders = match self.subscribers.lock() {
            Ok(subs) => subs.switch.clone(),
            Err(_) => return 0,
        };
        let mut delivered = 0;
        for sender in senders {
            if sender.send(info.clone()).await {
                delivered += 1;
            }
        }
        delivered
    }

    pub async fn emit_sdown(&self, info: SdownInfo) -> usize {
        let senders = match self.subscribers.lock() {
            Ok(subs) => subs.sdown.clone(),
            Err(_) => return 0,
        };
        let mut delivered = 0;
        for sender in senders {
            if sender.send(info.clone()).await {
                delivered += 1;
            }
        }
        delivered
    }

    fn check(flag: &AtomicBool, what: &str) -> Result<()> {
        if flag.load(Ordering::SeqCst) {
            return Err(MetaError::Directory(format!("{} failed", what)));
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl InstanceDirectory for MemoryDirectory {
    async fn get_instances(&self) -> Result<Vec<Instance>> {
        self.counters.get_instances.fetch_add(1, Ordering::SeqCst);
        Self::check(&self.failures.get_instances, "get instances")?;
        Ok(self.lock_instances()?.values().cloned().collect())
    }

    async fn discover_sentinels(&self, name: &str, _seeds: &[String]) -> Result<()> {
        self.counters.discover.fetch_add(1, Ordering::SeqCst);
        Self::check(&self.failures.discover, &format!("discover sentinels of {}", name))
    }

    async fn get_replicas_of(&self, name: &str) -> Result<Vec<Replica>> {
        self.counters.replicas.fetch_add(1, Ordering::SeqCst);
        Self::check(&self.failures.replicas, &format!("replicas of {}", name))?;
        self.lock_instances()?
            .get(name)
            .map(|instance| instance.replicas.clone())
            .ok_or_else(|| MetaError::Directory(format!("No such master with name {}", name)))
    }

    async fn watch_master_switch(&self) -> Result<EventSubscription<MasterSwitchInfo>> {
        let (sender, subscription) = event_channel(self.queue_capacity, self.shutdown.child_token());
        self.subscribers
            .lock()
            .map_err(|_| MetaError::Directory("directory state poisoned".to_string()))?
            .switch
            .push(sender);
        Ok(subscription)
    }

    async fn watch_subjective_down(&self) -> Result<EventSubscription<SdownInfo>> {
        let (sender, subscription) = event_channel(self.queue_capacity, self.shutdown.child_token());
        self.subscribers
            .lock()
            .map_err(|_| MetaError::Directory("directory state poisoned".to_string()))?
            .sdown
            .push(sender);
        Ok(subscription)
    }

    async fn add_instance(&self, raw: &RawInstance) -> Result<()> {
        self.counters.add.fetch_add(1, Ordering::SeqCst);
        let master = raw.validate()?;
        let mut instances = self.lock_instances()?;
        if instances.contains_key(&raw.name) {
            return Err(MetaError::Directory("ERR Duplicated master name".to_string()));
        }
        let mut instance = Instance::new(raw.name.clone(), Some(master));
        instance.epoch = raw.epoch;
        instance.subjective_down_timeout_ms = raw.subjective_down_timeout_ms;
        instance.failover_timeout_ms = raw.failover_timeout_ms;
        instances.insert(raw.name.clone(), instance);
        Ok(())
    }

    async fn remove_instance(&self, name: &str) -> Result<()> {
        self.counters.remove.fetch_add(1, Ordering::SeqCst);
        match self.lock_instances()?.remove(name) {
            Some(_) => Ok(()),
            None => Err(MetaError::Directory("ERR No such master with that name".to_string())),
        }
    }

    async fn close(&self) {
        self.shutdown.cancel();
        if let Ok(mut subs) = self.subscribers.lock() {
            subs.switch.clear();
            subs.sdown.clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Address, RawAddress, Role};

    fn addr(port: u32) -> Address {
        Address::new("10.1.0.1", port).unwrap()
    }

    #[tokio::test]
    async fn test_emit_reaches_subscription() {
        let dir = MemoryDirectory::new();
        let mut sub = dir.watch_subjective_down().await.unwrap();
        let info = SdownInfo {
            name: "cache1".into(),
            role: Role::Master,
            addr: addr(6379),
        };
        assert_eq!(dir.emit_sdown(info.clone()).await, 1);
        assert_eq!(sub.next().await, Some(info));
    }

    #[tokio::test]
    async fn test_add_rejects_duplicates() {
        let dir = MemoryDirectory::new();
        let raw = RawInstance {
            name: "cache1".into(),
            addr: RawAddress { ip: "10.1.0.1".into(), port: 6379 },
            epoch: 0,
            subjective_down_timeout_ms: 1000,
            failover_timeout_ms: 1000,
        };
        dir.add_instance(&raw).await.unwrap();
        let err = dir.add_instance(&raw).await.unwrap_err();
        assert_eq!(err.to_string(), "instance directory error: ERR Duplicated master name");
        assert_eq!(dir.add_calls(), 2);
        assert_eq!(dir.get_instances().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_close_ends_subscriptions() {
        let dir = MemoryDirectory::new();
        let mut sub = dir.watch_master_switch().await.unwrap();
        dir.close().await;
        assert_eq!(sub.next().await, None);
        let delivered = dir
            .emit_master_switch(MasterSwitchInfo {
                name: "cache1".into(),
                old_master: None,
                new_master: addr(1),
            })
            .await;
        assert_eq!(delivered, 0);
    }
}
