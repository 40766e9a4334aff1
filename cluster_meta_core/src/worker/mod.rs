//! Cluster metadata worker
//!
//! [`ClusterMetaWorker`] owns the versioned [`ClusterMeta`] snapshot and is
//! the only thing that mutates it. Reconciliation passes, the two event
//! watchers and persistence all go through the single reader/writer lock
//! held here; admin operations only reach the instance directory.

mod admin;
mod persistence;
mod reconcile;
mod watcher;

pub use persistence::{decode_snapshot, encode_snapshot, EncodedSnapshot};
pub use watcher::WatcherStatus;

use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{Mutex, RwLock};
use tracing::{info, warn};

use crate::config::MetaServerConfig;
use crate::directory::InstanceDirectory;
use crate::error::{MetaError, Result};
use crate::log::log_meta_operation;
use crate::model::{Address, ClusterMeta, Instance};
use crate::store::MetaStore;

use watcher::WatcherHandle;

pub struct ClusterMetaWorker {
    config: MetaServerConfig,
    directory: Arc<dyn InstanceDirectory>,
    store: Arc<dyn MetaStore>,
    meta: RwLock<ClusterMeta>,
    /// Serializes snapshot writes from this process.
    persist_lock: Mutex<()>,
    watchers: Mutex<Vec<WatcherHandle>>,
}

impl ClusterMetaWorker {
    /// A worker with an empty snapshot and no running watchers.
    pub fn new(config: MetaServerConfig, directory: Arc<dyn InstanceDirectory>, store: Arc<dyn MetaStore>) -> Self {
        Self {
            config,
            directory,
            store,
            meta: RwLock::new(ClusterMeta::new()),
            persist_lock: Mutex::new(()),
            watchers: Mutex::new(Vec::new()),
        }
    }

    /// Build a worker the way the server starts: discover every instance,
    /// register sentinel peers, load the persisted snapshot from the
    /// metadata-store master and run one reconciliation pass. Everything but
    /// the final pass is fatal.
    pub async fn bootstrap(
        config: MetaServerConfig,
        directory: Arc<dyn InstanceDirectory>,
        store: Arc<dyn MetaStore>,
    ) -> Result<Arc<Self>> {
        let started = Instant::now();
        let worker = Arc::new(Self::new(config, directory, store));

        let instances = worker.directory.get_instances().await?;
        let target = worker.locate_store_instance(&instances)?;

        for instance in &instances {
            worker
                .directory
                .discover_sentinels(&instance.name, &worker.config.sentinel.discovery_seeds)
                .await?;
        }

        let loaded = worker.load_snapshot(&target).await?;
        info!(
            "loaded snapshot version {} with {} instances from {}",
            loaded.version,
            loaded.instances.len(),
            target
        );
        *worker.meta.write().await = loaded;

        if let Err(e) = worker.reconcile().await {
            warn!("initial reconciliation failed, continuing with the loaded snapshot: {}", e);
        }

        let version = worker.version().await;
        log_meta_operation("bootstrap", &worker.config.meta_store.instance_name, true, started.elapsed(), version);
        Ok(worker)
    }

    fn locate_store_instance(&self, instances: &[Instance]) -> Result<Address> {
        let name = &self.config.meta_store.instance_name;
        let instance = instances
            .iter()
            .find(|instance| &instance.name == name)
            .ok_or_else(|| MetaError::Config(format!("metadata-store instance {} not found", name)))?;
        instance
            .master
            .ok_or_else(|| MetaError::Config(format!("metadata-store instance {} has no master", name)))
    }

    pub fn config(&self) -> &MetaServerConfig {
        &self.config
    }

    /// Copy of the current snapshot.
    pub async fn snapshot(&self) -> ClusterMeta {
        self.meta.read().await.clone()
    }

    pub async fn snapshot_json(&self) -> Result<String> {
        let meta = self.meta.read().await;
        Ok(serde_json::to_string(&*meta)?)
    }

    pub async fn version(&self) -> u32 {
        self.meta.read().await.version
    }

    /// Close both subscriptions, wait for their watchers to drain, then
    /// release the directory.
    pub async fn close(&self) {
        let handles: Vec<WatcherHandle> = self.watchers.lock().await.drain(..).collect();
        for handle in &handles {
            handle.close.cancel();
        }
        for handle in handles {
            if let Err(e) = handle.task.await {
                warn!("{} watcher ended abnormally: {}", handle.name, e);
            }
        }
        self.directory.close().await;
        info!("cluster meta worker closed");
    }
}
