//! Administrative add/remove, delegated to the instance directory

use std::time::Instant;
use tracing::info;

use super::ClusterMetaWorker;
use crate::error::{MetaError, Result};
use crate::log::log_meta_operation;
use crate::model::RawInstance;

impl ClusterMetaWorker {
    /// Validate `raw` and ask the directory to start monitoring it. The
    /// snapshot is not touched; the next reconciliation picks it up.
    pub async fn add_instance(&self, raw: &RawInstance) -> Result<()> {
        let started = Instant::now();
        let master = raw.validate()?;
        if self.config.meta_store.is_reserved_field(&raw.name) {
            return Err(MetaError::Validation(format!("instance name {:?} is reserved", raw.name)));
        }

        let result = self.directory.add_instance(raw).await;
        if result.is_ok() {
            info!("added instance {} with master {}", raw.name, master);
        }
        log_meta_operation("add_instance", &raw.name, result.is_ok(), started.elapsed(), self.version().await);
        result
    }

    /// Ask the directory to stop monitoring `name`. The snapshot catches up
    /// through later events or reconciliation.
    pub async fn remove_instance(&self, name: &str) -> Result<()> {
        let started = Instant::now();
        if name.trim().is_empty() {
            return Err(MetaError::Validation("instance name is empty".to_string()));
        }

        let result = self.directory.remove_instance(name).await;
        if result.is_ok() {
            info!("removed instance {}", name);
        }
        log_meta_operation("remove_instance", name, result.is_ok(), started.elapsed(), self.version().await);
        result
    }
}
