//! Full reconciliation against the instance directory

use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::ClusterMetaWorker;
use crate::error::Result;
use crate::log::log_meta_operation;
use crate::metrics;

impl ClusterMetaWorker {
    /// Pull every instance from the directory and record the ones whose
    /// master or available replicas differ from the snapshot. Returns
    /// whether anything changed. A failed store after a change is returned
    /// as an error while the in-memory change stays in place.
    pub async fn reconcile(&self) -> Result<bool> {
        let started = Instant::now();
        let result = self.reconcile_pass().await;
        if let Err(e) = &result {
            metrics::record_reconcile_failure();
            warn!("reconciliation failed: {}", e);
        }
        let version = self.version().await;
        log_meta_operation("reconcile", "*", result.is_ok(), started.elapsed(), version);
        result
    }

    async fn reconcile_pass(&self) -> Result<bool> {
        let instances = self.directory.get_instances().await?;
        let seeds = &self.config.sentinel.discovery_seeds;

        let mut staged = Vec::new();
        for mut instance in instances {
            self.directory.discover_sentinels(&instance.name, seeds).await?;
            instance.retain_available();
            if self.meta.read().await.needs_update(&instance) {
                debug!("staging change for {}", instance);
                staged.push(instance);
            }
        }

        let (applied, version) = if staged.is_empty() {
            (0, None)
        } else {
            let mut meta = self.meta.write().await;
            let applied = meta.merge_changed(staged)?;
            metrics::record_snapshot_shape(meta.version, meta.instances.len());
            (applied, Some(meta.version))
        };
        metrics::record_reconcile(applied);

        if applied == 0 {
            return Ok(false);
        }
        info!("reconciliation applied {} changes, version {:?}", applied, version);
        self.store_snapshot().await?;
        Ok(true)
    }

    /// Reconcile every `interval` until `token` is cancelled. The first
    /// pass runs one interval after start since bootstrap already ran one.
    pub fn spawn_reconcile_loop(self: &Arc<Self>, interval: Duration, token: CancellationToken) -> JoinHandle<()> {
        let worker = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        // Failures are already logged and counted by reconcile.
                        let _ = worker.reconcile().await;
                    }
                }
            }
            info!("periodic reconciliation stopped");
        })
    }
}
