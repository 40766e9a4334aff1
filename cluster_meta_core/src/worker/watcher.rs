//! Event watchers
//!
//! One task per subscription applies events in arrival order. A watcher has
//! no caller to report to, so every failure is logged and counted and the
//! loop moves on to the next event.

use serde::Serialize;
use std::fmt::Debug;
use std::future::Future;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::ClusterMetaWorker;
use crate::directory::EventSubscription;
use crate::error::Result;
use crate::metrics;
use crate::model::{MasterSwitchInfo, SdownInfo, SdownOutcome};

pub const MASTER_SWITCH_WATCHER: &str = "master-switch";
pub const SDOWN_WATCHER: &str = "subjective-down";

pub(super) struct WatcherHandle {
    pub(super) name: &'static str,
    pub(super) close: CancellationToken,
    pub(super) task: JoinHandle<()>,
}

/// Liveness of one watcher task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WatcherStatus {
    pub name: &'static str,
    pub running: bool,
}

impl ClusterMetaWorker {
    /// Subscribe to both event streams and start one watcher task for each.
    pub async fn start_watchers(self: &Arc<Self>) -> Result<()> {
        let switches = self.directory.watch_master_switch().await?;
        let sdowns = match self.directory.watch_subjective_down().await {
            Ok(sub) => sub,
            Err(e) => {
                switches.close();
                return Err(e);
            }
        };

        let mut watchers = self.watchers.lock().await;
        watchers.push(self.spawn_watcher(MASTER_SWITCH_WATCHER, switches, |worker, info| async move {
            let applied = match worker.handle_master_switch(&info).await {
                Ok(applied) => applied,
                Err(e) => {
                    error!("master switch {:?} abandoned: {}", info, e);
                    false
                }
            };
            metrics::record_event(MASTER_SWITCH_WATCHER, applied);
        }));
        watchers.push(self.spawn_watcher(SDOWN_WATCHER, sdowns, |worker, info| async move {
            let applied = worker.handle_sdown(&info).await;
            metrics::record_event(SDOWN_WATCHER, applied);
        }));
        Ok(())
    }

    fn spawn_watcher<T, F, Fut>(self: &Arc<Self>, name: &'static str, mut events: EventSubscription<T>, handle: F) -> WatcherHandle
    where
        T: Debug + Send + 'static,
        F: Fn(Arc<ClusterMetaWorker>, T) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let close = events.close_token();
        let worker = Arc::clone(self);
        let task = tokio::spawn(async move {
            info!("{} watcher started", name);
            while let Some(event) = events.next().await {
                debug!("{} event {:?}", name, event);
                handle(Arc::clone(&worker), event).await;
            }
            info!("{} watcher exit", name);
        });
        WatcherHandle { name, close, task }
    }

    /// Install the promoted master and refresh the replica set from the
    /// directory. An unknown instance is left alone; a failed replica query
    /// abandons the event without touching the snapshot. Persists when the
    /// snapshot changed.
    pub async fn handle_master_switch(&self, info: &MasterSwitchInfo) -> Result<bool> {
        let changed = {
            let mut meta = self.meta.write().await;
            if meta.get(&info.name).is_none() {
                error!("master switch for unknown instance {}", info.name);
                false
            } else {
                let replicas = self.directory.get_replicas_of(&info.name).await?;
                let changed = meta.switch_master(&info.name, info.new_master, replicas)?;
                metrics::record_snapshot_shape(meta.version, meta.instances.len());
                if changed {
                    info!("{} switched master to {}, version {}", info.name, info.new_master, meta.version);
                } else {
                    debug!("{} already has master {}, version {}", info.name, info.new_master, meta.version);
                }
                changed
            }
        };

        if changed {
            self.persist_after_event(MASTER_SWITCH_WATCHER).await;
        }
        Ok(changed)
    }

    /// Drop the endpoint named by a subjective-down event, deleting the
    /// instance when nothing is left. Persists when the snapshot changed.
    pub async fn handle_sdown(&self, info: &SdownInfo) -> bool {
        let outcome = {
            let mut meta = self.meta.write().await;
            let outcome = meta.mark_subjectively_down(info);
            metrics::record_snapshot_shape(meta.version, meta.instances.len());
            match outcome {
                Ok(outcome) => outcome,
                Err(e) => {
                    error!("sdown {:?} not applied: {}", info, e);
                    return false;
                }
            }
        };

        match outcome {
            SdownOutcome::UnknownInstance => error!("sdown for unknown instance {}", info.name),
            SdownOutcome::NoMatch => error!("sdown {:?} matches nothing in the snapshot", info),
            SdownOutcome::Reduced => info!("{} lost {:?} {}", info.name, info.role, info.addr),
            SdownOutcome::Retired => info!("{} has no reachable endpoint left and was removed", info.name),
        }

        if outcome.changed() {
            self.persist_after_event(SDOWN_WATCHER).await;
        }
        outcome.changed()
    }

    /// Best effort; the next event or reconciliation catches up on failure.
    async fn persist_after_event(&self, watcher: &str) {
        if let Err(e) = self.store_snapshot().await {
            warn!("{} watcher could not persist snapshot: {}", watcher, e);
        }
    }

    pub async fn watcher_status(&self) -> Vec<WatcherStatus> {
        self.watchers
            .lock()
            .await
            .iter()
            .map(|handle| WatcherStatus {
                name: handle.name,
                running: !handle.task.is_finished(),
            })
            .collect()
    }
}
