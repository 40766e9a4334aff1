//! Instance directory seam
//!
//! The quorum layer is the source of truth for which instances exist and
//! which endpoints serve them. [`InstanceDirectory`] is what the worker
//! consumes; [`SentinelDirectory`] talks to real sentinels and
//! [`MemoryDirectory`] is the in-process double used by tests.

pub mod memory;
pub mod sentinel;

pub use memory::MemoryDirectory;
pub use sentinel::SentinelDirectory;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::model::{Instance, MasterSwitchInfo, RawInstance, Replica, SdownInfo};

#[async_trait::async_trait]
pub trait InstanceDirectory: Send + Sync {
    /// Every monitored instance with all of its replicas, available or not.
    async fn get_instances(&self) -> Result<Vec<Instance>>;

    /// Register the sentinel peers monitoring `name`, ignoring peers whose
    /// IP is one of `seeds`.
    async fn discover_sentinels(&self, name: &str, seeds: &[String]) -> Result<()>;

    async fn get_replicas_of(&self, name: &str) -> Result<Vec<Replica>>;

    async fn watch_master_switch(&self) -> Result<EventSubscription<MasterSwitchInfo>>;

    async fn watch_subjective_down(&self) -> Result<EventSubscription<SdownInfo>>;

    async fn add_instance(&self, raw: &RawInstance) -> Result<()>;

    async fn remove_instance(&self, name: &str) -> Result<()>;

    /// Stop every subscription and release connections.
    async fn close(&self);
}

/// Create a bounded event queue. The producer blocks when the queue is full.
pub fn event_channel<T>(capacity: usize, token: CancellationToken) -> (EventSender<T>, EventSubscription<T>) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (
        EventSender {
            tx,
            token: token.clone(),
        },
        EventSubscription {
            rx,
            token,
            closing: false,
        },
    )
}

/// Producer half of a subscription.
#[derive(Debug)]
pub struct EventSender<T> {
    tx: mpsc::Sender<T>,
    token: CancellationToken,
}

impl<T> Clone for EventSender<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            token: self.token.clone(),
        }
    }
}

impl<T: Send> EventSender<T> {
    /// Queue one event, waiting for room. Returns false once the
    /// subscription is closed.
    pub async fn send(&self, event: T) -> bool {
        if self.token.is_cancelled() {
            return false;
        }
        tokio::select! {
            sent = self.tx.send(event) => sent.is_ok(),
            _ = self.token.cancelled() => false,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.token.is_cancelled() || self.tx.is_closed()
    }

    pub async fn closed(&self) {
        tokio::select! {
            _ = self.tx.closed() => {}
            _ = self.token.cancelled() => {}
        }
    }
}

/// Consumer half of a subscription: a bounded queue plus the token that
/// closes it.
#[derive(Debug)]
pub struct EventSubscription<T> {
    rx: mpsc::Receiver<T>,
    token: CancellationToken,
    closing: bool,
}

impl<T> EventSubscription<T> {
    /// Token that closes this subscription when cancelled.
    pub fn close_token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn close(&self) {
        self.token.cancel();
    }

    /// Next event in arrival order. After the subscription is closed the
    /// events already queued are still returned, then `None`.
    pub async fn next(&mut self) -> Option<T> {
        if !self.closing {
            tokio::select! {
                event = self.rx.recv() => return event,
                _ = self.token.cancelled() => {
                    self.rx.close();
                    self.closing = true;
                }
            }
        }
        self.rx.recv().await
    }
}
