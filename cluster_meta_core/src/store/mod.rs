//! Metadata store seam
//!
//! The snapshot lives in a hash on the master of the metadata-store
//! instance. [`MetaStore`] opens one [`MetaConnection`] per persistence
//! attempt; connections are never pooled by the caller.

pub mod memory;
pub mod resp;

pub use memory::MemoryMetaStore;
pub use resp::RespMetaStore;

use std::collections::HashMap;

use crate::error::Result;
use crate::model::Address;

/// Outcome of `EXEC` on an optimistic transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecOutcome {
    /// Every queued command ran.
    Committed,
    /// A watched key changed before `EXEC`; nothing ran.
    Aborted,
}

/// Factory for connections to the metadata store.
#[async_trait::async_trait]
pub trait MetaStore: Send + Sync {
    async fn connect(&self, addr: &Address) -> Result<Box<dyn MetaConnection>>;
}

/// One connection to the metadata store. Inside `multi`, `rename` only
/// queues the command; it runs at `exec`.
#[async_trait::async_trait]
pub trait MetaConnection: Send {
    async fn hgetall(&mut self, key: &str) -> Result<HashMap<String, String>>;

    async fn hset(&mut self, key: &str, field: &str, value: &str) -> Result<()>;

    async fn rename(&mut self, src: &str, dst: &str) -> Result<()>;

    async fn watch(&mut self, key: &str) -> Result<()>;

    async fn multi(&mut self) -> Result<()>;

    async fn exec(&mut self) -> Result<ExecOutcome>;

    async fn discard(&mut self) -> Result<()>;
}
