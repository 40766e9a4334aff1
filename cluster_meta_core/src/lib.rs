pub mod config;
pub mod directory;
pub mod error;
pub mod log;
pub mod metrics;
pub mod model;
pub mod resp;
pub mod server;
pub mod shutdown;
pub mod store;
pub mod worker;

pub use config::MetaServerConfig;
pub use directory::{InstanceDirectory, MemoryDirectory, SentinelDirectory};
pub use error::{ErrorCode, MetaError, Result};
pub use model::{Address, ClusterMeta, Instance, MasterSwitchInfo, RawAddress, RawInstance, Replica, Role, SdownInfo};
pub use server::HttpServer;
pub use shutdown::{PidFile, ShutdownCoordinator, ShutdownSignal};
pub use store::{MemoryMetaStore, MetaStore, RespMetaStore};
pub use worker::ClusterMetaWorker;
