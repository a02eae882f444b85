#![forbid(unsafe_code)]

pub mod cluster;
pub mod clock;
pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod fetch;
pub mod git;
pub mod identity;
pub mod log;
pub mod repo;
pub mod store;
pub mod test_harness;

pub use error::{EngineError, Transience};
pub type Result<T> = std::result::Result<T, EngineError>;

// Re-export the engine surface at crate root for convenience
pub use crate::cluster::{Binding, ClusterDirectory, DirectoryError, Protocol};
pub use crate::clock::{SystemClock, TimeSource};
pub use crate::config::SyncTimeouts;
pub use crate::engine::{ClusterEngine, EngineContext};
pub use crate::events::PushEventLog;
pub use crate::fetch::{FETCH_REFSPEC, FetchDriver, FetchError, FetchExecutor, FetchRequest};
pub use crate::git::GitFetcher;
pub use crate::identity::{DeviceId, RepositoryId, ServiceId, UserId};
pub use crate::log::{EngineLog, LogWriter, StderrLog};
pub use crate::repo::{RepositoryInfo, VcsFamily};
pub use crate::store::memory::MemoryVersionStore;
pub use crate::store::{
    LockName, OwnerToken, StoreConnection, StoreError, VersionRow, VersionStore, WriteProperties,
};
