//! Pseudo locks stored as objects in a blob store.
//!
//! A lock is a small JSON object whose existence means the lock is held. Object
//! creation is conditional, so two processes racing for the same lock name can
//! never both succeed. Every lock carries an expiration time after which it is
//! treated as released, so a crashed holder cannot block ingest forever.

mod manager;
pub mod region;
pub mod wait;

pub use manager::{Lock, LockGuard, LockManager};
pub use region::{DirectIngestRegionLockManager, WarehouseRefreshLockManager};
pub use wait::LockWaitConfig;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("lock [{lock_name}] already exists")]
    LockAlreadyExists { lock_name: String },

    #[error("Could not acquire lock after waiting {waited_secs} seconds for {description}.")]
    Timeout {
        description: String,
        waited_secs: u64,
    },

    #[error("object store error for lock [{lock_name}]: {source}")]
    ObjectStore {
        lock_name: String,
        source: object_store::Error,
    },

    #[error("lock [{lock_name}] has unreadable contents: {source}")]
    Corrupt {
        lock_name: String,
        source: serde_json::Error,
    },
}

impl Error {
    /// Whether waiting and trying again may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::LockAlreadyExists { .. })
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
