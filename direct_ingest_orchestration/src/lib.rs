//! Coordinates ingest for each region and instance: operator actions such as
//! starting a rerun or flashing SECONDARY to PRIMARY, discovery of raw files,
//! and the task queues that drive materialization until it is caught up.

pub mod context;
pub mod discovery;
pub mod operations;
pub mod queue;
pub mod scheduler;
pub mod tasks;

#[cfg(test)]
pub(crate) mod test_util;

pub use context::{IngestContext, OrchestrationConfig};
pub use discovery::{DiscoveryReport, RawFileDiscovery};
pub use operations::{
    IngestOperations, IngestViewSummaries, InstanceStatuses, InvalidationReport, RawFileTagStatus,
};
pub use queue::{ObjectStoreTaskQueue, QueueState, TaskQueueManager};
pub use scheduler::{IngestTaskRunner, ScheduleOutcome};
pub use tasks::TaskPayload;

use direct_ingest_types::{DirectIngestInstanceError, region};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Instance(#[from] DirectIngestInstanceError),

    #[error(transparent)]
    Metadata(#[from] direct_ingest_metadata::Error),

    #[error(transparent)]
    Materialization(#[from] direct_ingest_materialization::Error),

    #[error("warehouse error: {0}")]
    Warehouse(#[from] direct_ingest_materialization::warehouse::Error),

    #[error(transparent)]
    Lock(#[from] direct_ingest_lock::Error),

    #[error(transparent)]
    Region(#[from] region::Error),

    #[error("task queue error: {0}")]
    Queue(#[from] queue::Error),

    #[error("failed to list ingest bucket [{prefix}]: {source}")]
    IngestBucket {
        prefix: String,
        source: object_store::Error,
    },
}

impl Error {
    /// The operator asked for something the current state does not allow.
    pub fn is_precondition_failure(&self) -> bool {
        matches!(
            self,
            Self::Instance(_)
                | Self::Metadata(direct_ingest_metadata::Error::Instance { .. })
        )
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
