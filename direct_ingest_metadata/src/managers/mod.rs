//! Region and instance scoped views over the metadata store.

mod instance_status;
mod materialization;
mod raw_file;

pub use instance_status::{InstanceStatusManager, allowed_transitions};
pub use materialization::MaterializationMetadataManager;
pub use raw_file::RawFileMetadataManager;

use direct_ingest_types::{DirectIngestInstance, DirectIngestInstanceError, StateCode, filename};
use snafu::Snafu;

use crate::interface;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum Error {
    #[snafu(display("{source}"))]
    Instance { source: DirectIngestInstanceError },

    #[snafu(display("metadata store error: {source}"))]
    Catalog { source: interface::Error },

    #[snafu(display("No instance status found for {region_code} in {instance}"))]
    NoCurrentStatus {
        region_code: StateCode,
        instance: DirectIngestInstance,
    },

    #[snafu(display("{source}"))]
    FileName { source: filename::Error },

    #[snafu(display(
        "Raw file [{normalized_file_name}] has not been discovered for {region_code} in {instance}"
    ))]
    RawFileNotDiscovered {
        region_code: StateCode,
        instance: DirectIngestInstance,
        normalized_file_name: String,
    },

    #[snafu(display(
        "Attempting to register materialization job [{task_id}] whose lower bound does not \
         match the upper bound of the most recent job [{most_recent_upper}]"
    ))]
    NonContiguousJob {
        task_id: String,
        most_recent_upper: String,
    },
}

impl From<interface::Error> for Error {
    fn from(source: interface::Error) -> Self {
        Self::Catalog { source }
    }
}

impl From<DirectIngestInstanceError> for Error {
    fn from(source: DirectIngestInstanceError) -> Self {
        Self::Instance { source }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
