//! Incremental ingest view materialization.
//!
//! The [`args_generator`] decides which watermark ranges of each ingest view
//! still need to be materialized, the [`materializer`] computes the rows added
//! in a range inside the warehouse and the [`contents`] store keeps the results
//! until extract and merge has processed them.

pub mod args_generator;
pub mod contents;
pub mod materializer;
pub mod query;
pub mod value;
pub mod warehouse;

#[cfg(test)]
pub(crate) mod test_util;

pub use args_generator::IngestViewMaterializationArgsGenerator;
pub use contents::{IngestViewContentsSummary, InstanceIngestViewContents, ResultsBatchInfo};
pub use materializer::IngestViewMaterializer;
pub use warehouse::WarehouseClient;

use chrono::{DateTime, Utc};
use direct_ingest_types::{StateCode, region};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("warehouse error: {0}")]
    Warehouse(#[from] warehouse::Error),

    #[error(transparent)]
    Metadata(#[from] direct_ingest_metadata::Error),

    #[error(transparent)]
    Region(#[from] region::Error),

    #[error(
        "Found a potential new upper bound date [{candidate}] that is before the last valid \
         export upper bound date [{last_upper_bound}] for raw file [{file_tag}] of ingest view \
         [{ingest_view_name}]"
    )]
    UpperBoundBeforeLastExport {
        ingest_view_name: String,
        file_tag: String,
        candidate: DateTime<Utc>,
        last_upper_bound: DateTime<Utc>,
    },

    #[error("No materialization job registered for args [{task_id}]")]
    JobNotRegistered { task_id: String },

    #[error("Ingest not enabled for region [{0}]")]
    NotLaunched(StateCode),

    #[error("ingest view [{ingest_view_name}] is not defined for region [{region_code}]")]
    UnknownIngestView {
        region_code: StateCode,
        ingest_view_name: String,
    },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
