//! Rows owned by the metadata managers, as seen by callers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt::Display;

use crate::{DirectIngestInstance, DirectIngestStatus, IngestViewMaterializationArgs, StateCode};

/// One entry of the append-only status history of an ingest instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectIngestInstanceStatus {
    pub region_code: StateCode,
    pub instance: DirectIngestInstance,
    pub status: DirectIngestStatus,
    pub status_timestamp: DateTime<Utc>,
}

/// Unique ID for a [`RawFileMetadata`] row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RawFileId(i64);

impl RawFileId {
    pub fn new(v: i64) -> Self {
        Self(v)
    }

    pub fn get(&self) -> i64 {
        self.0
    }
}

impl Display for RawFileId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Bookkeeping for a single raw data file dropped by a state agency.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawFileMetadata {
    pub file_id: RawFileId,
    pub region_code: StateCode,
    pub file_tag: String,
    pub raw_data_instance: DirectIngestInstance,
    pub normalized_file_name: String,
    /// When the agency generated the file, parsed from the normalized name.
    pub update_datetime: DateTime<Utc>,
    pub file_discovery_time: DateTime<Utc>,
    /// `None` until the file has been imported into the raw data tables.
    pub file_processed_time: Option<DateTime<Utc>>,
    pub is_invalidated: bool,
}

impl RawFileMetadata {
    pub fn is_processed(&self) -> bool {
        self.file_processed_time.is_some()
    }
}

/// Per file tag roll-up of the raw file metadata of one instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawFileTagSummary {
    pub file_tag: String,
    pub number_processed_files: u64,
    pub number_unprocessed_files: u64,
    pub latest_discovery_time: DateTime<Utc>,
    pub latest_processed_time: Option<DateTime<Utc>>,
    pub latest_update_datetime: DateTime<Utc>,
}

/// A registered ingest view materialization job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestViewMaterializationMetadata {
    pub region_code: StateCode,
    pub instance: DirectIngestInstance,
    pub ingest_view_name: String,
    pub lower_bound_datetime_exclusive: Option<DateTime<Utc>>,
    pub upper_bound_datetime_inclusive: DateTime<Utc>,
    pub job_creation_time: DateTime<Utc>,
    pub materialization_time: Option<DateTime<Utc>>,
    pub is_invalidated: bool,
}

impl IngestViewMaterializationMetadata {
    pub fn is_materialized(&self) -> bool {
        self.materialization_time.is_some()
    }

    pub fn args(&self) -> IngestViewMaterializationArgs {
        IngestViewMaterializationArgs {
            ingest_view_name: self.ingest_view_name.clone(),
            ingest_instance: self.instance,
            lower_bound_datetime_exclusive: self.lower_bound_datetime_exclusive,
            upper_bound_datetime_inclusive: self.upper_bound_datetime_inclusive,
        }
    }
}

/// Job counts for one ingest view of an instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestViewMaterializationSummary {
    pub ingest_view_name: String,
    pub num_pending_jobs: u64,
    pub num_completed_jobs: u64,
    pub completed_jobs_max_datetime: Option<DateTime<Utc>>,
    pub pending_jobs_min_datetime: Option<DateTime<Utc>>,
}
