use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::DirectIngestInstance;

/// Format used when a datetime is embedded in a task or table name.
pub const SNAKE_CASE_DATETIME_FORMAT: &str = "%Y_%m_%d_%H_%M_%S_%6f";

/// Describes one incremental ingest view materialization: the rows of
/// `ingest_view_name` that exist as of `upper_bound_datetime_inclusive` but did
/// not exist as of `lower_bound_datetime_exclusive`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IngestViewMaterializationArgs {
    pub ingest_view_name: String,
    pub ingest_instance: DirectIngestInstance,
    /// `None` for the first job of a view, which materializes everything.
    pub lower_bound_datetime_exclusive: Option<DateTime<Utc>>,
    pub upper_bound_datetime_inclusive: DateTime<Utc>,
}

impl IngestViewMaterializationArgs {
    pub fn new(
        ingest_view_name: impl Into<String>,
        ingest_instance: DirectIngestInstance,
        lower_bound_datetime_exclusive: Option<DateTime<Utc>>,
        upper_bound_datetime_inclusive: DateTime<Utc>,
    ) -> Self {
        Self {
            ingest_view_name: ingest_view_name.into(),
            ingest_instance,
            lower_bound_datetime_exclusive,
            upper_bound_datetime_inclusive,
        }
    }

    /// Stable identifier used to name the task that materializes these args.
    pub fn task_id_tag(&self) -> String {
        let lower = self
            .lower_bound_datetime_exclusive
            .map(|dt| dt.format(SNAKE_CASE_DATETIME_FORMAT).to_string())
            .unwrap_or_else(|| "None".to_string());
        format!(
            "ingest_view_materialization_{}-{}-{}-{}",
            self.ingest_view_name,
            self.ingest_instance.as_str(),
            lower,
            self.upper_bound_datetime_inclusive
                .format(SNAKE_CASE_DATETIME_FORMAT),
        )
    }
}
