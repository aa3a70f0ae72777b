//! Materialized ingest view results of one region and instance.
//!
//! Results live in one table per ingest view inside the instance's results
//! dataset. Rows are saved in batches and flagged once extract and merge has
//! processed them.

use chrono::{DateTime, Utc};
use direct_ingest_types::{
    DirectIngestInstance, StateCode,
    datasets::{ingest_view_materialization_results_dataset, ingest_view_materialization_temp_dataset},
};
use observability_deps::tracing::info;
use serde::Serialize;
use std::sync::Arc;

use crate::{
    Result,
    query::{DiffInsert, DiffQuery, TableRef},
    warehouse::{BatchPosition, WarehouseClient},
};

pub const DEFAULT_BATCH_SIZE: usize = 100;

/// The oldest batch of a view that has not been processed yet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResultsBatchInfo {
    pub ingest_view_name: String,
    pub upper_bound_datetime_inclusive: DateTime<Utc>,
    pub batch_number: u64,
}

impl ResultsBatchInfo {
    fn position(&self) -> BatchPosition {
        BatchPosition {
            upper_bound_datetime_inclusive: self.upper_bound_datetime_inclusive,
            batch_number: self.batch_number,
        }
    }
}

/// Row counts of one ingest view results table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IngestViewContentsSummary {
    pub ingest_view_name: String,
    pub num_processed_rows: u64,
    pub processed_rows_max_datetime: Option<DateTime<Utc>>,
    pub num_unprocessed_rows: u64,
    pub unprocessed_rows_min_datetime: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct InstanceIngestViewContents {
    warehouse: Arc<dyn WarehouseClient>,
    region_code: StateCode,
    ingest_instance: DirectIngestInstance,
    dataset_prefix: Option<String>,
    batch_size: usize,
}

impl InstanceIngestViewContents {
    pub fn new(
        warehouse: Arc<dyn WarehouseClient>,
        region_code: StateCode,
        ingest_instance: DirectIngestInstance,
        dataset_prefix: Option<String>,
    ) -> Self {
        Self {
            warehouse,
            region_code,
            ingest_instance,
            dataset_prefix,
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn ingest_instance(&self) -> DirectIngestInstance {
        self.ingest_instance
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn results_dataset(&self) -> String {
        ingest_view_materialization_results_dataset(
            &self.region_code,
            self.ingest_instance,
            self.dataset_prefix.as_deref(),
        )
    }

    /// Scratch dataset for temp tables created on the day of `now`.
    pub fn temp_results_dataset(&self, now: DateTime<Utc>) -> String {
        let name = ingest_view_materialization_temp_dataset(&self.region_code, self.ingest_instance, now);
        match &self.dataset_prefix {
            Some(prefix) => format!("{prefix}_{name}"),
            None => name,
        }
    }

    fn results_table(&self, ingest_view_name: &str) -> TableRef {
        TableRef::new(
            self.warehouse.project_id(),
            self.results_dataset(),
            ingest_view_name,
        )
    }

    async fn results_table_exists(&self, ingest_view_name: &str) -> Result<bool> {
        Ok(self
            .warehouse
            .table_exists(&self.results_dataset(), ingest_view_name)
            .await?)
    }

    /// Saves the rows of `diff` as the results for the given bounds. Rows
    /// previously saved for the same upper bound are replaced.
    pub async fn save_query_results(
        &self,
        ingest_view_name: &str,
        upper_bound_datetime_inclusive: DateTime<Utc>,
        lower_bound_datetime_exclusive: Option<DateTime<Utc>>,
        diff: DiffQuery,
    ) -> Result<()> {
        self.warehouse
            .create_dataset_if_necessary(&self.results_dataset(), None)
            .await?;
        let insert = DiffInsert {
            diff,
            destination: self.results_table(ingest_view_name),
            upper_bound_datetime_inclusive,
            lower_bound_datetime_exclusive,
            batch_size: self.batch_size,
        };
        self.warehouse.insert_diff_into_table(&insert).await?;
        info!(
            region_code = %self.region_code,
            instance = %self.ingest_instance,
            ingest_view = ingest_view_name,
            upper_bound = %upper_bound_datetime_inclusive,
            "saved ingest view results"
        );
        Ok(())
    }

    pub async fn get_next_unprocessed_batch_info_by_view(
        &self,
        ingest_view_name: &str,
    ) -> Result<Option<ResultsBatchInfo>> {
        if !self.results_table_exists(ingest_view_name).await? {
            return Ok(None);
        }
        Ok(self
            .warehouse
            .next_unprocessed_batch(&self.results_table(ingest_view_name))
            .await?
            .map(|position| ResultsBatchInfo {
                ingest_view_name: ingest_view_name.to_string(),
                upper_bound_datetime_inclusive: position.upper_bound_datetime_inclusive,
                batch_number: position.batch_number,
            }))
    }

    pub async fn mark_rows_as_processed(&self, batch: &ResultsBatchInfo) -> Result<()> {
        self.warehouse
            .mark_batch_processed(
                &self.results_table(&batch.ingest_view_name),
                batch.position(),
            )
            .await?;
        Ok(())
    }

    /// `None` when nothing has been saved for the view.
    pub async fn get_ingest_view_contents_summary(
        &self,
        ingest_view_name: &str,
    ) -> Result<Option<IngestViewContentsSummary>> {
        if !self.results_table_exists(ingest_view_name).await? {
            return Ok(None);
        }
        let counts = self
            .warehouse
            .results_table_counts(&self.results_table(ingest_view_name))
            .await?;
        Ok(Some(IngestViewContentsSummary {
            ingest_view_name: ingest_view_name.to_string(),
            num_processed_rows: counts.num_processed_rows,
            processed_rows_max_datetime: counts.processed_rows_max_datetime,
            num_unprocessed_rows: counts.num_unprocessed_rows,
            unprocessed_rows_min_datetime: counts.unprocessed_rows_min_datetime,
        }))
    }

    /// Names of the results tables that exist.
    pub async fn results_tables(&self) -> Result<Vec<String>> {
        Ok(self.warehouse.list_tables(&self.results_dataset()).await?)
    }

    /// Drops every results table of the instance and returns how many there
    /// were.
    pub async fn delete_contents_in_ingest_view_dataset(&self) -> Result<usize> {
        let dataset = self.results_dataset();
        let tables = self.warehouse.list_tables(&dataset).await?;
        for table in &tables {
            self.warehouse.delete_table(&dataset, table).await?;
        }
        info!(
            region_code = %self.region_code,
            instance = %self.ingest_instance,
            dataset,
            count = tables.len(),
            "deleted ingest view results"
        );
        Ok(tables.len())
    }
}
