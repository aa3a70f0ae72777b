//! The analytical warehouse that raw data lives in and ingest views are
//! materialized into.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::fmt::Debug;

use crate::{
    query::{
        self, DiffInsert, TableRef, ViewSnapshotQuery, copy_table_sql, dataset_size_sql,
        mark_batch_processed_sql, next_unprocessed_batch_sql, results_table_counts_sql,
    },
    value::Row,
};

pub mod bigquery;
pub mod mem;

#[cfg(test)]
pub(crate) mod recording;

pub use bigquery::{BigQueryClient, BigQueryConfig};
pub use mem::MemWarehouse;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("failed to send {method} {url} request: {source}")]
    RequestSend {
        method: reqwest::Method,
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("warehouse responded with error [{code}]: {message}")]
    Api {
        code: reqwest::StatusCode,
        message: String,
    },

    #[error("failed to read warehouse response: {0}")]
    Response(#[source] reqwest::Error),

    #[error("invalid warehouse URL: {0}")]
    Url(#[from] url::ParseError),

    #[error("unexpected warehouse response: {0}")]
    InvalidResponse(String),

    #[error("dataset [{0}] does not exist")]
    DatasetNotFound(String),

    #[error("table [{dataset_id}.{table_id}] does not exist")]
    TableNotFound {
        dataset_id: String,
        table_id: String,
    },

    #[error("unsupported query: {0}")]
    Unsupported(String),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Position of the oldest unprocessed batch in an ingest view results table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct BatchPosition {
    pub upper_bound_datetime_inclusive: DateTime<Utc>,
    pub batch_number: u64,
}

/// Processed and unprocessed row counts of an ingest view results table.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResultsTableCounts {
    pub num_processed_rows: u64,
    pub processed_rows_max_datetime: Option<DateTime<Utc>>,
    pub num_unprocessed_rows: u64,
    pub unprocessed_rows_min_datetime: Option<DateTime<Utc>>,
}

fn column<'a>(row: &'a Row, name: &str) -> Result<&'a crate::value::Value> {
    row.get(name)
        .ok_or_else(|| Error::InvalidResponse(format!("missing column [{name}]")))
}

fn count_column(row: &Row, name: &str) -> Result<u64> {
    let value = column(row, name)?;
    if value.is_null() {
        return Ok(0);
    }
    value
        .as_i64()
        .and_then(|v| u64::try_from(v).ok())
        .ok_or_else(|| Error::InvalidResponse(format!("column [{name}] is not a count")))
}

fn datetime_column(row: &Row, name: &str) -> Result<Option<DateTime<Utc>>> {
    let value = column(row, name)?;
    if value.is_null() {
        return Ok(None);
    }
    value
        .as_datetime()
        .map(Some)
        .ok_or_else(|| Error::InvalidResponse(format!("column [{name}] is not a datetime")))
}

/// Client for the warehouse.
///
/// Implementations only need to provide the primitive operations. The
/// materialization operations default to rendering SQL and running it with
/// [`WarehouseClient::run_query_async`]; backends that cannot run arbitrary SQL
/// override them.
#[async_trait]
pub trait WarehouseClient: Send + Sync + Debug {
    fn project_id(&self) -> &str;

    /// Runs `sql` to completion and returns the rows of its last statement.
    async fn run_query_async(&self, sql: &str, use_query_cache: bool) -> Result<Vec<Row>>;

    async fn dataset_exists(&self, dataset_id: &str) -> Result<bool>;

    /// Creates the dataset unless it exists. New tables in it expire after
    /// `default_table_expiration_ms` when set.
    async fn create_dataset_if_necessary(
        &self,
        dataset_id: &str,
        default_table_expiration_ms: Option<u64>,
    ) -> Result<()>;

    /// Table names in the dataset. Empty when the dataset does not exist.
    async fn list_tables(&self, dataset_id: &str) -> Result<Vec<String>>;

    /// Deletes the table. Deleting a table that does not exist succeeds.
    async fn delete_table(&self, dataset_id: &str, table_id: &str) -> Result<()>;

    async fn table_exists(&self, dataset_id: &str, table_id: &str) -> Result<bool> {
        Ok(self
            .list_tables(dataset_id)
            .await?
            .iter()
            .any(|t| t == table_id))
    }

    /// Writes the snapshot of an ingest view to `destination`.
    async fn create_table_from_snapshot(
        &self,
        snapshot: &ViewSnapshotQuery,
        destination: &TableRef,
    ) -> Result<()> {
        self.run_query_async(&snapshot.create_table_sql(destination), false)
            .await?;
        Ok(())
    }

    async fn insert_diff_into_table(&self, insert: &DiffInsert) -> Result<()> {
        let exists = self
            .table_exists(&insert.destination.dataset_id, &insert.destination.table_id)
            .await?;
        self.run_query_async(&insert.to_sql(exists), false).await?;
        Ok(())
    }

    /// Replaces `destination` with a copy of `source`, creating the destination
    /// dataset if needed.
    async fn copy_table(&self, source: &TableRef, destination: &TableRef) -> Result<()> {
        self.create_dataset_if_necessary(&destination.dataset_id, None)
            .await?;
        self.run_query_async(&copy_table_sql(source, destination), false)
            .await?;
        Ok(())
    }

    /// Total size of all tables in the dataset.
    async fn dataset_size_bytes(&self, dataset_id: &str) -> Result<u64> {
        let rows = self
            .run_query_async(&dataset_size_sql(self.project_id(), dataset_id), false)
            .await?;
        match rows.first() {
            Some(row) => count_column(row, "total_bytes"),
            None => Ok(0),
        }
    }

    async fn next_unprocessed_batch(&self, table: &TableRef) -> Result<Option<BatchPosition>> {
        let rows = self
            .run_query_async(&next_unprocessed_batch_sql(table), false)
            .await?;
        let Some(row) = rows.first() else {
            return Ok(None);
        };
        let upper = datetime_column(row, query::columns::UPPER_BOUND_DATETIME_INCLUSIVE)?
            .ok_or_else(|| Error::InvalidResponse("null upper bound in results table".into()))?;
        Ok(Some(BatchPosition {
            upper_bound_datetime_inclusive: upper,
            batch_number: count_column(row, query::columns::BATCH_NUMBER)?,
        }))
    }

    async fn mark_batch_processed(&self, table: &TableRef, batch: BatchPosition) -> Result<()> {
        self.run_query_async(
            &mark_batch_processed_sql(
                table,
                batch.upper_bound_datetime_inclusive,
                batch.batch_number,
            ),
            false,
        )
        .await?;
        Ok(())
    }

    async fn results_table_counts(&self, table: &TableRef) -> Result<ResultsTableCounts> {
        let rows = self
            .run_query_async(&results_table_counts_sql(table), false)
            .await?;
        let Some(row) = rows.first() else {
            return Ok(ResultsTableCounts::default());
        };
        Ok(ResultsTableCounts {
            num_processed_rows: count_column(row, "num_processed_rows")?,
            processed_rows_max_datetime: datetime_column(row, "processed_rows_max_datetime")?,
            num_unprocessed_rows: count_column(row, "num_unprocessed_rows")?,
            unprocessed_rows_min_datetime: datetime_column(row, "unprocessed_rows_min_datetime")?,
        })
    }
}
