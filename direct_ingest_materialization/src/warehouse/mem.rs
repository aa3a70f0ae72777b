//! An in-memory warehouse for tests and local runs.
//!
//! Free-form SQL is rejected. The materialization operations are evaluated
//! directly against the stored rows, for ingest views that read a single raw
//! table and select it as-is.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use observability_deps::tracing::debug;
use parking_lot::Mutex;
use std::{
    collections::{BTreeMap, BTreeSet},
    sync::Arc,
};

use super::{BatchPosition, Error, Result, ResultsTableCounts, WarehouseClient};
use crate::{
    query::{DiffInsert, DiffQuery, TableRef, ViewSnapshotQuery, columns},
    value::{Row, Value},
};
use direct_ingest_types::region::RawFileConfig;

#[derive(Debug, Default)]
struct MemDataset {
    default_table_expiration_ms: Option<u64>,
    tables: BTreeMap<String, Vec<Row>>,
}

#[derive(Debug, Default)]
struct MemState {
    datasets: BTreeMap<String, MemDataset>,
    queries: Vec<String>,
}

#[derive(Debug)]
pub struct MemWarehouse {
    project_id: String,
    state: Arc<Mutex<MemState>>,
}

impl MemWarehouse {
    pub fn new(project_id: impl Into<String>) -> Self {
        Self {
            project_id: project_id.into(),
            state: Default::default(),
        }
    }

    /// Appends rows to a table, creating the dataset and table as needed.
    pub fn insert_rows(&self, dataset_id: &str, table_id: &str, rows: impl IntoIterator<Item = Row>) {
        let mut state = self.state.lock();
        state
            .datasets
            .entry(dataset_id.to_string())
            .or_default()
            .tables
            .entry(table_id.to_string())
            .or_default()
            .extend(rows);
    }

    /// All rows of a table, or `None` if it does not exist.
    pub fn table_rows(&self, dataset_id: &str, table_id: &str) -> Option<Vec<Row>> {
        let state = self.state.lock();
        state
            .datasets
            .get(dataset_id)
            .and_then(|d| d.tables.get(table_id))
            .cloned()
    }

    pub fn default_table_expiration_ms(&self, dataset_id: &str) -> Option<u64> {
        self.state
            .lock()
            .datasets
            .get(dataset_id)
            .and_then(|d| d.default_table_expiration_ms)
    }

    /// SQL passed to [`WarehouseClient::run_query_async`], all of it rejected.
    pub fn rejected_queries(&self) -> Vec<String> {
        self.state.lock().queries.clone()
    }

    fn rows(state: &MemState, table: &TableRef) -> Result<Vec<Row>> {
        state
            .datasets
            .get(&table.dataset_id)
            .and_then(|d| d.tables.get(&table.table_id))
            .cloned()
            .ok_or_else(|| Error::TableNotFound {
                dataset_id: table.dataset_id.clone(),
                table_id: table.table_id.clone(),
            })
    }

    fn put_table(state: &mut MemState, table: &TableRef, rows: Vec<Row>) {
        state
            .datasets
            .entry(table.dataset_id.clone())
            .or_default()
            .tables
            .insert(table.table_id.clone(), rows);
    }

    /// Rows of the diff, distinct and sorted by the ordering columns.
    pub fn evaluate_diff(&self, diff: &DiffQuery) -> Result<Vec<Row>> {
        let state = self.state.lock();
        let upper = Self::rows(&state, &diff.upper_bound_table)?;
        let lower: BTreeSet<Row> = match &diff.lower_bound_table {
            Some(table) => Self::rows(&state, table)?.into_iter().collect(),
            None => BTreeSet::new(),
        };

        let distinct: BTreeSet<Row> = upper.into_iter().filter(|r| !lower.contains(r)).collect();
        let mut rows: Vec<Row> = distinct.into_iter().collect();
        rows.sort_by(|a, b| {
            let key = |r: &Row| -> Vec<Value> {
                diff.order_by_columns
                    .iter()
                    .map(|c| r.get(c).cloned().unwrap_or(Value::Null))
                    .collect()
            };
            key(a).cmp(&key(b)).then_with(|| a.cmp(b))
        });
        Ok(rows)
    }
}

fn datetime_of(row: &Row, column: &str) -> Option<DateTime<Utc>> {
    row.get(column).and_then(Value::as_datetime)
}

fn project(row: &Row, columns: &[String]) -> Row {
    columns
        .iter()
        .map(|c| (c.clone(), row.get(c).cloned().unwrap_or(Value::Null)))
        .collect()
}

/// Latest non-deleted version of every primary key as of `bound`.
fn latest_by_primary_key(rows: &[Row], config: &RawFileConfig, bound: DateTime<Utc>) -> Vec<Row> {
    let mut latest: BTreeMap<Vec<Value>, &Row> = BTreeMap::new();
    for row in rows {
        let Some(update_datetime) = datetime_of(row, "update_datetime") else {
            continue;
        };
        if update_datetime > bound {
            continue;
        }
        let key: Vec<Value> = config
            .primary_keys
            .iter()
            .map(|k| row.get(k).cloned().unwrap_or(Value::Null))
            .collect();
        let newer = latest
            .get(&key)
            .and_then(|r| datetime_of(r, "update_datetime"))
            .is_none_or(|current| update_datetime > current);
        if newer {
            latest.insert(key, row);
        }
    }
    latest
        .into_values()
        .filter(|r| r.get("is_deleted").and_then(Value::as_bool) != Some(true))
        .map(|r| project(r, &config.columns))
        .collect()
}

/// Rows of the most recent file as of `bound`.
fn most_recent_file(rows: &[Row], config: &RawFileConfig, bound: DateTime<Utc>) -> Vec<Row> {
    let Some(max_update) = rows
        .iter()
        .filter_map(|r| datetime_of(r, "update_datetime"))
        .filter(|dt| *dt <= bound)
        .max()
    else {
        return vec![];
    };
    let Some(max_file_id) = rows
        .iter()
        .filter(|r| datetime_of(r, "update_datetime") == Some(max_update))
        .filter_map(|r| r.get("file_id").and_then(Value::as_i64))
        .max()
    else {
        return vec![];
    };
    rows.iter()
        .filter(|r| r.get("file_id").and_then(Value::as_i64) == Some(max_file_id))
        .map(|r| project(r, &config.columns))
        .collect()
}

#[async_trait]
impl WarehouseClient for MemWarehouse {
    fn project_id(&self) -> &str {
        &self.project_id
    }

    async fn run_query_async(&self, sql: &str, _use_query_cache: bool) -> Result<Vec<Row>> {
        self.state.lock().queries.push(sql.to_string());
        Err(Error::Unsupported(
            "the in-memory warehouse does not run SQL".to_string(),
        ))
    }

    async fn dataset_exists(&self, dataset_id: &str) -> Result<bool> {
        Ok(self.state.lock().datasets.contains_key(dataset_id))
    }

    async fn create_dataset_if_necessary(
        &self,
        dataset_id: &str,
        default_table_expiration_ms: Option<u64>,
    ) -> Result<()> {
        self.state
            .lock()
            .datasets
            .entry(dataset_id.to_string())
            .or_insert_with(|| MemDataset {
                default_table_expiration_ms,
                tables: BTreeMap::new(),
            });
        Ok(())
    }

    async fn list_tables(&self, dataset_id: &str) -> Result<Vec<String>> {
        Ok(self
            .state
            .lock()
            .datasets
            .get(dataset_id)
            .map(|d| d.tables.keys().cloned().collect())
            .unwrap_or_default())
    }

    async fn delete_table(&self, dataset_id: &str, table_id: &str) -> Result<()> {
        if let Some(dataset) = self.state.lock().datasets.get_mut(dataset_id) {
            dataset.tables.remove(table_id);
        }
        Ok(())
    }

    async fn create_table_from_snapshot(
        &self,
        snapshot: &ViewSnapshotQuery,
        destination: &TableRef,
    ) -> Result<()> {
        let [config] = snapshot.raw_tables.as_slice() else {
            return Err(Error::Unsupported(format!(
                "ingest view [{}] reads {} raw tables; the in-memory warehouse evaluates \
                 views over exactly one",
                snapshot.view.name,
                snapshot.raw_tables.len()
            )));
        };

        let mut state = self.state.lock();
        let raw = Self::rows(
            &state,
            &TableRef::new(&self.project_id, &snapshot.raw_data_dataset, &config.file_tag),
        )?;
        let rows = if config.always_historical_export {
            most_recent_file(&raw, config, snapshot.bound)
        } else {
            latest_by_primary_key(&raw, config, snapshot.bound)
        };
        debug!(
            destination = %destination,
            rows = rows.len(),
            "evaluated ingest view snapshot"
        );
        Self::put_table(&mut state, destination, rows);
        Ok(())
    }

    async fn insert_diff_into_table(&self, insert: &DiffInsert) -> Result<()> {
        let diff_rows = self.evaluate_diff(&insert.diff)?;
        let batch_size = insert.batch_size.max(1) as u64;

        let mut state = self.state.lock();
        let mut rows: Vec<Row> = Self::rows(&state, &insert.destination)
            .unwrap_or_default()
            .into_iter()
            .filter(|r| {
                datetime_of(r, columns::UPPER_BOUND_DATETIME_INCLUSIVE)
                    != Some(insert.upper_bound_datetime_inclusive)
            })
            .collect();
        for (i, mut row) in diff_rows.into_iter().enumerate() {
            row.insert(
                columns::UPPER_BOUND_DATETIME_INCLUSIVE.to_string(),
                insert.upper_bound_datetime_inclusive.into(),
            );
            row.insert(
                columns::LOWER_BOUND_DATETIME_EXCLUSIVE.to_string(),
                insert.lower_bound_datetime_exclusive.into(),
            );
            row.insert(
                columns::BATCH_NUMBER.to_string(),
                Value::Int((i as u64 / batch_size) as i64),
            );
            row.insert(columns::PROCESSED.to_string(), Value::Bool(false));
            rows.push(row);
        }
        Self::put_table(&mut state, &insert.destination, rows);
        Ok(())
    }

    async fn copy_table(&self, source: &TableRef, destination: &TableRef) -> Result<()> {
        let mut state = self.state.lock();
        let rows = Self::rows(&state, source)?;
        Self::put_table(&mut state, destination, rows);
        Ok(())
    }

    async fn dataset_size_bytes(&self, dataset_id: &str) -> Result<u64> {
        Ok(self
            .state
            .lock()
            .datasets
            .get(dataset_id)
            .map(|d| {
                d.tables
                    .values()
                    .flatten()
                    .flat_map(|r| r.values())
                    .map(Value::size_bytes)
                    .sum()
            })
            .unwrap_or(0))
    }

    async fn next_unprocessed_batch(&self, table: &TableRef) -> Result<Option<BatchPosition>> {
        let state = self.state.lock();
        Ok(Self::rows(&state, table)?
            .iter()
            .filter(|r| r.get(columns::PROCESSED).and_then(Value::as_bool) == Some(false))
            .filter_map(|r| {
                Some(BatchPosition {
                    upper_bound_datetime_inclusive: datetime_of(
                        r,
                        columns::UPPER_BOUND_DATETIME_INCLUSIVE,
                    )?,
                    batch_number: r.get(columns::BATCH_NUMBER)?.as_i64()? as u64,
                })
            })
            .min())
    }

    async fn mark_batch_processed(&self, table: &TableRef, batch: BatchPosition) -> Result<()> {
        let mut state = self.state.lock();
        let mut rows = Self::rows(&state, table)?;
        for row in rows.iter_mut().filter(|r| {
            datetime_of(r, columns::UPPER_BOUND_DATETIME_INCLUSIVE)
                == Some(batch.upper_bound_datetime_inclusive)
                && r.get(columns::BATCH_NUMBER).and_then(Value::as_i64)
                    == Some(batch.batch_number as i64)
        }) {
            row.insert(columns::PROCESSED.to_string(), Value::Bool(true));
        }
        Self::put_table(&mut state, table, rows);
        Ok(())
    }

    async fn results_table_counts(&self, table: &TableRef) -> Result<ResultsTableCounts> {
        let state = self.state.lock();
        let mut counts = ResultsTableCounts::default();
        for row in Self::rows(&state, table)? {
            let upper = datetime_of(&row, columns::UPPER_BOUND_DATETIME_INCLUSIVE);
            if row.get(columns::PROCESSED).and_then(Value::as_bool) == Some(true) {
                counts.num_processed_rows += 1;
                counts.processed_rows_max_datetime = counts.processed_rows_max_datetime.max(upper);
            } else {
                counts.num_unprocessed_rows += 1;
                counts.unprocessed_rows_min_datetime =
                    match (counts.unprocessed_rows_min_datetime, upper) {
                        (Some(current), Some(upper)) => Some(current.min(upper)),
                        (current, upper) => current.or(upper),
                    };
            }
        }
        Ok(counts)
    }
}
