//! A warehouse that records every call and answers from canned responses.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet, VecDeque};

use super::{Error, Result, WarehouseClient};
use crate::value::Row;

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Call {
    Query(String),
    CreateDataset {
        dataset_id: String,
        default_table_expiration_ms: Option<u64>,
    },
    DeleteTable {
        dataset_id: String,
        table_id: String,
    },
}

#[derive(Debug, Default)]
struct State {
    calls: Vec<Call>,
    responses: VecDeque<Vec<Row>>,
    datasets: BTreeSet<String>,
    tables: BTreeMap<String, Vec<String>>,
    /// Queries containing this fail after being recorded.
    failing_query_needle: Option<String>,
}

#[derive(Debug)]
pub(crate) struct RecordingWarehouse {
    project_id: String,
    state: Mutex<State>,
}

impl RecordingWarehouse {
    pub(crate) fn new(project_id: &str) -> Self {
        Self {
            project_id: project_id.to_string(),
            state: Default::default(),
        }
    }

    /// Rows returned by the next query. Queries without a queued response
    /// return no rows.
    pub(crate) fn push_response(&self, rows: Vec<Row>) {
        self.state.lock().responses.push_back(rows);
    }

    pub(crate) fn add_table(&self, dataset_id: &str, table_id: &str) {
        let mut state = self.state.lock();
        state.datasets.insert(dataset_id.to_string());
        state
            .tables
            .entry(dataset_id.to_string())
            .or_default()
            .push(table_id.to_string());
    }

    pub(crate) fn fail_queries_containing(&self, needle: &str) {
        self.state.lock().failing_query_needle = Some(needle.to_string());
    }

    pub(crate) fn calls(&self) -> Vec<Call> {
        self.state.lock().calls.clone()
    }

    pub(crate) fn queries(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::Query(sql) => Some(sql),
                _ => None,
            })
            .collect()
    }
}

#[async_trait]
impl WarehouseClient for RecordingWarehouse {
    fn project_id(&self) -> &str {
        &self.project_id
    }

    async fn run_query_async(&self, sql: &str, _use_query_cache: bool) -> Result<Vec<Row>> {
        let mut state = self.state.lock();
        state.calls.push(Call::Query(sql.to_string()));
        let fails = state
            .failing_query_needle
            .as_deref()
            .is_some_and(|needle| sql.contains(needle));
        if fails {
            return Err(Error::Api {
                code: reqwest::StatusCode::SERVICE_UNAVAILABLE,
                message: "backend error".to_string(),
            });
        }
        Ok(state.responses.pop_front().unwrap_or_default())
    }

    async fn dataset_exists(&self, dataset_id: &str) -> Result<bool> {
        Ok(self.state.lock().datasets.contains(dataset_id))
    }

    async fn create_dataset_if_necessary(
        &self,
        dataset_id: &str,
        default_table_expiration_ms: Option<u64>,
    ) -> Result<()> {
        let mut state = self.state.lock();
        state.calls.push(Call::CreateDataset {
            dataset_id: dataset_id.to_string(),
            default_table_expiration_ms,
        });
        state.datasets.insert(dataset_id.to_string());
        Ok(())
    }

    async fn list_tables(&self, dataset_id: &str) -> Result<Vec<String>> {
        Ok(self
            .state
            .lock()
            .tables
            .get(dataset_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn delete_table(&self, dataset_id: &str, table_id: &str) -> Result<()> {
        let mut state = self.state.lock();
        state.calls.push(Call::DeleteTable {
            dataset_id: dataset_id.to_string(),
            table_id: table_id.to_string(),
        });
        if let Some(tables) = state.tables.get_mut(dataset_id) {
            tables.retain(|t| t != table_id);
        }
        Ok(())
    }
}
