//! Per region task queues that drive ingest.
//!
//! Each region has one set of queues per ingest instance. Pausing a queue stops
//! its tasks from being dispatched without dropping them.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use direct_ingest_types::{DirectIngestInstance, StateCode};
use serde::{Deserialize, Serialize};
use std::{collections::BTreeSet, fmt::Debug, str::FromStr};

use crate::tasks::TaskPayload;

mod blob;

pub use blob::ObjectStoreTaskQueue;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("object store error for queue [{queue_name}]: {source}")]
    ObjectStore {
        queue_name: String,
        source: object_store::Error,
    },

    #[error("queue [{queue_name}] holds an unreadable object: {source}")]
    Corrupt {
        queue_name: String,
        source: serde_json::Error,
    },

    #[error("Invalid queue state [{0}] received, expected RUNNING or PAUSED")]
    InvalidQueueState(String),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// The ingest stage a queue dispatches tasks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum IngestQueueKind {
    Scheduler,
    RawDataImport,
    Materialization,
    ExtractAndMerge,
}

impl IngestQueueKind {
    pub const ALL: [Self; 4] = [
        Self::Scheduler,
        Self::RawDataImport,
        Self::Materialization,
        Self::ExtractAndMerge,
    ];

    fn suffix(&self) -> &'static str {
        match self {
            Self::Scheduler => "scheduler",
            Self::RawDataImport => "raw-data-import",
            Self::Materialization => "materialization",
            Self::ExtractAndMerge => "extract-and-merge",
        }
    }
}

/// e.g. `direct-ingest-state-us-xx-materialization-secondary`
pub fn queue_name(
    state_code: &StateCode,
    instance: DirectIngestInstance,
    kind: IngestQueueKind,
) -> String {
    let name = format!(
        "direct-ingest-state-{}-{}",
        state_code.lower().replace('_', "-"),
        kind.suffix()
    );
    match instance {
        DirectIngestInstance::Primary => name,
        DirectIngestInstance::Secondary => format!("{name}-secondary"),
    }
}

/// Queues holding work for one instance of a region.
pub fn queues_for_instance(state_code: &StateCode, instance: DirectIngestInstance) -> Vec<String> {
    IngestQueueKind::ALL
        .into_iter()
        .map(|kind| queue_name(state_code, instance, kind))
        .collect()
}

/// Every ingest queue of a region.
pub fn queues_for_state(state_code: &StateCode) -> BTreeSet<String> {
    DirectIngestInstance::ALL
        .into_iter()
        .flat_map(|instance| queues_for_instance(state_code, instance))
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum QueueState {
    Running,
    Paused,
}

impl QueueState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "RUNNING",
            Self::Paused => "PAUSED",
        }
    }
}

impl FromStr for QueueState {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "RUNNING" => Ok(Self::Running),
            "PAUSED" => Ok(Self::Paused),
            _ => Err(Error::InvalidQueueState(s.to_string())),
        }
    }
}

impl std::fmt::Display for QueueState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Name and state of one queue, as reported to operators.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestQueueState {
    pub name: String,
    pub state: QueueState,
}

/// A queued unit of work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    /// Unique within a queue while the task is pending.
    pub name: String,
    pub queue_name: String,
    pub payload: TaskPayload,
    pub enqueued_at: DateTime<Utc>,
}

/// Creates, dispatches and administers ingest tasks.
#[async_trait]
pub trait TaskQueueManager: Send + Sync + Debug {
    /// Adds a task to the end of `queue_name`. Returns `None` without enqueuing
    /// anything if a task named `task_name` is already pending in the queue.
    async fn create_task(
        &self,
        queue_name: &str,
        task_name: &str,
        payload: &TaskPayload,
    ) -> Result<Option<Task>>;

    /// Pending tasks in dispatch order.
    async fn list_tasks(&self, queue_name: &str) -> Result<Vec<Task>>;

    /// Removes and returns the oldest pending task. A paused queue dispatches
    /// nothing.
    async fn pop_next_task(&self, queue_name: &str) -> Result<Option<Task>>;

    /// Drops all pending tasks, returning how many were dropped.
    async fn purge_queue(&self, queue_name: &str) -> Result<usize>;

    async fn get_queue_state(&self, queue_name: &str) -> Result<QueueState>;

    async fn update_queue_state(&self, queue_name: &str, state: QueueState) -> Result<()>;

    async fn queue_is_empty(&self, queue_name: &str) -> Result<bool> {
        Ok(self.list_tasks(queue_name).await?.is_empty())
    }

    /// True when no queue of the region instance has pending tasks.
    async fn all_ingest_related_queues_are_empty(
        &self,
        state_code: &StateCode,
        instance: DirectIngestInstance,
    ) -> Result<bool> {
        for queue in queues_for_instance(state_code, instance) {
            if !self.queue_is_empty(&queue).await? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Sets every queue of the region, both instances, to `state`.
    async fn update_ingest_queue_states(
        &self,
        state_code: &StateCode,
        state: QueueState,
    ) -> Result<()> {
        for queue in queues_for_state(state_code) {
            self.update_queue_state(&queue, state).await?;
        }
        Ok(())
    }

    async fn get_ingest_queue_states(&self, state_code: &StateCode) -> Result<Vec<IngestQueueState>> {
        let mut states = vec![];
        for name in queues_for_state(state_code) {
            let state = self.get_queue_state(&name).await?;
            states.push(IngestQueueState { name, state });
        }
        Ok(states)
    }
}
