use async_trait::async_trait;
use futures::TryStreamExt;
use iox_time::TimeProvider;
use object_store::{ObjectMeta, ObjectStore, PutMode, PutPayload, path::Path};
use observability_deps::tracing::{debug, info};
use std::sync::Arc;

use super::{Error, QueueState, Result, Task, TaskQueueManager};
use crate::tasks::TaskPayload;

/// Root under which every queue keeps its objects.
const QUEUE_DIR: &str = "task_queues";

/// A [`TaskQueueManager`] keeping each task as a JSON object.
///
/// Tasks live under `task_queues/{queue}/tasks/`, named so that listing order is
/// enqueue order. A task is dispatched by first creating a claim object with a
/// conditional create, so concurrent runners never dispatch it twice.
#[derive(Debug, Clone)]
pub struct ObjectStoreTaskQueue {
    object_store: Arc<dyn ObjectStore>,
    time_provider: Arc<dyn TimeProvider>,
}

impl ObjectStoreTaskQueue {
    pub fn new(object_store: Arc<dyn ObjectStore>, time_provider: Arc<dyn TimeProvider>) -> Self {
        Self {
            object_store,
            time_provider,
        }
    }

    fn tasks_dir(queue_name: &str) -> Path {
        Path::from(format!("{QUEUE_DIR}/{queue_name}/tasks"))
    }

    fn claim_path(queue_name: &str, task_file: &str) -> Path {
        Path::from(format!("{QUEUE_DIR}/{queue_name}/claims/{task_file}"))
    }

    fn state_path(queue_name: &str) -> Path {
        Path::from(format!("{QUEUE_DIR}/{queue_name}/state.json"))
    }

    fn error(queue_name: &str, source: object_store::Error) -> Error {
        Error::ObjectStore {
            queue_name: queue_name.to_string(),
            source,
        }
    }

    fn corrupt(queue_name: &str, source: serde_json::Error) -> Error {
        Error::Corrupt {
            queue_name: queue_name.to_string(),
            source,
        }
    }

    /// Task objects sorted into dispatch order.
    async fn task_objects(&self, queue_name: &str) -> Result<Vec<ObjectMeta>> {
        let mut metas: Vec<ObjectMeta> = self
            .object_store
            .list(Some(&Self::tasks_dir(queue_name)))
            .try_collect()
            .await
            .map_err(|e| Self::error(queue_name, e))?;
        metas.sort_by(|a, b| a.location.cmp(&b.location));
        Ok(metas)
    }

    async fn read_task(&self, queue_name: &str, location: &Path) -> Result<Option<Task>> {
        let result = match self.object_store.get(location).await {
            Ok(result) => result,
            Err(object_store::Error::NotFound { .. }) => return Ok(None),
            Err(e) => return Err(Self::error(queue_name, e)),
        };
        let bytes = result
            .bytes()
            .await
            .map_err(|e| Self::error(queue_name, e))?;
        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|e| Self::corrupt(queue_name, e))
    }

    async fn delete(&self, queue_name: &str, location: &Path) -> Result<()> {
        match self.object_store.delete(location).await {
            Ok(()) | Err(object_store::Error::NotFound { .. }) => Ok(()),
            Err(e) => Err(Self::error(queue_name, e)),
        }
    }
}

#[async_trait]
impl TaskQueueManager for ObjectStoreTaskQueue {
    async fn create_task(
        &self,
        queue_name: &str,
        task_name: &str,
        payload: &TaskPayload,
    ) -> Result<Option<Task>> {
        if self
            .list_tasks(queue_name)
            .await?
            .iter()
            .any(|t| t.name == task_name)
        {
            debug!(queue_name, task_name, "task already queued");
            return Ok(None);
        }

        let enqueued_at = self.time_provider.now().date_time();
        let task = Task {
            name: task_name.to_string(),
            queue_name: queue_name.to_string(),
            payload: payload.clone(),
            enqueued_at,
        };
        let body = serde_json::to_vec(&task).map_err(|e| Self::corrupt(queue_name, e))?;
        let location = Self::tasks_dir(queue_name).child(format!(
            "{:020}-{task_name}.json",
            enqueued_at.timestamp_micros()
        ));
        self.object_store
            .put_opts(&location, PutPayload::from(body), PutMode::Create.into())
            .await
            .map_err(|e| Self::error(queue_name, e))?;

        info!(queue_name, task_name, "created task");
        Ok(Some(task))
    }

    async fn list_tasks(&self, queue_name: &str) -> Result<Vec<Task>> {
        let mut tasks = vec![];
        for meta in self.task_objects(queue_name).await? {
            if let Some(task) = self.read_task(queue_name, &meta.location).await? {
                tasks.push(task);
            }
        }
        Ok(tasks)
    }

    async fn pop_next_task(&self, queue_name: &str) -> Result<Option<Task>> {
        if self.get_queue_state(queue_name).await? == QueueState::Paused {
            debug!(queue_name, "queue is paused");
            return Ok(None);
        }

        for meta in self.task_objects(queue_name).await? {
            let Some(task_file) = meta.location.filename() else {
                continue;
            };
            let claim = Self::claim_path(queue_name, task_file);
            match self
                .object_store
                .put_opts(&claim, PutPayload::from_static(b""), PutMode::Create.into())
                .await
            {
                Ok(_) => {}
                // another runner is dispatching it
                Err(object_store::Error::AlreadyExists { .. }) => continue,
                Err(e) => return Err(Self::error(queue_name, e)),
            }

            let task = self.read_task(queue_name, &meta.location).await?;
            self.delete(queue_name, &meta.location).await?;
            self.delete(queue_name, &claim).await?;
            if let Some(task) = task {
                debug!(queue_name, task_name = %task.name, "dispatching task");
                return Ok(Some(task));
            }
        }
        Ok(None)
    }

    async fn purge_queue(&self, queue_name: &str) -> Result<usize> {
        let metas = self.task_objects(queue_name).await?;
        for meta in &metas {
            self.delete(queue_name, &meta.location).await?;
        }
        info!(queue_name, count = metas.len(), "purged queue");
        Ok(metas.len())
    }

    async fn get_queue_state(&self, queue_name: &str) -> Result<QueueState> {
        let result = match self.object_store.get(&Self::state_path(queue_name)).await {
            Ok(result) => result,
            Err(object_store::Error::NotFound { .. }) => return Ok(QueueState::Running),
            Err(e) => return Err(Self::error(queue_name, e)),
        };
        let bytes = result
            .bytes()
            .await
            .map_err(|e| Self::error(queue_name, e))?;
        serde_json::from_slice(&bytes).map_err(|e| Self::corrupt(queue_name, e))
    }

    async fn update_queue_state(&self, queue_name: &str, state: QueueState) -> Result<()> {
        let body = serde_json::to_vec(&state).map_err(|e| Self::corrupt(queue_name, e))?;
        self.object_store
            .put(&Self::state_path(queue_name), PutPayload::from(body))
            .await
            .map_err(|e| Self::error(queue_name, e))?;
        info!(queue_name, %state, "updated queue state");
        Ok(())
    }
}
