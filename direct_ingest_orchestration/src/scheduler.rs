//! Advances ingest of a region instance one task at a time.
//!
//! A scheduler pass looks at the status and raw data of the instance, registers
//! the materialization jobs new raw data calls for and queues them. Every
//! materialization task queues another scheduler pass, so draining the queues
//! leaves the instance caught up. A pass that fails leaves its jobs pending and
//! the next pass queues them again. A task that fails goes back on its queue.

use direct_ingest_materialization::{
    Error as MaterializationError, IngestViewMaterializationArgsGenerator,
    IngestViewMaterializer,
};
use direct_ingest_metadata::{InstanceStatusManager, allowed_transitions};
use direct_ingest_types::{
    DirectIngestInstance, DirectIngestStatus, IngestViewMaterializationArgs, StateCode,
    region::RegionConfig,
};
use observability_deps::tracing::{debug, info, warn};
use serde::Serialize;
use std::sync::Arc;

use crate::{
    Error, IngestContext, Result, TaskPayload,
    queue::{IngestQueueKind, Task, queue_name},
};

/// What a scheduler pass did.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ScheduleOutcome {
    /// The region is not launched.
    NotLaunched,
    /// The instance is in a status without ingest work.
    Idle { status: DirectIngestStatus },
    /// Raw files of the source instance still have to be imported.
    WaitingOnRawDataImport {
        raw_data_source_instance: DirectIngestInstance,
        unprocessed_files: usize,
    },
    /// Jobs are pending. `tasks_created` lists the tasks this pass queued; jobs
    /// already queued are not queued again.
    MaterializationScheduled {
        pending_jobs: usize,
        tasks_created: Vec<String>,
    },
    /// Nothing left to do for now.
    CaughtUp { status: DirectIngestStatus },
}

/// Statuses in which the scheduler has work to look for.
fn ingest_active(instance: DirectIngestInstance, status: DirectIngestStatus) -> bool {
    use DirectIngestStatus as S;
    match instance {
        DirectIngestInstance::Primary => status != S::FlashInProgress,
        DirectIngestInstance::Secondary => matches!(
            status,
            S::StandardRerunStarted
                | S::RerunWithRawDataImportStarted
                | S::RawDataReimportStarted
                | S::RawDataImportInProgress
                | S::BlockedOnPrimaryRawDataImport
                | S::IngestViewMaterializationInProgress
                | S::ExtractAndMergeInProgress
                | S::StaleRawData
                | S::ReadyToFlash
        ),
    }
}

/// Moves to `target` if the transition table allows it and returns the status
/// the instance ends up in.
async fn move_to_if_legal(
    manager: &InstanceStatusManager,
    current: DirectIngestStatus,
    target: DirectIngestStatus,
) -> Result<DirectIngestStatus> {
    if current == target {
        debug!(
            region_code = %manager.region_code(),
            instance = %manager.instance(),
            %current,
            "status unchanged"
        );
        return Ok(current);
    }
    if !allowed_transitions(manager.instance(), current).contains(&target) {
        warn!(
            region_code = %manager.region_code(),
            instance = %manager.instance(),
            %current,
            %target,
            "transition not allowed, keeping current status"
        );
        return Ok(current);
    }
    Ok(manager.change_status_to(target).await?.status)
}

#[derive(Debug, Clone)]
pub struct IngestTaskRunner {
    context: IngestContext,
}

impl IngestTaskRunner {
    pub fn new(context: IngestContext) -> Self {
        Self { context }
    }

    pub fn context(&self) -> &IngestContext {
        &self.context
    }

    /// A scheduler pass for the instance, under its region lock.
    pub async fn handle_new_files(
        &self,
        state_code: &StateCode,
        instance: DirectIngestInstance,
    ) -> Result<ScheduleOutcome> {
        let region = self.context.region(state_code)?;
        if !region.launched {
            info!(%state_code, %instance, "region not launched, skipping scheduler");
            return Ok(ScheduleOutcome::NotLaunched);
        }
        self.context
            .status_manager(state_code, instance)
            .add_initial_status()
            .await?;

        let outcome = self
            .context
            .with_region_lock(state_code, instance, || self.schedule(&region, instance))
            .await?;
        info!(%state_code, %instance, ?outcome, "scheduler pass done");
        Ok(outcome)
    }

    async fn schedule(
        &self,
        region: &Arc<RegionConfig>,
        instance: DirectIngestInstance,
    ) -> Result<ScheduleOutcome> {
        let state_code = &region.region_code;
        let status_manager = self.context.status_manager(state_code, instance);
        let current = status_manager.get_current_status().await?;
        if !ingest_active(instance, current) {
            return Ok(ScheduleOutcome::Idle { status: current });
        }

        let raw_data_source_instance = self
            .context
            .raw_data_source_instance(state_code, instance)
            .await?;
        let raw_file_manager = self
            .context
            .raw_file_manager(state_code, raw_data_source_instance);
        let unprocessed_files = raw_file_manager
            .get_non_invalidated_files()
            .await?
            .iter()
            .filter(|file| !file.is_processed())
            .count();
        if unprocessed_files > 0 {
            let waiting = if raw_data_source_instance == instance {
                DirectIngestStatus::RawDataImportInProgress
            } else {
                DirectIngestStatus::BlockedOnPrimaryRawDataImport
            };
            move_to_if_legal(&status_manager, current, waiting).await?;
            return Ok(ScheduleOutcome::WaitingOnRawDataImport {
                raw_data_source_instance,
                unprocessed_files,
            });
        }

        // a reimport is done once its raw data is loaded
        if instance == DirectIngestInstance::Secondary
            && self.context.most_recent_secondary_start(state_code).await?
                == Some(DirectIngestStatus::RawDataReimportStarted)
        {
            let status =
                move_to_if_legal(&status_manager, current, DirectIngestStatus::ReadyToFlash)
                    .await?;
            return Ok(ScheduleOutcome::CaughtUp { status });
        }

        let metadata_manager = self.context.materialization_manager(state_code, instance);
        let generator = IngestViewMaterializationArgsGenerator::new(
            Arc::clone(region),
            raw_file_manager,
            metadata_manager.clone(),
        );
        for args in generator.get_ingest_view_materialization_task_args().await? {
            metadata_manager
                .register_ingest_materialization_job(&args)
                .await?;
        }

        let pending = metadata_manager
            .get_jobs_pending_completion(&region.ingest_view_rank_list)
            .await?;
        if pending.is_empty() {
            let caught_up = match instance {
                DirectIngestInstance::Primary => DirectIngestStatus::UpToDate,
                DirectIngestInstance::Secondary => DirectIngestStatus::ReadyToFlash,
            };
            let status = move_to_if_legal(&status_manager, current, caught_up).await?;
            return Ok(ScheduleOutcome::CaughtUp { status });
        }

        let mut tasks_created = vec![];
        for job in &pending {
            let payload = TaskPayload::Materialize {
                region_code: state_code.clone(),
                args: job.args(),
            };
            if let Some(task) = self
                .context
                .queue()
                .create_task(&payload.queue_name(), &payload.task_name(), &payload)
                .await?
            {
                tasks_created.push(task.name);
            }
        }
        move_to_if_legal(
            &status_manager,
            current,
            DirectIngestStatus::IngestViewMaterializationInProgress,
        )
        .await?;

        Ok(ScheduleOutcome::MaterializationScheduled {
            pending_jobs: pending.len(),
            tasks_created,
        })
    }

    /// Materializes one job under the region lock and queues a scheduler pass
    /// to pick up what follows it. A job invalidated since it was queued, e.g.
    /// by a cancelled rerun, is skipped.
    pub async fn materialize(
        &self,
        state_code: &StateCode,
        args: &IngestViewMaterializationArgs,
    ) -> Result<bool> {
        let region = self.context.region(state_code)?;
        let instance = args.ingest_instance;
        let result = self
            .context
            .with_region_lock(state_code, instance, || self.materialize_locked(region, args))
            .await;
        let materialized = match result {
            Err(Error::Materialization(MaterializationError::JobNotRegistered { task_id })) => {
                info!(%state_code, %instance, %task_id, "job no longer registered, skipping");
                return Ok(false);
            }
            result => result?,
        };
        self.context
            .trigger_task_scheduler(state_code, instance)
            .await?;
        Ok(materialized)
    }

    async fn materialize_locked(
        &self,
        region: Arc<RegionConfig>,
        args: &IngestViewMaterializationArgs,
    ) -> Result<bool> {
        let state_code = region.region_code.clone();
        let instance = args.ingest_instance;
        let raw_data_source_instance = self
            .context
            .raw_data_source_instance(&state_code, instance)
            .await?;
        let materializer = IngestViewMaterializer::new(
            region,
            raw_data_source_instance,
            self.context.materialization_manager(&state_code, instance),
            self.context.ingest_view_contents(&state_code, instance),
            Arc::clone(self.context.warehouse()),
            Arc::clone(self.context.time_provider()),
        );
        Ok(materializer.materialize_view_for_args(args).await?)
    }

    pub async fn run_task(&self, task: &Task) -> Result<()> {
        debug!(task = %task.name, queue = %task.queue_name, "running task");
        match &task.payload {
            TaskPayload::HandleNewFiles {
                region_code,
                ingest_instance,
            } => {
                self.handle_new_files(region_code, *ingest_instance).await?;
            }
            TaskPayload::Materialize { region_code, args } => {
                self.materialize(region_code, args).await?;
            }
        }
        Ok(())
    }

    /// Runs the next dispatchable task of the instance, scheduler tasks first.
    /// Returns `None` when its queues have nothing to dispatch.
    pub async fn run_next_task(
        &self,
        state_code: &StateCode,
        instance: DirectIngestInstance,
    ) -> Result<Option<Task>> {
        for kind in [IngestQueueKind::Scheduler, IngestQueueKind::Materialization] {
            let queue = queue_name(state_code, instance, kind);
            let Some(task) = self.context.queue().pop_next_task(&queue).await? else {
                continue;
            };
            if let Err(e) = self.run_task(&task).await {
                warn!(task = %task.name, %queue, %e, "task failed, queuing it again");
                if let Err(requeue_error) = self
                    .context
                    .queue()
                    .create_task(&queue, &task.name, &task.payload)
                    .await
                {
                    warn!(task = %task.name, %queue, %requeue_error, "failed to queue task again");
                }
                return Err(e);
            }
            return Ok(Some(task));
        }
        Ok(None)
    }

    /// Runs tasks until the queues of the instance are drained or paused and
    /// returns how many ran.
    pub async fn run_until_idle(
        &self,
        state_code: &StateCode,
        instance: DirectIngestInstance,
    ) -> Result<usize> {
        let mut count = 0;
        while self.run_next_task(state_code, instance).await?.is_some() {
            count += 1;
        }
        info!(%state_code, %instance, count, "ingest queues idle");
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        QueueState, RawFileDiscovery,
        test_util::{TestContext, date, people_region, person, put_raw_file, state_code},
    };
    use direct_ingest_types::datasets::raw_tables_dataset_for_region;
    use pretty_assertions::assert_eq;
    use std::time::Duration;

    use DirectIngestInstance::{Primary, Secondary};

    fn runner(t: &TestContext) -> IngestTaskRunner {
        IngestTaskRunner::new(t.context.clone())
    }

    async fn start_standard_rerun(t: &TestContext) {
        t.init_statuses().await;
        t.context
            .status_manager(&state_code(), Secondary)
            .change_status_to(DirectIngestStatus::StandardRerunStarted)
            .await
            .unwrap();
    }

    #[test_log::test(tokio::test)]
    async fn primary_ingest_catches_up() {
        let t = TestContext::new();
        let runner = runner(&t);
        let state = state_code();

        let name = put_raw_file(&t.store, Primary, "people", date(1)).await;
        let raw_files = t.context.raw_file_manager(&state, Primary);
        RawFileDiscovery::new(Arc::clone(&t.store), raw_files.clone())
            .discover()
            .await
            .unwrap();

        assert_eq!(
            runner.handle_new_files(&state, Primary).await.unwrap(),
            ScheduleOutcome::WaitingOnRawDataImport {
                raw_data_source_instance: Primary,
                unprocessed_files: 1,
            }
        );
        assert_eq!(t.status(Primary).await, DirectIngestStatus::RawDataImportInProgress);

        t.warehouse.insert_rows(
            &raw_tables_dataset_for_region(&state, Primary, None),
            "people",
            [
                person(1, date(1), "1", "ann"),
                person(1, date(1), "2", "bob"),
            ],
        );
        raw_files.mark_raw_file_as_processed(&name).await.unwrap();
        t.tick();

        let outcome = runner.handle_new_files(&state, Primary).await.unwrap();
        assert!(
            matches!(
                &outcome,
                ScheduleOutcome::MaterializationScheduled { pending_jobs: 1, tasks_created }
                    if tasks_created.len() == 1
            ),
            "{outcome:?}"
        );
        assert_eq!(
            t.status(Primary).await,
            DirectIngestStatus::IngestViewMaterializationInProgress
        );

        // the same pending job is not queued twice
        assert_eq!(
            runner.handle_new_files(&state, Primary).await.unwrap(),
            ScheduleOutcome::MaterializationScheduled {
                pending_jobs: 1,
                tasks_created: vec![],
            }
        );

        // materialization, then the scheduler pass it queues
        assert_eq!(runner.run_until_idle(&state, Primary).await.unwrap(), 2);
        assert_eq!(t.status(Primary).await, DirectIngestStatus::UpToDate);
        assert_eq!(t.saved_ids(Primary), vec!["1", "2"]);

        t.tick();
        t.import_people_file(Primary, 2, date(2), &[("3", "cy")]).await;
        t.context.trigger_task_scheduler(&state, Primary).await.unwrap();
        assert_eq!(runner.run_until_idle(&state, Primary).await.unwrap(), 3);
        assert_eq!(t.status(Primary).await, DirectIngestStatus::UpToDate);
        assert_eq!(t.saved_ids(Primary), vec!["1", "2", "3"]);
    }

    #[tokio::test]
    async fn unlaunched_region_is_skipped() {
        let t = TestContext::with_region(people_region(false));
        assert_eq!(
            runner(&t)
                .handle_new_files(&state_code(), Primary)
                .await
                .unwrap(),
            ScheduleOutcome::NotLaunched
        );
    }

    #[tokio::test]
    async fn secondary_without_rerun_is_idle() {
        let t = TestContext::new();
        t.import_people_file(Secondary, 1, date(1), &[("1", "ann")]).await;
        assert_eq!(
            runner(&t)
                .handle_new_files(&state_code(), Secondary)
                .await
                .unwrap(),
            ScheduleOutcome::Idle {
                status: DirectIngestStatus::NoRerunInProgress
            }
        );
        assert!(t.saved_ids(Secondary).is_empty());
    }

    #[test_log::test(tokio::test)]
    async fn standard_rerun_reads_primary_raw_data() {
        let t = TestContext::new();
        let runner = runner(&t);
        let state = state_code();
        t.import_people_file(Primary, 1, date(1), &[("1", "ann"), ("2", "bob")])
            .await;
        t.tick();
        t.import_people_file(Primary, 2, date(2), &[("3", "cy")]).await;
        start_standard_rerun(&t).await;
        t.tick();

        t.context.trigger_task_scheduler(&state, Secondary).await.unwrap();
        assert_eq!(runner.run_until_idle(&state, Secondary).await.unwrap(), 3);

        assert_eq!(t.status(Secondary).await, DirectIngestStatus::ReadyToFlash);
        assert_eq!(t.saved_ids(Secondary), vec!["1", "2", "3"]);
        // PRIMARY was not touched
        assert!(t.saved_ids(Primary).is_empty());
    }

    #[tokio::test]
    async fn standard_rerun_without_raw_data_is_ready_to_flash() {
        let t = TestContext::new();
        start_standard_rerun(&t).await;

        assert_eq!(
            runner(&t)
                .handle_new_files(&state_code(), Secondary)
                .await
                .unwrap(),
            ScheduleOutcome::CaughtUp {
                status: DirectIngestStatus::ReadyToFlash
            }
        );
        assert_eq!(t.status(Secondary).await, DirectIngestStatus::ReadyToFlash);
    }

    #[tokio::test]
    async fn standard_rerun_waits_on_primary_import() {
        let t = TestContext::new();
        put_raw_file(&t.store, Primary, "people", date(1)).await;
        RawFileDiscovery::new(
            Arc::clone(&t.store),
            t.context.raw_file_manager(&state_code(), Primary),
        )
        .discover()
        .await
        .unwrap();
        start_standard_rerun(&t).await;

        assert_eq!(
            runner(&t)
                .handle_new_files(&state_code(), Secondary)
                .await
                .unwrap(),
            ScheduleOutcome::WaitingOnRawDataImport {
                raw_data_source_instance: Primary,
                unprocessed_files: 1,
            }
        );
        assert_eq!(
            t.status(Secondary).await,
            DirectIngestStatus::BlockedOnPrimaryRawDataImport
        );
    }

    #[tokio::test]
    async fn reimport_is_ready_to_flash_once_raw_data_is_loaded() {
        let t = TestContext::new();
        t.init_statuses().await;
        let status_manager = t.context.status_manager(&state_code(), Secondary);
        status_manager
            .change_status_to(DirectIngestStatus::RawDataReimportStarted)
            .await
            .unwrap();
        status_manager
            .change_status_to(DirectIngestStatus::RawDataImportInProgress)
            .await
            .unwrap();
        t.import_people_file(Secondary, 1, date(1), &[("1", "ann")]).await;

        assert_eq!(
            runner(&t)
                .handle_new_files(&state_code(), Secondary)
                .await
                .unwrap(),
            ScheduleOutcome::CaughtUp {
                status: DirectIngestStatus::ReadyToFlash
            }
        );
        // reimports do not materialize
        assert!(
            t.context
                .materialization_manager(&state_code(), Secondary)
                .get_instance_summaries()
                .await
                .unwrap()
                .is_empty()
        );
    }

    #[tokio::test]
    async fn paused_queues_hold_tasks() {
        let t = TestContext::new();
        let runner = runner(&t);
        let state = state_code();
        t.import_people_file(Primary, 1, date(1), &[("1", "ann")]).await;
        t.tick();

        t.context
            .queue()
            .update_ingest_queue_states(&state, QueueState::Paused)
            .await
            .unwrap();
        t.context.trigger_task_scheduler(&state, Primary).await.unwrap();
        assert_eq!(runner.run_until_idle(&state, Primary).await.unwrap(), 0);
        assert!(t.saved_ids(Primary).is_empty());

        t.context
            .queue()
            .update_ingest_queue_states(&state, QueueState::Running)
            .await
            .unwrap();
        assert_eq!(runner.run_until_idle(&state, Primary).await.unwrap(), 3);
        assert_eq!(t.saved_ids(Primary), vec!["1"]);
    }

    #[tokio::test]
    async fn backdated_file_fails_the_pass() {
        let t = TestContext::new();
        let runner = runner(&t);
        let state = state_code();
        t.import_people_file(Primary, 1, date(2), &[("1", "ann")]).await;
        t.tick();
        t.context.trigger_task_scheduler(&state, Primary).await.unwrap();
        runner.run_until_idle(&state, Primary).await.unwrap();

        t.tick();
        t.import_people_file(Primary, 2, date(1), &[("2", "bob")]).await;
        let err = runner.handle_new_files(&state, Primary).await.unwrap_err();
        assert!(
            matches!(
                err,
                Error::Materialization(
                    direct_ingest_materialization::Error::UpperBoundBeforeLastExport { .. }
                )
            ),
            "{err}"
        );

        // the lock was released, the failure repeats rather than timing out
        let err = runner.handle_new_files(&state, Primary).await.unwrap_err();
        assert!(matches!(err, Error::Materialization(_)), "{err}");
    }

    /// Imports one PRIMARY file and registers its job without running it.
    async fn pending_primary_job(t: &TestContext) -> IngestViewMaterializationArgs {
        let state = state_code();
        t.import_people_file(Primary, 1, date(1), &[("1", "ann")]).await;
        t.tick();
        runner(t).handle_new_files(&state, Primary).await.unwrap();
        let pending = t
            .context
            .materialization_manager(&state, Primary)
            .get_jobs_pending_completion(&people_region(true).ingest_view_rank_list)
            .await
            .unwrap();
        assert_eq!(pending.len(), 1);
        pending[0].args()
    }

    #[test_log::test(tokio::test)]
    async fn materialization_waits_for_region_lock() {
        let t = TestContext::new();
        let runner = runner(&t);
        let state = state_code();
        let args = pending_primary_job(&t).await;

        // e.g. a flash holding the lock
        let locks = t.context.region_lock_manager(&state, Primary);
        locks.acquire_lock(Duration::from_secs(3600)).await.unwrap();

        let err = runner.materialize(&state, &args).await.unwrap_err();
        assert!(
            matches!(err, Error::Lock(direct_ingest_lock::Error::Timeout { .. })),
            "{err}"
        );
        assert!(t.saved_ids(Primary).is_empty());
        assert_eq!(
            t.context
                .materialization_manager(&state, Primary)
                .get_job_completion_time_for_args(&args)
                .await
                .unwrap(),
            None
        );

        locks.release_lock().await.unwrap();
        assert!(runner.materialize(&state, &args).await.unwrap());
        assert_eq!(t.saved_ids(Primary), vec!["1"]);
    }

    #[tokio::test]
    async fn failed_task_is_queued_again() {
        let t = TestContext::new();
        let runner = runner(&t);
        let state = state_code();
        pending_primary_job(&t).await;
        let materialization = queue_name(&state, Primary, IngestQueueKind::Materialization);
        assert_eq!(t.context.queue().list_tasks(&materialization).await.unwrap().len(), 1);

        let locks = t.context.region_lock_manager(&state, Primary);
        locks.acquire_lock(Duration::from_secs(3600)).await.unwrap();
        runner.run_next_task(&state, Primary).await.unwrap_err();
        assert_eq!(t.context.queue().list_tasks(&materialization).await.unwrap().len(), 1);

        locks.release_lock().await.unwrap();
        assert_eq!(runner.run_until_idle(&state, Primary).await.unwrap(), 2);
        assert_eq!(t.saved_ids(Primary), vec!["1"]);
        assert_eq!(t.status(Primary).await, DirectIngestStatus::UpToDate);
    }

    #[tokio::test]
    async fn invalidated_job_is_skipped() {
        let t = TestContext::new();
        let runner = runner(&t);
        let state = state_code();
        let args = pending_primary_job(&t).await;

        t.context
            .materialization_manager(&state, Primary)
            .mark_instance_data_invalidated()
            .await
            .unwrap();
        assert!(!runner.materialize(&state, &args).await.unwrap());
        assert!(t.saved_ids(Primary).is_empty());
        assert!(
            t.context
                .queue()
                .queue_is_empty(&queue_name(&state, Primary, IngestQueueKind::Scheduler))
                .await
                .unwrap()
        );
    }
}
