//! Operator actions on the ingest of a region.
//!
//! Every action validates the state it needs before mutating anything and
//! fails with a [`DirectIngestInstanceError`] carrying an operator facing
//! message when it cannot proceed. Status changes happen under the region lock
//! of the instance they affect.

use chrono::{DateTime, Utc};
use direct_ingest_materialization::{
    IngestViewContentsSummary, query::TableRef, warehouse::WarehouseClient,
};
use direct_ingest_metadata::allowed_transitions;
use direct_ingest_types::{
    DirectIngestInstance, DirectIngestInstanceError, DirectIngestInstanceStatus,
    DirectIngestStatus, IngestViewMaterializationSummary, StateCode,
    datasets::raw_tables_dataset_for_region,
};
use futures::{StreamExt, TryStreamExt, stream};
use observability_deps::tracing::info;
use serde::Serialize;
use std::{
    collections::{BTreeMap, BTreeSet},
    sync::Arc,
};

use crate::{
    IngestContext, RawFileDiscovery, Result,
    queue::{IngestQueueState, QueueState, queues_for_instance, queues_for_state},
};

use DirectIngestInstance::{Primary, Secondary};

/// Processing state of one raw file tag in an instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RawFileTagStatus {
    pub file_tag: String,
    /// Whether the region defines a raw file config for the tag.
    pub has_config: bool,
    pub number_files_in_bucket: u64,
    pub number_unprocessed_files: u64,
    pub number_processed_files: u64,
    pub latest_discovery_time: Option<DateTime<Utc>>,
    pub latest_processed_time: Option<DateTime<Utc>>,
    pub latest_update_datetime: Option<DateTime<Utc>>,
}

impl RawFileTagStatus {
    fn empty(file_tag: String) -> Self {
        Self {
            file_tag,
            has_config: false,
            number_files_in_bucket: 0,
            number_unprocessed_files: 0,
            number_processed_files: 0,
            latest_discovery_time: None,
            latest_processed_time: None,
            latest_update_datetime: None,
        }
    }
}

/// Materialization jobs and saved results of an instance, per ingest view.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IngestViewSummaries {
    pub materialization_summaries: Vec<IngestViewMaterializationSummary>,
    pub contents_summaries: Vec<IngestViewContentsSummary>,
}

/// What an invalidation removed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct InvalidationReport {
    pub metadata_rows_invalidated: u64,
    pub tables_deleted: usize,
}

/// Current status of each instance of each launched region. `None` for an
/// instance that has never been initialized.
pub type InstanceStatuses =
    BTreeMap<StateCode, BTreeMap<DirectIngestInstance, Option<DirectIngestInstanceStatus>>>;

fn precondition(message: impl Into<String>) -> crate::Error {
    DirectIngestInstanceError::new(message).into()
}

/// Deletes every table in `dataset` and returns how many there were.
async fn delete_dataset_tables(warehouse: &dyn WarehouseClient, dataset: &str) -> Result<usize> {
    let tables = warehouse.list_tables(dataset).await?;
    for table in &tables {
        warehouse.delete_table(dataset, table).await?;
    }
    Ok(tables.len())
}

/// Replaces the tables of `destination` with those of `source`, leaving
/// `source` empty. Returns the number of tables moved.
async fn move_dataset_tables(
    warehouse: &dyn WarehouseClient,
    source: &str,
    destination: &str,
) -> Result<usize> {
    delete_dataset_tables(warehouse, destination).await?;
    let tables = warehouse.list_tables(source).await?;
    for table in &tables {
        warehouse
            .copy_table(
                &TableRef::new(warehouse.project_id(), source, table.as_str()),
                &TableRef::new(warehouse.project_id(), destination, table.as_str()),
            )
            .await?;
        warehouse.delete_table(source, table).await?;
    }
    info!(source, destination, count = tables.len(), "moved warehouse tables");
    Ok(tables.len())
}

#[derive(Debug, Clone)]
pub struct IngestOperations {
    context: IngestContext,
}

impl IngestOperations {
    pub fn new(context: IngestContext) -> Self {
        Self { context }
    }

    pub fn context(&self) -> &IngestContext {
        &self.context
    }

    /// Queues a scheduler pass that kicks off ingest for the instance.
    pub async fn trigger_task_scheduler(
        &self,
        state_code: &StateCode,
        instance: DirectIngestInstance,
    ) -> Result<()> {
        info!(%state_code, %instance, "scheduling next job and kicking ingest");
        self.context
            .trigger_task_scheduler(state_code, instance)
            .await
    }

    /// Pauses or resumes every ingest queue of the region.
    pub async fn update_ingest_queues_state(
        &self,
        state_code: &StateCode,
        new_state: QueueState,
    ) -> Result<()> {
        self.context
            .queue()
            .update_ingest_queue_states(state_code, new_state)
            .await?;
        info!(%state_code, state = %new_state, "updated ingest queue states");
        Ok(())
    }

    /// Drops the tasks of every ingest queue of the region and returns how
    /// many were dropped.
    pub async fn purge_ingest_queues(&self, state_code: &StateCode) -> Result<usize> {
        let mut purged = 0;
        for queue in queues_for_state(state_code) {
            purged += self.context.queue().purge_queue(&queue).await?;
        }
        info!(%state_code, purged, "purged ingest queues");
        Ok(purged)
    }

    pub async fn get_ingest_queue_states(
        &self,
        state_code: &StateCode,
    ) -> Result<Vec<IngestQueueState>> {
        Ok(self
            .context
            .queue()
            .get_ingest_queue_states(state_code)
            .await?)
    }

    async fn purge_instance_queues(
        &self,
        state_code: &StateCode,
        instance: DirectIngestInstance,
    ) -> Result<usize> {
        let mut purged = 0;
        for queue in queues_for_instance(state_code, instance) {
            purged += self.context.queue().purge_queue(&queue).await?;
        }
        Ok(purged)
    }

    /// No raw file metadata or raw data may be left in SECONDARY.
    async fn verify_clean_secondary_raw_data_state(&self, state_code: &StateCode) -> Result<()> {
        let raw_files = self.context.raw_file_manager(state_code, Secondary);
        if !raw_files.get_non_invalidated_files().await?.is_empty() {
            return Err(precondition(
                "Cannot kick off ingest rerun, as there are still unprocessed raw files on \
                 Postgres.",
            ));
        }

        let dataset = raw_tables_dataset_for_region(state_code, Secondary, None);
        if self.context.warehouse().dataset_size_bytes(&dataset).await? > 0 {
            return Err(precondition(format!(
                "There are tables in {dataset} that are not empty. Cannot proceed with ingest \
                 rerun."
            )));
        }
        Ok(())
    }

    /// All materialization metadata of the instance must be invalidated and its
    /// results dataset emptied.
    async fn verify_clean_ingest_view_state(
        &self,
        state_code: &StateCode,
        instance: DirectIngestInstance,
    ) -> Result<()> {
        let summaries = self
            .context
            .materialization_manager(state_code, instance)
            .get_instance_summaries()
            .await?;
        if !summaries.is_empty() {
            return Err(precondition(
                "Cannot kick off ingest rerun, as not all ingest view materialization metadata \
                 has been invalidated on Postgres.",
            ));
        }

        let dataset_id = self
            .context
            .ingest_view_contents(state_code, instance)
            .results_dataset();
        let warehouse = self.context.warehouse();
        if warehouse.dataset_exists(&dataset_id).await?
            && !warehouse.list_tables(&dataset_id).await?.is_empty()
        {
            return Err(precondition(format!(
                "There are ingest view results in {dataset_id} that have not been cleaned up. \
                 Cannot proceed with ingest rerun."
            )));
        }
        Ok(())
    }

    /// Starts a rerun of ingest in SECONDARY, reading raw data from
    /// `raw_data_source_instance`.
    pub async fn start_ingest_rerun(
        &self,
        state_code: &StateCode,
        instance: DirectIngestInstance,
        raw_data_source_instance: DirectIngestInstance,
    ) -> Result<()> {
        if instance != Secondary {
            return Err(precondition(
                "Ingest reruns can only be kicked off for SECONDARY instances.",
            ));
        }
        self.context.region(state_code)?;

        let new_status = match raw_data_source_instance {
            Primary => DirectIngestStatus::StandardRerunStarted,
            Secondary => DirectIngestStatus::RerunWithRawDataImportStarted,
        };
        let status_manager = self.context.status_manager(state_code, instance);
        self.context
            .with_region_lock(state_code, instance, || async {
                if !self
                    .context
                    .queue()
                    .all_ingest_related_queues_are_empty(state_code, instance)
                    .await?
                {
                    return Err(precondition(
                        "Cannot kick off ingest rerun because not all ingest related queues \
                         are empty. Please check queues on Ingest Operations Admin Panel to see \
                         which have remaining tasks.",
                    ));
                }

                if raw_data_source_instance == Secondary {
                    self.verify_clean_secondary_raw_data_state(state_code)
                        .await?;
                }
                self.verify_clean_ingest_view_state(state_code, instance)
                    .await?;

                status_manager.add_initial_status().await?;
                status_manager.change_status_to(new_status).await?;
                Ok::<_, crate::Error>(())
            })
            .await?;
        info!(
            %state_code,
            %instance,
            %raw_data_source_instance,
            "started ingest rerun"
        );

        self.trigger_task_scheduler(state_code, instance).await
    }

    /// Lets SECONDARY import the raw files in its bucket into its own raw
    /// dataset, without materializing ingest views.
    pub async fn start_secondary_raw_data_reimport(&self, state_code: &StateCode) -> Result<()> {
        self.context.region(state_code)?;

        let status_manager = self.context.status_manager(state_code, Secondary);
        self.context
            .with_region_lock(state_code, Secondary, || async {
                if !self
                    .context
                    .queue()
                    .all_ingest_related_queues_are_empty(state_code, Secondary)
                    .await?
                {
                    return Err(precondition(
                        "Cannot kick off raw data reimport because not all related task queues \
                         are empty. Please check queues on Ingest Operations Admin Panel to see \
                         which have remaining tasks.",
                    ));
                }
                self.verify_clean_secondary_raw_data_state(state_code)
                    .await?;

                status_manager.add_initial_status().await?;
                status_manager
                    .change_status_to(DirectIngestStatus::RawDataReimportStarted)
                    .await?;
                Ok::<_, crate::Error>(())
            })
            .await?;
        info!(%state_code, "started secondary raw data reimport");

        self.trigger_task_scheduler(state_code, Secondary).await
    }

    pub async fn get_all_current_ingest_instance_statuses(&self) -> Result<InstanceStatuses> {
        let mut statuses = BTreeMap::new();
        for region in self.context.regions().iter().filter(|r| r.launched) {
            let mut by_instance = BTreeMap::new();
            for instance in DirectIngestInstance::ALL {
                let status = match self
                    .context
                    .status_manager(&region.region_code, instance)
                    .get_current_status_info()
                    .await
                {
                    Ok(status) => Some(status),
                    Err(direct_ingest_metadata::Error::NoCurrentStatus { .. }) => None,
                    Err(e) => return Err(e.into()),
                };
                by_instance.insert(instance, status);
            }
            statuses.insert(region.region_code.clone(), by_instance);
        }
        Ok(statuses)
    }

    /// One entry per file tag that has a config, files in the bucket or raw
    /// file metadata, sorted by tag.
    pub async fn get_ingest_raw_file_processing_status(
        &self,
        state_code: &StateCode,
        instance: DirectIngestInstance,
    ) -> Result<Vec<RawFileTagStatus>> {
        let region = self.context.region(state_code)?;
        let raw_file_manager = self.context.raw_file_manager(state_code, instance);
        let bucket_counts = RawFileDiscovery::new(
            Arc::clone(self.context.object_store()),
            raw_file_manager.clone(),
        )
        .file_tag_counts()
        .await?;
        let summaries = raw_file_manager
            .get_metadata_for_all_raw_files_in_region()
            .await?;
        let tags_with_configs: BTreeSet<&str> = region
            .raw_files
            .iter()
            .map(|config| config.file_tag.as_str())
            .collect();

        let all_tags: BTreeSet<&str> = bucket_counts
            .keys()
            .chain(summaries.keys())
            .map(String::as_str)
            .chain(tags_with_configs.iter().copied())
            .collect();

        Ok(all_tags
            .into_iter()
            .map(|file_tag| {
                let mut status = RawFileTagStatus::empty(file_tag.to_string());
                status.has_config = tags_with_configs.contains(file_tag);
                status.number_files_in_bucket =
                    bucket_counts.get(file_tag).copied().unwrap_or_default();
                if let Some(summary) = summaries.get(file_tag) {
                    status.number_unprocessed_files = summary.number_unprocessed_files;
                    status.number_processed_files = summary.number_processed_files;
                    status.latest_discovery_time = Some(summary.latest_discovery_time);
                    status.latest_processed_time = summary.latest_processed_time;
                    status.latest_update_datetime = Some(summary.latest_update_datetime);
                }
                status
            })
            .collect())
    }

    /// Job summaries from the metadata store and results summaries from the
    /// warehouse. Results are fetched concurrently, using at most half of the
    /// warehouse connections.
    pub async fn get_ingest_view_summaries(
        &self,
        state_code: &StateCode,
        instance: DirectIngestInstance,
    ) -> Result<IngestViewSummaries> {
        info!(%state_code, %instance, "getting ingest view materialization summaries");
        let materialization_summaries = self
            .context
            .materialization_manager(state_code, instance)
            .get_instance_summaries()
            .await?;

        let contents = self.context.ingest_view_contents(state_code, instance);
        let concurrency = (self.context.config().warehouse_pool_size / 2).max(1);
        info!(%state_code, %instance, concurrency, "getting ingest view contents summaries");
        let mut contents_summaries: Vec<IngestViewContentsSummary> =
            stream::iter(materialization_summaries.keys())
                .map(|ingest_view_name| {
                    let contents = &contents;
                    async move {
                        contents
                            .get_ingest_view_contents_summary(ingest_view_name)
                            .await
                    }
                })
                .buffer_unordered(concurrency)
                .try_filter_map(|summary| async move { Ok(summary) })
                .try_collect()
                .await?;
        contents_summaries.sort_by(|a, b| a.ingest_view_name.cmp(&b.ingest_view_name));

        Ok(IngestViewSummaries {
            materialization_summaries: materialization_summaries.into_values().collect(),
            contents_summaries,
        })
    }

    async fn clear_ingest_view_data(
        &self,
        state_code: &StateCode,
        instance: DirectIngestInstance,
    ) -> Result<InvalidationReport> {
        let metadata_rows_invalidated = self
            .context
            .materialization_manager(state_code, instance)
            .mark_instance_data_invalidated()
            .await?;
        let tables_deleted = self
            .context
            .ingest_view_contents(state_code, instance)
            .delete_contents_in_ingest_view_dataset()
            .await?;
        Ok(InvalidationReport {
            metadata_rows_invalidated,
            tables_deleted,
        })
    }

    async fn clear_raw_data(
        &self,
        state_code: &StateCode,
        instance: DirectIngestInstance,
    ) -> Result<InvalidationReport> {
        let metadata_rows_invalidated = self
            .context
            .raw_file_manager(state_code, instance)
            .mark_instance_data_invalidated()
            .await?;
        let dataset = raw_tables_dataset_for_region(state_code, instance, None);
        let tables_deleted =
            delete_dataset_tables(self.context.warehouse().as_ref(), &dataset).await?;
        info!(%state_code, %instance, dataset, tables_deleted, "deleted raw data tables");
        Ok(InvalidationReport {
            metadata_rows_invalidated,
            tables_deleted,
        })
    }

    /// Invalidates all materialization jobs of the instance and drops its
    /// ingest view results.
    pub async fn invalidate_ingest_view_data(
        &self,
        state_code: &StateCode,
        instance: DirectIngestInstance,
    ) -> Result<InvalidationReport> {
        self.context.region(state_code)?;
        self.context
            .with_region_lock(state_code, instance, || {
                self.clear_ingest_view_data(state_code, instance)
            })
            .await
    }

    /// Invalidates all raw file metadata of the instance and drops its raw
    /// data tables.
    pub async fn invalidate_raw_data(
        &self,
        state_code: &StateCode,
        instance: DirectIngestInstance,
    ) -> Result<InvalidationReport> {
        self.context.region(state_code)?;
        self.context
            .with_region_lock(state_code, instance, || {
                self.clear_raw_data(state_code, instance)
            })
            .await
    }

    /// Moves both instances to FLASH_IN_PROGRESS. SECONDARY must be
    /// READY_TO_FLASH with nothing left in its queues.
    pub async fn start_flash(&self, state_code: &StateCode) -> Result<()> {
        self.context.region(state_code)?;
        self.context
            .with_region_lock(state_code, Primary, || {
                self.context
                    .with_region_lock(state_code, Secondary, || self.do_start_flash(state_code))
            })
            .await?;
        info!(%state_code, "started flash of SECONDARY to PRIMARY");
        Ok(())
    }

    async fn do_start_flash(&self, state_code: &StateCode) -> Result<()> {
        let primary = self.context.status_manager(state_code, Primary);
        let secondary = self.context.status_manager(state_code, Secondary);
        let primary_status = primary.add_initial_status().await?.status;
        let secondary_status = secondary.add_initial_status().await?.status;

        if secondary_status != DirectIngestStatus::ReadyToFlash {
            return Err(precondition(format!(
                "Cannot start flash for {state_code}: SECONDARY status is {secondary_status}, \
                 expected {}.",
                DirectIngestStatus::ReadyToFlash
            )));
        }
        if !allowed_transitions(Primary, primary_status).contains(&DirectIngestStatus::FlashInProgress)
        {
            return Err(precondition(format!(
                "Cannot start flash for {state_code}: PRIMARY status {primary_status} does not \
                 allow a flash."
            )));
        }
        if !self
            .context
            .queue()
            .all_ingest_related_queues_are_empty(state_code, Secondary)
            .await?
        {
            return Err(precondition(
                "Cannot start flash because not all SECONDARY ingest queues are empty.",
            ));
        }

        secondary
            .change_status_to(DirectIngestStatus::FlashInProgress)
            .await?;
        primary
            .change_status_to(DirectIngestStatus::FlashInProgress)
            .await?;
        Ok(())
    }

    /// Makes the SECONDARY results the PRIMARY ones and returns both instances
    /// to their idle statuses. Raw data moves too when SECONDARY imported its
    /// own.
    pub async fn complete_flash(&self, state_code: &StateCode) -> Result<()> {
        self.context.region(state_code)?;
        self.context
            .with_region_lock(state_code, Primary, || {
                self.context.with_region_lock(state_code, Secondary, || {
                    self.do_complete_flash(state_code)
                })
            })
            .await?;
        info!(%state_code, "completed flash of SECONDARY to PRIMARY");
        self.trigger_task_scheduler(state_code, Primary).await
    }

    async fn do_complete_flash(&self, state_code: &StateCode) -> Result<()> {
        let primary = self.context.status_manager(state_code, Primary);
        let secondary = self.context.status_manager(state_code, Secondary);
        let primary_status = primary.get_current_status().await?;
        let secondary_status = secondary.get_current_status().await?;
        if primary_status != DirectIngestStatus::FlashInProgress
            || secondary_status != DirectIngestStatus::FlashInProgress
        {
            return Err(precondition(format!(
                "Cannot complete flash for {state_code}: PRIMARY status is {primary_status}, \
                 SECONDARY status is {secondary_status}. Both must be {}.",
                DirectIngestStatus::FlashInProgress
            )));
        }

        let start = self.context.most_recent_secondary_start(state_code).await?;
        let reimport = start == Some(DirectIngestStatus::RawDataReimportStarted);
        let imported_raw_data = reimport
            || start == Some(DirectIngestStatus::RerunWithRawDataImportStarted);
        let warehouse = self.context.warehouse().as_ref();

        if !reimport {
            self.context
                .materialization_manager(state_code, Primary)
                .mark_instance_data_invalidated()
                .await?;
            self.context
                .materialization_manager(state_code, Secondary)
                .transfer_metadata_to_new_instance(Primary)
                .await?;
            move_dataset_tables(
                warehouse,
                &self
                    .context
                    .ingest_view_contents(state_code, Secondary)
                    .results_dataset(),
                &self
                    .context
                    .ingest_view_contents(state_code, Primary)
                    .results_dataset(),
            )
            .await?;
        }
        if imported_raw_data {
            self.context
                .raw_file_manager(state_code, Primary)
                .mark_instance_data_invalidated()
                .await?;
            self.context
                .raw_file_manager(state_code, Secondary)
                .transfer_metadata_to_new_instance(Primary)
                .await?;
            move_dataset_tables(
                warehouse,
                &raw_tables_dataset_for_region(state_code, Secondary, None),
                &raw_tables_dataset_for_region(state_code, Primary, None),
            )
            .await?;
        }

        secondary
            .change_status_to(DirectIngestStatus::FlashCompleted)
            .await?;
        secondary
            .change_status_to(if reimport {
                DirectIngestStatus::NoRawDataReimportInProgress
            } else {
                DirectIngestStatus::NoRerunInProgress
            })
            .await?;
        primary
            .change_status_to(DirectIngestStatus::FlashCompleted)
            .await?;
        primary
            .change_status_to(DirectIngestStatus::UpToDate)
            .await?;
        Ok(())
    }

    /// Stops the rerun or raw data reimport running in SECONDARY and throws
    /// away everything it produced.
    pub async fn cancel_rerun(&self, state_code: &StateCode) -> Result<()> {
        self.context.region(state_code)?;
        self.context
            .with_region_lock(state_code, Secondary, || self.do_cancel_rerun(state_code))
            .await
    }

    async fn do_cancel_rerun(&self, state_code: &StateCode) -> Result<()> {
        let status_manager = self.context.status_manager(state_code, Secondary);
        let current = status_manager.add_initial_status().await?.status;
        if current.is_secondary_idle() {
            return Err(precondition(format!(
                "Cannot cancel: there is no rerun or raw data reimport in progress in SECONDARY \
                 for {state_code}."
            )));
        }

        let start = self.context.most_recent_secondary_start(state_code).await?;
        let reimport = start == Some(DirectIngestStatus::RawDataReimportStarted);
        let (cancelling, cancelled, idle) = if reimport {
            (
                DirectIngestStatus::RawDataReimportCancellationInProgress,
                DirectIngestStatus::RawDataReimportCanceled,
                DirectIngestStatus::NoRawDataReimportInProgress,
            )
        } else {
            (
                DirectIngestStatus::RerunCancellationInProgress,
                DirectIngestStatus::RerunCanceled,
                DirectIngestStatus::NoRerunInProgress,
            )
        };
        status_manager.change_status_to(cancelling).await?;

        let purged = self.purge_instance_queues(state_code, Secondary).await?;
        let ingest_views = self.clear_ingest_view_data(state_code, Secondary).await?;
        let raw_data = if reimport
            || start == Some(DirectIngestStatus::RerunWithRawDataImportStarted)
        {
            self.clear_raw_data(state_code, Secondary).await?
        } else {
            InvalidationReport::default()
        };

        status_manager.change_status_to(cancelled).await?;
        status_manager.change_status_to(idle).await?;
        info!(
            %state_code,
            purged,
            ingest_view_jobs = ingest_views.metadata_rows_invalidated,
            raw_files = raw_data.metadata_rows_invalidated,
            "canceled SECONDARY rerun"
        );
        Ok(())
    }
}
