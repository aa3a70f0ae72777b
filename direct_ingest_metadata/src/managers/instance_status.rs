use chrono::{DateTime, TimeDelta, Utc};
use direct_ingest_types::{
    DirectIngestInstance, DirectIngestInstanceError, DirectIngestInstanceStatus,
    DirectIngestStatus, StateCode,
};
use observability_deps::tracing::info;
use std::sync::Arc;

use super::{Error, Result};
use crate::interface::Catalog;

use direct_ingest_types::DirectIngestStatus as S;

/// Statuses `instance` may move to from `current`. Anything not listed is
/// illegal, including staying in the same status.
pub fn allowed_transitions(
    instance: DirectIngestInstance,
    current: DirectIngestStatus,
) -> &'static [DirectIngestStatus] {
    match instance {
        DirectIngestInstance::Primary => match current {
            S::InitialState => &[
                S::RawDataImportInProgress,
                S::IngestViewMaterializationInProgress,
                S::UpToDate,
                S::FlashInProgress,
            ],
            S::RawDataImportInProgress => &[
                S::IngestViewMaterializationInProgress,
                S::UpToDate,
                S::FlashInProgress,
            ],
            S::IngestViewMaterializationInProgress => &[
                S::ExtractAndMergeInProgress,
                S::RawDataImportInProgress,
                S::UpToDate,
                S::FlashInProgress,
            ],
            S::ExtractAndMergeInProgress => &[
                S::IngestViewMaterializationInProgress,
                S::RawDataImportInProgress,
                S::UpToDate,
                S::FlashInProgress,
            ],
            S::UpToDate => &[
                S::RawDataImportInProgress,
                S::IngestViewMaterializationInProgress,
                S::ExtractAndMergeInProgress,
                S::FlashInProgress,
            ],
            S::FlashInProgress => &[S::FlashCompleted],
            S::FlashCompleted => &[
                S::RawDataImportInProgress,
                S::IngestViewMaterializationInProgress,
                S::UpToDate,
            ],
            _ => &[],
        },
        DirectIngestInstance::Secondary => match current {
            S::NoRerunInProgress | S::NoRawDataReimportInProgress => &[
                S::StandardRerunStarted,
                S::RerunWithRawDataImportStarted,
                S::RawDataReimportStarted,
            ],
            // an instance with nothing left to import or materialize goes
            // straight to READY_TO_FLASH
            S::StandardRerunStarted => &[
                S::IngestViewMaterializationInProgress,
                S::BlockedOnPrimaryRawDataImport,
                S::ReadyToFlash,
                S::RerunCancellationInProgress,
            ],
            S::RerunWithRawDataImportStarted => &[
                S::RawDataImportInProgress,
                S::ReadyToFlash,
                S::RerunCancellationInProgress,
            ],
            S::RawDataReimportStarted => &[
                S::RawDataImportInProgress,
                S::ReadyToFlash,
                S::RawDataReimportCancellationInProgress,
            ],
            S::RawDataImportInProgress => &[
                S::IngestViewMaterializationInProgress,
                S::ReadyToFlash,
                S::StaleRawData,
                S::RerunCancellationInProgress,
                S::RawDataReimportCancellationInProgress,
            ],
            S::BlockedOnPrimaryRawDataImport => &[
                S::IngestViewMaterializationInProgress,
                S::ReadyToFlash,
                S::RerunCancellationInProgress,
            ],
            S::IngestViewMaterializationInProgress => &[
                S::ExtractAndMergeInProgress,
                S::RawDataImportInProgress,
                S::ReadyToFlash,
                S::RerunCancellationInProgress,
            ],
            S::ExtractAndMergeInProgress => &[
                S::IngestViewMaterializationInProgress,
                S::RawDataImportInProgress,
                S::ReadyToFlash,
                S::RerunCancellationInProgress,
            ],
            S::StaleRawData => &[
                S::ReadyToFlash,
                S::RawDataImportInProgress,
                S::RerunCancellationInProgress,
                S::RawDataReimportCancellationInProgress,
            ],
            S::ReadyToFlash => &[
                S::FlashInProgress,
                S::StaleRawData,
                S::IngestViewMaterializationInProgress,
                S::RerunCancellationInProgress,
                S::RawDataReimportCancellationInProgress,
            ],
            // a flash that is aborted returns to READY_TO_FLASH
            S::FlashInProgress => &[S::FlashCompleted, S::ReadyToFlash],
            S::FlashCompleted => &[S::NoRerunInProgress, S::NoRawDataReimportInProgress],
            S::RerunCancellationInProgress => &[S::RerunCanceled],
            S::RerunCanceled => &[S::NoRerunInProgress],
            S::RawDataReimportCancellationInProgress => &[S::RawDataReimportCanceled],
            S::RawDataReimportCanceled => &[S::NoRawDataReimportInProgress],
            _ => &[],
        },
    }
}

/// Checks a transition against [`allowed_transitions`].
fn validate_transition(
    instance: DirectIngestInstance,
    current: DirectIngestStatus,
    new_status: DirectIngestStatus,
) -> Result<(), DirectIngestInstanceError> {
    if !new_status.is_valid_for(instance) {
        return Err(DirectIngestInstanceError::new(format!(
            "The status={new_status} is an invalid status to transition to for instance={instance}"
        )));
    }
    if !allowed_transitions(instance, current).contains(&new_status) {
        return Err(DirectIngestInstanceError::new(format!(
            "Can only transition from the following statuses to {new_status}: [{}]. \
             Current status is {current}.",
            valid_current_statuses(instance, new_status).join(", ")
        )));
    }
    Ok(())
}

fn valid_current_statuses(
    instance: DirectIngestInstance,
    new_status: DirectIngestStatus,
) -> Vec<&'static str> {
    DirectIngestStatus::ALL
        .into_iter()
        .filter(|current| allowed_transitions(instance, *current).contains(&new_status))
        .map(|current| current.as_str())
        .collect()
}

/// Reads and moves the status of one ingest instance of a region.
///
/// Callers are expected to hold the region lock for the instance around
/// [`Self::change_status_to`], which is what linearizes transitions.
#[derive(Debug, Clone)]
pub struct InstanceStatusManager {
    catalog: Arc<dyn Catalog>,
    region_code: StateCode,
    instance: DirectIngestInstance,
}

impl InstanceStatusManager {
    pub fn new(
        catalog: Arc<dyn Catalog>,
        region_code: StateCode,
        instance: DirectIngestInstance,
    ) -> Self {
        Self {
            catalog,
            region_code,
            instance,
        }
    }

    pub fn region_code(&self) -> &StateCode {
        &self.region_code
    }

    pub fn instance(&self) -> DirectIngestInstance {
        self.instance
    }

    fn now(&self) -> DateTime<Utc> {
        self.catalog.time_provider().now().date_time()
    }

    /// Records the initial status of the instance if it has none yet. Returns
    /// the current status either way.
    pub async fn add_initial_status(&self) -> Result<DirectIngestInstanceStatus> {
        let mut txn = self.catalog.start_transaction().await?;
        if let Some(current) = txn
            .instance_statuses()
            .get_current(&self.region_code, self.instance)
            .await?
        {
            txn.abort().await?;
            return Ok(current);
        }

        let status = DirectIngestStatus::initial_for(self.instance);
        let row = txn
            .instance_statuses()
            .create(&self.region_code, self.instance, status, self.now())
            .await?;
        txn.commit().await?;
        info!(
            region_code = %self.region_code,
            instance = %self.instance,
            %status,
            "added initial instance status"
        );
        Ok(row)
    }

    pub async fn get_current_status_info(&self) -> Result<DirectIngestInstanceStatus> {
        self.catalog
            .repositories()
            .await
            .instance_statuses()
            .get_current(&self.region_code, self.instance)
            .await?
            .ok_or_else(|| Error::NoCurrentStatus {
                region_code: self.region_code.clone(),
                instance: self.instance,
            })
    }

    pub async fn get_current_status(&self) -> Result<DirectIngestStatus> {
        Ok(self.get_current_status_info().await?.status)
    }

    /// Every status the instance has been in, oldest first.
    pub async fn get_status_history(&self) -> Result<Vec<DirectIngestInstanceStatus>> {
        Ok(self
            .catalog
            .repositories()
            .await
            .instance_statuses()
            .list_history(&self.region_code, self.instance)
            .await?)
    }

    /// Appends `new_status` to the history if the move from the current status
    /// is legal. Nothing is written when it is not.
    pub async fn change_status_to(
        &self,
        new_status: DirectIngestStatus,
    ) -> Result<DirectIngestInstanceStatus> {
        let mut txn = self.catalog.start_transaction().await?;
        let current = match txn
            .instance_statuses()
            .get_current(&self.region_code, self.instance)
            .await?
        {
            Some(current) => current,
            None => {
                txn.abort().await?;
                return Err(Error::NoCurrentStatus {
                    region_code: self.region_code.clone(),
                    instance: self.instance,
                });
            }
        };

        if let Err(e) = validate_transition(self.instance, current.status, new_status) {
            txn.abort().await?;
            return Err(e.into());
        }

        // the new row must sort after the current one even if the clock did not move
        let mut timestamp = self.now();
        if timestamp <= current.status_timestamp {
            timestamp = current.status_timestamp + TimeDelta::microseconds(1);
        }

        let row = txn
            .instance_statuses()
            .create(&self.region_code, self.instance, new_status, timestamp)
            .await?;
        txn.commit().await?;

        info!(
            region_code = %self.region_code,
            instance = %self.instance,
            from = %current.status,
            to = %new_status,
            "changed instance status"
        );
        Ok(row)
    }
}
