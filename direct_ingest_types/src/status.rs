use serde::{Deserialize, Serialize};
use std::{fmt::Display, str::FromStr};

use crate::DirectIngestInstance;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown direct ingest status [{0}]")]
pub struct UnknownStatus(pub String);

/// Lifecycle state of a single ingest instance of a region.
///
/// Variants are listed in operator sort order: statuses that need attention
/// first, idle statuses last.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DirectIngestStatus {
    ReadyToFlash,
    ExtractAndMergeInProgress,
    FlashInProgress,
    RerunCancellationInProgress,
    RawDataReimportCancellationInProgress,
    IngestViewMaterializationInProgress,
    RawDataImportInProgress,
    BlockedOnPrimaryRawDataImport,
    RerunWithRawDataImportStarted,
    RawDataReimportStarted,
    StaleRawData,
    StandardRerunStarted,
    InitialState,
    RerunCanceled,
    RawDataReimportCanceled,
    FlashCompleted,
    NoRerunInProgress,
    NoRawDataReimportInProgress,
    UpToDate,
}

impl DirectIngestStatus {
    pub const ALL: [Self; 19] = [
        Self::ReadyToFlash,
        Self::ExtractAndMergeInProgress,
        Self::FlashInProgress,
        Self::RerunCancellationInProgress,
        Self::RawDataReimportCancellationInProgress,
        Self::IngestViewMaterializationInProgress,
        Self::RawDataImportInProgress,
        Self::BlockedOnPrimaryRawDataImport,
        Self::RerunWithRawDataImportStarted,
        Self::RawDataReimportStarted,
        Self::StaleRawData,
        Self::StandardRerunStarted,
        Self::InitialState,
        Self::RerunCanceled,
        Self::RawDataReimportCanceled,
        Self::FlashCompleted,
        Self::NoRerunInProgress,
        Self::NoRawDataReimportInProgress,
        Self::UpToDate,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ReadyToFlash => "READY_TO_FLASH",
            Self::ExtractAndMergeInProgress => "EXTRACT_AND_MERGE_IN_PROGRESS",
            Self::FlashInProgress => "FLASH_IN_PROGRESS",
            Self::RerunCancellationInProgress => "RERUN_CANCELLATION_IN_PROGRESS",
            Self::RawDataReimportCancellationInProgress => {
                "RAW_DATA_REIMPORT_CANCELLATION_IN_PROGRESS"
            }
            Self::IngestViewMaterializationInProgress => "INGEST_VIEW_MATERIALIZATION_IN_PROGRESS",
            Self::RawDataImportInProgress => "RAW_DATA_IMPORT_IN_PROGRESS",
            Self::BlockedOnPrimaryRawDataImport => "BLOCKED_ON_PRIMARY_RAW_DATA_IMPORT",
            Self::RerunWithRawDataImportStarted => "RERUN_WITH_RAW_DATA_IMPORT_STARTED",
            Self::RawDataReimportStarted => "RAW_DATA_REIMPORT_STARTED",
            Self::StaleRawData => "STALE_RAW_DATA",
            Self::StandardRerunStarted => "STANDARD_RERUN_STARTED",
            Self::InitialState => "INITIAL_STATE",
            Self::RerunCanceled => "RERUN_CANCELED",
            Self::RawDataReimportCanceled => "RAW_DATA_REIMPORT_CANCELED",
            Self::FlashCompleted => "FLASH_COMPLETED",
            Self::NoRerunInProgress => "NO_RERUN_IN_PROGRESS",
            Self::NoRawDataReimportInProgress => "NO_RAW_DATA_REIMPORT_IN_PROGRESS",
            Self::UpToDate => "UP_TO_DATE",
        }
    }

    /// Human readable description shown next to the status in operator tooling.
    pub fn message(&self) -> &'static str {
        match self {
            Self::ReadyToFlash => {
                "Scheduler in SECONDARY found no more work to do - flash to PRIMARY is ready to take place"
            }
            Self::ExtractAndMergeInProgress => {
                "Conversion of materialized ingest views to Postgres entities is in progress"
            }
            Self::FlashInProgress => "Flash of data from SECONDARY to PRIMARY is in progress",
            Self::RerunCancellationInProgress => {
                "Cancellation of rerun in SECONDARY is in progress"
            }
            Self::RawDataReimportCancellationInProgress => {
                "Cancellation of raw data reimport in SECONDARY is in progress"
            }
            Self::IngestViewMaterializationInProgress => {
                "Ingest view materialization is in progress"
            }
            Self::RawDataImportInProgress => "Raw data import from GCS to BQ is in progress",
            Self::BlockedOnPrimaryRawDataImport => {
                "Raw data import from GCS to BQ is in progress in primary"
            }
            Self::RerunWithRawDataImportStarted => {
                "Rerun with both raw data import and ingest view materialization has been kicked off"
            }
            Self::RawDataReimportStarted => {
                "A reimport of raw data in SECONDARY has been kicked off"
            }
            Self::StaleRawData => {
                "Raw data in PRIMARY is more up to date than raw data in SECONDARY"
            }
            Self::StandardRerunStarted => {
                "Standard rerun with only ingest view materialization has been kicked off"
            }
            Self::InitialState => {
                "Raw data import has been enabled in PRIMARY but nothing has processed yet"
            }
            Self::RerunCanceled => "Rerun in SECONDARY has been canceled",
            Self::RawDataReimportCanceled => "Raw data reimport in SECONDARY has been canceled",
            Self::FlashCompleted => "Flash of data from SECONDARY to PRIMARY is completed",
            Self::NoRerunInProgress => "No rerun is currently in progress in SECONDARY",
            Self::NoRawDataReimportInProgress => {
                "No raw data reimport is currently in progress in SECONDARY"
            }
            Self::UpToDate => "Scheduler in PRIMARY found no more work to do and is up to date",
        }
    }

    /// Position of this status when listing instances for an operator.
    pub fn sort_rank(&self) -> usize {
        *self as usize
    }

    /// Whether an instance of the given kind can ever be in this status.
    pub fn is_valid_for(&self, instance: DirectIngestInstance) -> bool {
        match instance {
            DirectIngestInstance::Primary => matches!(
                self,
                Self::InitialState
                    | Self::RawDataImportInProgress
                    | Self::IngestViewMaterializationInProgress
                    | Self::ExtractAndMergeInProgress
                    | Self::UpToDate
                    | Self::FlashInProgress
                    | Self::FlashCompleted
            ),
            DirectIngestInstance::Secondary => !matches!(self, Self::InitialState | Self::UpToDate),
        }
    }

    /// The status a freshly created instance starts in.
    pub fn initial_for(instance: DirectIngestInstance) -> Self {
        match instance {
            DirectIngestInstance::Primary => Self::InitialState,
            DirectIngestInstance::Secondary => Self::NoRerunInProgress,
        }
    }

    /// Statuses in which the SECONDARY instance holds no rerun or reimport work.
    pub fn is_secondary_idle(&self) -> bool {
        matches!(
            self,
            Self::NoRerunInProgress | Self::NoRawDataReimportInProgress
        )
    }
}

impl FromStr for DirectIngestStatus {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .find(|status| status.as_str() == s)
            .copied()
            .ok_or_else(|| UnknownStatus(s.to_string()))
    }
}

impl Display for DirectIngestStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
