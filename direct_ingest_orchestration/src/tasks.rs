//! Payloads carried by ingest tasks and the names tasks are queued under.

use direct_ingest_types::{DirectIngestInstance, IngestViewMaterializationArgs, StateCode};
use serde::{Deserialize, Serialize};

use crate::queue::{IngestQueueKind, queue_name};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TaskPayload {
    /// Look for new work in an instance and schedule it.
    HandleNewFiles {
        region_code: StateCode,
        ingest_instance: DirectIngestInstance,
    },
    /// Materialize one registered job.
    Materialize {
        region_code: StateCode,
        args: IngestViewMaterializationArgs,
    },
}

impl TaskPayload {
    pub fn region_code(&self) -> &StateCode {
        match self {
            Self::HandleNewFiles { region_code, .. } | Self::Materialize { region_code, .. } => {
                region_code
            }
        }
    }

    pub fn ingest_instance(&self) -> DirectIngestInstance {
        match self {
            Self::HandleNewFiles {
                ingest_instance, ..
            } => *ingest_instance,
            Self::Materialize { args, .. } => args.ingest_instance,
        }
    }

    /// The queue this task belongs in.
    pub fn queue_name(&self) -> String {
        let kind = match self {
            Self::HandleNewFiles { .. } => IngestQueueKind::Scheduler,
            Self::Materialize { .. } => IngestQueueKind::Materialization,
        };
        queue_name(self.region_code(), self.ingest_instance(), kind)
    }

    /// Scheduler tasks get a unique name each time. Materialization tasks are
    /// named after their args so the same job is never queued twice.
    pub fn task_name(&self) -> String {
        match self {
            Self::HandleNewFiles {
                region_code,
                ingest_instance,
            } => format!(
                "{}-{}-handle_new_files-{}",
                region_code.lower(),
                ingest_instance.lower(),
                uuid::Uuid::new_v4().simple()
            ),
            Self::Materialize { region_code, args } => {
                format!("{}-{}", region_code.lower(), args.task_id_tag())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use pretty_assertions::assert_eq;

    #[test]
    fn payload_json() {
        let payload = TaskPayload::Materialize {
            region_code: StateCode::new("US_XX").unwrap(),
            args: IngestViewMaterializationArgs::new(
                "ingest_view",
                DirectIngestInstance::Secondary,
                None,
                Utc.with_ymd_and_hms(2022, 4, 14, 1, 2, 3).unwrap(),
            ),
        };
        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["type"], "materialize");
        assert_eq!(json["region_code"], "US_XX");
        assert_eq!(json["args"]["ingest_instance"], "SECONDARY");
        assert_eq!(serde_json::from_value::<TaskPayload>(json).unwrap(), payload);

        assert_eq!(
            payload.queue_name(),
            "direct-ingest-state-us-xx-materialization-secondary"
        );
        assert_eq!(
            payload.task_name(),
            "us_xx-ingest_view_materialization_ingest_view-SECONDARY-None-\
             2022_04_14_01_02_03_000000"
        );
    }

    #[test]
    fn scheduler_task_names_are_unique() {
        let payload = TaskPayload::HandleNewFiles {
            region_code: StateCode::new("US_XX").unwrap(),
            ingest_instance: DirectIngestInstance::Primary,
        };
        assert_eq!(payload.queue_name(), "direct-ingest-state-us-xx-scheduler");
        assert!(payload.task_name().starts_with("us_xx-primary-handle_new_files-"));
        assert_ne!(payload.task_name(), payload.task_name());
    }
}
