//! Value types shared by every direct ingest crate: regions, instances, statuses,
//! metadata entities and the arguments that drive ingest view materialization.

pub mod datasets;
pub mod entities;
pub mod filename;
pub mod instance;
pub mod materialization_args;
pub mod region;
pub mod status;

pub use entities::{
    DirectIngestInstanceStatus, IngestViewMaterializationMetadata,
    IngestViewMaterializationSummary, RawFileId, RawFileMetadata, RawFileTagSummary,
};
pub use instance::{DirectIngestInstance, SchemaType, StateCode};
pub use materialization_args::IngestViewMaterializationArgs;
pub use status::DirectIngestStatus;

/// Raised when an operator action is not allowed given the current state of an
/// ingest instance. The message is surfaced to the operator verbatim.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{0}")]
pub struct DirectIngestInstanceError(pub String);

impl DirectIngestInstanceError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }

    pub fn message(&self) -> &str {
        &self.0
    }
}
