//! Traits and parameter types of the metadata store API.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use direct_ingest_types::{
    DirectIngestInstance, DirectIngestInstanceStatus, DirectIngestStatus,
    IngestViewMaterializationArgs, IngestViewMaterializationMetadata, RawFileMetadata, StateCode,
};
use iox_time::TimeProvider;
use snafu::Snafu;
use std::{
    fmt::{Debug, Display},
    sync::Arc,
};

#[derive(Debug, Snafu)]
#[allow(missing_copy_implementations)]
#[snafu(visibility(pub(crate)))]
pub enum Error {
    #[snafu(display("Unhandled sqlx error: {source}"))]
    SqlxError { source: sqlx::Error },

    #[snafu(display("Failed to set up the metadata store: {source}"))]
    Setup { source: sqlx::Error },

    #[snafu(display("Row in {table} could not be decoded: {message}"))]
    InvalidRow { table: &'static str, message: String },

    #[snafu(display(
        "Raw file [{normalized_file_name}] has already been discovered for {region_code} in {instance}"
    ))]
    RawFileExists {
        region_code: StateCode,
        instance: DirectIngestInstance,
        normalized_file_name: String,
    },

    #[snafu(display(
        "Raw file [{normalized_file_name}] not found for {region_code} in {instance}"
    ))]
    RawFileNotFound {
        region_code: StateCode,
        instance: DirectIngestInstance,
        normalized_file_name: String,
    },

    #[snafu(display("Materialization job [{task_id}] has already been registered"))]
    JobExists { task_id: String },

    #[snafu(display("Materialization job [{task_id}] not found"))]
    JobNotFound { task_id: String },

    #[snafu(display("Materialization job [{task_id}] has lower bound not before upper bound"))]
    InvalidJobBounds { task_id: String },
}

/// A specialized `Error` for metadata store errors
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Connection to the operations metadata store.
#[async_trait]
pub trait Catalog: Send + Sync + Debug + Display {
    /// Creates or migrates the schema. Safe to call repeatedly.
    async fn setup(&self) -> Result<()>;

    /// Starts a transaction. Changes become visible to other callers on
    /// [`Transaction::commit`] only.
    async fn start_transaction(&self) -> Result<Box<dyn Transaction>>;

    /// Repositories whose every call is applied on its own.
    async fn repositories(&self) -> Box<dyn RepoCollection>;

    fn time_provider(&self) -> Arc<dyn TimeProvider>;
}

/// Repositories bound to one open transaction. Dropping it without
/// committing rolls back.
#[async_trait]
pub trait Transaction: RepoCollection {
    async fn commit(self: Box<Self>) -> Result<()>;

    async fn abort(self: Box<Self>) -> Result<()>;
}

pub trait RepoCollection: Send + Sync + Debug {
    fn instance_statuses(&mut self) -> &mut dyn InstanceStatusRepo;

    fn raw_files(&mut self) -> &mut dyn RawFileMetadataRepo;

    fn materialization_jobs(&mut self) -> &mut dyn MaterializationJobRepo;
}

/// Append-only status history per region and instance.
#[async_trait]
pub trait InstanceStatusRepo: Send + Sync {
    async fn create(
        &mut self,
        region_code: &StateCode,
        instance: DirectIngestInstance,
        status: DirectIngestStatus,
        status_timestamp: DateTime<Utc>,
    ) -> Result<DirectIngestInstanceStatus>;

    /// The row with the latest timestamp.
    async fn get_current(
        &mut self,
        region_code: &StateCode,
        instance: DirectIngestInstance,
    ) -> Result<Option<DirectIngestInstanceStatus>>;

    /// Every row, oldest first.
    async fn list_history(
        &mut self,
        region_code: &StateCode,
        instance: DirectIngestInstance,
    ) -> Result<Vec<DirectIngestInstanceStatus>>;

    /// The current row of every region and instance that has one, ordered by
    /// region then instance.
    async fn list_current(&mut self) -> Result<Vec<DirectIngestInstanceStatus>>;
}

/// Values needed to record a newly discovered raw file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawFileMetadataParams {
    pub region_code: StateCode,
    pub raw_data_instance: DirectIngestInstance,
    pub file_tag: String,
    pub normalized_file_name: String,
    pub update_datetime: DateTime<Utc>,
    pub file_discovery_time: DateTime<Utc>,
}

/// Raw file bookkeeping. Reads only ever return non-invalidated rows.
#[async_trait]
pub trait RawFileMetadataRepo: Send + Sync {
    /// Fails with [`Error::RawFileExists`] if a non-invalidated row with the
    /// same name exists.
    async fn create(&mut self, params: &RawFileMetadataParams) -> Result<RawFileMetadata>;

    async fn get_by_normalized_file_name(
        &mut self,
        region_code: &StateCode,
        instance: DirectIngestInstance,
        normalized_file_name: &str,
    ) -> Result<Option<RawFileMetadata>>;

    async fn mark_processed(
        &mut self,
        region_code: &StateCode,
        instance: DirectIngestInstance,
        normalized_file_name: &str,
        file_processed_time: DateTime<Utc>,
    ) -> Result<RawFileMetadata>;

    /// Ordered by update datetime, then file id.
    async fn list(
        &mut self,
        region_code: &StateCode,
        instance: DirectIngestInstance,
    ) -> Result<Vec<RawFileMetadata>>;

    /// Files of `file_tag` discovered strictly after `cutoff`, all of them when
    /// `cutoff` is `None`. Ordered by update datetime, then file id.
    async fn list_discovered_after(
        &mut self,
        region_code: &StateCode,
        instance: DirectIngestInstance,
        file_tag: &str,
        cutoff: Option<DateTime<Utc>>,
    ) -> Result<Vec<RawFileMetadata>>;

    /// Returns the number of rows invalidated.
    async fn invalidate_all(
        &mut self,
        region_code: &StateCode,
        instance: DirectIngestInstance,
    ) -> Result<u64>;

    /// Moves every row of `from` to `to`. Returns the number of rows moved.
    async fn transfer(
        &mut self,
        region_code: &StateCode,
        from: DirectIngestInstance,
        to: DirectIngestInstance,
    ) -> Result<u64>;
}

/// Materialization job bookkeeping. Reads only ever return non-invalidated rows.
#[async_trait]
pub trait MaterializationJobRepo: Send + Sync {
    async fn create(
        &mut self,
        region_code: &StateCode,
        args: &IngestViewMaterializationArgs,
        job_creation_time: DateTime<Utc>,
    ) -> Result<IngestViewMaterializationMetadata>;

    async fn get(
        &mut self,
        region_code: &StateCode,
        args: &IngestViewMaterializationArgs,
    ) -> Result<Option<IngestViewMaterializationMetadata>>;

    /// The job with the latest upper bound.
    async fn get_most_recent(
        &mut self,
        region_code: &StateCode,
        instance: DirectIngestInstance,
        ingest_view_name: &str,
    ) -> Result<Option<IngestViewMaterializationMetadata>>;

    async fn mark_materialized(
        &mut self,
        region_code: &StateCode,
        args: &IngestViewMaterializationArgs,
        materialization_time: DateTime<Utc>,
    ) -> Result<IngestViewMaterializationMetadata>;

    /// Ordered by view name, then upper bound.
    async fn list(
        &mut self,
        region_code: &StateCode,
        instance: DirectIngestInstance,
    ) -> Result<Vec<IngestViewMaterializationMetadata>>;

    /// Returns the number of rows invalidated.
    async fn invalidate_all(
        &mut self,
        region_code: &StateCode,
        instance: DirectIngestInstance,
    ) -> Result<u64>;

    /// Moves every row of `from` to `to`. Returns the number of rows moved.
    async fn transfer(
        &mut self,
        region_code: &StateCode,
        from: DirectIngestInstance,
        to: DirectIngestInstance,
    ) -> Result<u64>;
}
