use direct_ingest_clap_blocks::{
    catalog_dsn::{self, CatalogDsnConfig},
    object_store::{self, ObjectStoreConfig},
    orchestration::OrchestrationArgs,
    warehouse::{self, WarehouseConfig},
};
use direct_ingest_lock::LockManager;
use direct_ingest_orchestration::{
    IngestContext, IngestOperations, IngestTaskRunner, ObjectStoreTaskQueue,
};
use direct_ingest_types::{DirectIngestInstance, StateCode, region};
use iox_time::{SystemProvider, TimeProvider};
use serde::Serialize;
use std::sync::Arc;
use trogging::cli::LoggingConfig;

#[derive(Debug, thiserror::Error)]
pub(crate) enum Error {
    #[error("Cannot parse object store config: {0}")]
    ObjectStoreParsing(#[from] object_store::ParseError),

    #[error("Cannot set up the metadata store: {0}")]
    Catalog(#[from] catalog_dsn::Error),

    #[error("Cannot set up the warehouse: {0}")]
    Warehouse(#[from] warehouse::Error),

    #[error("Cannot load region configuration: {0}")]
    Regions(#[from] region::Error),

    #[error(transparent)]
    Orchestration(#[from] direct_ingest_orchestration::Error),

    #[error("Cannot render output: {0}")]
    Output(#[from] serde_json::Error),
}

pub(crate) type Result<T, E = Error> = std::result::Result<T, E>;

/// Options shared by every command that talks to ingest infrastructure.
#[derive(Debug, clap::Parser)]
pub(crate) struct IngestConfig {
    /// object store options
    #[clap(flatten)]
    object_store_config: ObjectStoreConfig,

    /// metadata store options
    #[clap(flatten)]
    catalog_dsn: CatalogDsnConfig,

    /// warehouse options
    #[clap(flatten)]
    warehouse_config: WarehouseConfig,

    /// region, lock and concurrency options
    #[clap(flatten)]
    orchestration: OrchestrationArgs,

    /// logging options
    #[clap(flatten)]
    pub(crate) logging_config: LoggingConfig,
}

impl IngestConfig {
    pub(crate) async fn context(&self) -> Result<IngestContext> {
        let time_provider: Arc<dyn TimeProvider> = Arc::new(SystemProvider::new());
        let object_store = self.object_store_config.make_object_store()?;
        let catalog = self.catalog_dsn.get_catalog("direct_ingest").await?;
        let warehouse = self.warehouse_config.make_warehouse()?;
        let regions = self.orchestration.load_regions()?;

        Ok(IngestContext::new(
            Arc::new(regions),
            catalog,
            Arc::clone(&object_store),
            LockManager::new(Arc::clone(&object_store), Arc::clone(&time_provider)),
            warehouse,
            Arc::new(ObjectStoreTaskQueue::new(
                object_store,
                Arc::clone(&time_provider),
            )),
            time_provider,
        )
        .with_config(self.orchestration.orchestration_config()))
    }

    pub(crate) async fn operations(&self) -> Result<IngestOperations> {
        Ok(IngestOperations::new(self.context().await?))
    }

    pub(crate) async fn task_runner(&self) -> Result<IngestTaskRunner> {
        Ok(IngestTaskRunner::new(self.context().await?))
    }
}

/// Selects one region.
#[derive(Debug, clap::Parser)]
pub(crate) struct RegionArgs {
    /// State code of the region, e.g. `US_XX`
    #[clap(short = 's', long = "state-code", env = "DIRECT_INGEST_STATE_CODE")]
    pub(crate) state_code: StateCode,
}

/// Selects one ingest instance of a region.
#[derive(Debug, clap::Parser)]
pub(crate) struct InstanceArgs {
    #[clap(flatten)]
    pub(crate) region: RegionArgs,

    /// Ingest instance, PRIMARY or SECONDARY
    #[clap(short = 'i', long = "instance", default_value = "PRIMARY")]
    pub(crate) instance: DirectIngestInstance,
}

/// Prints `value` to stdout as pretty JSON.
pub(crate) fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
