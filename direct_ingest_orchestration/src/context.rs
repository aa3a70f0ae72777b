//! Shared services and the per region, per instance views built from them.

use direct_ingest_lock::{DirectIngestRegionLockManager, LockManager, LockWaitConfig};
use direct_ingest_materialization::{InstanceIngestViewContents, WarehouseClient};
use direct_ingest_metadata::{
    Catalog, InstanceStatusManager, MaterializationMetadataManager, RawFileMetadataManager,
};
use direct_ingest_types::{
    DirectIngestInstance, DirectIngestStatus, StateCode,
    region::{RegionConfig, RegionRegistry},
};
use iox_time::TimeProvider;
use object_store::ObjectStore;
use observability_deps::tracing::debug;
use std::{future::Future, sync::Arc, time::Duration};

use crate::{Result, TaskPayload, queue::TaskQueueManager};

/// Tunables for orchestration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrchestrationConfig {
    /// How long a region lock is held before it is considered abandoned.
    pub lock_ttl: Duration,
    pub lock_wait: LockWaitConfig,
    /// Connections the warehouse client may use at once. Summary fetches use
    /// half of them.
    pub warehouse_pool_size: usize,
    /// Prefix for ingest view results datasets, for sandboxed runs.
    pub dataset_prefix: Option<String>,
}

impl OrchestrationConfig {
    pub const DEFAULT_LOCK_TTL: Duration = Duration::from_secs(60 * 60);
    pub const DEFAULT_WAREHOUSE_POOL_SIZE: usize = 128;
}

impl Default for OrchestrationConfig {
    fn default() -> Self {
        Self {
            lock_ttl: Self::DEFAULT_LOCK_TTL,
            lock_wait: LockWaitConfig::default(),
            warehouse_pool_size: Self::DEFAULT_WAREHOUSE_POOL_SIZE,
            dataset_prefix: None,
        }
    }
}

/// Everything ingest orchestration talks to.
///
/// `object_store` holds the ingest buckets; locks and queues may share it.
#[derive(Debug, Clone)]
pub struct IngestContext {
    regions: Arc<RegionRegistry>,
    catalog: Arc<dyn Catalog>,
    object_store: Arc<dyn ObjectStore>,
    lock_manager: LockManager,
    warehouse: Arc<dyn WarehouseClient>,
    queue: Arc<dyn TaskQueueManager>,
    time_provider: Arc<dyn TimeProvider>,
    config: OrchestrationConfig,
}

impl IngestContext {
    pub fn new(
        regions: Arc<RegionRegistry>,
        catalog: Arc<dyn Catalog>,
        object_store: Arc<dyn ObjectStore>,
        lock_manager: LockManager,
        warehouse: Arc<dyn WarehouseClient>,
        queue: Arc<dyn TaskQueueManager>,
        time_provider: Arc<dyn TimeProvider>,
    ) -> Self {
        Self {
            regions,
            catalog,
            object_store,
            lock_manager,
            warehouse,
            queue,
            time_provider,
            config: OrchestrationConfig::default(),
        }
    }

    pub fn with_config(mut self, config: OrchestrationConfig) -> Self {
        self.config = config;
        self
    }

    pub fn config(&self) -> &OrchestrationConfig {
        &self.config
    }

    pub fn regions(&self) -> &RegionRegistry {
        &self.regions
    }

    pub fn region(&self, state_code: &StateCode) -> Result<Arc<RegionConfig>> {
        Ok(self.regions.get(state_code)?)
    }

    pub fn object_store(&self) -> &Arc<dyn ObjectStore> {
        &self.object_store
    }

    pub fn warehouse(&self) -> &Arc<dyn WarehouseClient> {
        &self.warehouse
    }

    pub fn queue(&self) -> &Arc<dyn TaskQueueManager> {
        &self.queue
    }

    pub fn time_provider(&self) -> &Arc<dyn TimeProvider> {
        &self.time_provider
    }

    pub fn status_manager(
        &self,
        state_code: &StateCode,
        instance: DirectIngestInstance,
    ) -> InstanceStatusManager {
        InstanceStatusManager::new(Arc::clone(&self.catalog), state_code.clone(), instance)
    }

    pub fn raw_file_manager(
        &self,
        state_code: &StateCode,
        raw_data_instance: DirectIngestInstance,
    ) -> RawFileMetadataManager {
        RawFileMetadataManager::new(
            Arc::clone(&self.catalog),
            state_code.clone(),
            raw_data_instance,
        )
    }

    pub fn materialization_manager(
        &self,
        state_code: &StateCode,
        instance: DirectIngestInstance,
    ) -> MaterializationMetadataManager {
        MaterializationMetadataManager::new(Arc::clone(&self.catalog), state_code.clone(), instance)
    }

    pub fn region_lock_manager(
        &self,
        state_code: &StateCode,
        instance: DirectIngestInstance,
    ) -> DirectIngestRegionLockManager {
        DirectIngestRegionLockManager::new(self.lock_manager.clone(), state_code.clone(), instance)
    }

    pub fn ingest_view_contents(
        &self,
        state_code: &StateCode,
        instance: DirectIngestInstance,
    ) -> InstanceIngestViewContents {
        InstanceIngestViewContents::new(
            Arc::clone(&self.warehouse),
            state_code.clone(),
            instance,
            self.config.dataset_prefix.clone(),
        )
    }

    /// The status that started the latest SECONDARY rerun or raw data reimport.
    pub async fn most_recent_secondary_start(
        &self,
        state_code: &StateCode,
    ) -> Result<Option<DirectIngestStatus>> {
        let history = self
            .status_manager(state_code, DirectIngestInstance::Secondary)
            .get_status_history()
            .await?;
        Ok(history.iter().rev().map(|row| row.status).find(|status| {
            matches!(
                status,
                DirectIngestStatus::StandardRerunStarted
                    | DirectIngestStatus::RerunWithRawDataImportStarted
                    | DirectIngestStatus::RawDataReimportStarted
            )
        }))
    }

    /// The instance whose raw data feeds ingest in `instance`. A standard rerun
    /// in SECONDARY reads PRIMARY raw data.
    pub async fn raw_data_source_instance(
        &self,
        state_code: &StateCode,
        instance: DirectIngestInstance,
    ) -> Result<DirectIngestInstance> {
        if instance == DirectIngestInstance::Primary {
            return Ok(DirectIngestInstance::Primary);
        }
        Ok(match self.most_recent_secondary_start(state_code).await? {
            Some(DirectIngestStatus::StandardRerunStarted) => DirectIngestInstance::Primary,
            _ => DirectIngestInstance::Secondary,
        })
    }

    /// Queues a scheduler pass for the instance.
    pub async fn trigger_task_scheduler(
        &self,
        state_code: &StateCode,
        instance: DirectIngestInstance,
    ) -> Result<()> {
        let payload = TaskPayload::HandleNewFiles {
            region_code: state_code.clone(),
            ingest_instance: instance,
        };
        let task = self
            .queue
            .create_task(&payload.queue_name(), &payload.task_name(), &payload)
            .await?;
        debug!(%state_code, %instance, task = ?task.map(|t| t.name), "triggered task scheduler");
        Ok(())
    }

    /// Runs `f` holding the region lock of the instance.
    ///
    /// Waits, within the configured bounds, while another process holds the
    /// lock or a warehouse refresh blocks ingest for the instance.
    pub async fn with_region_lock<F, Fut, T>(
        &self,
        state_code: &StateCode,
        instance: DirectIngestInstance,
        f: F,
    ) -> Result<T>
    where
        F: FnOnce() -> Fut + Send,
        Fut: Future<Output = Result<T>> + Send,
        T: Send,
    {
        debug!(%state_code, %instance, "acquiring region lock");
        self.region_lock_manager(state_code, instance)
            .using_region_lock_when_free(self.config.lock_ttl, self.config.lock_wait, f)
            .await
    }
}
