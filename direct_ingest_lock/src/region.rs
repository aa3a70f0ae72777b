//! Lock naming for ingest and for the metadata store to warehouse refresh, and
//! the rules for when each may proceed.

use direct_ingest_types::{DirectIngestInstance, SchemaType, StateCode};
use observability_deps::tracing::{info, warn};
use std::{future::Future, time::Duration};

use crate::{
    Error, Lock, LockManager, Result,
    wait::{LockWaitConfig, poll_until},
};

pub const INGEST_PROCESS_RUNNING_LOCK_PREFIX: &str = "INGEST_PROCESS_RUNNING_";
/// Held while an ingest process writes region metadata or state data.
pub const STATE_INGEST_PROCESS_RUNNING_LOCK_PREFIX: &str = "INGEST_PROCESS_RUNNING_STATE_";
/// Held while a raw file is imported into the raw data tables.
pub const RAW_FILE_IMPORT_INGEST_PROCESS_RUNNING_LOCK_PREFIX: &str =
    "INGEST_PROCESS_RUNNING_RAW_FILE_";
/// Held while a schema is exported from the metadata store to the warehouse.
pub const EXPORT_PROCESS_RUNNING_LOCK_PREFIX: &str = "EXPORT_PROCESS_RUNNING_";

pub fn region_lock_name(region_code: &StateCode, instance: DirectIngestInstance) -> String {
    format!(
        "{STATE_INGEST_PROCESS_RUNNING_LOCK_PREFIX}{}_{}",
        region_code.as_str(),
        instance.as_str()
    )
}

pub fn raw_file_lock_name(
    region_code: &StateCode,
    instance: DirectIngestInstance,
    raw_file_tag: &str,
) -> String {
    format!(
        "{RAW_FILE_IMPORT_INGEST_PROCESS_RUNNING_LOCK_PREFIX}{}_{}_{raw_file_tag}",
        region_code.as_str(),
        instance.as_str()
    )
}

pub fn warehouse_refresh_lock_name(schema: SchemaType, instance: DirectIngestInstance) -> String {
    format!(
        "{EXPORT_PROCESS_RUNNING_LOCK_PREFIX}{}_{}",
        schema.as_str(),
        instance.as_str()
    )
}

/// Serializes ingest work for one region and instance.
#[derive(Debug, Clone)]
pub struct DirectIngestRegionLockManager {
    lock_manager: LockManager,
    region_code: StateCode,
    instance: DirectIngestInstance,
    /// Locks that, while held, mean ingest for this instance must not proceed.
    blocking_locks: Vec<String>,
}

impl DirectIngestRegionLockManager {
    pub fn new(
        lock_manager: LockManager,
        region_code: StateCode,
        instance: DirectIngestInstance,
    ) -> Self {
        let blocking_locks = SchemaType::ALL
            .into_iter()
            .map(|schema| warehouse_refresh_lock_name(schema, instance))
            .collect();
        Self {
            lock_manager,
            region_code,
            instance,
            blocking_locks,
        }
    }

    pub fn region_code(&self) -> &StateCode {
        &self.region_code
    }

    pub fn instance(&self) -> DirectIngestInstance {
        self.instance
    }

    pub fn ingest_lock_name(&self) -> String {
        region_lock_name(&self.region_code, self.instance)
    }

    pub async fn is_locked(&self) -> Result<bool> {
        self.lock_manager.is_locked(&self.ingest_lock_name()).await
    }

    /// False while a warehouse refresh that conflicts with this instance runs.
    pub async fn can_proceed(&self) -> Result<bool> {
        for lock in &self.blocking_locks {
            if self.lock_manager.is_locked(lock).await? {
                info!(
                    region_code = %self.region_code,
                    instance = %self.instance,
                    blocking_lock = %lock,
                    "ingest blocked by lock"
                );
                return Ok(false);
            }
        }
        Ok(true)
    }

    pub async fn acquire_lock(&self, ttl: Duration) -> Result<Lock> {
        self.lock_manager
            .acquire(&self.ingest_lock_name(), None, ttl)
            .await
    }

    pub async fn release_lock(&self) -> Result<()> {
        self.lock_manager.release(&self.ingest_lock_name()).await
    }

    /// Runs `f` while holding the region lock.
    pub async fn using_region_lock<F, Fut, T, E>(&self, ttl: Duration, f: F) -> Result<T, E>
    where
        F: FnOnce() -> Fut + Send,
        Fut: Future<Output = Result<T, E>> + Send,
        T: Send,
        E: From<Error> + std::fmt::Display + Send,
    {
        self.lock_manager
            .using_lock(&self.ingest_lock_name(), None, ttl, f)
            .await
    }

    /// Runs `f` holding the region lock, polling within `wait` until ingest may
    /// proceed and the lock is acquired. Losing the lock to another process
    /// keeps polling.
    pub async fn using_region_lock_when_free<F, Fut, T, E>(
        &self,
        ttl: Duration,
        wait: LockWaitConfig,
        f: F,
    ) -> Result<T, E>
    where
        F: FnOnce() -> Fut + Send,
        Fut: Future<Output = Result<T, E>> + Send,
        T: Send,
        E: From<Error> + std::fmt::Display + Send,
    {
        let description = format!("region lock [{}]", self.ingest_lock_name());
        let lock = poll_until(wait, &description, || async {
            if !self.can_proceed().await? {
                return Ok(None);
            }
            match self.acquire_lock(ttl).await {
                Ok(lock) => Ok(Some(lock)),
                Err(Error::LockAlreadyExists { .. }) => Ok(None),
                Err(e) => Err(e),
            }
        })
        .await?;
        self.lock_manager.run_holding(lock, f).await
    }

    /// Runs `f` while holding the lock for one raw file tag.
    pub async fn using_raw_file_lock<F, Fut, T, E>(
        &self,
        raw_file_tag: &str,
        ttl: Duration,
        f: F,
    ) -> Result<T, E>
    where
        F: FnOnce() -> Fut + Send,
        Fut: Future<Output = Result<T, E>> + Send,
        T: Send,
        E: From<Error> + std::fmt::Display + Send,
    {
        let lock_name = raw_file_lock_name(&self.region_code, self.instance, raw_file_tag);
        self.lock_manager.using_lock(&lock_name, None, ttl, f).await
    }
}

/// Coordinates the export of metadata store schemas to the warehouse with the
/// ingest processes writing to them.
#[derive(Debug, Clone)]
pub struct WarehouseRefreshLockManager {
    lock_manager: LockManager,
}

impl WarehouseRefreshLockManager {
    pub fn new(lock_manager: LockManager) -> Self {
        Self { lock_manager }
    }

    pub async fn acquire_lock(
        &self,
        schema: SchemaType,
        instance: DirectIngestInstance,
        payload: Option<String>,
        ttl: Duration,
    ) -> Result<Lock> {
        self.lock_manager
            .acquire(&warehouse_refresh_lock_name(schema, instance), payload, ttl)
            .await
    }

    pub async fn release_lock(&self, schema: SchemaType, instance: DirectIngestInstance) -> Result<()> {
        self.lock_manager
            .release(&warehouse_refresh_lock_name(schema, instance))
            .await
    }

    /// False while any region holds its ingest lock for `instance`.
    pub async fn can_proceed(&self, schema: SchemaType, instance: DirectIngestInstance) -> Result<bool> {
        let suffix = format!("_{}", instance.as_str());
        let held: Vec<_> = self
            .lock_manager
            .lock_names_with_prefix(STATE_INGEST_PROCESS_RUNNING_LOCK_PREFIX)
            .await?
            .into_iter()
            .filter(|name| name.ends_with(&suffix))
            .collect();
        if !held.is_empty() {
            info!(%schema, %instance, ?held, "warehouse refresh waiting on ingest locks");
        }
        Ok(held.is_empty())
    }

    /// Acquires the refresh lock for `schema`, then waits for in-flight ingest
    /// writes to finish. Each phase polls for at most `wait.max_wait`.
    pub async fn acquire_lock_and_wait(
        &self,
        schema: SchemaType,
        instance: DirectIngestInstance,
        payload: Option<String>,
        ttl: Duration,
        wait: LockWaitConfig,
    ) -> Result<Lock> {
        let description = format!("{schema} in {instance}");
        let lock = poll_until(wait, &description, || {
            let payload = payload.clone();
            async move {
                match self.acquire_lock(schema, instance, payload, ttl).await {
                    Ok(lock) => Ok(Some(lock)),
                    Err(Error::LockAlreadyExists { lock_name }) => {
                        warn!(%lock_name, "refresh lock already held");
                        Ok(None)
                    }
                    Err(e) => Err(e),
                }
            }
        })
        .await?;

        let waited = poll_until(wait, &description, || async {
            Ok(self.can_proceed(schema, instance).await?.then_some(()))
        })
        .await;
        if let Err(e) = waited {
            self.lock_manager.release_if_owned(&lock).await?;
            return Err(e);
        }
        Ok(lock)
    }
}
