//! In-memory implementation of the metadata store interface. Used for tests
//! and for running without a database.

use crate::interface::{
    Catalog, Error, InstanceStatusRepo, MaterializationJobRepo, RawFileMetadataParams,
    RawFileMetadataRepo, RepoCollection, Result, Transaction,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use direct_ingest_types::{
    DirectIngestInstance, DirectIngestInstanceStatus, DirectIngestStatus,
    IngestViewMaterializationArgs, IngestViewMaterializationMetadata, RawFileId, RawFileMetadata,
    StateCode,
};
use iox_time::{SystemProvider, TimeProvider};
use observability_deps::tracing::warn;
use std::{
    collections::BTreeMap,
    fmt::{Display, Formatter},
    sync::Arc,
};
use tokio::sync::{Mutex, OwnedMutexGuard};

/// In-memory metadata store.
pub struct MemCatalog {
    collections: Arc<Mutex<MemCollections>>,
    time_provider: Arc<dyn TimeProvider>,
}

impl MemCatalog {
    pub fn new() -> Self {
        Self::new_with_time_provider(Arc::new(SystemProvider::new()))
    }

    pub fn new_with_time_provider(time_provider: Arc<dyn TimeProvider>) -> Self {
        Self {
            collections: Default::default(),
            time_provider,
        }
    }
}

impl Default for MemCatalog {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for MemCatalog {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemCatalog").finish_non_exhaustive()
    }
}

impl Display for MemCatalog {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Memory")
    }
}

#[derive(Default, Debug, Clone)]
struct MemCollections {
    statuses: Vec<DirectIngestInstanceStatus>,
    raw_files: Vec<RawFileMetadata>,
    jobs: Vec<IngestViewMaterializationMetadata>,
    next_file_id: i64,
}

#[derive(Debug)]
enum MemTxnInner {
    Txn {
        guard: OwnedMutexGuard<MemCollections>,
        stage: MemCollections,
        finalized: bool,
    },
    NoTxn {
        collections: OwnedMutexGuard<MemCollections>,
    },
}

/// Transaction bound to a [`MemCatalog`].
///
/// Holds the catalog mutex for its whole lifetime, so transactions are
/// serialized.
#[derive(Debug)]
pub struct MemTxn {
    inner: MemTxnInner,
}

impl MemTxn {
    fn stage(&mut self) -> &mut MemCollections {
        match &mut self.inner {
            MemTxnInner::Txn { stage, .. } => stage,
            MemTxnInner::NoTxn { collections } => collections,
        }
    }
}

impl Drop for MemTxn {
    fn drop(&mut self) {
        match self.inner {
            MemTxnInner::Txn { finalized, .. } if !finalized => {
                warn!("Dropping MemTxn w/o finalizing (commit or abort)");
            }
            _ => {}
        }
    }
}

#[async_trait]
impl Catalog for MemCatalog {
    async fn setup(&self) -> Result<()> {
        // nothing to do
        Ok(())
    }

    async fn start_transaction(&self) -> Result<Box<dyn Transaction>> {
        let guard = Arc::clone(&self.collections).lock_owned().await;
        let stage = guard.clone();
        Ok(Box::new(MemTxn {
            inner: MemTxnInner::Txn {
                guard,
                stage,
                finalized: false,
            },
        }))
    }

    async fn repositories(&self) -> Box<dyn RepoCollection> {
        let collections = Arc::clone(&self.collections).lock_owned().await;
        Box::new(MemTxn {
            inner: MemTxnInner::NoTxn { collections },
        })
    }

    fn time_provider(&self) -> Arc<dyn TimeProvider> {
        Arc::clone(&self.time_provider)
    }
}

#[async_trait]
impl Transaction for MemTxn {
    async fn commit(self: Box<Self>) -> Result<()> {
        let mut this = self;
        if let MemTxnInner::Txn {
            guard,
            stage,
            finalized,
        } = &mut this.inner
        {
            **guard = std::mem::take(stage);
            *finalized = true;
        }
        Ok(())
    }

    async fn abort(self: Box<Self>) -> Result<()> {
        let mut this = self;
        if let MemTxnInner::Txn { finalized, .. } = &mut this.inner {
            *finalized = true;
        }
        Ok(())
    }
}

impl RepoCollection for MemTxn {
    fn instance_statuses(&mut self) -> &mut dyn InstanceStatusRepo {
        self
    }

    fn raw_files(&mut self) -> &mut dyn RawFileMetadataRepo {
        self
    }

    fn materialization_jobs(&mut self) -> &mut dyn MaterializationJobRepo {
        self
    }
}

#[async_trait]
impl InstanceStatusRepo for MemTxn {
    async fn create(
        &mut self,
        region_code: &StateCode,
        instance: DirectIngestInstance,
        status: DirectIngestStatus,
        status_timestamp: DateTime<Utc>,
    ) -> Result<DirectIngestInstanceStatus> {
        let row = DirectIngestInstanceStatus {
            region_code: region_code.clone(),
            instance,
            status,
            status_timestamp,
        };
        self.stage().statuses.push(row.clone());
        Ok(row)
    }

    async fn get_current(
        &mut self,
        region_code: &StateCode,
        instance: DirectIngestInstance,
    ) -> Result<Option<DirectIngestInstanceStatus>> {
        Ok(self
            .stage()
            .statuses
            .iter()
            .filter(|s| &s.region_code == region_code && s.instance == instance)
            .max_by_key(|s| s.status_timestamp)
            .cloned())
    }

    async fn list_history(
        &mut self,
        region_code: &StateCode,
        instance: DirectIngestInstance,
    ) -> Result<Vec<DirectIngestInstanceStatus>> {
        let mut history: Vec<_> = self
            .stage()
            .statuses
            .iter()
            .filter(|s| &s.region_code == region_code && s.instance == instance)
            .cloned()
            .collect();
        history.sort_by_key(|s| s.status_timestamp);
        Ok(history)
    }

    async fn list_current(&mut self) -> Result<Vec<DirectIngestInstanceStatus>> {
        let mut current: BTreeMap<(String, &'static str), DirectIngestInstanceStatus> =
            BTreeMap::new();
        for s in &self.stage().statuses {
            let key = (s.region_code.as_str().to_string(), s.instance.as_str());
            match current.get(&key) {
                Some(existing) if existing.status_timestamp >= s.status_timestamp => {}
                _ => {
                    current.insert(key, s.clone());
                }
            }
        }
        Ok(current.into_values().collect())
    }
}

fn raw_files_of<'a>(
    raw_files: &'a mut [RawFileMetadata],
    region_code: &'a StateCode,
    instance: DirectIngestInstance,
) -> impl Iterator<Item = &'a mut RawFileMetadata> + 'a {
    raw_files.iter_mut().filter(move |f| {
        &f.region_code == region_code && f.raw_data_instance == instance && !f.is_invalidated
    })
}

fn sorted_files(mut files: Vec<RawFileMetadata>) -> Vec<RawFileMetadata> {
    files.sort_by_key(|f| (f.update_datetime, f.file_id));
    files
}

#[async_trait]
impl RawFileMetadataRepo for MemTxn {
    async fn create(&mut self, params: &RawFileMetadataParams) -> Result<RawFileMetadata> {
        let stage = self.stage();
        let exists = raw_files_of(
            &mut stage.raw_files,
            &params.region_code,
            params.raw_data_instance,
        )
        .any(|f| f.normalized_file_name == params.normalized_file_name);
        if exists {
            return Err(Error::RawFileExists {
                region_code: params.region_code.clone(),
                instance: params.raw_data_instance,
                normalized_file_name: params.normalized_file_name.clone(),
            });
        }

        stage.next_file_id += 1;
        let row = RawFileMetadata {
            file_id: RawFileId::new(stage.next_file_id),
            region_code: params.region_code.clone(),
            file_tag: params.file_tag.clone(),
            raw_data_instance: params.raw_data_instance,
            normalized_file_name: params.normalized_file_name.clone(),
            update_datetime: params.update_datetime,
            file_discovery_time: params.file_discovery_time,
            file_processed_time: None,
            is_invalidated: false,
        };
        stage.raw_files.push(row.clone());
        Ok(row)
    }

    async fn get_by_normalized_file_name(
        &mut self,
        region_code: &StateCode,
        instance: DirectIngestInstance,
        normalized_file_name: &str,
    ) -> Result<Option<RawFileMetadata>> {
        Ok(
            raw_files_of(&mut self.stage().raw_files, region_code, instance)
                .find(|f| f.normalized_file_name == normalized_file_name)
                .cloned(),
        )
    }

    async fn mark_processed(
        &mut self,
        region_code: &StateCode,
        instance: DirectIngestInstance,
        normalized_file_name: &str,
        file_processed_time: DateTime<Utc>,
    ) -> Result<RawFileMetadata> {
        let file = raw_files_of(&mut self.stage().raw_files, region_code, instance)
            .find(|f| f.normalized_file_name == normalized_file_name)
            .ok_or_else(|| Error::RawFileNotFound {
                region_code: region_code.clone(),
                instance,
                normalized_file_name: normalized_file_name.to_string(),
            })?;
        file.file_processed_time = Some(file_processed_time);
        Ok(file.clone())
    }

    async fn list(
        &mut self,
        region_code: &StateCode,
        instance: DirectIngestInstance,
    ) -> Result<Vec<RawFileMetadata>> {
        Ok(sorted_files(
            raw_files_of(&mut self.stage().raw_files, region_code, instance)
                .map(|f| f.clone())
                .collect(),
        ))
    }

    async fn list_discovered_after(
        &mut self,
        region_code: &StateCode,
        instance: DirectIngestInstance,
        file_tag: &str,
        cutoff: Option<DateTime<Utc>>,
    ) -> Result<Vec<RawFileMetadata>> {
        Ok(sorted_files(
            raw_files_of(&mut self.stage().raw_files, region_code, instance)
                .filter(|f| f.file_tag == file_tag)
                .filter(|f| cutoff.is_none_or(|cutoff| f.file_discovery_time > cutoff))
                .map(|f| f.clone())
                .collect(),
        ))
    }

    async fn invalidate_all(
        &mut self,
        region_code: &StateCode,
        instance: DirectIngestInstance,
    ) -> Result<u64> {
        let mut count = 0;
        for f in raw_files_of(&mut self.stage().raw_files, region_code, instance) {
            f.is_invalidated = true;
            count += 1;
        }
        Ok(count)
    }

    async fn transfer(
        &mut self,
        region_code: &StateCode,
        from: DirectIngestInstance,
        to: DirectIngestInstance,
    ) -> Result<u64> {
        let mut count = 0;
        for f in raw_files_of(&mut self.stage().raw_files, region_code, from) {
            f.raw_data_instance = to;
            count += 1;
        }
        Ok(count)
    }
}

fn jobs_of<'a>(
    jobs: &'a mut [IngestViewMaterializationMetadata],
    region_code: &'a StateCode,
    instance: DirectIngestInstance,
) -> impl Iterator<Item = &'a mut IngestViewMaterializationMetadata> + 'a {
    jobs.iter_mut().filter(move |j| {
        &j.region_code == region_code && j.instance == instance && !j.is_invalidated
    })
}

fn matches_args(job: &IngestViewMaterializationMetadata, args: &IngestViewMaterializationArgs) -> bool {
    job.ingest_view_name == args.ingest_view_name
        && job.lower_bound_datetime_exclusive == args.lower_bound_datetime_exclusive
        && job.upper_bound_datetime_inclusive == args.upper_bound_datetime_inclusive
}

#[async_trait]
impl MaterializationJobRepo for MemTxn {
    async fn create(
        &mut self,
        region_code: &StateCode,
        args: &IngestViewMaterializationArgs,
        job_creation_time: DateTime<Utc>,
    ) -> Result<IngestViewMaterializationMetadata> {
        if args
            .lower_bound_datetime_exclusive
            .is_some_and(|lower| lower >= args.upper_bound_datetime_inclusive)
        {
            return Err(Error::InvalidJobBounds {
                task_id: args.task_id_tag(),
            });
        }

        let stage = self.stage();
        let exists = jobs_of(&mut stage.jobs, region_code, args.ingest_instance).any(|j| {
            j.ingest_view_name == args.ingest_view_name
                && j.upper_bound_datetime_inclusive == args.upper_bound_datetime_inclusive
        });
        if exists {
            return Err(Error::JobExists {
                task_id: args.task_id_tag(),
            });
        }

        let row = IngestViewMaterializationMetadata {
            region_code: region_code.clone(),
            instance: args.ingest_instance,
            ingest_view_name: args.ingest_view_name.clone(),
            lower_bound_datetime_exclusive: args.lower_bound_datetime_exclusive,
            upper_bound_datetime_inclusive: args.upper_bound_datetime_inclusive,
            job_creation_time,
            materialization_time: None,
            is_invalidated: false,
        };
        stage.jobs.push(row.clone());
        Ok(row)
    }

    async fn get(
        &mut self,
        region_code: &StateCode,
        args: &IngestViewMaterializationArgs,
    ) -> Result<Option<IngestViewMaterializationMetadata>> {
        Ok(
            jobs_of(&mut self.stage().jobs, region_code, args.ingest_instance)
                .find(|j| matches_args(j, args))
                .cloned(),
        )
    }

    async fn get_most_recent(
        &mut self,
        region_code: &StateCode,
        instance: DirectIngestInstance,
        ingest_view_name: &str,
    ) -> Result<Option<IngestViewMaterializationMetadata>> {
        Ok(jobs_of(&mut self.stage().jobs, region_code, instance)
            .filter(|j| j.ingest_view_name == ingest_view_name)
            .max_by_key(|j| j.upper_bound_datetime_inclusive)
            .cloned())
    }

    async fn mark_materialized(
        &mut self,
        region_code: &StateCode,
        args: &IngestViewMaterializationArgs,
        materialization_time: DateTime<Utc>,
    ) -> Result<IngestViewMaterializationMetadata> {
        let job = jobs_of(&mut self.stage().jobs, region_code, args.ingest_instance)
            .find(|j| matches_args(j, args))
            .ok_or_else(|| Error::JobNotFound {
                task_id: args.task_id_tag(),
            })?;
        job.materialization_time = Some(materialization_time);
        Ok(job.clone())
    }

    async fn list(
        &mut self,
        region_code: &StateCode,
        instance: DirectIngestInstance,
    ) -> Result<Vec<IngestViewMaterializationMetadata>> {
        let mut jobs: Vec<_> = jobs_of(&mut self.stage().jobs, region_code, instance)
            .map(|j| j.clone())
            .collect();
        jobs.sort_by(|a, b| {
            (&a.ingest_view_name, a.upper_bound_datetime_inclusive)
                .cmp(&(&b.ingest_view_name, b.upper_bound_datetime_inclusive))
        });
        Ok(jobs)
    }

    async fn invalidate_all(
        &mut self,
        region_code: &StateCode,
        instance: DirectIngestInstance,
    ) -> Result<u64> {
        let mut count = 0;
        for j in jobs_of(&mut self.stage().jobs, region_code, instance) {
            j.is_invalidated = true;
            count += 1;
        }
        Ok(count)
    }

    async fn transfer(
        &mut self,
        region_code: &StateCode,
        from: DirectIngestInstance,
        to: DirectIngestInstance,
    ) -> Result<u64> {
        let mut count = 0;
        for j in jobs_of(&mut self.stage().jobs, region_code, from) {
            j.instance = to;
            count += 1;
        }
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_catalog() {
        crate::interface_tests::test_catalog(Arc::new(MemCatalog::new())).await;
    }
}
