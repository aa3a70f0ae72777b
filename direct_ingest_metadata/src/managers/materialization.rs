use chrono::{DateTime, Utc};
use direct_ingest_types::{
    DirectIngestInstance, DirectIngestInstanceError, IngestViewMaterializationArgs,
    IngestViewMaterializationMetadata, IngestViewMaterializationSummary, StateCode,
};
use observability_deps::tracing::{debug, info};
use std::{collections::BTreeMap, sync::Arc};

use super::{Error, Result};
use crate::interface::Catalog;

fn format_bound(bound: Option<DateTime<Utc>>) -> String {
    bound
        .map(|dt| dt.to_rfc3339())
        .unwrap_or_else(|| "None".to_string())
}

/// Materialization job bookkeeping for one region and ingest instance.
#[derive(Debug, Clone)]
pub struct MaterializationMetadataManager {
    catalog: Arc<dyn Catalog>,
    region_code: StateCode,
    instance: DirectIngestInstance,
}

impl MaterializationMetadataManager {
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

    fn check_instance(&self, args: &IngestViewMaterializationArgs) -> Result<()> {
        if args.ingest_instance != self.instance {
            return Err(DirectIngestInstanceError::new(format!(
                "Args for instance {} cannot be handled by the {} metadata manager",
                args.ingest_instance, self.instance
            ))
            .into());
        }
        Ok(())
    }

    /// Registers a pending job. The args must continue the chain of registered
    /// jobs for the view: the lower bound has to equal the upper bound of the
    /// most recent registered job, or be `None` when there is none.
    pub async fn register_ingest_materialization_job(
        &self,
        args: &IngestViewMaterializationArgs,
    ) -> Result<IngestViewMaterializationMetadata> {
        self.check_instance(args)?;
        let now = self.catalog.time_provider().now().date_time();

        let mut txn = self.catalog.start_transaction().await?;
        let most_recent = txn
            .materialization_jobs()
            .get_most_recent(&self.region_code, self.instance, &args.ingest_view_name)
            .await?;
        let expected_lower = most_recent
            .as_ref()
            .map(|job| job.upper_bound_datetime_inclusive);
        if args.lower_bound_datetime_exclusive != expected_lower {
            txn.abort().await?;
            return Err(Error::NonContiguousJob {
                task_id: args.task_id_tag(),
                most_recent_upper: format_bound(expected_lower),
            });
        }

        let job = match txn
            .materialization_jobs()
            .create(&self.region_code, args, now)
            .await
        {
            Ok(job) => job,
            Err(e) => {
                txn.abort().await?;
                return Err(e.into());
            }
        };
        txn.commit().await?;

        info!(
            region_code = %self.region_code,
            instance = %self.instance,
            ingest_view = %args.ingest_view_name,
            lower_bound = %format_bound(args.lower_bound_datetime_exclusive),
            upper_bound = %args.upper_bound_datetime_inclusive,
            "registered ingest view materialization job"
        );
        Ok(job)
    }

    pub async fn mark_ingest_view_materialized(
        &self,
        args: &IngestViewMaterializationArgs,
    ) -> Result<IngestViewMaterializationMetadata> {
        self.check_instance(args)?;
        let now = self.catalog.time_provider().now().date_time();
        let job = self
            .catalog
            .repositories()
            .await
            .materialization_jobs()
            .mark_materialized(&self.region_code, args, now)
            .await?;
        debug!(task_id = %args.task_id_tag(), "marked ingest view materialized");
        Ok(job)
    }

    /// The registered job with the latest upper bound for `ingest_view_name`.
    pub async fn get_most_recent_registered_job(
        &self,
        ingest_view_name: &str,
    ) -> Result<Option<IngestViewMaterializationMetadata>> {
        Ok(self
            .catalog
            .repositories()
            .await
            .materialization_jobs()
            .get_most_recent(&self.region_code, self.instance, ingest_view_name)
            .await?)
    }

    /// The registered job exactly matching `args`, if any.
    pub async fn get_job(
        &self,
        args: &IngestViewMaterializationArgs,
    ) -> Result<Option<IngestViewMaterializationMetadata>> {
        self.check_instance(args)?;
        Ok(self
            .catalog
            .repositories()
            .await
            .materialization_jobs()
            .get(&self.region_code, args)
            .await?)
    }

    /// `None` while the job is pending or if it was never registered.
    pub async fn get_job_completion_time_for_args(
        &self,
        args: &IngestViewMaterializationArgs,
    ) -> Result<Option<DateTime<Utc>>> {
        Ok(self
            .get_job(args)
            .await?
            .and_then(|job| job.materialization_time))
    }

    /// Pending jobs ordered by the position of their view in
    /// `ingest_view_rank_list`, then by upper bound. Views missing from the list
    /// sort last.
    pub async fn get_jobs_pending_completion(
        &self,
        ingest_view_rank_list: &[String],
    ) -> Result<Vec<IngestViewMaterializationMetadata>> {
        let mut pending: Vec<_> = self
            .catalog
            .repositories()
            .await
            .materialization_jobs()
            .list(&self.region_code, self.instance)
            .await?
            .into_iter()
            .filter(|job| !job.is_materialized())
            .collect();

        let rank = |name: &str| {
            ingest_view_rank_list
                .iter()
                .position(|v| v == name)
                .unwrap_or(usize::MAX)
        };
        pending.sort_by(|a, b| {
            rank(&a.ingest_view_name)
                .cmp(&rank(&b.ingest_view_name))
                .then_with(|| a.ingest_view_name.cmp(&b.ingest_view_name))
                .then_with(|| {
                    a.upper_bound_datetime_inclusive
                        .cmp(&b.upper_bound_datetime_inclusive)
                })
        });
        Ok(pending)
    }

    /// Job counts per view. Empty once all metadata of the instance is
    /// invalidated.
    pub async fn get_instance_summaries(
        &self,
    ) -> Result<BTreeMap<String, IngestViewMaterializationSummary>> {
        let jobs = self
            .catalog
            .repositories()
            .await
            .materialization_jobs()
            .list(&self.region_code, self.instance)
            .await?;

        let mut summaries: BTreeMap<String, IngestViewMaterializationSummary> = BTreeMap::new();
        for job in jobs {
            let summary = summaries
                .entry(job.ingest_view_name.clone())
                .or_insert_with(|| IngestViewMaterializationSummary {
                    ingest_view_name: job.ingest_view_name.clone(),
                    num_pending_jobs: 0,
                    num_completed_jobs: 0,
                    completed_jobs_max_datetime: None,
                    pending_jobs_min_datetime: None,
                });
            let upper = Some(job.upper_bound_datetime_inclusive);
            if job.is_materialized() {
                summary.num_completed_jobs += 1;
                summary.completed_jobs_max_datetime =
                    summary.completed_jobs_max_datetime.max(upper);
            } else {
                summary.num_pending_jobs += 1;
                summary.pending_jobs_min_datetime = match summary.pending_jobs_min_datetime {
                    Some(current) => Some(current.min(job.upper_bound_datetime_inclusive)),
                    None => upper,
                };
            }
        }
        Ok(summaries)
    }

    pub async fn mark_instance_data_invalidated(&self) -> Result<u64> {
        let count = self
            .catalog
            .repositories()
            .await
            .materialization_jobs()
            .invalidate_all(&self.region_code, self.instance)
            .await?;
        info!(
            region_code = %self.region_code,
            instance = %self.instance,
            count,
            "invalidated ingest view materialization metadata"
        );
        Ok(count)
    }

    /// Moves all jobs of this instance to `new_instance`, which must not have
    /// any non-invalidated jobs of its own.
    pub async fn transfer_metadata_to_new_instance(
        &self,
        new_instance: DirectIngestInstance,
    ) -> Result<u64> {
        if new_instance == self.instance {
            return Err(DirectIngestInstanceError::new(format!(
                "Either state codes are not the same or new instance is same as origin: \
                 {region}/{instance} -> {region}/{new_instance}",
                region = self.region_code,
                instance = self.instance,
            ))
            .into());
        }

        let mut txn = self.catalog.start_transaction().await?;
        let existing = txn
            .materialization_jobs()
            .list(&self.region_code, new_instance)
            .await?;
        if !existing.is_empty() {
            txn.abort().await?;
            return Err(DirectIngestInstanceError::new(format!(
                "Destination instance should not have any valid materialization metadata \
                 rows: {} has {} for {}",
                new_instance,
                existing.len(),
                self.region_code
            ))
            .into());
        }
        let count = txn
            .materialization_jobs()
            .transfer(&self.region_code, self.instance, new_instance)
            .await?;
        txn.commit().await?;

        info!(
            region_code = %self.region_code,
            from = %self.instance,
            to = %new_instance,
            count,
            "transferred ingest view materialization metadata"
        );
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mem::MemCatalog;
    use iox_time::{MockProvider, Time, TimeProvider};
    use pretty_assertions::assert_eq;
    use std::time::Duration;

    fn ts(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(1_600_000_000 + secs, 0).unwrap()
    }

    struct TestContext {
        catalog: Arc<MemCatalog>,
        time_provider: Arc<MockProvider>,
    }

    impl TestContext {
        fn new() -> Self {
            let time_provider = Arc::new(MockProvider::new(Time::from_date_time(ts(1_000))));
            let catalog = Arc::new(MemCatalog::new_with_time_provider(
                Arc::clone(&time_provider) as Arc<dyn TimeProvider>,
            ));
            Self {
                catalog,
                time_provider,
            }
        }

        fn manager(&self, instance: DirectIngestInstance) -> MaterializationMetadataManager {
            MaterializationMetadataManager::new(
                Arc::clone(&self.catalog) as Arc<dyn Catalog>,
                StateCode::new("US_XX").unwrap(),
                instance,
            )
        }
    }

    fn args(
        view: &str,
        instance: DirectIngestInstance,
        lower: Option<i64>,
        upper: i64,
    ) -> IngestViewMaterializationArgs {
        IngestViewMaterializationArgs::new(view, instance, lower.map(ts), ts(upper))
    }

    #[test_log::test(tokio::test)]
    async fn register_and_materialize() {
        let ctx = TestContext::new();
        let manager = ctx.manager(DirectIngestInstance::Primary);
        let first = args("view_a", DirectIngestInstance::Primary, None, 10);

        assert!(manager.get_most_recent_registered_job("view_a").await.unwrap().is_none());
        let job = manager.register_ingest_materialization_job(&first).await.unwrap();
        assert_eq!(job.job_creation_time, ts(1_000));
        assert_eq!(manager.get_job_completion_time_for_args(&first).await.unwrap(), None);

        ctx.time_provider.inc(Duration::from_secs(5));
        manager.mark_ingest_view_materialized(&first).await.unwrap();
        assert_eq!(
            manager.get_job_completion_time_for_args(&first).await.unwrap(),
            Some(ts(1_005))
        );
        assert_eq!(
            manager
                .get_most_recent_registered_job("view_a")
                .await
                .unwrap()
                .unwrap()
                .args(),
            first
        );
    }

    #[tokio::test]
    async fn registration_must_continue_the_chain() {
        let ctx = TestContext::new();
        let manager = ctx.manager(DirectIngestInstance::Primary);

        let skipped = args("view_a", DirectIngestInstance::Primary, Some(5), 10);
        let err = manager
            .register_ingest_materialization_job(&skipped)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NonContiguousJob { .. }), "{err}");

        manager
            .register_ingest_materialization_job(&args("view_a", DirectIngestInstance::Primary, None, 10))
            .await
            .unwrap();
        let err = manager
            .register_ingest_materialization_job(&args("view_a", DirectIngestInstance::Primary, None, 20))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NonContiguousJob { .. }), "{err}");

        let err = manager
            .register_ingest_materialization_job(&args("view_a", DirectIngestInstance::Primary, Some(10), 10))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Catalog { .. }), "{err}");

        manager
            .register_ingest_materialization_job(&args("view_a", DirectIngestInstance::Primary, Some(10), 20))
            .await
            .unwrap();

        let err = manager
            .register_ingest_materialization_job(&args("view_a", DirectIngestInstance::Secondary, None, 10))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Instance { .. }), "{err}");
    }

    #[tokio::test]
    async fn pending_jobs_follow_rank_order() {
        let ctx = TestContext::new();
        let manager = ctx.manager(DirectIngestInstance::Secondary);
        let instance = DirectIngestInstance::Secondary;

        for a in [
            args("view_a", instance, None, 10),
            args("view_a", instance, Some(10), 20),
            args("view_b", instance, None, 15),
            args("view_c", instance, None, 5),
        ] {
            manager.register_ingest_materialization_job(&a).await.unwrap();
        }
        manager
            .mark_ingest_view_materialized(&args("view_a", instance, None, 10))
            .await
            .unwrap();

        let rank_list = vec!["view_b".to_string(), "view_a".to_string()];
        let pending: Vec<_> = manager
            .get_jobs_pending_completion(&rank_list)
            .await
            .unwrap()
            .into_iter()
            .map(|j| (j.ingest_view_name, j.upper_bound_datetime_inclusive))
            .collect();
        assert_eq!(
            pending,
            vec![
                ("view_b".to_string(), ts(15)),
                ("view_a".to_string(), ts(20)),
                ("view_c".to_string(), ts(5)),
            ]
        );
    }

    #[tokio::test]
    async fn summaries() {
        let ctx = TestContext::new();
        let manager = ctx.manager(DirectIngestInstance::Primary);
        let instance = DirectIngestInstance::Primary;

        for a in [
            args("view_a", instance, None, 10),
            args("view_a", instance, Some(10), 20),
            args("view_a", instance, Some(20), 30),
            args("view_b", instance, None, 15),
        ] {
            manager.register_ingest_materialization_job(&a).await.unwrap();
        }
        manager
            .mark_ingest_view_materialized(&args("view_a", instance, None, 10))
            .await
            .unwrap();

        let summaries = manager.get_instance_summaries().await.unwrap();
        assert_eq!(
            summaries["view_a"],
            IngestViewMaterializationSummary {
                ingest_view_name: "view_a".to_string(),
                num_pending_jobs: 2,
                num_completed_jobs: 1,
                completed_jobs_max_datetime: Some(ts(10)),
                pending_jobs_min_datetime: Some(ts(20)),
            }
        );
        assert_eq!(summaries["view_b"].num_pending_jobs, 1);
        assert_eq!(summaries["view_b"].completed_jobs_max_datetime, None);

        assert_eq!(manager.mark_instance_data_invalidated().await.unwrap(), 4);
        assert!(manager.get_instance_summaries().await.unwrap().is_empty());
        assert!(manager.get_most_recent_registered_job("view_a").await.unwrap().is_none());

        // a fresh chain may start after invalidation
        manager
            .register_ingest_materialization_job(&args("view_a", instance, None, 40))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn transfer() {
        let ctx = TestContext::new();
        let primary = ctx.manager(DirectIngestInstance::Primary);
        let secondary = ctx.manager(DirectIngestInstance::Secondary);

        secondary
            .register_ingest_materialization_job(&args(
                "view_a",
                DirectIngestInstance::Secondary,
                None,
                10,
            ))
            .await
            .unwrap();
        primary
            .register_ingest_materialization_job(&args(
                "view_a",
                DirectIngestInstance::Primary,
                None,
                5,
            ))
            .await
            .unwrap();

        let err = secondary
            .transfer_metadata_to_new_instance(DirectIngestInstance::Primary)
            .await
            .unwrap_err();
        assert!(
            err.to_string()
                .contains("Destination instance should not have any valid materialization metadata rows"),
            "{err}"
        );

        primary.mark_instance_data_invalidated().await.unwrap();
        assert_eq!(
            secondary
                .transfer_metadata_to_new_instance(DirectIngestInstance::Primary)
                .await
                .unwrap(),
            1
        );
        assert!(secondary.get_instance_summaries().await.unwrap().is_empty());
        let moved = primary
            .get_most_recent_registered_job("view_a")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(moved.instance, DirectIngestInstance::Primary);
        assert_eq!(moved.upper_bound_datetime_inclusive, ts(10));
    }
}
