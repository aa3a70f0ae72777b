//! Decides which watermark range of each ingest view to materialize next.

use chrono::{DateTime, Utc};
use direct_ingest_metadata::{MaterializationMetadataManager, RawFileMetadataManager};
use direct_ingest_types::{
    IngestViewMaterializationArgs,
    region::{IngestViewDefinition, RegionConfig},
};
use observability_deps::tracing::{debug, info};
use std::sync::Arc;

use crate::{Error, Result};

/// Generates materialization args from newly discovered raw files.
///
/// Raw files are read from the raw data source instance, jobs are looked up in
/// the ingest instance. The two differ for a rerun that reuses PRIMARY raw data.
#[derive(Debug, Clone)]
pub struct IngestViewMaterializationArgsGenerator {
    region: Arc<RegionConfig>,
    raw_file_metadata_manager: RawFileMetadataManager,
    metadata_manager: MaterializationMetadataManager,
}

impl IngestViewMaterializationArgsGenerator {
    pub fn new(
        region: Arc<RegionConfig>,
        raw_file_metadata_manager: RawFileMetadataManager,
        metadata_manager: MaterializationMetadataManager,
    ) -> Self {
        Self {
            region,
            raw_file_metadata_manager,
            metadata_manager,
        }
    }

    pub fn metadata_manager(&self) -> &MaterializationMetadataManager {
        &self.metadata_manager
    }

    /// Args for every launched ingest view with new data, in rank order.
    pub async fn get_ingest_view_materialization_task_args(
        &self,
    ) -> Result<Vec<IngestViewMaterializationArgs>> {
        let mut all_args = vec![];
        for view in self.region.launched_ingest_views() {
            if let Some(args) = self.args_for_view(view).await? {
                all_args.push(args);
            }
        }
        info!(
            region_code = %self.region.region_code,
            instance = %self.metadata_manager.instance(),
            count = all_args.len(),
            "generated ingest view materialization args"
        );
        Ok(all_args)
    }

    async fn args_for_view(
        &self,
        view: &IngestViewDefinition,
    ) -> Result<Option<IngestViewMaterializationArgs>> {
        let previous_job = self
            .metadata_manager
            .get_most_recent_registered_job(&view.name)
            .await?;
        let previous_upper = previous_job
            .as_ref()
            .map(|job| job.upper_bound_datetime_inclusive);
        let discovered_after = previous_job.as_ref().map(|job| job.job_creation_time);

        let mut new_upper: Option<DateTime<Utc>> = None;
        for config in self.region.raw_file_configs_for_view(view)? {
            let files = self
                .raw_file_metadata_manager
                .get_metadata_for_raw_files_discovered_after_datetime(
                    &config.file_tag,
                    discovered_after,
                )
                .await?;

            for file in files {
                let candidate = file.update_datetime;
                match previous_upper {
                    Some(last) if candidate < last => {
                        if config.is_reference_table() {
                            // re-sent code tables carry old dates
                            debug!(
                                ingest_view = %view.name,
                                file_tag = %config.file_tag,
                                %candidate,
                                "skipping backdated reference table file"
                            );
                            continue;
                        }
                        return Err(Error::UpperBoundBeforeLastExport {
                            ingest_view_name: view.name.clone(),
                            file_tag: config.file_tag.clone(),
                            candidate,
                            last_upper_bound: last,
                        });
                    }
                    Some(last) if candidate == last => continue,
                    _ => {}
                }
                new_upper = new_upper.max(Some(candidate));
            }
        }

        Ok(new_upper.map(|upper| {
            IngestViewMaterializationArgs::new(
                view.name.clone(),
                self.metadata_manager.instance(),
                previous_upper,
                upper,
            )
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::{fake_region, raw_file, state_code, view};
    use chrono::TimeZone;
    use direct_ingest_metadata::MemCatalog;
    use direct_ingest_types::{DirectIngestInstance, filename::NormalizedRawFileName};
    use iox_time::{MockProvider, Time};
    use pretty_assertions::assert_eq;

    fn date(y: i32, m: u32, d: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, 0, 0, 0).unwrap()
    }

    struct Fixture {
        time: Arc<MockProvider>,
        generator: IngestViewMaterializationArgsGenerator,
    }

    impl Fixture {
        fn new(region: Arc<RegionConfig>, ingest_instance: DirectIngestInstance) -> Self {
            let time = Arc::new(MockProvider::new(Time::from_date_time(date(2022, 4, 14))));
            let catalog = Arc::new(MemCatalog::new_with_time_provider(
                Arc::clone(&time) as _
            ));
            let generator = IngestViewMaterializationArgsGenerator::new(
                region,
                RawFileMetadataManager::new(
                    Arc::clone(&catalog) as _,
                    state_code(),
                    DirectIngestInstance::Primary,
                ),
                MaterializationMetadataManager::new(catalog, state_code(), ingest_instance),
            );
            Self { time, generator }
        }

        fn at(&self, dt: DateTime<Utc>) {
            self.time.set(Time::from_date_time(dt));
        }

        async fn discover(&self, tag: &str, update_datetime: DateTime<Utc>) {
            let name = NormalizedRawFileName::new_unprocessed(tag, update_datetime, "csv");
            self.generator
                .raw_file_metadata_manager
                .mark_raw_file_as_discovered(&name.to_string())
                .await
                .unwrap();
        }

        async fn register(&self, args: &IngestViewMaterializationArgs) {
            self.generator
                .metadata_manager
                .register_ingest_materialization_job(args)
                .await
                .unwrap();
        }

        async fn args(&self) -> Result<Vec<IngestViewMaterializationArgs>> {
            self.generator.get_ingest_view_materialization_task_args().await
        }
    }

    #[tokio::test]
    async fn first_job_covers_all_files() {
        let fixture = Fixture::new(fake_region(false), DirectIngestInstance::Secondary);
        fixture.discover("file_tag_first", date(2019, 7, 20)).await;
        fixture.discover("tagFullHistoricalExport", date(2020, 7, 20)).await;
        fixture.discover("unrelated", date(2021, 7, 20)).await;

        assert_eq!(
            fixture.args().await.unwrap(),
            vec![IngestViewMaterializationArgs::new(
                "ingest_view",
                DirectIngestInstance::Secondary,
                None,
                date(2020, 7, 20),
            )]
        );
    }

    #[tokio::test]
    async fn continues_from_previous_job() {
        let fixture = Fixture::new(fake_region(false), DirectIngestInstance::Primary);
        fixture.discover("file_tag_first", date(2019, 7, 20)).await;
        let first = IngestViewMaterializationArgs::new(
            "ingest_view",
            DirectIngestInstance::Primary,
            None,
            date(2019, 7, 20),
        );
        assert_eq!(fixture.args().await.unwrap(), vec![first.clone()]);

        fixture.at(date(2022, 4, 15));
        fixture.register(&first).await;
        // nothing new since the job was created
        assert_eq!(fixture.args().await.unwrap(), vec![]);

        fixture.at(date(2022, 4, 16));
        fixture.discover("file_tag_first", date(2020, 7, 20)).await;
        assert_eq!(
            fixture.args().await.unwrap(),
            vec![IngestViewMaterializationArgs::new(
                "ingest_view",
                DirectIngestInstance::Primary,
                Some(date(2019, 7, 20)),
                date(2020, 7, 20),
            )]
        );
    }

    #[tokio::test]
    async fn data_file_older_than_last_export_fails() {
        let fixture = Fixture::new(fake_region(false), DirectIngestInstance::Primary);
        fixture
            .register(&IngestViewMaterializationArgs::new(
                "ingest_view",
                DirectIngestInstance::Primary,
                None,
                date(2020, 7, 20),
            ))
            .await;

        fixture.at(date(2022, 4, 15));
        fixture.discover("file_tag_first", date(2019, 7, 20)).await;
        let err = fixture.args().await.unwrap_err();
        assert!(matches!(err, Error::UpperBoundBeforeLastExport { .. }));
        let message = err.to_string();
        assert!(message.contains("upper bound date"), "{message}");
        assert!(message.contains("before the last valid export"), "{message}");
    }

    #[tokio::test]
    async fn backdated_reference_table_is_ignored() {
        let mut region = (*fake_region(false)).clone();
        region.raw_files.push(raw_file(
            "RECIDIVIZ_REFERENCE_ingest_view",
            &["code"],
            &["code", "description"],
        ));
        region.ingest_views.push(view(
            "ingest_view_using_code_table",
            "select * from {RECIDIVIZ_REFERENCE_ingest_view}",
            &["code"],
        ));
        region
            .ingest_view_rank_list
            .push("ingest_view_using_code_table".to_string());
        let fixture = Fixture::new(Arc::new(region), DirectIngestInstance::Primary);

        fixture
            .register(&IngestViewMaterializationArgs::new(
                "ingest_view_using_code_table",
                DirectIngestInstance::Primary,
                None,
                date(2020, 7, 20),
            ))
            .await;
        fixture.at(date(2022, 4, 15));
        fixture
            .discover("RECIDIVIZ_REFERENCE_ingest_view", date(2019, 7, 20))
            .await;

        assert_eq!(fixture.args().await.unwrap(), vec![]);
    }

    #[tokio::test]
    async fn file_at_previous_upper_bound_adds_nothing() {
        let fixture = Fixture::new(fake_region(false), DirectIngestInstance::Primary);
        fixture.discover("file_tag_first", date(2021, 7, 25)).await;
        fixture
            .register(&IngestViewMaterializationArgs::new(
                "ingest_view",
                DirectIngestInstance::Primary,
                None,
                date(2021, 7, 25),
            ))
            .await;

        // an identically dated file of another dependency shows up late
        fixture.at(date(2022, 4, 15));
        fixture.discover("tagFullHistoricalExport", date(2021, 7, 25)).await;
        assert_eq!(fixture.args().await.unwrap(), vec![]);
    }

    #[tokio::test]
    async fn unranked_views_are_not_materialized() {
        let mut region = (*fake_region(false)).clone();
        region.ingest_view_rank_list.clear();
        let fixture = Fixture::new(Arc::new(region), DirectIngestInstance::Primary);
        fixture.discover("file_tag_first", date(2019, 7, 20)).await;

        assert_eq!(fixture.args().await.unwrap(), vec![]);
    }
}
