//! Materializes the rows an ingest view gained between two watermarks.

use chrono::{DateTime, Utc};
use direct_ingest_metadata::MaterializationMetadataManager;
use direct_ingest_types::{
    DirectIngestInstance, IngestViewMaterializationArgs,
    datasets::raw_tables_dataset_for_region,
    region::{IngestViewDefinition, RegionConfig},
};
use iox_time::TimeProvider;
use observability_deps::tracing::{info, warn};
use std::sync::Arc;

use crate::{
    Error, Result,
    contents::InstanceIngestViewContents,
    query::{self, BoundType, DiffQuery, TableRef, ViewSnapshotQuery, temp_table_name},
    warehouse::WarehouseClient,
};

/// Tables in the temp dataset are dropped after a day.
pub const TEMP_DATASET_DEFAULT_TABLE_EXPIRATION_MS: u64 = 24 * 60 * 60 * 1000;

fn temp_table_suffix() -> String {
    uuid::Uuid::new_v4().simple().to_string()[..8].to_string()
}

#[derive(Debug, Clone)]
pub struct IngestViewMaterializer {
    region: Arc<RegionConfig>,
    ingest_instance: DirectIngestInstance,
    raw_data_source_instance: DirectIngestInstance,
    metadata_manager: MaterializationMetadataManager,
    contents: InstanceIngestViewContents,
    warehouse: Arc<dyn WarehouseClient>,
    time_provider: Arc<dyn TimeProvider>,
}

impl IngestViewMaterializer {
    pub fn new(
        region: Arc<RegionConfig>,
        raw_data_source_instance: DirectIngestInstance,
        metadata_manager: MaterializationMetadataManager,
        contents: InstanceIngestViewContents,
        warehouse: Arc<dyn WarehouseClient>,
        time_provider: Arc<dyn TimeProvider>,
    ) -> Self {
        Self {
            region,
            ingest_instance: metadata_manager.instance(),
            raw_data_source_instance,
            metadata_manager,
            contents,
            warehouse,
            time_provider,
        }
    }

    pub fn ingest_instance(&self) -> DirectIngestInstance {
        self.ingest_instance
    }

    fn ingest_view(&self, ingest_view_name: &str) -> Result<&IngestViewDefinition> {
        self.region
            .ingest_view(ingest_view_name)
            .ok_or_else(|| Error::UnknownIngestView {
                region_code: self.region.region_code.clone(),
                ingest_view_name: ingest_view_name.to_string(),
            })
    }

    fn snapshot_query(
        &self,
        view: &IngestViewDefinition,
        bound: DateTime<Utc>,
    ) -> Result<ViewSnapshotQuery> {
        Ok(ViewSnapshotQuery {
            project_id: self.warehouse.project_id().to_string(),
            raw_data_dataset: raw_tables_dataset_for_region(
                &self.region.region_code,
                self.raw_data_source_instance,
                None,
            ),
            view: view.clone(),
            raw_tables: self
                .region
                .raw_file_configs_for_view(view)?
                .into_iter()
                .cloned()
                .collect(),
            bound,
        })
    }

    /// Computes and saves the results for `args` and marks the job
    /// materialized. Returns `false` without touching the warehouse when the
    /// job was already materialized.
    pub async fn materialize_view_for_args(
        &self,
        args: &IngestViewMaterializationArgs,
    ) -> Result<bool> {
        if !self.region.launched {
            return Err(Error::NotLaunched(self.region.region_code.clone()));
        }
        let view = self.ingest_view(&args.ingest_view_name)?;

        let job = self
            .metadata_manager
            .get_job(args)
            .await?
            .ok_or_else(|| Error::JobNotRegistered {
                task_id: args.task_id_tag(),
            })?;
        if job.is_materialized() {
            info!(
                task_id = %args.task_id_tag(),
                "ingest view already materialized, skipping"
            );
            return Ok(false);
        }

        let now = self.time_provider.now().date_time();
        let temp_dataset = self.contents.temp_results_dataset(now);
        self.warehouse
            .create_dataset_if_necessary(
                &temp_dataset,
                Some(TEMP_DATASET_DEFAULT_TABLE_EXPIRATION_MS),
            )
            .await?;

        let mut temp_tables = vec![];
        let saved = self
            .save_diff(view, args, &temp_dataset, &mut temp_tables)
            .await;
        let cleaned_up = self.delete_temp_tables(&temp_tables).await;
        if let Err(e) = saved {
            if let Err(cleanup_error) = cleaned_up {
                warn!(
                    task_id = %args.task_id_tag(),
                    %cleanup_error,
                    "failed to delete temp tables, they expire with the dataset"
                );
            }
            return Err(e);
        }
        cleaned_up?;

        self.metadata_manager
            .mark_ingest_view_materialized(args)
            .await?;
        info!(
            region_code = %self.region.region_code,
            instance = %self.ingest_instance,
            raw_data_source_instance = %self.raw_data_source_instance,
            task_id = %args.task_id_tag(),
            "materialized ingest view"
        );
        Ok(true)
    }

    /// Snapshots the view at both bounds into temp tables of `temp_dataset`
    /// and saves their diff. Every temp table created is pushed to
    /// `temp_tables`, also when a later step fails.
    async fn save_diff(
        &self,
        view: &IngestViewDefinition,
        args: &IngestViewMaterializationArgs,
        temp_dataset: &str,
        temp_tables: &mut Vec<TableRef>,
    ) -> Result<()> {
        let suffix = temp_table_suffix();
        let project_id = self.warehouse.project_id();

        let upper_table = TableRef::new(
            project_id,
            temp_dataset,
            temp_table_name(
                &view.name,
                args.upper_bound_datetime_inclusive,
                BoundType::Upper,
                &suffix,
            ),
        );
        self.warehouse
            .create_table_from_snapshot(
                &self.snapshot_query(view, args.upper_bound_datetime_inclusive)?,
                &upper_table,
            )
            .await?;
        temp_tables.push(upper_table.clone());

        let lower_table = match args.lower_bound_datetime_exclusive {
            Some(lower) => {
                let table = TableRef::new(
                    project_id,
                    temp_dataset,
                    temp_table_name(&view.name, lower, BoundType::Lower, &suffix),
                );
                self.warehouse
                    .create_table_from_snapshot(&self.snapshot_query(view, lower)?, &table)
                    .await?;
                temp_tables.push(table.clone());
                Some(table)
            }
            None => None,
        };

        let diff = DiffQuery {
            upper_bound_table: upper_table,
            lower_bound_table: lower_table,
            order_by_columns: view.order_by_columns.clone(),
        };
        self.contents
            .save_query_results(
                &view.name,
                args.upper_bound_datetime_inclusive,
                args.lower_bound_datetime_exclusive,
                diff,
            )
            .await?;
        Ok(())
    }

    async fn delete_temp_tables(&self, temp_tables: &[TableRef]) -> Result<()> {
        for table in temp_tables {
            self.warehouse
                .delete_table(&table.dataset_id, &table.table_id)
                .await?;
        }
        Ok(())
    }

    /// The computation for `args` as a standalone script.
    pub fn debug_query_for_args(&self, args: &IngestViewMaterializationArgs) -> Result<String> {
        let view = self.ingest_view(&args.ingest_view_name)?;
        let upper = self.snapshot_query(view, args.upper_bound_datetime_inclusive)?;
        let lower = args
            .lower_bound_datetime_exclusive
            .map(|lower| self.snapshot_query(view, lower))
            .transpose()?;
        Ok(query::debug_query_for_args(
            &upper,
            lower.as_ref(),
            args,
            &temp_table_suffix(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        query::columns,
        test_util::{PROJECT_ID, fake_region, raw_file, state_code, view},
        value::{Row, Value, row},
        warehouse::{
            MemWarehouse,
            recording::{Call, RecordingWarehouse},
        },
    };
    use chrono::TimeZone;
    use direct_ingest_metadata::MemCatalog;
    use iox_time::{MockProvider, Time};
    use pretty_assertions::assert_eq;
    use std::collections::BTreeSet;

    fn date_1() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2019, 7, 20, 0, 0, 0).unwrap()
    }

    fn date_2() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2020, 7, 20, 1, 2, 3).unwrap()
    }

    fn args(
        instance: DirectIngestInstance,
        lower: Option<DateTime<Utc>>,
        upper: DateTime<Utc>,
    ) -> IngestViewMaterializationArgs {
        IngestViewMaterializationArgs::new("ingest_view", instance, lower, upper)
    }

    struct Fixture {
        time: Arc<MockProvider>,
        materializer: IngestViewMaterializer,
    }

    impl Fixture {
        fn new(
            region: Arc<RegionConfig>,
            catalog: Arc<MemCatalog>,
            time: Arc<MockProvider>,
            warehouse: Arc<dyn WarehouseClient>,
            instance: DirectIngestInstance,
        ) -> Self {
            let contents = InstanceIngestViewContents::new(
                Arc::clone(&warehouse),
                state_code(),
                instance,
                None,
            );
            let materializer = IngestViewMaterializer::new(
                region,
                DirectIngestInstance::Primary,
                MaterializationMetadataManager::new(catalog, state_code(), instance),
                contents,
                warehouse,
                Arc::clone(&time) as _,
            );
            Self { time, materializer }
        }

        fn secondary(region: Arc<RegionConfig>, warehouse: Arc<dyn WarehouseClient>) -> Self {
            let time = Arc::new(MockProvider::new(Time::from_date_time(
                Utc.with_ymd_and_hms(2022, 4, 13, 0, 0, 0).unwrap(),
            )));
            let catalog = Arc::new(MemCatalog::new_with_time_provider(
                Arc::clone(&time) as _
            ));
            Self::new(
                region,
                catalog,
                time,
                warehouse,
                DirectIngestInstance::Secondary,
            )
        }

        fn metadata(&self) -> &MaterializationMetadataManager {
            &self.materializer.metadata_manager
        }

        async fn materialize(&self, args: &IngestViewMaterializationArgs) -> Result<bool> {
            self.materializer.materialize_view_for_args(args).await
        }
    }

    fn suffix_of(sql: &str) -> String {
        let start = sql.find("_upper_bound_").unwrap() + "_upper_bound_".len();
        sql[start..start + 8].to_string()
    }

    #[tokio::test]
    async fn not_launched() {
        let mut region = (*fake_region(false)).clone();
        region.launched = false;
        let warehouse = Arc::new(RecordingWarehouse::new(PROJECT_ID));
        let fixture = Fixture::secondary(Arc::new(region), Arc::clone(&warehouse) as _);

        let err = fixture
            .materialize(&args(DirectIngestInstance::Secondary, Some(date_1()), date_2()))
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "Ingest not enabled for region [US_XX]");
        assert_eq!(warehouse.calls(), vec![]);
    }

    #[tokio::test]
    async fn job_must_be_registered() {
        let warehouse = Arc::new(RecordingWarehouse::new(PROJECT_ID));
        let fixture = Fixture::secondary(fake_region(false), Arc::clone(&warehouse) as _);

        let err = fixture
            .materialize(&args(DirectIngestInstance::Secondary, Some(date_1()), date_2()))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::JobNotRegistered { .. }), "{err}");
        assert_eq!(warehouse.calls(), vec![]);
    }

    #[test_log::test(tokio::test)]
    async fn already_materialized() {
        let warehouse = Arc::new(RecordingWarehouse::new(PROJECT_ID));
        let fixture = Fixture::secondary(fake_region(false), Arc::clone(&warehouse) as _);
        let args = args(DirectIngestInstance::Secondary, Some(date_1()), date_2());
        fixture
            .metadata()
            .register_ingest_materialization_job(&args)
            .await
            .unwrap_err();
        // a job with a lower bound needs a predecessor
        let first = IngestViewMaterializationArgs::new(
            "ingest_view",
            DirectIngestInstance::Secondary,
            None,
            date_1(),
        );
        fixture
            .metadata()
            .register_ingest_materialization_job(&first)
            .await
            .unwrap();
        fixture
            .metadata()
            .register_ingest_materialization_job(&args)
            .await
            .unwrap();

        fixture.time.inc(std::time::Duration::from_secs(86_400));
        let marked = fixture
            .metadata()
            .mark_ingest_view_materialized(&args)
            .await
            .unwrap();

        fixture.time.inc(std::time::Duration::from_secs(86_400));
        assert!(!fixture.materialize(&args).await.unwrap());
        assert_eq!(warehouse.calls(), vec![]);
        assert_eq!(
            fixture
                .metadata()
                .get_job_completion_time_for_args(&args)
                .await
                .unwrap(),
            marked.materialization_time
        );
    }

    #[tokio::test]
    async fn failed_save_still_deletes_temp_tables() {
        let warehouse = Arc::new(RecordingWarehouse::new(PROJECT_ID));
        let fixture = Fixture::secondary(fake_region(false), Arc::clone(&warehouse) as _);
        let first = args(DirectIngestInstance::Secondary, None, date_1());
        let second = args(DirectIngestInstance::Secondary, Some(date_1()), date_2());
        for a in [&first, &second] {
            fixture
                .metadata()
                .register_ingest_materialization_job(a)
                .await
                .unwrap();
        }
        warehouse.fail_queries_containing("us_xx_ingest_view_results_secondary");

        let err = fixture.materialize(&second).await.unwrap_err();
        assert!(matches!(err, Error::Warehouse(_)), "{err}");

        let deleted: Vec<_> = warehouse
            .calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::DeleteTable { table_id, .. } => Some(table_id),
                _ => None,
            })
            .collect();
        assert_eq!(deleted.len(), 2, "{deleted:?}");
        assert!(deleted[0].contains("_upper_bound_"), "{deleted:?}");
        assert!(deleted[1].contains("_lower_bound_"), "{deleted:?}");
        // the job stays pending so it runs again
        assert_eq!(
            fixture
                .metadata()
                .get_job_completion_time_for_args(&second)
                .await
                .unwrap(),
            None
        );
    }

    #[tokio::test]
    async fn materializes_diff_between_bounds() {
        let warehouse = Arc::new(RecordingWarehouse::new(PROJECT_ID));
        let fixture = Fixture::secondary(fake_region(false), Arc::clone(&warehouse) as _);
        let first = args(DirectIngestInstance::Secondary, None, date_1());
        let second = args(DirectIngestInstance::Secondary, Some(date_1()), date_2());
        for a in [&first, &second] {
            fixture
                .metadata()
                .register_ingest_materialization_job(a)
                .await
                .unwrap();
        }

        assert!(fixture.materialize(&second).await.unwrap());

        let calls = warehouse.calls();
        let Call::Query(upper_sql) = &calls[1] else {
            panic!("expected upper bound query, got {calls:?}");
        };
        let suffix = suffix_of(upper_sql);
        let temp = "us_xx_secondary_temp_20220413";
        let upper_table = format!("ingest_view_2020_07_20_01_02_03_upper_bound_{suffix}");
        let lower_table = format!("ingest_view_2019_07_20_00_00_00_lower_bound_{suffix}");

        let region = fake_region(false);
        let view = region.ingest_view("ingest_view").unwrap();
        let snapshot = |bound| ViewSnapshotQuery {
            project_id: PROJECT_ID.to_string(),
            raw_data_dataset: "us_xx_raw_data".to_string(),
            view: view.clone(),
            raw_tables: region
                .raw_file_configs_for_view(view)
                .unwrap()
                .into_iter()
                .cloned()
                .collect(),
            bound,
        };
        let insert = query::DiffInsert {
            diff: DiffQuery {
                upper_bound_table: TableRef::new(PROJECT_ID, temp, &upper_table),
                lower_bound_table: Some(TableRef::new(PROJECT_ID, temp, &lower_table)),
                order_by_columns: vec!["colA".to_string(), "colC".to_string()],
            },
            destination: TableRef::new(
                PROJECT_ID,
                "us_xx_ingest_view_results_secondary",
                "ingest_view",
            ),
            upper_bound_datetime_inclusive: date_2(),
            lower_bound_datetime_exclusive: Some(date_1()),
            batch_size: 100,
        };

        assert_eq!(
            calls,
            vec![
                Call::CreateDataset {
                    dataset_id: temp.to_string(),
                    default_table_expiration_ms: Some(86_400_000),
                },
                Call::Query(
                    snapshot(date_2()).create_table_sql(&TableRef::new(PROJECT_ID, temp, &upper_table))
                ),
                Call::Query(
                    snapshot(date_1()).create_table_sql(&TableRef::new(PROJECT_ID, temp, &lower_table))
                ),
                Call::CreateDataset {
                    dataset_id: "us_xx_ingest_view_results_secondary".to_string(),
                    default_table_expiration_ms: None,
                },
                Call::Query(insert.to_sql(false)),
                Call::DeleteTable {
                    dataset_id: temp.to_string(),
                    table_id: upper_table.clone(),
                },
                Call::DeleteTable {
                    dataset_id: temp.to_string(),
                    table_id: lower_table,
                },
            ]
        );
        assert!(upper_sql.starts_with(&format!(
            "DROP TABLE IF EXISTS `recidiviz-456.{temp}.{upper_table}`;\nCREATE TABLE"
        )));
        assert!(upper_sql.contains("`recidiviz-456.us_xx_raw_data.file_tag_first`"));

        assert!(
            fixture
                .metadata()
                .get_job_completion_time_for_args(&second)
                .await
                .unwrap()
                .is_some()
        );
        assert!(
            fixture
                .metadata()
                .get_job_completion_time_for_args(&first)
                .await
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test]
    async fn first_job_has_no_lower_bound_table() {
        let warehouse = Arc::new(RecordingWarehouse::new(PROJECT_ID));
        let fixture = Fixture::secondary(fake_region(true), Arc::clone(&warehouse) as _);
        let first = args(DirectIngestInstance::Secondary, None, date_2());
        fixture
            .metadata()
            .register_ingest_materialization_job(&first)
            .await
            .unwrap();
        // results table left over from an earlier attempt
        warehouse.add_table("us_xx_ingest_view_results_secondary", "ingest_view");

        fixture.materialize(&first).await.unwrap();

        let queries = warehouse.queries();
        assert_eq!(queries.len(), 2);
        assert!(queries[0].starts_with("CREATE TEMP TABLE file_tag_first_generated_view AS ("));
        let suffix = suffix_of(&queries[0]);
        assert!(queries[1].starts_with(
            "DELETE FROM `recidiviz-456.us_xx_ingest_view_results_secondary.ingest_view`\n\
             WHERE __upper_bound_datetime_inclusive = DATETIME \"2020-07-20T01:02:03\";\n\
             INSERT INTO"
        ));
        assert!(queries[1].contains(&format!(
            "SELECT * FROM `recidiviz-456.us_xx_secondary_temp_20220413.ingest_view_2020_07_20_01_02_03_upper_bound_{suffix}`\nORDER BY colA, colC"
        )));
        assert!(!queries[1].contains("EXCEPT DISTINCT"));
    }

    #[tokio::test]
    async fn debug_query() {
        let warehouse = Arc::new(RecordingWarehouse::new(PROJECT_ID));
        let fixture = Fixture::secondary(fake_region(true), Arc::clone(&warehouse) as _);
        let debug = fixture
            .materializer
            .debug_query_for_args(&args(
                DirectIngestInstance::Secondary,
                Some(date_1()),
                date_2(),
            ))
            .unwrap();

        assert!(debug.starts_with("CREATE TEMP TABLE upper_file_tag_first_generated_view AS ("));
        assert!(debug.contains("CREATE TEMP TABLE lower_tagFullHistoricalExport_generated_view AS ("));
        assert!(debug.contains("EXCEPT DISTINCT"));
        assert_eq!(warehouse.calls(), vec![]);

        let err = fixture
            .materializer
            .debug_query_for_args(&IngestViewMaterializationArgs::new(
                "no_such_view",
                DirectIngestInstance::Secondary,
                None,
                date_2(),
            ))
            .unwrap_err();
        assert!(matches!(err, Error::UnknownIngestView { .. }), "{err}");
    }

    fn people_region() -> Arc<RegionConfig> {
        let region = RegionConfig {
            region_code: state_code(),
            launched: true,
            ingest_view_rank_list: vec!["people_view".to_string()],
            raw_files: vec![raw_file("people", &["id"], &["id", "name"])],
            ingest_views: vec![view("people_view", "SELECT * FROM {people}", &["id"])],
        };
        region.validate().unwrap();
        Arc::new(region)
    }

    fn person(file_id: i64, day: u32, id: &str, name: &str) -> Row {
        row([
            ("file_id", Value::Int(file_id)),
            (
                "update_datetime",
                Value::DateTime(Utc.with_ymd_and_hms(2022, 1, day, 0, 0, 0).unwrap()),
            ),
            ("is_deleted", Value::Bool(false)),
            ("id", Value::from(id)),
            ("name", Value::from(name)),
        ])
    }

    fn saved_people(warehouse: &MemWarehouse, instance: DirectIngestInstance) -> BTreeSet<Row> {
        warehouse
            .table_rows(
                &format!("us_xx_ingest_view_results_{}", instance.lower()),
                "people_view",
            )
            .unwrap()
            .into_iter()
            .map(|mut r| {
                r.retain(|k, _| !k.starts_with("__"));
                r
            })
            .collect()
    }

    #[tokio::test]
    async fn incremental_jobs_add_up_to_a_full_materialization() {
        let warehouse = Arc::new(MemWarehouse::new(PROJECT_ID));
        warehouse.insert_rows(
            "us_xx_raw_data",
            "people",
            [
                person(1, 1, "1", "ann"),
                person(1, 1, "2", "bob"),
                person(2, 2, "3", "cy"),
                person(3, 3, "4", "di"),
            ],
        );
        let t1 = Utc.with_ymd_and_hms(2022, 1, 1, 0, 0, 0).unwrap();
        let t2 = Utc.with_ymd_and_hms(2022, 1, 2, 0, 0, 0).unwrap();

        let time = Arc::new(MockProvider::new(Time::from_date_time(t2)));
        let catalog = Arc::new(MemCatalog::new_with_time_provider(Arc::clone(&time) as _));
        let incremental = Fixture::new(
            people_region(),
            Arc::clone(&catalog),
            Arc::clone(&time),
            Arc::clone(&warehouse) as _,
            DirectIngestInstance::Primary,
        );
        let full = Fixture::new(
            people_region(),
            catalog,
            time,
            Arc::clone(&warehouse) as _,
            DirectIngestInstance::Secondary,
        );

        let jobs = [
            (&incremental, None, t1),
            (&incremental, Some(t1), t2),
            (&full, None, t2),
        ];
        for (fixture, lower, upper) in jobs {
            let args = IngestViewMaterializationArgs::new(
                "people_view",
                fixture.materializer.ingest_instance(),
                lower,
                upper,
            );
            fixture
                .metadata()
                .register_ingest_materialization_job(&args)
                .await
                .unwrap();
            assert!(fixture.materialize(&args).await.unwrap());
        }

        let incremental_rows = saved_people(&warehouse, DirectIngestInstance::Primary);
        assert_eq!(incremental_rows.len(), 3);
        assert_eq!(
            incremental_rows,
            saved_people(&warehouse, DirectIngestInstance::Secondary)
        );

        let batches: Vec<_> = warehouse
            .table_rows("us_xx_ingest_view_results_primary", "people_view")
            .unwrap()
            .into_iter()
            .map(|r| {
                (
                    r[columns::UPPER_BOUND_DATETIME_INCLUSIVE].clone(),
                    r["id"].clone(),
                )
            })
            .collect();
        assert_eq!(
            batches,
            vec![
                (Value::DateTime(t1), Value::from("1")),
                (Value::DateTime(t1), Value::from("2")),
                (Value::DateTime(t2), Value::from("3")),
            ]
        );

        // temp tables are cleaned up
        assert!(
            warehouse
                .list_tables("us_xx_primary_temp_20220102")
                .await
                .unwrap()
                .is_empty()
        );
    }
}
