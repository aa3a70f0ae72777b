use chrono::{DateTime, TimeZone, Utc};
use direct_ingest_lock::{LockManager, LockWaitConfig};
use direct_ingest_materialization::{
    value::{Row, Value, row},
    warehouse::MemWarehouse,
};
use direct_ingest_metadata::MemCatalog;
use direct_ingest_types::{
    DirectIngestInstance, DirectIngestStatus, StateCode,
    datasets::raw_tables_dataset_for_region,
    filename::NormalizedRawFileName,
    region::{IngestViewDefinition, RawFileConfig, RegionConfig, RegionRegistry},
};
use iox_time::{MockProvider, Time};
use object_store::{ObjectStore, memory::InMemory, path::Path};
use std::{sync::Arc, time::Duration};

use crate::{
    IngestContext, OrchestrationConfig,
    discovery::{RawFileDiscovery, ingest_bucket_prefix},
    queue::ObjectStoreTaskQueue,
};

pub(crate) const PROJECT_ID: &str = "recidiviz-staging";

pub(crate) fn state_code() -> StateCode {
    StateCode::new("US_XX").unwrap()
}

pub(crate) fn date(day: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2022, 1, day, 0, 0, 0).unwrap()
}

/// US_XX with a single `people_view` over the `people` raw table.
pub(crate) fn people_region(launched: bool) -> RegionConfig {
    RegionConfig {
        region_code: state_code(),
        launched,
        ingest_view_rank_list: vec!["people_view".to_string()],
        raw_files: vec![RawFileConfig {
            file_tag: "people".to_string(),
            primary_keys: vec!["id".to_string()],
            columns: vec!["id".to_string(), "name".to_string()],
            is_code_table: false,
            always_historical_export: false,
        }],
        ingest_views: vec![IngestViewDefinition {
            name: "people_view".to_string(),
            query_template: "SELECT * FROM {people}".to_string(),
            order_by_columns: vec!["id".to_string()],
            materialize_raw_data_table_views: false,
        }],
    }
}

/// Drops a normalized raw file into the ingest bucket and returns its name.
pub(crate) async fn put_raw_file(
    store: &Arc<dyn ObjectStore>,
    instance: DirectIngestInstance,
    file_tag: &str,
    update_datetime: DateTime<Utc>,
) -> String {
    let name = NormalizedRawFileName::new_unprocessed(file_tag, update_datetime, "csv").to_string();
    let path = ingest_bucket_prefix(&state_code(), instance).child(name.as_str());
    store.put(&path, "id,name".into()).await.unwrap();
    name
}

pub(crate) fn person(file_id: i64, update_datetime: DateTime<Utc>, id: &str, name: &str) -> Row {
    row([
        ("file_id", Value::Int(file_id)),
        ("update_datetime", Value::DateTime(update_datetime)),
        ("is_deleted", Value::Bool(false)),
        ("id", Value::from(id)),
        ("name", Value::from(name)),
    ])
}

/// In-memory services with a controllable clock.
#[derive(Debug)]
pub(crate) struct TestContext {
    pub(crate) context: IngestContext,
    pub(crate) time: Arc<MockProvider>,
    pub(crate) store: Arc<dyn ObjectStore>,
    pub(crate) warehouse: Arc<MemWarehouse>,
}

impl TestContext {
    pub(crate) fn new() -> Self {
        Self::with_region(people_region(true))
    }

    pub(crate) fn with_region(region: RegionConfig) -> Self {
        let time = Arc::new(MockProvider::new(Time::from_date_time(
            Utc.with_ymd_and_hms(2022, 4, 14, 0, 0, 0).unwrap(),
        )));
        let store: Arc<dyn ObjectStore> = Arc::new(InMemory::new());
        let warehouse = Arc::new(MemWarehouse::new(PROJECT_ID));
        let catalog = Arc::new(MemCatalog::new_with_time_provider(Arc::clone(&time) as _));
        let context = IngestContext::new(
            Arc::new(RegionRegistry::new([region]).unwrap()),
            catalog,
            Arc::clone(&store),
            LockManager::new(Arc::clone(&store), Arc::clone(&time) as _),
            Arc::clone(&warehouse) as _,
            Arc::new(ObjectStoreTaskQueue::new(
                Arc::clone(&store),
                Arc::clone(&time) as _,
            )),
            Arc::clone(&time) as _,
        )
        .with_config(OrchestrationConfig {
            lock_wait: LockWaitConfig {
                poll_interval: Duration::from_millis(10),
                max_wait: Duration::ZERO,
            },
            ..Default::default()
        });
        Self {
            context,
            time,
            store,
            warehouse,
        }
    }

    pub(crate) fn tick(&self) {
        self.time.inc(Duration::from_secs(60));
    }

    pub(crate) async fn status(&self, instance: DirectIngestInstance) -> DirectIngestStatus {
        self.context
            .status_manager(&state_code(), instance)
            .get_current_status()
            .await
            .unwrap()
    }

    pub(crate) async fn init_statuses(&self) {
        for instance in DirectIngestInstance::ALL {
            self.context
                .status_manager(&state_code(), instance)
                .add_initial_status()
                .await
                .unwrap();
        }
    }

    /// Drops a `people` file into the bucket, registers it, loads its rows into
    /// the raw table and marks it processed.
    pub(crate) async fn import_people_file(
        &self,
        instance: DirectIngestInstance,
        file_id: i64,
        update_datetime: DateTime<Utc>,
        people: &[(&str, &str)],
    ) {
        let name = put_raw_file(&self.store, instance, "people", update_datetime).await;
        let raw_files = self.context.raw_file_manager(&state_code(), instance);
        RawFileDiscovery::new(Arc::clone(&self.store), raw_files.clone())
            .discover()
            .await
            .unwrap();
        self.warehouse.insert_rows(
            &raw_tables_dataset_for_region(&state_code(), instance, None),
            "people",
            people
                .iter()
                .map(|(id, name)| person(file_id, update_datetime, id, name)),
        );
        raw_files.mark_raw_file_as_processed(&name).await.unwrap();
    }

    /// The saved `people_view` ids of an instance, in order.
    pub(crate) fn saved_ids(&self, instance: DirectIngestInstance) -> Vec<String> {
        self.warehouse
            .table_rows(
                &format!("us_xx_ingest_view_results_{}", instance.lower()),
                "people_view",
            )
            .unwrap_or_default()
            .into_iter()
            .filter_map(|r| r.get("id").and_then(|v| v.as_str().map(str::to_string)))
            .collect()
    }

    /// Path of an object in the ingest bucket of `instance`.
    pub(crate) fn bucket_path(&self, instance: DirectIngestInstance, name: &str) -> Path {
        ingest_bucket_prefix(&state_code(), instance).child(name)
    }
}
