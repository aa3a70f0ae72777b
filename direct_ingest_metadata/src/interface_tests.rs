//! Behaviour every [`Catalog`] implementation must share.

use crate::interface::{Catalog, Error, RawFileMetadataParams};
use chrono::{DateTime, Utc};
use direct_ingest_types::{
    DirectIngestInstance, DirectIngestStatus, IngestViewMaterializationArgs, StateCode,
};
use pretty_assertions::assert_eq;
use std::sync::Arc;

fn ts(secs: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(1_650_000_000 + secs, 0).unwrap()
}

pub(crate) async fn test_catalog(catalog: Arc<dyn Catalog>) {
    catalog.setup().await.expect("first catalog setup");
    catalog.setup().await.expect("second catalog setup");

    test_instance_statuses(Arc::clone(&catalog)).await;
    test_raw_files(Arc::clone(&catalog)).await;
    test_materialization_jobs(Arc::clone(&catalog)).await;
    test_transactions(catalog).await;
}

async fn test_instance_statuses(catalog: Arc<dyn Catalog>) {
    let us_xx = StateCode::new("US_XX").unwrap();
    let us_yy = StateCode::new("US_YY").unwrap();
    let mut repos = catalog.repositories().await;
    let statuses = repos.instance_statuses();

    assert!(
        statuses
            .get_current(&us_xx, DirectIngestInstance::Primary)
            .await
            .unwrap()
            .is_none()
    );

    for (i, status) in [
        DirectIngestStatus::InitialState,
        DirectIngestStatus::RawDataImportInProgress,
        DirectIngestStatus::UpToDate,
    ]
    .into_iter()
    .enumerate()
    {
        statuses
            .create(&us_xx, DirectIngestInstance::Primary, status, ts(i as i64))
            .await
            .unwrap();
    }
    statuses
        .create(
            &us_xx,
            DirectIngestInstance::Secondary,
            DirectIngestStatus::NoRerunInProgress,
            ts(0),
        )
        .await
        .unwrap();
    statuses
        .create(
            &us_yy,
            DirectIngestInstance::Primary,
            DirectIngestStatus::FlashInProgress,
            ts(5),
        )
        .await
        .unwrap();

    let current = statuses
        .get_current(&us_xx, DirectIngestInstance::Primary)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(current.status, DirectIngestStatus::UpToDate);
    assert_eq!(current.status_timestamp, ts(2));

    let history: Vec<_> = statuses
        .list_history(&us_xx, DirectIngestInstance::Primary)
        .await
        .unwrap()
        .into_iter()
        .map(|s| s.status)
        .collect();
    assert_eq!(
        history,
        vec![
            DirectIngestStatus::InitialState,
            DirectIngestStatus::RawDataImportInProgress,
            DirectIngestStatus::UpToDate,
        ]
    );

    let all_current: Vec<_> = statuses
        .list_current()
        .await
        .unwrap()
        .into_iter()
        .map(|s| (s.region_code.to_string(), s.instance, s.status))
        .collect();
    assert_eq!(
        all_current,
        vec![
            (
                "US_XX".to_string(),
                DirectIngestInstance::Primary,
                DirectIngestStatus::UpToDate
            ),
            (
                "US_XX".to_string(),
                DirectIngestInstance::Secondary,
                DirectIngestStatus::NoRerunInProgress
            ),
            (
                "US_YY".to_string(),
                DirectIngestInstance::Primary,
                DirectIngestStatus::FlashInProgress
            ),
        ]
    );
}

fn raw_file_params(
    region_code: &StateCode,
    instance: DirectIngestInstance,
    file_tag: &str,
    update_secs: i64,
    discovery_secs: i64,
) -> RawFileMetadataParams {
    RawFileMetadataParams {
        region_code: region_code.clone(),
        raw_data_instance: instance,
        file_tag: file_tag.to_string(),
        normalized_file_name: format!("unprocessed_{update_secs}_raw_{file_tag}.csv"),
        update_datetime: ts(update_secs),
        file_discovery_time: ts(discovery_secs),
    }
}

async fn test_raw_files(catalog: Arc<dyn Catalog>) {
    let region = StateCode::new("US_RF").unwrap();
    let primary = DirectIngestInstance::Primary;
    let secondary = DirectIngestInstance::Secondary;
    let mut repos = catalog.repositories().await;
    let raw_files = repos.raw_files();

    let a1 = raw_files
        .create(&raw_file_params(&region, primary, "tagA", 10, 100))
        .await
        .unwrap();
    let a2 = raw_files
        .create(&raw_file_params(&region, primary, "tagA", 20, 200))
        .await
        .unwrap();
    let b1 = raw_files
        .create(&raw_file_params(&region, primary, "tagB", 5, 300))
        .await
        .unwrap();
    assert_ne!(a1.file_id, a2.file_id);
    assert!(!a1.is_processed());
    assert!(!a1.is_invalidated);

    let err = raw_files
        .create(&raw_file_params(&region, primary, "tagA", 10, 400))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::RawFileExists { .. }), "{err}");

    // same name is fine in the other instance
    raw_files
        .create(&raw_file_params(&region, secondary, "tagA", 10, 100))
        .await
        .unwrap();

    let fetched = raw_files
        .get_by_normalized_file_name(&region, primary, &a2.normalized_file_name)
        .await
        .unwrap();
    assert_eq!(fetched, Some(a2.clone()));

    let processed = raw_files
        .mark_processed(&region, primary, &a1.normalized_file_name, ts(500))
        .await
        .unwrap();
    assert_eq!(processed.file_processed_time, Some(ts(500)));

    let err = raw_files
        .mark_processed(&region, primary, "unprocessed_0_raw_nope.csv", ts(500))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::RawFileNotFound { .. }), "{err}");

    let names: Vec<_> = raw_files
        .list(&region, primary)
        .await
        .unwrap()
        .into_iter()
        .map(|f| f.file_id)
        .collect();
    assert_eq!(names, vec![b1.file_id, a1.file_id, a2.file_id]);

    let after: Vec<_> = raw_files
        .list_discovered_after(&region, primary, "tagA", Some(ts(100)))
        .await
        .unwrap()
        .into_iter()
        .map(|f| f.file_id)
        .collect();
    assert_eq!(after, vec![a2.file_id]);
    let all_a = raw_files
        .list_discovered_after(&region, primary, "tagA", None)
        .await
        .unwrap();
    assert_eq!(all_a.len(), 2);

    assert_eq!(raw_files.invalidate_all(&region, secondary).await.unwrap(), 1);
    assert!(raw_files.list(&region, secondary).await.unwrap().is_empty());
    // an invalidated name can be discovered again
    raw_files
        .create(&raw_file_params(&region, secondary, "tagA", 10, 600))
        .await
        .unwrap();
    assert_eq!(raw_files.invalidate_all(&region, secondary).await.unwrap(), 1);

    assert_eq!(raw_files.transfer(&region, primary, secondary).await.unwrap(), 3);
    assert!(raw_files.list(&region, primary).await.unwrap().is_empty());
    let moved = raw_files.list(&region, secondary).await.unwrap();
    assert_eq!(moved.len(), 3);
    assert!(moved.iter().all(|f| f.raw_data_instance == secondary));
}

async fn test_materialization_jobs(catalog: Arc<dyn Catalog>) {
    let region = StateCode::new("US_MJ").unwrap();
    let primary = DirectIngestInstance::Primary;
    let secondary = DirectIngestInstance::Secondary;
    let mut repos = catalog.repositories().await;
    let jobs = repos.materialization_jobs();

    let first = IngestViewMaterializationArgs::new("view_a", primary, None, ts(10));
    let second = IngestViewMaterializationArgs::new("view_a", primary, Some(ts(10)), ts(20));
    let other_view = IngestViewMaterializationArgs::new("view_b", primary, None, ts(15));

    assert!(jobs.get_most_recent(&region, primary, "view_a").await.unwrap().is_none());

    let created = jobs.create(&region, &first, ts(11)).await.unwrap();
    assert_eq!(created.args(), first);
    assert!(!created.is_materialized());
    jobs.create(&region, &second, ts(21)).await.unwrap();
    jobs.create(&region, &other_view, ts(16)).await.unwrap();

    let err = jobs.create(&region, &second, ts(22)).await.unwrap_err();
    assert!(matches!(err, Error::JobExists { .. }), "{err}");

    let backwards = IngestViewMaterializationArgs::new("view_a", primary, Some(ts(30)), ts(30));
    let err = jobs.create(&region, &backwards, ts(31)).await.unwrap_err();
    assert!(matches!(err, Error::InvalidJobBounds { .. }), "{err}");

    let most_recent = jobs
        .get_most_recent(&region, primary, "view_a")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(most_recent.args(), second);

    assert!(jobs.get(&region, &first).await.unwrap().is_some());
    let no_match = IngestViewMaterializationArgs::new("view_a", primary, Some(ts(1)), ts(10));
    assert!(jobs.get(&region, &no_match).await.unwrap().is_none());

    let materialized = jobs.mark_materialized(&region, &first, ts(12)).await.unwrap();
    assert_eq!(materialized.materialization_time, Some(ts(12)));
    let err = jobs
        .mark_materialized(&region, &no_match, ts(12))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::JobNotFound { .. }), "{err}");

    let listed: Vec<_> = jobs
        .list(&region, primary)
        .await
        .unwrap()
        .into_iter()
        .map(|j| j.args())
        .collect();
    assert_eq!(listed, vec![first.clone(), second.clone(), other_view.clone()]);

    assert_eq!(jobs.transfer(&region, primary, secondary).await.unwrap(), 3);
    assert!(jobs.list(&region, primary).await.unwrap().is_empty());
    assert_eq!(jobs.invalidate_all(&region, secondary).await.unwrap(), 3);
    assert!(jobs.list(&region, secondary).await.unwrap().is_empty());
    assert!(jobs.get_most_recent(&region, secondary, "view_a").await.unwrap().is_none());

    // invalidated jobs do not block registering the same bounds again
    let again = IngestViewMaterializationArgs::new("view_a", secondary, None, ts(10));
    jobs.create(&region, &again, ts(40)).await.unwrap();
}

async fn test_transactions(catalog: Arc<dyn Catalog>) {
    let region = StateCode::new("US_TX").unwrap();
    let instance = DirectIngestInstance::Primary;

    let mut txn = catalog.start_transaction().await.unwrap();
    txn.instance_statuses()
        .create(&region, instance, DirectIngestStatus::InitialState, ts(0))
        .await
        .unwrap();
    txn.abort().await.unwrap();
    assert!(
        catalog
            .repositories()
            .await
            .instance_statuses()
            .get_current(&region, instance)
            .await
            .unwrap()
            .is_none()
    );

    let mut txn = catalog.start_transaction().await.unwrap();
    txn.instance_statuses()
        .create(&region, instance, DirectIngestStatus::InitialState, ts(0))
        .await
        .unwrap();
    // reads inside the transaction see its own writes
    assert!(
        txn.instance_statuses()
            .get_current(&region, instance)
            .await
            .unwrap()
            .is_some()
    );
    txn.commit().await.unwrap();

    let current = catalog
        .repositories()
        .await
        .instance_statuses()
        .get_current(&region, instance)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(current.status, DirectIngestStatus::InitialState);
    assert_eq!(current.status_timestamp, ts(0));
}
