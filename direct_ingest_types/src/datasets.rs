//! Warehouse dataset naming.
//!
//! Every function takes an optional `sandbox_prefix` so operators can stage
//! changes in a copy of the datasets, e.g. `my_prefix_us_xx_raw_data`.

use chrono::{DateTime, Utc};

use crate::{DirectIngestInstance, StateCode};

fn with_prefix(sandbox_prefix: Option<&str>, name: String) -> String {
    match sandbox_prefix {
        Some(prefix) => format!("{prefix}_{name}"),
        None => name,
    }
}

/// Dataset holding one table per raw file tag for the given instance.
pub fn raw_tables_dataset_for_region(
    state_code: &StateCode,
    instance: DirectIngestInstance,
    sandbox_prefix: Option<&str>,
) -> String {
    let suffix = match instance {
        DirectIngestInstance::Primary => "",
        DirectIngestInstance::Secondary => "_secondary",
    };
    with_prefix(
        sandbox_prefix,
        format!("{}_raw_data{suffix}", state_code.lower()),
    )
}

/// Dataset holding `*_latest` views over the raw tables.
pub fn raw_latest_views_dataset_for_region(
    state_code: &StateCode,
    instance: DirectIngestInstance,
    sandbox_prefix: Option<&str>,
) -> String {
    let suffix = match instance {
        DirectIngestInstance::Primary => "",
        DirectIngestInstance::Secondary => "_secondary",
    };
    with_prefix(
        sandbox_prefix,
        format!("{}_raw_data_up_to_date_views{suffix}", state_code.lower()),
    )
}

/// Dataset holding one table of materialized results per ingest view.
pub fn ingest_view_materialization_results_dataset(
    state_code: &StateCode,
    instance: DirectIngestInstance,
    sandbox_prefix: Option<&str>,
) -> String {
    with_prefix(
        sandbox_prefix,
        format!(
            "{}_ingest_view_results_{}",
            state_code.lower(),
            instance.lower()
        ),
    )
}

/// Scratch dataset for the temp tables of a materialization run. A new dataset
/// is used each day; tables expire on their own.
pub fn ingest_view_materialization_temp_dataset(
    state_code: &StateCode,
    instance: DirectIngestInstance,
    now: DateTime<Utc>,
) -> String {
    format!(
        "{}_{}_temp_{}",
        state_code.lower(),
        instance.lower(),
        now.format("%Y%m%d")
    )
}
