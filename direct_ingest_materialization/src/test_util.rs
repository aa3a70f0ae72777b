use direct_ingest_types::{
    StateCode,
    region::{IngestViewDefinition, RawFileConfig, RegionConfig},
};
use std::sync::Arc;

pub(crate) const PROJECT_ID: &str = "recidiviz-456";

pub(crate) fn state_code() -> StateCode {
    StateCode::new("US_XX").unwrap()
}

pub(crate) fn raw_file(tag: &str, primary_keys: &[&str], columns: &[&str]) -> RawFileConfig {
    RawFileConfig {
        file_tag: tag.to_string(),
        primary_keys: primary_keys.iter().map(ToString::to_string).collect(),
        columns: columns.iter().map(ToString::to_string).collect(),
        is_code_table: false,
        always_historical_export: false,
    }
}

pub(crate) fn view(name: &str, query_template: &str, order_by: &[&str]) -> IngestViewDefinition {
    IngestViewDefinition {
        name: name.to_string(),
        query_template: query_template.to_string(),
        order_by_columns: order_by.iter().map(ToString::to_string).collect(),
        materialize_raw_data_table_views: false,
    }
}

/// US_XX with `ingest_view` joining a primary keyed table with a historical
/// export table.
pub(crate) fn fake_region(materialize_raw_data_table_views: bool) -> Arc<RegionConfig> {
    let mut historical = raw_file("tagFullHistoricalExport", &[], &["COL_1"]);
    historical.always_historical_export = true;
    let mut ingest_view = view(
        "ingest_view",
        "select * from {file_tag_first} JOIN {tagFullHistoricalExport} USING (COL_1)",
        &["colA", "colC"],
    );
    ingest_view.materialize_raw_data_table_views = materialize_raw_data_table_views;

    let region = RegionConfig {
        region_code: state_code(),
        launched: true,
        ingest_view_rank_list: vec!["ingest_view".to_string()],
        raw_files: vec![
            raw_file(
                "file_tag_first",
                &["col_name_1a", "col_name_1b"],
                &["col_name_1a", "col_name_1b"],
            ),
            historical,
        ],
        ingest_views: vec![ingest_view],
    };
    region.validate().unwrap();
    Arc::new(region)
}
