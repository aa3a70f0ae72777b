use super::common::{IngestConfig, InstanceArgs, Result, print_json};

#[derive(Debug, clap::Parser)]
pub(crate) struct Config {
    #[clap(flatten)]
    pub(crate) common: IngestConfig,

    #[clap(flatten)]
    instance: InstanceArgs,

    /// What to invalidate
    #[clap(value_enum, long = "data", default_value = "ingest-views")]
    data: InvalidateData,
}

#[derive(Debug, Clone, Copy, clap::ValueEnum)]
enum InvalidateData {
    /// Materialization jobs and ingest view results
    IngestViews,
    /// Raw file metadata and raw data tables
    RawData,
}

pub(crate) async fn command(config: Config) -> Result<()> {
    let operations = config.common.operations().await?;
    let state_code = &config.instance.region.state_code;
    let instance = config.instance.instance;
    let report = match config.data {
        InvalidateData::IngestViews => {
            operations
                .invalidate_ingest_view_data(state_code, instance)
                .await?
        }
        InvalidateData::RawData => operations.invalidate_raw_data(state_code, instance).await?,
    };
    print_json(&report)
}
