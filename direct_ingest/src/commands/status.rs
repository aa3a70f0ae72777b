use super::common::{IngestConfig, Result, print_json};

#[derive(Debug, clap::Parser)]
pub(crate) struct Config {
    #[clap(flatten)]
    pub(crate) common: IngestConfig,
}

pub(crate) async fn command(config: Config) -> Result<()> {
    let statuses = config
        .common
        .operations()
        .await?
        .get_all_current_ingest_instance_statuses()
        .await?;
    print_json(&statuses)
}
