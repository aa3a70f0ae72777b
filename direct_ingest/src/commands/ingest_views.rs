use super::common::{IngestConfig, InstanceArgs, Result, print_json};

#[derive(Debug, clap::Parser)]
pub(crate) struct Config {
    #[clap(flatten)]
    pub(crate) common: IngestConfig,

    #[clap(flatten)]
    instance: InstanceArgs,
}

pub(crate) async fn command(config: Config) -> Result<()> {
    let summaries = config
        .common
        .operations()
        .await?
        .get_ingest_view_summaries(&config.instance.region.state_code, config.instance.instance)
        .await?;
    print_json(&summaries)
}
