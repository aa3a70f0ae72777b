use super::common::{IngestConfig, RegionArgs, Result};

#[derive(Debug, clap::Parser)]
pub(crate) struct Config {
    #[clap(flatten)]
    pub(crate) common: IngestConfig,

    #[clap(flatten)]
    region: RegionArgs,
}

pub(crate) async fn command(config: Config) -> Result<()> {
    let state_code = &config.region.state_code;
    config
        .common
        .operations()
        .await?
        .start_secondary_raw_data_reimport(state_code)
        .await?;
    println!("Started SECONDARY raw data reimport for {state_code}");
    Ok(())
}
