use direct_ingest_types::DirectIngestInstance;

use super::common::{IngestConfig, RegionArgs, Result};

#[derive(Debug, clap::Parser)]
pub(crate) struct Config {
    #[clap(flatten)]
    pub(crate) common: IngestConfig,

    #[clap(flatten)]
    region: RegionArgs,

    #[clap(subcommand)]
    cmd: SubCommand,
}

#[derive(Debug, clap::Subcommand)]
enum SubCommand {
    /// Start a rerun of ingest in an instance
    Start {
        /// Instance to rerun ingest in. Only SECONDARY is allowed
        #[clap(short = 'i', long = "instance", default_value = "SECONDARY")]
        instance: DirectIngestInstance,

        /// Instance whose raw data the rerun reads. SECONDARY means raw data
        /// is imported again into SECONDARY first
        #[clap(long = "raw-data-source-instance", default_value = "PRIMARY")]
        raw_data_source_instance: DirectIngestInstance,
    },

    /// Cancel the rerun or raw data reimport running in SECONDARY and clean
    /// up its data
    Cancel,
}

pub(crate) async fn command(config: Config) -> Result<()> {
    let operations = config.common.operations().await?;
    let state_code = &config.region.state_code;
    match config.cmd {
        SubCommand::Start {
            instance,
            raw_data_source_instance,
        } => {
            operations
                .start_ingest_rerun(state_code, instance, raw_data_source_instance)
                .await?;
            println!(
                "Started {instance} rerun for {state_code} reading {raw_data_source_instance} raw data"
            );
        }
        SubCommand::Cancel => {
            operations.cancel_rerun(state_code).await?;
            println!("Canceled SECONDARY rerun for {state_code}");
        }
    }
    Ok(())
}
