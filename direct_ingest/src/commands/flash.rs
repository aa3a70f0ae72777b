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
    /// Mark both instances as flashing. SECONDARY must be ready to flash
    Start,

    /// Move SECONDARY results into PRIMARY and return both instances to
    /// their resting statuses
    Complete,
}

pub(crate) async fn command(config: Config) -> Result<()> {
    let operations = config.common.operations().await?;
    let state_code = &config.region.state_code;
    match config.cmd {
        SubCommand::Start => {
            operations.start_flash(state_code).await?;
            println!("Started flash of SECONDARY to PRIMARY for {state_code}");
        }
        SubCommand::Complete => {
            operations.complete_flash(state_code).await?;
            println!("Completed flash of SECONDARY to PRIMARY for {state_code}");
        }
    }
    Ok(())
}
