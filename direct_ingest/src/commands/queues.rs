use direct_ingest_orchestration::QueueState;
use direct_ingest_types::DirectIngestInstance;

use super::common::{IngestConfig, RegionArgs, Result, print_json};

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
    /// Print the state of every ingest queue of the region
    States,

    /// Stop dispatching tasks from every ingest queue of the region
    Pause,

    /// Dispatch tasks from every ingest queue of the region again
    Resume,

    /// Drop all pending tasks of the region
    Purge,

    /// Queue a scheduler pass for an instance
    Trigger {
        #[clap(short = 'i', long = "instance", default_value = "PRIMARY")]
        instance: DirectIngestInstance,
    },
}

pub(crate) async fn command(config: Config) -> Result<()> {
    let operations = config.common.operations().await?;
    let state_code = &config.region.state_code;
    match config.cmd {
        SubCommand::States => {
            print_json(&operations.get_ingest_queue_states(state_code).await?)?;
        }
        SubCommand::Pause => {
            operations
                .update_ingest_queues_state(state_code, QueueState::Paused)
                .await?;
            println!("Paused ingest queues for {state_code}");
        }
        SubCommand::Resume => {
            operations
                .update_ingest_queues_state(state_code, QueueState::Running)
                .await?;
            println!("Resumed ingest queues for {state_code}");
        }
        SubCommand::Purge => {
            let purged = operations.purge_ingest_queues(state_code).await?;
            println!("Purged {purged} tasks from ingest queues for {state_code}");
        }
        SubCommand::Trigger { instance } => {
            operations
                .trigger_task_scheduler(state_code, instance)
                .await?;
            println!("Triggered {instance} task scheduler for {state_code}");
        }
    }
    Ok(())
}
