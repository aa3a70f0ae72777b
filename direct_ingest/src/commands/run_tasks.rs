use serde_json::json;

use super::common::{IngestConfig, InstanceArgs, Result, print_json};

#[derive(Debug, clap::Parser)]
pub(crate) struct Config {
    #[clap(flatten)]
    pub(crate) common: IngestConfig,

    #[clap(flatten)]
    instance: InstanceArgs,
}

/// Runs queued tasks of the instance until its queues are drained or paused.
pub(crate) async fn command(config: Config) -> Result<()> {
    let runner = config.common.task_runner().await?;
    let state_code = &config.instance.region.state_code;
    let instance = config.instance.instance;

    let tasks_run = runner.run_until_idle(state_code, instance).await?;
    let status = runner
        .context()
        .status_manager(state_code, instance)
        .get_current_status()
        .await
        .ok();
    print_json(&json!({
        "state_code": state_code,
        "instance": instance,
        "tasks_run": tasks_run,
        "status": status,
    }))
}
