use direct_ingest_orchestration::RawFileDiscovery;
use std::sync::Arc;

use super::common::{IngestConfig, InstanceArgs, Result, print_json};

#[derive(Debug, clap::Parser)]
pub(crate) struct Config {
    #[clap(flatten)]
    pub(crate) common: IngestConfig,

    #[clap(flatten)]
    instance: InstanceArgs,
}

/// Registers new raw files in the ingest bucket and, if there were any, queues
/// a scheduler pass for the instance.
pub(crate) async fn command(config: Config) -> Result<()> {
    let context = config.common.context().await?;
    let state_code = &config.instance.region.state_code;
    let instance = config.instance.instance;
    context.region(state_code)?;

    let discovery = RawFileDiscovery::new(
        Arc::clone(context.object_store()),
        context.raw_file_manager(state_code, instance),
    );
    let report = discovery.discover().await?;
    if !report.newly_discovered.is_empty() {
        context.trigger_task_scheduler(state_code, instance).await?;
    }
    print_json(&report)
}
