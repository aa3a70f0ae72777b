//! CLI config for region configuration, locking and warehouse concurrency.

use direct_ingest_lock::LockWaitConfig;
use direct_ingest_orchestration::OrchestrationConfig;
use direct_ingest_types::region::{self, RegionRegistry};
use observability_deps::tracing::info;
use std::{path::PathBuf, time::Duration};

fn format_duration(d: Duration) -> &'static str {
    let s = humantime::format_duration(d).to_string();
    Box::leak(Box::new(s))
}

fn default_lock_ttl() -> &'static str {
    format_duration(OrchestrationConfig::DEFAULT_LOCK_TTL)
}

fn default_lock_poll_interval() -> &'static str {
    format_duration(LockWaitConfig::DEFAULT_POLL_INTERVAL)
}

fn default_lock_max_wait() -> &'static str {
    format_duration(LockWaitConfig::DEFAULT_MAX_WAIT)
}

fn default_warehouse_pool_size() -> &'static str {
    let s = OrchestrationConfig::DEFAULT_WAREHOUSE_POOL_SIZE.to_string();
    Box::leak(Box::new(s))
}

/// CLI config for ingest orchestration.
#[derive(Debug, Clone, clap::Parser)]
pub struct OrchestrationArgs {
    /// JSON file with the array of region configurations.
    #[clap(
        long = "region-config",
        env = "DIRECT_INGEST_REGION_CONFIG",
        action
    )]
    pub region_config: PathBuf,

    /// How long a region lock is held before it counts as abandoned.
    #[clap(
        long = "lock-ttl",
        env = "DIRECT_INGEST_LOCK_TTL",
        default_value = default_lock_ttl(),
        value_parser = humantime::parse_duration,
    )]
    pub lock_ttl: Duration,

    /// Delay between checks of a held lock.
    #[clap(
        long = "lock-poll-interval",
        env = "DIRECT_INGEST_LOCK_POLL_INTERVAL",
        default_value = default_lock_poll_interval(),
        value_parser = humantime::parse_duration,
    )]
    pub lock_poll_interval: Duration,

    /// How long to wait for a held lock before giving up.
    #[clap(
        long = "lock-max-wait",
        env = "DIRECT_INGEST_LOCK_MAX_WAIT",
        default_value = default_lock_max_wait(),
        value_parser = humantime::parse_duration,
    )]
    pub lock_max_wait: Duration,

    /// Maximum number of concurrent warehouse requests.
    #[clap(
        long = "warehouse-pool-size",
        env = "DIRECT_INGEST_WAREHOUSE_POOL_SIZE",
        default_value = default_warehouse_pool_size(),
        action
    )]
    pub warehouse_pool_size: usize,

    /// Prefix for ingest view results datasets, for sandboxed runs.
    #[clap(
        long = "dataset-prefix",
        env = "DIRECT_INGEST_DATASET_PREFIX",
        action
    )]
    pub dataset_prefix: Option<String>,
}

impl OrchestrationArgs {
    pub fn orchestration_config(&self) -> OrchestrationConfig {
        OrchestrationConfig {
            lock_ttl: self.lock_ttl,
            lock_wait: LockWaitConfig {
                poll_interval: self.lock_poll_interval,
                max_wait: self.lock_max_wait,
            },
            warehouse_pool_size: self.warehouse_pool_size,
            dataset_prefix: self.dataset_prefix.clone(),
        }
    }

    pub fn load_regions(&self) -> Result<RegionRegistry, region::Error> {
        let regions = RegionRegistry::from_path(&self.region_config)?;
        info!(
            path = %self.region_config.display(),
            regions = regions.state_codes().count(),
            "loaded region configuration"
        );
        Ok(regions)
    }
}
