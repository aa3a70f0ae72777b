//! Entrypoint of the direct_ingest binary

use direct_ingest_clap_blocks::tokio::TokioRuntimeConfig;
use dotenvy::dotenv;
use trogging::{
    TroggingGuard,
    cli::{LoggingConfig, LoggingConfigBuilderExt},
    tracing_subscriber::{Registry, prelude::*},
};

mod commands {
    pub(crate) mod common;
    pub(crate) mod discover;
    pub(crate) mod flash;
    pub(crate) mod ingest_views;
    pub(crate) mod invalidate;
    pub(crate) mod queues;
    pub(crate) mod raw_files;
    pub(crate) mod reimport;
    pub(crate) mod rerun;
    pub(crate) mod run_tasks;
    pub(crate) mod status;
}

enum ReturnCode {
    Failure = 1,
}

#[derive(Debug, clap::Parser)]
#[clap(
    name = "direct_ingest",
    version,
    about = "Operator tools for direct ingest of state data",
    long_about = r#"Operator tools for direct ingest of state data

Connection options are usually set through the environment or a .env file:
    DIRECT_INGEST_REGION_CONFIG, DIRECT_INGEST_CATALOG_DSN, DIRECT_INGEST_OBJECT_STORE,
    DIRECT_INGEST_DATA_DIR, DIRECT_INGEST_WAREHOUSE, DIRECT_INGEST_WAREHOUSE_PROJECT_ID

Examples:
    # Show the current status of every ingest instance
    direct_ingest status

    # Start a SECONDARY rerun for US_XX that reads PRIMARY raw data
    direct_ingest rerun --state-code US_XX start

    # Work off queued ingest tasks for US_XX SECONDARY
    direct_ingest run-tasks --state-code US_XX --instance SECONDARY

    # Run with full debug logging specified with LOG_FILTER
    LOG_FILTER=debug direct_ingest run-tasks --state-code US_XX
"#
)]
struct Config {
    #[clap(flatten)]
    runtime_config: TokioRuntimeConfig,

    #[clap(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, clap::Parser)]
enum Command {
    /// Start or cancel an ingest rerun in SECONDARY
    Rerun(commands::rerun::Config),

    /// Start a reimport of raw data into SECONDARY
    Reimport(commands::reimport::Config),

    /// Inspect and administer the ingest task queues of a region
    Queues(commands::queues::Config),

    /// Print the current status of every ingest instance of launched regions
    Status(commands::status::Config),

    /// Print the processing status of each raw file tag
    RawFiles(commands::raw_files::Config),

    /// Print materialization and results summaries of each ingest view
    IngestViews(commands::ingest_views::Config),

    /// Delete ingest view or raw data of an instance
    Invalidate(commands::invalidate::Config),

    /// Flash SECONDARY results into PRIMARY
    Flash(commands::flash::Config),

    /// Register new raw files in the ingest bucket
    Discover(commands::discover::Config),

    /// Run queued ingest tasks until the queues are idle
    RunTasks(commands::run_tasks::Config),
}

impl Command {
    fn logging_config(&self) -> &LoggingConfig {
        match self {
            Self::Rerun(config) => &config.common.logging_config,
            Self::Reimport(config) => &config.common.logging_config,
            Self::Queues(config) => &config.common.logging_config,
            Self::Status(config) => &config.common.logging_config,
            Self::RawFiles(config) => &config.common.logging_config,
            Self::IngestViews(config) => &config.common.logging_config,
            Self::Invalidate(config) => &config.common.logging_config,
            Self::Flash(config) => &config.common.logging_config,
            Self::Discover(config) => &config.common.logging_config,
            Self::RunTasks(config) => &config.common.logging_config,
        }
    }
}

fn main() -> Result<(), std::io::Error> {
    // load all environment variables from .env before doing anything
    load_dotenv();

    let config: Config = clap::Parser::parse();

    let tokio_runtime = config.runtime_config.builder()?.build()?;

    tokio_runtime.block_on(async move {
        fn handle_init_logs(r: Result<TroggingGuard, trogging::Error>) -> TroggingGuard {
            match r {
                Ok(guard) => guard,
                Err(e) => {
                    eprintln!("Initializing logs failed: {e}");
                    std::process::exit(ReturnCode::Failure as _);
                }
            }
        }

        let Some(command) = config.command else {
            println!("command required, -h/--help for help");
            return;
        };
        let _tracing_guard = handle_init_logs(init_logs_and_tracing(command.logging_config()));

        let (name, result) = match command {
            Command::Rerun(config) => ("Rerun", commands::rerun::command(config).await),
            Command::Reimport(config) => ("Reimport", commands::reimport::command(config).await),
            Command::Queues(config) => ("Queues", commands::queues::command(config).await),
            Command::Status(config) => ("Status", commands::status::command(config).await),
            Command::RawFiles(config) => ("Raw files", commands::raw_files::command(config).await),
            Command::IngestViews(config) => {
                ("Ingest views", commands::ingest_views::command(config).await)
            }
            Command::Invalidate(config) => {
                ("Invalidate", commands::invalidate::command(config).await)
            }
            Command::Flash(config) => ("Flash", commands::flash::command(config).await),
            Command::Discover(config) => ("Discover", commands::discover::command(config).await),
            Command::RunTasks(config) => ("Run tasks", commands::run_tasks::command(config).await),
        };
        if let Err(e) = result {
            eprintln!("{name} command failed: {e}");
            std::process::exit(ReturnCode::Failure as _)
        }
    });

    Ok(())
}

/// Source the .env file before initialising the Config struct - this sets
/// any envs in the file, which the Config struct then uses.
///
/// Precedence is given to existing env variables.
fn load_dotenv() {
    match dotenv() {
        Ok(_) => {}
        Err(dotenvy::Error::Io(err)) if err.kind() == std::io::ErrorKind::NotFound => {
            // a missing env file is not an error, defaults apply
        }
        Err(e) => {
            eprintln!("FATAL Error loading config from: {e}");
            eprintln!("Aborting");
            std::process::exit(1);
        }
    };
}

fn init_logs_and_tracing(config: &LoggingConfig) -> Result<TroggingGuard, trogging::Error> {
    let log_layer = trogging::Builder::new()
        .with_default_log_filter("info")
        .with_logging_config(config)
        .build()?;

    let subscriber = Registry::default().with(log_layer);
    trogging::install_global(subscriber)
}
