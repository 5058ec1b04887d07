//! tidepoold — the Tidepool daemon.
//!
//! Fronts one or more database endpoints with adaptive connection pools,
//! a query-result cache, and health-aware load balancing, and serves
//! `/health` and `/metrics` for operators.
//!
//! # Usage
//!
//! ```text
//! tidepoold run --config tidepool.toml [--listen 0.0.0.0:9187] [--log-format json]
//! tidepoold check-config --config tidepool.toml
//! ```

mod daemon;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use tracing::info;
use tracing_subscriber::EnvFilter;

use tidepool_core::TidepoolConfig;
use tidepool_pool::JsonLinesDriver;

const DEFAULT_FILTER: &str = "info,tidepoold=debug,tidepool=debug";

#[derive(Parser)]
#[command(name = "tidepoold", about = "Tidepool connection pooling daemon")]
struct Cli {
    /// Log output format.
    #[arg(long, value_enum, default_value_t = LogFormat::Text, global = true)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, Copy, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
enum Command {
    /// Run the daemon until interrupted.
    Run {
        #[arg(long, default_value = "tidepool.toml")]
        config: PathBuf,

        /// Override `server.listen` from the config file.
        #[arg(long)]
        listen: Option<String>,
    },
    /// Parse and validate a config file, then print the effective config.
    CheckConfig {
        #[arg(long, default_value = "tidepool.toml")]
        config: PathBuf,
    },
}

fn init_tracing(format: LogFormat) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

fn load_config(path: &PathBuf) -> anyhow::Result<TidepoolConfig> {
    TidepoolConfig::from_file(path).with_context(|| format!("loading {}", path.display()))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    match cli.command {
        Command::Run { config, listen } => {
            let config = load_config(&config)?;
            let listen = listen.unwrap_or_else(|| config.server.listen.clone());
            let driver = Arc::new(JsonLinesDriver::new(&config.driver));
            daemon::run(config, listen, driver).await
        }
        Command::CheckConfig { config: path } => {
            let config = load_config(&path)?;
            info!(path = %path.display(), endpoints = config.endpoints.len(), "config is valid");
            println!("{}", config.to_toml_string()?);
            Ok(())
        }
    }
}
