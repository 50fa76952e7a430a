//! # tidal-sync
//!
//! CLI tool for exercising tidal-sync.
//!
//! ## Commands
//!
//! - `simulate`: Drive the subscription manager over the mock transport
//! - `cache-demo`: Walk the cache coordinator through a TTL and single-flight scenario
//! - `check-config`: Validate a TOML configuration file
//!
//! ## Example
//!
//! ```bash
//! # Two failed opens, then a live channel
//! tidal-sync simulate --fail-opens 2
//!
//! # Same, with custom backoff settings
//! tidal-sync --config tidal.toml simulate
//!
//! # Validate a configuration file
//! tidal-sync check-config tidal.toml
//! ```

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tidal_sync_client::Config;
use tracing_subscriber::EnvFilter;

mod commands;

use commands::{cache_demo, check_config, simulate};

/// CLI tool for exercising tidal-sync.
#[derive(Parser, Debug)]
#[command(name = "tidal-sync")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Configuration file (TOML); defaults are used when omitted
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log at debug level unless RUST_LOG says otherwise
    #[arg(long, short, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run a live session against the mock transport
    Simulate {
        /// Session identifier
        #[arg(long, default_value = "demo-session")]
        session: String,

        /// Number of channel opens that fail before the transport recovers
        #[arg(long, default_value = "2")]
        fail_opens: usize,

        /// Give up waiting for a connection after this many seconds
        #[arg(long, default_value = "20")]
        duration_secs: u64,
    },

    /// Show cache decisions for a scripted request timeline
    CacheDemo,

    /// Validate a configuration file and print the effective values
    CheckConfig {
        /// Path to the TOML file
        path: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose)?;

    match cli.command {
        Commands::Simulate {
            session,
            fail_opens,
            duration_secs,
        } => {
            let config = load_config(cli.config.as_deref())?;
            let options = simulate::Options {
                session,
                fail_opens,
                duration: Duration::from_secs(duration_secs),
            };
            simulate::run(config.realtime, options).await?;
        }
        Commands::CacheDemo => {
            cache_demo::run().await?;
        }
        Commands::CheckConfig { path } => {
            check_config::run(&path)?;
        }
    }

    Ok(())
}

/// Install the global subscriber. `RUST_LOG` overrides the default level.
fn init_tracing(verbose: bool) -> Result<()> {
    let default_level = if verbose { "debug" } else { "info" };
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::fmt()
        .compact()
        .with_env_filter(env_filter)
        .with_target(true)
        .try_init()
        .map_err(|e| anyhow::anyhow!("failed to initialize logging: {e}"))
}

fn load_config(path: Option<&Path>) -> Result<Config> {
    match path {
        Some(path) => Config::from_file(path)
            .with_context(|| format!("Failed to load configuration from {}", path.display())),
        None => Ok(Config::default()),
    }
}
