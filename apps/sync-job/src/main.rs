//! # storewatch
//!
//! Scheduled sync job and operator CLI.
//!
//! ## Commands
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        storewatch CLI                                   │
//! │                                                                         │
//! │  storewatch sync [--page N] [--size N] [--once] [--interval-secs N]    │
//! │      └─► Scheduler ──► SyncOrchestrator ──► SQLite                     │
//! │                                                                         │
//! │  storewatch invalidate [--tier TIER] [--key KEY]                       │
//! │      └─► TieredCache (default: dashboard keys)                         │
//! │                                                                         │
//! │  storewatch dashboard [--changes N]                                    │
//! │      └─► Dashboard (cached KPIs, alerts, recent changes)               │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Logs go to stderr (`RUST_LOG` overrides the `info` default); results are
//! printed to stdout as JSON.

mod app;
mod commands;
mod shutdown;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::app::App;
use crate::commands::SyncOptions;
use storewatch_core::CacheTier;
use storewatch_sync::StorewatchConfig;

/// Store status monitoring: sync job and cache tools.
#[derive(Parser, Debug)]
#[command(name = "storewatch", version, about, long_about = None)]
struct Cli {
    /// Config file (defaults to the platform config dir).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Sync partner and collector data into the snapshot history.
    Sync {
        /// First shop page to request.
        #[arg(long)]
        page: Option<u32>,
        /// Page size for shop and item listings.
        #[arg(long)]
        size: Option<u32>,
        /// Run once and exit instead of ticking.
        #[arg(long)]
        once: bool,
        /// Seconds between ticks.
        #[arg(long)]
        interval_secs: Option<u64>,
    },
    /// Drop cache entries.
    Invalidate {
        /// fast | moderate | slow | very_slow
        #[arg(long)]
        tier: Option<CacheTier>,
        /// One cache key.
        #[arg(long)]
        key: Option<String>,
    },
    /// Print cached KPIs, alerts and recent changes.
    Dashboard {
        /// Number of recent changes to include.
        #[arg(long, default_value_t = 20)]
        changes: u32,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .with_target(true)
        .init();

    let cli = Cli::parse();

    let config = StorewatchConfig::load(cli.config)?;
    info!(
        database = %config.database.path.display(),
        backend = %config.cache.backend,
        job = %config.sync.job_name,
        "Configuration loaded"
    );

    let app = App::connect(config).await?;

    let output = match cli.command {
        Commands::Sync {
            page,
            size,
            once,
            interval_secs,
        } => {
            let cancel = shutdown::install_signal_handler();
            let options = SyncOptions {
                page,
                size,
                once,
                interval_secs,
            };
            commands::sync(&app, options, cancel).await?
        }
        Commands::Invalidate { tier, key } => commands::invalidate(&app, tier, key).await?,
        Commands::Dashboard { changes } => commands::dashboard(&app, changes).await?,
    };

    println!("{}", serde_json::to_string_pretty(&output)?);

    app.db.close().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_sync_flags() {
        let cli = Cli::try_parse_from([
            "storewatch", "sync", "--page", "2", "--size", "50", "--once",
        ])
        .unwrap();
        match cli.command {
            Commands::Sync {
                page,
                size,
                once,
                interval_secs,
            } => {
                assert_eq!(page, Some(2));
                assert_eq!(size, Some(50));
                assert!(once);
                assert_eq!(interval_secs, None);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn test_parse_invalidate_tier() {
        let cli = Cli::try_parse_from(["storewatch", "invalidate", "--tier", "very-slow"]).unwrap();
        match cli.command {
            Commands::Invalidate { tier, key } => {
                assert_eq!(tier, Some(CacheTier::VerySlow));
                assert!(key.is_none());
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn test_unknown_tier_rejected() {
        assert!(Cli::try_parse_from(["storewatch", "invalidate", "--tier", "glacial"]).is_err());
    }

    #[test]
    fn test_global_config_flag() {
        let args = ["storewatch", "dashboard", "--config", "/etc/storewatch.toml"];
        let cli = Cli::try_parse_from(args).unwrap();
        assert_eq!(cli.config, Some(PathBuf::from("/etc/storewatch.toml")));
        assert!(matches!(cli.command, Commands::Dashboard { changes: 20 }));
    }
}
