//! # Kurultai Operator CLI
//!
//! Inspect and repair the resilience core: connection and circuit status,
//! manual sync, fallback export/import and stuck sync-queue entries.

use anyhow::Context;
use clap::{Parser, Subcommand};
use kurultai_core::config::ConfigManager;
use kurultai_core::fallback::FallbackExport;
use kurultai_core::logging::init_structured_logging;
use kurultai_core::system::KurultaiSystem;
use serde::Serialize;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "kurultai-ops")]
#[command(about = "Operate the Kurultai resilience core")]
#[command(version = env!("CARGO_PKG_VERSION"))]
pub struct Cli {
    /// Configuration file (default: config/kurultai.* or $KURULTAI_CONFIG)
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Show connection, circuit breaker and fallback store status
    Status,

    /// Replay queued fallback writes to the primary store now
    Sync,

    /// Force every operation to the fallback store, or lift the override
    ForceFallback {
        #[arg(action = clap::ArgAction::Set)]
        enabled: bool,
    },

    /// Export the fallback store as JSON
    Export {
        /// Output file
        file: PathBuf,
    },

    /// Import a JSON export into the fallback store
    Import {
        /// Input file
        file: PathBuf,
    },

    /// List sync-queue entries excluded from automatic replay
    Stuck {
        #[arg(long)]
        min_retries: Option<u32>,
    },

    /// Delete stuck sync-queue entries (records are kept)
    ClearStuck {
        #[arg(long)]
        min_retries: Option<u32>,
    },

    /// Reset stuck entries so the next sync pass retries them
    RetryStuck {
        #[arg(long)]
        min_retries: Option<u32>,
    },

    /// Show failover state and recent failover events
    FailoverStatus {
        #[arg(long, default_value_t = 10)]
        history: u32,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_structured_logging();
    let cli = Cli::parse();

    let manager = match &cli.config {
        Some(path) => ConfigManager::load_from_file(path),
        None => ConfigManager::load(),
    }
    .context("loading configuration")?;

    let system = KurultaiSystem::init(manager.config().clone())
        .await
        .context("initializing resilience core")?;
    let result = run(&system, cli.command).await;
    system.close().await;
    result
}

async fn run(system: &KurultaiSystem, command: Commands) -> anyhow::Result<()> {
    let connection = system.connection();
    match command {
        Commands::Status => print_json(&connection.status().await),
        Commands::Sync => match connection.sync_pending().await? {
            Some(report) => print_json(&report),
            None => {
                println!("a sync pass is already running");
                Ok(())
            }
        },
        Commands::ForceFallback { enabled } => {
            connection.force_fallback(enabled);
            print_json(&connection.status().await)
        }
        Commands::Export { file } => {
            let export = connection.export_fallback().await?;
            let json = serde_json::to_string_pretty(&export)?;
            std::fs::write(&file, json).with_context(|| format!("writing {}", file.display()))?;
            println!(
                "exported {} records and {} queue entries to {}",
                export.records.len(),
                export.sync_queue.len(),
                file.display()
            );
            Ok(())
        }
        Commands::Import { file } => {
            let json = std::fs::read_to_string(&file)
                .with_context(|| format!("reading {}", file.display()))?;
            let export: FallbackExport = serde_json::from_str(&json)
                .with_context(|| format!("parsing {}", file.display()))?;
            print_json(&connection.import_fallback(&export).await?)
        }
        Commands::Stuck { min_retries } => {
            print_json(&connection.stuck_sync_entries(min_retries).await?)
        }
        Commands::ClearStuck { min_retries } => {
            let cleared = connection.clear_stuck_sync_entries(min_retries).await?;
            println!("cleared {cleared} stuck sync entries");
            Ok(())
        }
        Commands::RetryStuck { min_retries } => {
            let reset = connection.retry_stuck_sync_entries(min_retries).await?;
            println!("reset {reset} stuck sync entries for retry");
            Ok(())
        }
        Commands::FailoverStatus { history } => {
            let protocol = system.protocol();
            print_json(&serde_json::json!({
                "status": protocol.get_failover_status(),
                "history": protocol.get_failover_history(history).await,
            }))
        }
    }
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
