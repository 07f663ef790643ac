//! # tally
//!
//! Usage-retention analytics: keeps the daily-visit ledger materialized in
//! the background and prints point-in-time usage snapshots.

#![deny(unsafe_code)]

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use tally_core::{EngineInfo, UsageSnapshot};
use tally_engine::StatsEngine;
use tally_settings::{LoggingSettings, TallySettings};
use tally_store::{Database, StatsError};
use tally_telemetry::{init_telemetry, IncidentFilter, IncidentLog, TelemetryConfig};
use tracing::{info, Level};

/// Usage-retention analytics engine.
#[derive(Parser, Debug)]
#[command(name = "tally", about = "Usage-retention analytics engine")]
struct Cli {
    /// Settings file (defaults to `~/.tally/settings.json`).
    #[arg(long, global = true)]
    settings: Option<PathBuf>,

    /// Path to the `SQLite` database (overrides settings).
    #[arg(long, global = true)]
    db_path: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run background materialization until Ctrl-C.
    Run,
    /// Print one usage snapshot as JSON.
    Snapshot {
        /// Read every metric from a single transaction.
        #[arg(long)]
        consistent: bool,
    },
    /// Show recorded warnings and errors, newest first.
    Logs {
        /// Only incidents raised by this job (e.g. `daily_visits`).
        #[arg(long)]
        job: Option<String>,
        /// Only incidents from the last N hours.
        #[arg(long)]
        since_hours: Option<i64>,
        /// Skip warnings.
        #[arg(long)]
        errors: bool,
        #[arg(long, default_value_t = 50)]
        limit: u32,
    },
}

fn ensure_parent_dir(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
    }
    Ok(())
}

fn telemetry_config(logging: &LoggingSettings) -> TelemetryConfig {
    TelemetryConfig {
        log_level: logging.level.parse().unwrap_or(Level::INFO),
        log_to_sqlite: logging.log_to_sqlite,
        log_db_path: logging.log_db_path.clone(),
    }
}

fn load_settings(cli: &Cli) -> Result<TallySettings> {
    let mut settings = match &cli.settings {
        Some(path) => tally_settings::load_settings_from_path(path),
        None => tally_settings::load_settings(),
    }
    .context("Failed to load settings")?;
    if let Some(db_path) = &cli.db_path {
        settings.database.path.clone_from(db_path);
    }
    Ok(settings)
}

fn render(snapshot: &UsageSnapshot, engine: &EngineInfo) -> Result<String> {
    let doc = serde_json::json!({ "snapshot": snapshot, "engine": engine });
    Ok(serde_json::to_string_pretty(&doc)?)
}

fn print_snapshot(engine: &StatsEngine, consistent: bool) -> Result<()> {
    let now = Utc::now();
    let result = if consistent {
        engine.get_snapshot_consistent(now)
    } else {
        engine.get_snapshot(now)
    };
    match result {
        Ok((snapshot, info)) => {
            println!("{}", render(&snapshot, &info)?);
            Ok(())
        }
        Err(err) => {
            // Whatever was computed before the failure is still worth printing.
            if let StatsError::Partial { snapshot, engine: info, .. } = &err {
                println!("{}", render(snapshot, info)?);
            }
            Err(err).context("Snapshot incomplete")
        }
    }
}

fn print_incidents(path: &Path, filter: &IncidentFilter) -> Result<()> {
    ensure_parent_dir(path)?;
    let log = IncidentLog::open(path)
        .with_context(|| format!("Failed to open incident log: {}", path.display()))?;
    for incident in log.recent(filter).context("Failed to read incident log")? {
        println!("{}", serde_json::to_string(&incident)?);
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let settings = load_settings(&cli)?;

    if settings.logging.log_to_sqlite {
        ensure_parent_dir(&settings.logging.log_db_path)?;
    }
    init_telemetry(telemetry_config(&settings.logging));

    let open_db = || {
        Database::open(&settings.database.path).with_context(|| {
            format!("Failed to open database: {}", settings.database.path.display())
        })
    };

    match cli.command {
        Command::Logs {
            job,
            since_hours,
            errors,
            limit,
        } => {
            let filter = IncidentFilter {
                job,
                since: since_hours.map(|h| Utc::now() - chrono::Duration::hours(h)),
                errors_only: errors,
                limit,
            };
            print_incidents(&settings.logging.log_db_path, &filter)
        }
        Command::Snapshot { consistent } => {
            print_snapshot(&StatsEngine::new(open_db()?), consistent)
        }
        Command::Run => {
            let engine = StatsEngine::start(open_db()?, &settings.materializer);
            info!(path = %settings.database.path.display(), "tally running");

            tokio::signal::ctrl_c()
                .await
                .context("Failed to listen for ctrl+c")?;

            info!("shutting down");
            engine.shutdown().await;
            Ok(())
        }
    }
}
