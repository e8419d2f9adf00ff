//! automation-daemon -- runs declarative automation ticks against the
//! filesystem schedule store.
//!
//! Inputs:
//! - `--definitions`: YAML list of managed assets and their conditions
//! - `--instance`: JSON snapshot of partitions, materializations and runs
//!
//! Requested runs are logged, not launched.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use chrono::Utc;
use clap::Parser;
use tracing::{info, warn};

use automat_conditions::{InMemoryInstance, InstanceSnapshot};
use automat_core::config::{load_dotenv, Config};
use automat_daemon::{AutomationDaemon, DefinitionsFile, LoggingSink};
use automat_storage::FileScheduleStorage;

// ── CLI ─────────────────────────────────────────────────────────────

/// Declarative automation daemon.
#[derive(Parser, Debug)]
#[command(name = "automation-daemon", version, about)]
struct Cli {
    /// Asset definitions (YAML).
    #[arg(long, env = "AUTOMAT_DEFINITIONS", default_value = "config/automation.yaml")]
    definitions: PathBuf,

    /// Instance snapshot (JSON).
    #[arg(long, env = "AUTOMAT_INSTANCE")]
    instance: PathBuf,

    /// Schedule store directory. Overrides AUTOMAT_DATA_DIR.
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Run a single cycle and exit.
    #[arg(long)]
    once: bool,

    /// Drop every stored cursor before the first cycle.
    #[arg(long)]
    reset_cursors: bool,
}

fn load_instance(path: &Path) -> anyhow::Result<InMemoryInstance> {
    let json = std::fs::read_to_string(path)
        .with_context(|| format!("reading instance snapshot {}", path.display()))?;
    let snapshot: InstanceSnapshot = serde_json::from_str(&json)
        .with_context(|| format!("parsing instance snapshot {}", path.display()))?;
    Ok(InMemoryInstance::from_snapshot(snapshot))
}

// ── main ────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    load_dotenv();
    let cli = Cli::parse();
    let mut config = Config::from_env();
    if let Some(dir) = cli.data_dir {
        config.storage.data_dir = dir;
    }
    config.log_summary();

    let definitions = DefinitionsFile::load(&cli.definitions)?.into_definitions()?;
    info!(path = %cli.definitions.display(), assets = definitions.len(), "loaded definitions");
    let instance = Arc::new(load_instance(&cli.instance)?);
    let storage = Arc::new(FileScheduleStorage::from_config(&config.storage)?);
    info!(path = %storage.path().display(), "opened schedule store");

    let daemon = Arc::new(AutomationDaemon::new(
        config.daemon.clone(),
        definitions,
        storage,
        instance,
        Arc::new(LoggingSink),
    )?);

    if cli.reset_cursors {
        let removed = daemon.reset_all_cursors()?;
        info!(removed, "cursors reset");
    }

    if cli.once {
        let report = daemon.run_cycle(Utc::now())?;
        info!(
            tick_id = report.tick.id,
            status = %report.tick.status,
            runs = report.tick.run_ids.len(),
            deferred = report.deferred.len(),
            "single cycle complete"
        );
        return Ok(());
    }

    let shutdown = daemon.shutdown_signal();
    let runner = Arc::clone(&daemon);
    let handle = tokio::task::spawn_blocking(move || runner.run());

    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received");
    shutdown.store(true, std::sync::atomic::Ordering::SeqCst);

    if let Err(e) = handle.await {
        warn!(error = %e, "daemon loop ended abnormally");
    }
    info!("automation-daemon exited cleanly");
    Ok(())
}
