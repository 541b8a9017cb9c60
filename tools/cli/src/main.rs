//! FieldSync CLI - Command line interface for the capture sync subsystem.
//!
//! This tool authorizes the device, allocates references, captures
//! records into the local queue and drains that queue to the backend.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use fieldsync_common::TransactionType;
use fieldsync_storage::{ConfigStore, FileStore, SqliteQueueStore, SqliteStore, SyncQueue};
use fieldsync_sync::{
    BackendApi, HttpBackend, OfflineBackend, PassReport, SyncConfig, SyncEvent, SyncOrchestrator,
    SyncTrigger,
};

type Orchestrator = SyncOrchestrator<dyn BackendApi>;

#[derive(Parser)]
#[command(name = "fieldsync")]
#[command(about = "FieldSync - Offline transaction references and backend sync")]
#[command(version)]
struct Cli {
    /// Enable verbose logging.
    #[arg(short, long)]
    verbose: bool,

    /// Directory holding the local database and backup.
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// JSON config file (default: <data-dir>/fieldsync.json).
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Backend base URL.
    #[arg(long, global = true, env = "FIELDSYNC_BACKEND_URL")]
    backend_url: Option<String>,

    /// Device fingerprint reported to the backend.
    #[arg(long, global = true, env = "FIELDSYNC_FINGERPRINT")]
    fingerprint: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Confirm device authorization and merge backend counters.
    Authorize,

    /// Allocate a reference without capturing a record.
    Allocate {
        /// Also allocate an upload reference for this type.
        #[arg(short = 't', long = "type")]
        kind: Option<TransactionType>,
    },

    /// Capture a record into the sync queue.
    Capture {
        /// Transaction type: collection, sale or service.
        #[arg(short = 't', long = "type")]
        kind: TransactionType,

        /// Record payload as JSON.
        #[arg(short, long)]
        payload: String,
    },

    /// List records awaiting delivery.
    Pending {
        /// Only show this transaction type.
        #[arg(short = 't', long = "type")]
        kind: Option<TransactionType>,
    },

    /// Show queue counts and counter state.
    Stats,

    /// Drain the queue to the backend now.
    Sync {
        /// Keep running on the periodic schedule until interrupted.
        #[arg(short, long)]
        watch: bool,
    },

    /// Delete every unsynced record.
    Purge {
        /// Confirm the irreversible deletion.
        #[arg(long)]
        yes: bool,
    },

    /// Remove the device config (devcode and counters).
    Reset {
        /// Confirm the reset.
        #[arg(long)]
        yes: bool,
    },

    /// Print the effective configuration.
    ShowConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let default_filter = if cli.verbose {
        "fieldsync=debug"
    } else {
        "fieldsync=info"
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(false).compact())
        .init();

    let data_dir = resolve_data_dir(cli.data_dir.as_deref())?;
    let config_path = cli
        .config
        .clone()
        .unwrap_or_else(|| data_dir.join("fieldsync.json"));
    let mut config = SyncConfig::load(&config_path)
        .with_context(|| format!("Failed to load config {}", config_path.display()))?;
    if let Some(url) = cli.backend_url {
        config.backend_url = Some(url);
    }
    if let Some(fingerprint) = cli.fingerprint {
        config.device_fingerprint = fingerprint;
    }

    if let Commands::ShowConfig = cli.command {
        return cmd_show_config(&config, &config_path, &data_dir).await;
    }

    let orchestrator = open_orchestrator(&data_dir, config)?;

    match cli.command {
        Commands::Authorize => cmd_authorize(&orchestrator).await,
        Commands::Allocate { kind } => cmd_allocate(&orchestrator, kind).await,
        Commands::Capture { kind, payload } => cmd_capture(&orchestrator, kind, &payload).await,
        Commands::Pending { kind } => cmd_pending(&orchestrator, kind).await,
        Commands::Stats => cmd_stats(&orchestrator).await,
        Commands::Sync { watch } => cmd_sync(orchestrator, watch).await,
        Commands::Purge { yes } => cmd_purge(&orchestrator, yes).await,
        Commands::Reset { yes } => cmd_reset(&orchestrator, yes).await,
        Commands::ShowConfig => Ok(()),
    }
}

fn resolve_data_dir(explicit: Option<&Path>) -> Result<PathBuf> {
    let dir = match explicit {
        Some(dir) => dir.to_path_buf(),
        None => dirs::data_dir()
            .context("No platform data directory; pass --data-dir")?
            .join("fieldsync"),
    };
    std::fs::create_dir_all(&dir)
        .with_context(|| format!("Failed to create data directory {}", dir.display()))?;
    Ok(dir)
}

/// Wire the SQLite primary, file backup, SQLite queue and backend client.
fn open_orchestrator(data_dir: &Path, config: SyncConfig) -> Result<Orchestrator> {
    let db_path = data_dir.join("fieldsync.db");
    let primary = SqliteStore::open(&db_path).context("Failed to open config database")?;
    let backup = FileStore::new(data_dir.join("backup")).context("Failed to open backup store")?;
    let config_store = Arc::new(ConfigStore::new(Arc::new(primary), Arc::new(backup)));

    let queue_store = SqliteQueueStore::open(&db_path).context("Failed to open queue database")?;
    let queue = Arc::new(SyncQueue::new(Arc::new(queue_store), config.queue.clone()));

    let backend: Arc<dyn BackendApi> = match config.backend_url.as_deref() {
        Some(url) => Arc::new(
            HttpBackend::new(url, config.request_timeout()).context("Invalid backend URL")?,
        ),
        None => {
            warn!("No backend URL configured; working offline");
            Arc::new(OfflineBackend)
        }
    };

    Ok(SyncOrchestrator::new(backend, config_store, queue, config))
}

/// Confirm authorization.
async fn cmd_authorize(orchestrator: &Orchestrator) -> Result<()> {
    let authorization = orchestrator
        .authorize()
        .await
        .context("Authorization failed")?;

    println!("Device authorized.");
    if let Some(company) = &authorization.company_name {
        println!("  Company: {}", company);
    }
    println!("  Devcode: {}", authorization.config.devcode);
    println!("  Last transaction id: {}", authorization.config.last_trn_id);
    for (kind, value) in &authorization.config.type_counters {
        println!("  Last {} id: {}", kind, value);
    }

    Ok(())
}

/// Allocate references.
async fn cmd_allocate(orchestrator: &Orchestrator, kind: Option<TransactionType>) -> Result<()> {
    let allocator = orchestrator.allocator();
    match kind {
        Some(kind) => {
            let allocation = allocator
                .allocate(kind)
                .await
                .context("Failed to allocate references")?;
            println!("Reference: {}", allocation.reference);
            if let Some(upload) = allocation.upload_reference {
                println!("Upload reference ({}): {}", kind, upload);
            }
        }
        None => {
            let reference = allocator
                .next_reference()
                .await
                .context("Failed to allocate reference")?;
            println!("Reference: {}", reference);
        }
    }

    Ok(())
}

/// Capture a record.
async fn cmd_capture(orchestrator: &Orchestrator, kind: TransactionType, payload: &str) -> Result<()> {
    let payload: serde_json::Value =
        serde_json::from_str(payload).context("Payload is not valid JSON")?;

    let record = orchestrator
        .capture(kind, payload)
        .await
        .context("Capture could not be recorded")?;

    println!("Captured {} {}", record.kind, record.reference);
    if let Some(upload) = &record.upload_reference {
        println!("  Upload reference: {}", upload);
    }

    Ok(())
}

/// List pending records.
async fn cmd_pending(orchestrator: &Orchestrator, kind: Option<TransactionType>) -> Result<()> {
    let records = orchestrator
        .queue()
        .list_pending(kind)
        .await
        .context("Failed to read queue")?;

    if records.is_empty() {
        println!("No pending records.");
        return Ok(());
    }

    for record in records {
        println!(
            "  {}  {:<10}  {}  failures: {}",
            record.reference,
            record.kind.as_str(),
            record.created_at.format("%Y-%m-%d %H:%M:%S"),
            record.failure_count
        );
    }

    Ok(())
}

/// Show queue and counter state.
async fn cmd_stats(orchestrator: &Orchestrator) -> Result<()> {
    let stats = orchestrator
        .queue()
        .stats()
        .await
        .context("Failed to read queue")?;

    println!("Queue:");
    println!("  Pending: {}", stats.pending);
    println!("  Failed: {}", stats.failed);
    println!("  Synced: {}", stats.synced);

    match orchestrator.config_store().get().await? {
        Some(config) => {
            println!("Device:");
            println!("  Devcode: {}", config.devcode);
            println!("  Last transaction id: {}", config.last_trn_id);
            for kind in TransactionType::ALL {
                println!("  Last {} id: {}", kind, config.type_counter(kind));
            }
        }
        None => println!("Device not configured; run `fieldsync authorize`."),
    }

    Ok(())
}

/// Drain now, optionally staying on the schedule.
async fn cmd_sync(mut orchestrator: Orchestrator, watch: bool) -> Result<()> {
    if !watch {
        let report = orchestrator
            .handle_trigger(SyncTrigger::Manual)
            .await
            .context("Sync failed")?;
        if let Some(report) = report {
            print_report(&report);
        }
        return Ok(());
    }

    let handle = orchestrator.init_scheduler();
    let orchestrator = Arc::new(orchestrator);
    let mut events = orchestrator.subscribe();
    let task = orchestrator.run_scheduler(handle);
    let scheduler = orchestrator
        .scheduler()
        .context("Scheduler not initialized")?;

    scheduler.notify(SyncTrigger::Manual).await?;
    info!("Watching; press Ctrl-C to stop");

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(SyncEvent::PassCompleted(report)) => print_report(&report),
                Ok(SyncEvent::BackendOutdated(message)) => {
                    eprintln!("Backend outdated, delivery halted: {}", message);
                }
                Ok(other) => info!("{:?}", other),
                Err(e) => warn!("Missed sync events: {}", e),
            },
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    scheduler.shutdown().await;
    task.await.context("Scheduler task failed")?;
    Ok(())
}

fn print_report(report: &PassReport) {
    println!(
        "Sync pass: {} delivered, {} superseded, {} failed, {} deferred, {} waiting ({:?})",
        report.delivered,
        report.superseded,
        report.failed,
        report.deferred,
        report.skipped,
        report.duration
    );
}

/// Purge unsynced records.
async fn cmd_purge(orchestrator: &Orchestrator, yes: bool) -> Result<()> {
    if !yes {
        anyhow::bail!("Purging deletes unsent captures permanently; pass --yes to confirm");
    }

    let purged = orchestrator
        .queue()
        .purge_all_pending()
        .await
        .context("Failed to purge queue")?;
    println!("Purged {} unsynced records.", purged);

    Ok(())
}

/// Reset device config.
async fn cmd_reset(orchestrator: &Orchestrator, yes: bool) -> Result<()> {
    if !yes {
        anyhow::bail!("Reset removes the devcode and counters; pass --yes to confirm");
    }

    let stats = orchestrator.queue().stats().await?;
    if stats.unsynced() > 0 {
        warn!("{} records are still unsynced", stats.unsynced());
    }

    orchestrator
        .config_store()
        .reset()
        .await
        .context("Failed to reset device config")?;
    println!("Device config removed.");

    Ok(())
}

/// Print effective configuration.
async fn cmd_show_config(config: &SyncConfig, config_path: &Path, data_dir: &Path) -> Result<()> {
    println!("Config file: {}", config_path.display());
    println!("Data directory: {}", data_dir.display());
    println!("{}", serde_json::to_string_pretty(config)?);
    Ok(())
}
