//! Backup Daemon - Main entry point
//!
//! One-shot backup commands plus a long-running scheduler mode.

use anyhow::{Context, Result};
use backup_daemon::cloud::{self, SyncQueue};
use backup_daemon::daemon::shutdown::ShutdownCoordinator;
use backup_daemon::engine::{check_health, storage_size};
use backup_daemon::restore::{restore_artifact, verify_artifact};
use backup_daemon::scheduler::{ScheduleSettings, Scheduler};
use backup_daemon::store::{read_state, BackupKind, MetadataStore, Snapshot};
use backup_daemon::{utils, BackupEngine, Config};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "FILE", default_value = "backup_config.toml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a full backup now
    Full,
    /// Run an incremental backup now (a full one if no baseline exists)
    Incremental,
    /// Apply the retention policy now
    Cleanup {
        /// Keep incremental backups from the last N days (overrides config)
        #[arg(long)]
        days: Option<u32>,

        /// Keep the N newest full backups (overrides config)
        #[arg(long)]
        keep_full: Option<u32>,
    },
    /// Run the scheduler until SIGINT/SIGTERM
    Schedule,
    /// List recorded backups
    List,
    /// Check that backups are recent; exits with status 1 otherwise
    Health {
        /// Maximum age of the newest backup
        #[arg(long, default_value_t = 48)]
        max_age_hours: u32,
    },
    /// Unpack a zip backup or copy a mirrored one into DESTINATION
    Restore {
        /// Backup artifact (zip file or snapshot directory)
        backup: PathBuf,

        /// Directory to restore into
        destination: PathBuf,

        /// Skip the integrity check before restoring
        #[arg(long)]
        no_verify: bool,
    },
    /// Upload an existing backup through the sync queue
    SyncCloud {
        /// Backup artifact to upload
        artifact: PathBuf,

        /// Provider to use instead of the configured one
        #[arg(long, value_parser = ["none", "google_drive", "onedrive"])]
        provider: Option<String>,
    },
}

#[derive(Debug, Clone, Copy)]
enum OneShot {
    Full,
    Incremental,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = Config::from_file(&args.config)
        .with_context(|| format!("Failed to load configuration from {}", args.config.display()))?;

    // Initialize logging
    let log_level = args.log_level.as_deref().unwrap_or(&config.log.level);
    let log_dir = config.log.to_file.then(|| config.log_directory());
    utils::logger::init(log_level, log_dir.as_deref())?;

    tracing::info!(
        "Starting backup-daemon v{} (source: {})",
        env!("CARGO_PKG_VERSION"),
        config.source_directory.display()
    );

    match args.command {
        Command::Full => run_backup(config, OneShot::Full).await,
        Command::Incremental => run_backup(config, OneShot::Incremental).await,
        Command::Cleanup { days, keep_full } => run_cleanup(config, days, keep_full).await,
        Command::Schedule => run_schedule(config).await,
        Command::List => list_backups(&config),
        Command::Health { max_age_hours } => health(&config, max_age_hours),
        Command::Restore {
            backup,
            destination,
            no_verify,
        } => restore(backup, destination, !no_verify).await,
        Command::SyncCloud { artifact, provider } => sync_cloud(config, artifact, provider).await,
    }
}

fn open_sync_queue(config: &Config) -> Result<Arc<SyncQueue>> {
    let provider = cloud::provider_from_config(config)?;
    Ok(SyncQueue::open(
        provider,
        &config.local_backup_directory,
        config.sync.workers,
        config.sync.max_attempts,
    ))
}

/// Wait for queued uploads, giving up on timeout or a shutdown signal
async fn drain_uploads(queue: &SyncQueue, timeout: Duration, shutdown: &CancellationToken) {
    tokio::select! {
        drained = queue.wait_idle(timeout) => {
            if !drained {
                tracing::warn!("Uploads still pending, they will be retried by the next run");
            }
        }
        _ = shutdown.cancelled() => {
            tracing::warn!("Interrupted, pending uploads stay queued");
        }
    }
}

async fn run_backup(config: Config, kind: OneShot) -> Result<()> {
    let shutdown = ShutdownCoordinator::new().spawn_listener();
    let queue = open_sync_queue(&config)?;
    let drain_timeout = Duration::from_secs(config.sync.drain_timeout_seconds);

    let snapshot = tokio::task::spawn_blocking(move || {
        let mut engine = BackupEngine::new(&config)?;
        match kind {
            OneShot::Full => engine.perform_full_backup(),
            OneShot::Incremental => engine.perform_incremental_backup(),
        }
    })
    .await??;

    match &snapshot {
        Some(snapshot) => {
            println!(
                "Created {} backup with {} files: {}",
                snapshot.kind,
                snapshot.file_count,
                snapshot.path.display()
            );
            queue.enqueue(&snapshot.path);
        }
        None => println!("Nothing to back up"),
    }

    // Earlier failed uploads get another chance too
    queue.retry_pending();
    drain_uploads(&queue, drain_timeout, &shutdown).await;

    Ok(())
}

async fn run_cleanup(mut config: Config, days: Option<u32>, keep_full: Option<u32>) -> Result<()> {
    if let Some(days) = days {
        config.retention_policy.keep_incremental_days = days;
    }
    if let Some(keep_full) = keep_full {
        config.retention_policy.keep_full_backups = keep_full;
    }
    println!(
        "Removing backups older than {} days, keeping {} full backups",
        config.retention_policy.keep_incremental_days, config.retention_policy.keep_full_backups
    );

    let outcome = tokio::task::spawn_blocking(move || {
        let mut engine = BackupEngine::new(&config)?;
        engine.cleanup_old_backups()
    })
    .await??;

    println!(
        "Removed {} backups, {} could not be deleted, {} remaining",
        outcome.removed.len(),
        outcome.failed.len(),
        outcome.state.backup_history.len()
    );
    Ok(())
}

async fn run_schedule(config: Config) -> Result<()> {
    let shutdown = ShutdownCoordinator::new().spawn_listener();
    let queue = open_sync_queue(&config)?;
    queue.retry_pending();

    let settings = ScheduleSettings::from_config(&config);
    let stop_timeout = settings.stop_timeout;

    let engine_config = config.clone();
    let engine = tokio::task::spawn_blocking(move || BackupEngine::new(&engine_config)).await??;

    tracing::info!(
        provider = queue.provider_name(),
        tick_secs = config.scheduler.tick_seconds,
        "Scheduler mode"
    );

    let mut scheduler = Scheduler::new(engine, settings, Some(Arc::clone(&queue)));
    scheduler.start();

    // Wait for shutdown signal
    shutdown.cancelled().await;

    if !scheduler.stop().await {
        tracing::warn!("Scheduler loop abandoned");
    }

    if !queue.wait_idle(stop_timeout).await {
        tracing::warn!(
            pending = queue.pending().len(),
            "Exiting with uploads in flight, they stay queued"
        );
    }

    tracing::info!("Shutdown complete");
    Ok(())
}

fn list_backups(config: &Config) -> Result<()> {
    let store = MetadataStore::new(&config.local_backup_directory);
    let state = read_state(store.path())?.unwrap_or_default();

    if state.backup_history.is_empty() {
        println!("No backups recorded");
        return Ok(());
    }

    let mut history: Vec<&Snapshot> = state.backup_history.iter().collect();
    history.sort_by_key(|s| s.timestamp);

    println!("{:<12} {:<20} {:>8} {:>12}  PATH", "TYPE", "TIMESTAMP", "FILES", "SIZE (MB)");
    for snapshot in history {
        let size_mb = storage_size(&snapshot.path) as f64 / (1024.0 * 1024.0);
        println!(
            "{:<12} {:<20} {:>8} {:>12.1}  {}",
            snapshot.kind,
            snapshot.timestamp.format("%Y-%m-%d %H:%M:%S").to_string(),
            snapshot.file_count,
            size_mb,
            snapshot.path.display()
        );
    }

    println!(
        "\n{} full, {} incremental",
        state.count(BackupKind::Full),
        state.count(BackupKind::Incremental)
    );

    let pending = cloud::queue::load_pending(&config.local_backup_directory);
    if !pending.is_empty() {
        println!("{} uploads pending", pending.len());
    }
    Ok(())
}

fn health(config: &Config, max_age_hours: u32) -> Result<()> {
    let report = check_health(
        config,
        chrono::Utc::now(),
        chrono::Duration::hours(i64::from(max_age_hours)),
    );

    if let Some(last) = &report.last_backup {
        println!("Last backup: {} ({}) at {}", last.timestamp.to_rfc3339(), last.kind, last.path.display());
    }

    if report.healthy {
        println!("Backup system healthy");
        return Ok(());
    }

    for problem in &report.problems {
        println!("Problem: {problem}");
    }
    std::process::exit(1);
}

async fn restore(backup: PathBuf, destination: PathBuf, verify: bool) -> Result<()> {
    let report = tokio::task::spawn_blocking(move || {
        if verify {
            println!("Verifying {}...", backup.display());
            let files = verify_artifact(&backup)?;
            println!("{files} files verified");
        }
        println!("Restoring {} to {}...", backup.display(), destination.display());
        restore_artifact(&backup, &destination)
    })
    .await??;

    println!("Restored {} files ({} bytes)", report.files, report.bytes);
    if report.skipped > 0 {
        println!("{} entries with unsafe names were skipped", report.skipped);
    }
    Ok(())
}

async fn sync_cloud(mut config: Config, artifact: PathBuf, provider: Option<String>) -> Result<()> {
    if let Some(provider) = provider {
        config.cloud_provider = provider;
    }
    anyhow::ensure!(artifact.exists(), "{} does not exist", artifact.display());

    let shutdown = ShutdownCoordinator::new().spawn_listener();
    let queue = open_sync_queue(&config)?;
    println!("Uploading {} via {}...", artifact.display(), queue.provider_name());

    queue.enqueue(&artifact);
    drain_uploads(&queue, Duration::from_secs(config.sync.drain_timeout_seconds), &shutdown).await;

    match queue.pending().into_iter().find(|p| p.path == artifact) {
        None => println!("Upload complete"),
        Some(entry) => anyhow::bail!(
            "upload not finished after {} attempts ({}), it stays queued",
            entry.attempts,
            entry.last_error.as_deref().unwrap_or("still running")
        ),
    }
    Ok(())
}
