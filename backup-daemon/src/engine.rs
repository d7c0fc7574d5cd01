//! Backup orchestration.
//!
//! Ties the change detector, the archive builder and the metadata store
//! together. A backup is committed only after its artifact is published, and
//! an artifact whose commit fails is removed again, so history never points
//! at an artifact the ledger does not know about (and vice versa).

use crate::archive::ArchiveBuilder;
use crate::config::Config;
use crate::detector::ChangeDetector;
use crate::retention::{delete_storage, PruneOutcome, RetentionPolicyEngine};
use crate::store::{read_state, BackupKind, MetadataState, MetadataStore, Snapshot};
use crate::utils::errors::{BackupError, Result};
use chrono::{DateTime, Duration, SubsecRound, Utc};
use std::path::{Path, PathBuf};
use tracing::{error, info, warn};
use walkdir::WalkDir;

pub struct BackupEngine {
    source_directory: PathBuf,
    detector: ChangeDetector,
    builder: ArchiveBuilder,
    store: MetadataStore,
    retention: RetentionPolicyEngine,
}

/// Backups are stamped to whole seconds, matching artifact names
fn now_seconds() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(0)
}

impl BackupEngine {
    pub fn new(config: &Config) -> Result<Self> {
        let builder = ArchiveBuilder::new(
            config.local_backup_directory.clone(),
            config.compression.enabled,
        );
        let swept = builder.sweep_staging();
        if swept > 0 {
            warn!(swept, "Cleaned up interrupted builds");
        }

        // Our own artifacts, ledger, queue and logs never feed back into a scan
        std::fs::create_dir_all(&config.local_backup_directory)?;
        let mut detector = ChangeDetector::new(&config.exclude_patterns)?;
        detector.skip_directory(config.local_backup_directory.canonicalize()?);

        Ok(Self {
            source_directory: config.source_directory.clone(),
            detector,
            builder,
            store: MetadataStore::new(&config.local_backup_directory),
            retention: RetentionPolicyEngine::new(config.retention_policy),
        })
    }

    /// Current ledger (loaded on first access)
    pub fn metadata(&mut self) -> &MetadataState {
        self.store.load()
    }

    pub fn perform_full_backup(&mut self) -> Result<Option<Snapshot>> {
        self.backup_at(BackupKind::Full, now_seconds())
    }

    pub fn perform_incremental_backup(&mut self) -> Result<Option<Snapshot>> {
        self.backup_at(BackupKind::Incremental, now_seconds())
    }

    pub fn cleanup_old_backups(&mut self) -> Result<PruneOutcome> {
        self.cleanup_at(Utc::now())
    }

    /// Run one backup stamped `timestamp`.
    ///
    /// Returns `Ok(None)` for a no-op: nothing changed, or the source
    /// directory is missing. An incremental request without a full baseline
    /// runs as a full backup.
    pub fn backup_at(&mut self, requested: BackupKind, timestamp: DateTime<Utc>) -> Result<Option<Snapshot>> {
        let prior = self.store.load().clone();

        let kind = if requested == BackupKind::Incremental && prior.last_full_backup_timestamp.is_none() {
            info!("No full backup recorded yet, running a full backup instead of an incremental");
            BackupKind::Full
        } else {
            requested
        };
        let force_full = kind == BackupKind::Full;

        info!(kind = %kind, source = %self.source_directory.display(), "Starting backup");

        let scan = match self.detector.scan(&self.source_directory, &prior.file_hashes, force_full) {
            Ok(scan) => scan,
            Err(e @ BackupError::SourceMissing(_)) => {
                error!(error = %e, "Backup skipped");
                return Ok(None);
            }
            Err(e) => return Err(e),
        };

        if scan.is_empty() {
            info!(kind = %kind, "No files to back up, nothing written");
            return Ok(None);
        }

        let artifact = self
            .builder
            .build(&scan.files, &scan.root, kind.label(), timestamp)?;

        let snapshot = Snapshot {
            kind,
            timestamp,
            path: artifact,
            file_count: scan.files.len(),
        };

        let mut next = prior;
        next.file_hashes = scan.hashes;
        if kind == BackupKind::Full {
            next.last_full_backup_timestamp = Some(timestamp);
        }
        next.backup_history.push(snapshot.clone());

        if let Err(e) = self.store.commit(next) {
            error!(error = %e, artifact = %snapshot.path.display(), "Metadata commit failed, discarding artifact");
            if let Err(cleanup) = delete_storage(&snapshot.path) {
                warn!(error = %cleanup, "Failed to discard uncommitted artifact");
            }
            return Err(e);
        }

        info!(
            kind = %kind,
            files = snapshot.file_count,
            artifact = %snapshot.path.display(),
            "Backup completed"
        );
        Ok(Some(snapshot))
    }

    /// Apply the retention policy as of `now`, committing only when the
    /// history changed.
    pub fn cleanup_at(&mut self, now: DateTime<Utc>) -> Result<PruneOutcome> {
        let state = self.store.load().clone();
        let outcome = self.retention.prune(&state, now);
        if outcome.changed() {
            self.store.commit(outcome.state.clone())?;
        }
        Ok(outcome)
    }
}

/// Bytes on disk of an artifact (file or directory tree); 0 when missing
pub fn storage_size(path: &Path) -> u64 {
    WalkDir::new(path)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .filter_map(|e| e.metadata().ok())
        .map(|m| m.len())
        .sum()
}

#[derive(Debug, Clone)]
pub struct HealthReport {
    pub healthy: bool,
    pub problems: Vec<String>,
    pub last_backup: Option<Snapshot>,
}

/// Check that the ledger is readable, the source exists and the newest
/// snapshot is at most `max_age` old.
pub fn check_health(config: &Config, now: DateTime<Utc>, max_age: Duration) -> HealthReport {
    let mut problems = Vec::new();

    if !config.source_directory.is_dir() {
        problems.push(format!(
            "source directory {} does not exist",
            config.source_directory.display()
        ));
    }

    let metadata_path = MetadataStore::new(&config.local_backup_directory).path().to_path_buf();
    let last_backup = match read_state(&metadata_path) {
        Ok(Some(state)) => state.latest_snapshot().cloned(),
        Ok(None) => None,
        Err(e) => {
            problems.push(e.to_string());
            None
        }
    };

    match &last_backup {
        Some(snapshot) if now - snapshot.timestamp > max_age => problems.push(format!(
            "last backup at {} is older than {} hours",
            snapshot.timestamp.to_rfc3339(),
            max_age.num_hours()
        )),
        Some(_) => {}
        None => problems.push("no backups recorded".to_string()),
    }

    HealthReport {
        healthy: problems.is_empty(),
        problems,
        last_backup,
    }
}
