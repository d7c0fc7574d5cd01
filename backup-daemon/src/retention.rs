//! Retention policy enforcement.
//!
//! Keeps the newest `keep_full_backups` full snapshots and every incremental
//! snapshot younger than `keep_incremental_days`. Everything else is deleted
//! from disk and dropped from the history. A snapshot whose storage cannot be
//! removed stays in the history so the next pass retries it.

use crate::config::RetentionPolicy;
use crate::store::{BackupKind, MetadataState, Snapshot};
use crate::utils::errors::BackupError;
use chrono::{DateTime, Duration, Utc};
use std::collections::HashSet;
use std::path::Path;
use tracing::{error, info, warn};

/// Result of a retention pass
#[derive(Debug, Clone, Default)]
pub struct PruneOutcome {
    /// State to commit
    pub state: MetadataState,

    /// Snapshots deleted and dropped from history
    pub removed: Vec<Snapshot>,

    /// Expired snapshots whose deletion failed, kept for the next pass
    pub failed: Vec<Snapshot>,
}

impl PruneOutcome {
    pub fn changed(&self) -> bool {
        !self.removed.is_empty()
    }
}

pub struct RetentionPolicyEngine {
    policy: RetentionPolicy,
}

impl RetentionPolicyEngine {
    pub fn new(policy: RetentionPolicy) -> Self {
        Self { policy }
    }

    /// Indices into `history` of snapshots the policy no longer keeps
    pub fn expired(&self, history: &[Snapshot], now: DateTime<Utc>) -> Vec<usize> {
        let mut fulls: Vec<usize> = history
            .iter()
            .enumerate()
            .filter(|(_, s)| s.kind == BackupKind::Full)
            .map(|(i, _)| i)
            .collect();
        fulls.sort_by(|a, b| history[*b].timestamp.cmp(&history[*a].timestamp));

        let keep_full = self.policy.keep_full_backups as usize;
        // None when the window reaches past the earliest representable date
        let cutoff = Duration::try_days(i64::from(self.policy.keep_incremental_days))
            .and_then(|window| now.checked_sub_signed(window));

        let mut expired: HashSet<usize> = fulls.into_iter().skip(keep_full).collect();
        expired.extend(
            history
                .iter()
                .enumerate()
                .filter(|(_, s)| s.kind == BackupKind::Incremental)
                .filter(|(_, s)| cutoff.is_some_and(|cutoff| s.timestamp < cutoff))
                .map(|(i, _)| i),
        );

        let mut expired: Vec<usize> = expired.into_iter().collect();
        expired.sort_unstable();
        expired
    }

    /// Delete expired snapshots and return the pruned state.
    ///
    /// Each deletion is independent: one failure never blocks the others.
    pub fn prune(&self, state: &MetadataState, now: DateTime<Utc>) -> PruneOutcome {
        self.prune_with(state, now, delete_storage)
    }

    fn prune_with<F>(&self, state: &MetadataState, now: DateTime<Utc>, mut delete: F) -> PruneOutcome
    where
        F: FnMut(&Path) -> Result<(), BackupError>,
    {
        let expired: HashSet<usize> = self.expired(&state.backup_history, now).into_iter().collect();

        let mut outcome = PruneOutcome {
            state: MetadataState {
                backup_history: Vec::with_capacity(state.backup_history.len()),
                ..state.clone()
            },
            ..Default::default()
        };

        for (idx, snapshot) in state.backup_history.iter().enumerate() {
            if !expired.contains(&idx) {
                outcome.state.backup_history.push(snapshot.clone());
                continue;
            }

            match delete(&snapshot.path) {
                Ok(()) => {
                    info!(
                        kind = %snapshot.kind,
                        path = %snapshot.path.display(),
                        timestamp = %snapshot.timestamp,
                        "Removed expired backup"
                    );
                    outcome.removed.push(snapshot.clone());
                }
                Err(e) if !exists(&snapshot.path) => {
                    warn!(error = %e, "Deletion reported an error but the backup is gone");
                    outcome.removed.push(snapshot.clone());
                }
                Err(e) => {
                    error!(error = %e, "Failed to remove expired backup, will retry on next pass");
                    outcome.state.backup_history.push(snapshot.clone());
                    outcome.failed.push(snapshot.clone());
                }
            }
        }

        info!(
            removed = outcome.removed.len(),
            failed = outcome.failed.len(),
            remaining = outcome.state.backup_history.len(),
            "Retention pass complete"
        );

        outcome
    }
}

fn exists(path: &Path) -> bool {
    std::fs::symlink_metadata(path).is_ok()
}

/// Remove a snapshot's storage, file or directory tree. Missing storage
/// counts as removed.
pub(crate) fn delete_storage(path: &Path) -> Result<(), BackupError> {
    let metadata = match std::fs::symlink_metadata(path) {
        Ok(metadata) => metadata,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(source) => {
            return Err(BackupError::Deletion {
                path: path.to_path_buf(),
                source,
            })
        }
    };

    let result = if metadata.is_dir() {
        std::fs::remove_dir_all(path)
    } else {
        std::fs::remove_file(path)
    };

    result.map_err(|source| BackupError::Deletion {
        path: path.to_path_buf(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::fs;
    use std::path::PathBuf;
    use tempfile::TempDir;

    fn policy(keep_full_backups: u32, keep_incremental_days: u32) -> RetentionPolicy {
        RetentionPolicy {
            keep_full_backups,
            keep_incremental_days,
        }
    }

    fn day(d: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, d, 0, 0, 0).unwrap()
    }

    fn snapshot(dir: &Path, kind: BackupKind, d: u32) -> Snapshot {
        let path = dir.join(format!("{}_{d:02}.zip", kind.label()));
        fs::write(&path, b"archive").unwrap();
        Snapshot {
            kind,
            timestamp: day(d),
            path,
            file_count: 1,
        }
    }

    fn history_days(state: &MetadataState) -> Vec<(BackupKind, u32)> {
        use chrono::Datelike;
        state
            .backup_history
            .iter()
            .map(|s| (s.kind, s.timestamp.day()))
            .collect()
    }

    #[test]
    fn test_keeps_newest_full_backups() {
        let temp_dir = TempDir::new().unwrap();
        let t1 = snapshot(temp_dir.path(), BackupKind::Full, 1);
        let t2 = snapshot(temp_dir.path(), BackupKind::Full, 2);
        let t3 = snapshot(temp_dir.path(), BackupKind::Full, 3);
        let state = MetadataState {
            // Out of order on purpose: selection is by timestamp
            backup_history: vec![t2.clone(), t1.clone(), t3.clone()],
            ..Default::default()
        };

        let outcome = RetentionPolicyEngine::new(policy(2, 30)).prune(&state, day(4));

        assert_eq!(outcome.removed, vec![t1.clone()]);
        assert!(!t1.path.exists());
        assert!(t2.path.exists() && t3.path.exists());
        assert_eq!(
            history_days(&outcome.state),
            vec![(BackupKind::Full, 2), (BackupKind::Full, 3)]
        );
    }

    #[test]
    fn test_incrementals_expire_by_age() {
        let temp_dir = TempDir::new().unwrap();
        let state = MetadataState {
            backup_history: vec![
                snapshot(temp_dir.path(), BackupKind::Full, 1),
                snapshot(temp_dir.path(), BackupKind::Incremental, 2),
                snapshot(temp_dir.path(), BackupKind::Incremental, 5),
                snapshot(temp_dir.path(), BackupKind::Incremental, 9),
            ],
            ..Default::default()
        };

        // cutoff = June 5th, inclusive
        let outcome = RetentionPolicyEngine::new(policy(4, 5)).prune(&state, day(10));

        assert_eq!(outcome.removed.len(), 1);
        assert_eq!(
            history_days(&outcome.state),
            vec![
                (BackupKind::Full, 1),
                (BackupKind::Incremental, 5),
                (BackupKind::Incremental, 9)
            ]
        );
    }

    #[test]
    fn test_zero_keep_removes_all_fulls() {
        let temp_dir = TempDir::new().unwrap();
        let state = MetadataState {
            backup_history: vec![
                snapshot(temp_dir.path(), BackupKind::Full, 1),
                snapshot(temp_dir.path(), BackupKind::Full, 2),
            ],
            ..Default::default()
        };

        let outcome = RetentionPolicyEngine::new(policy(0, 30)).prune(&state, day(3));
        assert!(outcome.state.backup_history.is_empty());
        assert_eq!(outcome.removed.len(), 2);
    }

    #[test]
    fn test_missing_storage_is_dropped_from_history() {
        let state = MetadataState {
            backup_history: vec![
                Snapshot {
                    kind: BackupKind::Full,
                    timestamp: day(1),
                    path: PathBuf::from("/nonexistent/backup_full_01.zip"),
                    file_count: 3,
                },
                Snapshot {
                    kind: BackupKind::Full,
                    timestamp: day(2),
                    path: PathBuf::from("/nonexistent/backup_full_02.zip"),
                    file_count: 3,
                },
            ],
            ..Default::default()
        };

        let outcome = RetentionPolicyEngine::new(policy(1, 30)).prune(&state, day(3));
        assert_eq!(outcome.removed.len(), 1);
        assert!(outcome.failed.is_empty());
        assert_eq!(history_days(&outcome.state), vec![(BackupKind::Full, 2)]);
    }

    #[test]
    fn test_directory_snapshots_are_removed_recursively() {
        let temp_dir = TempDir::new().unwrap();
        let old = temp_dir.path().join("backup_full_old");
        fs::create_dir_all(old.join("a/b")).unwrap();
        fs::write(old.join("a/b/file.txt"), b"x").unwrap();

        let state = MetadataState {
            backup_history: vec![
                Snapshot {
                    kind: BackupKind::Full,
                    timestamp: day(1),
                    path: old.clone(),
                    file_count: 1,
                },
                snapshot(temp_dir.path(), BackupKind::Full, 2),
            ],
            ..Default::default()
        };

        let outcome = RetentionPolicyEngine::new(policy(1, 30)).prune(&state, day(3));
        assert!(!old.exists());
        assert_eq!(outcome.removed.len(), 1);
    }

    #[test]
    fn test_huge_incremental_window_keeps_everything() {
        let temp_dir = TempDir::new().unwrap();
        let state = MetadataState {
            backup_history: vec![
                snapshot(temp_dir.path(), BackupKind::Full, 1),
                snapshot(temp_dir.path(), BackupKind::Incremental, 2),
            ],
            ..Default::default()
        };

        for days in [100_000_000, u32::MAX] {
            let engine = RetentionPolicyEngine::new(policy(4, days));
            assert!(engine.expired(&state.backup_history, day(3)).is_empty());

            let outcome = engine.prune(&state, day(3));
            assert!(!outcome.changed());
            assert_eq!(outcome.state.backup_history, state.backup_history);
        }

        // Full-backup selection still applies
        let outcome = RetentionPolicyEngine::new(policy(0, u32::MAX)).prune(&state, day(3));
        assert_eq!(history_days(&outcome.state), vec![(BackupKind::Incremental, 2)]);
    }

    #[test]
    fn test_failed_deletion_stays_in_history() {
        let temp_dir = TempDir::new().unwrap();
        let stuck = snapshot(temp_dir.path(), BackupKind::Full, 1);
        let free = snapshot(temp_dir.path(), BackupKind::Full, 2);
        let newest = snapshot(temp_dir.path(), BackupKind::Full, 3);

        let state = MetadataState {
            backup_history: vec![stuck.clone(), free.clone(), newest.clone()],
            ..Default::default()
        };

        let stuck_path = stuck.path.clone();
        let outcome = RetentionPolicyEngine::new(policy(1, 30)).prune_with(&state, day(4), |path| {
            if path == stuck_path {
                return Err(BackupError::Deletion {
                    path: path.to_path_buf(),
                    source: std::io::Error::from(std::io::ErrorKind::PermissionDenied),
                });
            }
            delete_storage(path)
        });

        assert_eq!(outcome.failed, vec![stuck.clone()]);
        assert_eq!(outcome.removed, vec![free.clone()]);
        assert_eq!(outcome.state.backup_history, vec![stuck.clone(), newest]);
        assert!(stuck.path.exists());
        assert!(!free.path.exists());
    }

    #[test]
    fn test_deletion_error_with_storage_gone_counts_as_removed() {
        let temp_dir = TempDir::new().unwrap();
        let vanished = snapshot(temp_dir.path(), BackupKind::Full, 1);
        let newest = snapshot(temp_dir.path(), BackupKind::Full, 2);
        let state = MetadataState {
            backup_history: vec![vanished.clone(), newest.clone()],
            ..Default::default()
        };

        // The storage disappears but the deleter still reports an error
        let outcome = RetentionPolicyEngine::new(policy(1, 30)).prune_with(&state, day(3), |path| {
            fs::remove_file(path).unwrap();
            Err(BackupError::Deletion {
                path: path.to_path_buf(),
                source: std::io::Error::from(std::io::ErrorKind::Other),
            })
        });

        assert_eq!(outcome.removed, vec![vanished]);
        assert!(outcome.failed.is_empty());
        assert_eq!(outcome.state.backup_history, vec![newest]);
    }

    #[test]
    #[cfg(target_os = "linux")]
    fn test_undeletable_storage_stays_in_history() {
        // procfs entries cannot be unlinked, not even by root
        let undeletable = Snapshot {
            kind: BackupKind::Full,
            timestamp: day(1),
            path: PathBuf::from("/proc/self"),
            file_count: 1,
        };
        let temp_dir = TempDir::new().unwrap();
        let newest = snapshot(temp_dir.path(), BackupKind::Full, 2);
        let state = MetadataState {
            backup_history: vec![undeletable.clone(), newest.clone()],
            ..Default::default()
        };

        let outcome = RetentionPolicyEngine::new(policy(1, 30)).prune(&state, day(3));
        assert_eq!(outcome.failed, vec![undeletable.clone()]);
        assert!(outcome.removed.is_empty());
        assert_eq!(outcome.state.backup_history, vec![undeletable, newest]);
    }
}
