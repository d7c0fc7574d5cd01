//! Content-addressed change detection.
//!
//! Walks the source tree, hashes every non-excluded file and decides which
//! files belong in the next snapshot.

use crate::fs::hash::hash_file;
use crate::fs::walker::{walk_directory, ExcludeMatcher};
use crate::store::FileHashes;
use crate::utils::errors::{BackupError, Result};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use tracing::{debug, error, info};

/// Outcome of one scan
#[derive(Debug, Clone, Default)]
pub struct ScanResult {
    /// Canonical source root the scan ran against
    pub root: PathBuf,

    /// Absolute paths selected for the snapshot
    pub files: BTreeSet<PathBuf>,

    /// Complete hash map to commit if the snapshot succeeds
    pub hashes: FileHashes,

    /// Total size of the selected files
    pub selected_bytes: u64,

    /// Files that were found but could not be read
    pub unreadable: usize,
}

impl ScanResult {
    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}

pub struct ChangeDetector {
    excludes: ExcludeMatcher,
}

impl ChangeDetector {
    pub fn new(exclude_patterns: &[String]) -> Result<Self> {
        Ok(Self {
            excludes: ExcludeMatcher::new(exclude_patterns)?,
        })
    }

    /// Never descend into `dir` (canonical), e.g. a backup directory that
    /// lives inside the source tree
    pub fn skip_directory(&mut self, dir: PathBuf) {
        self.excludes.prune_path(dir);
    }

    /// Scan `source_root` against `prior` hashes.
    ///
    /// With `force_full` every readable file is selected and the returned map
    /// is rebuilt from this scan. Otherwise only new or modified files are
    /// selected and the returned map is `prior` with those entries
    /// overwritten. Unreadable files are skipped and keep their prior entry.
    pub fn scan(&self, source_root: &Path, prior: &FileHashes, force_full: bool) -> Result<ScanResult> {
        let root = match source_root.canonicalize() {
            Ok(root) if root.is_dir() => root,
            _ => return Err(BackupError::SourceMissing(source_root.to_path_buf())),
        };

        let entries = walk_directory(&root, &self.excludes)
            .map_err(|_| BackupError::SourceMissing(source_root.to_path_buf()))?;

        let mut result = ScanResult {
            root,
            hashes: if force_full { FileHashes::new() } else { prior.clone() },
            ..Default::default()
        };

        for entry in entries {
            let key = entry.path.to_string_lossy().to_string();

            let digest = match hash_file(&entry.path) {
                Ok(digest) => digest,
                Err(source) => {
                    let err = BackupError::FileRead {
                        path: entry.path.clone(),
                        source,
                    };
                    error!(error = %err, "Skipping unreadable file");
                    result.unreadable += 1;
                    if let Some(previous) = prior.get(&key) {
                        result.hashes.insert(key, previous.clone());
                    }
                    continue;
                }
            };

            let changed = prior.get(&key) != Some(&digest);
            if force_full || changed {
                debug!(path = %entry.relative_path.display(), changed, "Selected file");
                result.selected_bytes += entry.size;
                result.files.insert(entry.path);
            }
            result.hashes.insert(key, digest);
        }

        info!(
            root = %result.root.display(),
            selected = result.files.len(),
            bytes = result.selected_bytes,
            hashed = result.hashes.len(),
            unreadable = result.unreadable,
            force_full,
            "Scan complete"
        );

        Ok(result)
    }
}
