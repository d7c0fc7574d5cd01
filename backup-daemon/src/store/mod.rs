//! Durable metadata store.
//!
//! The whole [`MetadataState`] lives in one JSON file that is rewritten on
//! every commit via a temp file and rename, so readers never observe a
//! partially written ledger.

pub mod state;

pub use state::{BackupKind, FileHashes, MetadataState, Snapshot};

use crate::fs::metadata::sync_dir;
use crate::utils::errors::{BackupError, Result};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::{debug, error, info};

/// File name of the ledger inside the backup directory
pub const METADATA_FILE_NAME: &str = "backup_metadata.json";

pub struct MetadataStore {
    path: PathBuf,
    cache: Option<MetadataState>,
}

impl MetadataStore {
    /// Store backed by `<backup_dir>/backup_metadata.json`
    pub fn new(backup_dir: &Path) -> Self {
        Self::at(backup_dir.join(METADATA_FILE_NAME))
    }

    /// Store backed by an explicit file
    pub fn at(path: PathBuf) -> Self {
        Self { path, cache: None }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current state, read from disk on first access.
    ///
    /// A missing file yields the zero-value state. A corrupt file is logged
    /// and also yields the zero-value state, so the next full backup
    /// re-bootstraps the ledger.
    pub fn load(&mut self) -> &MetadataState {
        if self.cache.is_none() {
            let state = match read_state(&self.path) {
                Ok(Some(state)) => {
                    debug!(
                        path = %self.path.display(),
                        snapshots = state.backup_history.len(),
                        "Loaded metadata"
                    );
                    state
                }
                Ok(None) => {
                    info!(path = %self.path.display(), "No metadata yet, starting fresh");
                    MetadataState::default()
                }
                Err(e) => {
                    error!(error = %e, "Falling back to empty metadata");
                    MetadataState::default()
                }
            };
            self.cache = Some(state);
        }

        self.cache.get_or_insert_with(MetadataState::default)
    }

    /// Atomically replace the persisted state. The cache is only updated
    /// once the new file is in place.
    pub fn commit(&mut self, state: MetadataState) -> Result<()> {
        write_json_atomic(&self.path, &state)?;
        debug!(path = %self.path.display(), "Metadata committed");
        self.cache = Some(state);
        Ok(())
    }
}

/// Read the ledger without any fallback.
///
/// `Ok(None)` when the file does not exist, `MetadataCorrupt` when it cannot
/// be read or parsed.
pub fn read_state(path: &Path) -> Result<Option<MetadataState>> {
    let content = match std::fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => {
            return Err(BackupError::MetadataCorrupt {
                path: path.to_path_buf(),
                reason: e.to_string(),
            })
        }
    };

    serde_json::from_str(&content)
        .map(Some)
        .map_err(|e| BackupError::MetadataCorrupt {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })
}

/// Serialize `value` to `path` through a synced temp file in the same
/// directory followed by a rename and a sync of the directory.
pub(crate) fn write_json_atomic<T: serde::Serialize>(path: &Path, value: &T) -> Result<()> {
    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(dir)?;

    let tmp = NamedTempFile::new_in(dir)?;
    {
        let mut writer = BufWriter::new(tmp.as_file());
        serde_json::to_writer_pretty(&mut writer, value)?;
        writer.flush()?;
    }
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| BackupError::Io(e.error))?;
    sync_dir(dir)?;

    Ok(())
}
