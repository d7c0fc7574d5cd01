//! Ledger types persisted in `backup_metadata.json`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

/// Absolute source path → lowercase hex SHA-256
pub type FileHashes = BTreeMap<String, String>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackupKind {
    Full,
    Incremental,
}

impl BackupKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackupKind::Full => "full",
            BackupKind::Incremental => "incremental",
        }
    }

    /// Prefix used for artifact names
    pub fn label(&self) -> &'static str {
        match self {
            BackupKind::Full => "backup_full",
            BackupKind::Incremental => "backup_incremental",
        }
    }
}

impl fmt::Display for BackupKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

/// One completed backup artifact
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    #[serde(rename = "type")]
    pub kind: BackupKind,
    pub timestamp: DateTime<Utc>,
    pub path: PathBuf,
    pub file_count: usize,
}

/// The durable ledger: baseline hashes plus backup history
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetadataState {
    #[serde(default)]
    pub last_full_backup_timestamp: Option<DateTime<Utc>>,

    #[serde(default)]
    pub file_hashes: FileHashes,

    /// Chronological (insertion) order
    #[serde(default)]
    pub backup_history: Vec<Snapshot>,
}

impl MetadataState {
    /// Most recent snapshot by timestamp, of any kind
    pub fn latest_snapshot(&self) -> Option<&Snapshot> {
        self.backup_history.iter().max_by_key(|s| s.timestamp)
    }

    pub fn count(&self, kind: BackupKind) -> usize {
        self.backup_history.iter().filter(|s| s.kind == kind).count()
    }
}
