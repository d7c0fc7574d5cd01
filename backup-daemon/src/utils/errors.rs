//! Custom error types for the backup daemon.

use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum BackupError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to read {path}: {source}")]
    FileRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Source directory not found: {0}")]
    SourceMissing(PathBuf),

    #[error("Failed to write archive {path}: {reason}")]
    ArchiveWrite { path: PathBuf, reason: String },

    #[error("Backup {path} cannot be read back: {reason}")]
    ArchiveRead { path: PathBuf, reason: String },

    #[error("Metadata file {path} is corrupt: {reason}")]
    MetadataCorrupt { path: PathBuf, reason: String },

    #[error("Failed to delete {path}: {source}")]
    Deletion {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Sync error: {0}")]
    Sync(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid exclude pattern: {0}")]
    Pattern(#[from] globset::Error),
}

impl BackupError {
    /// Wrap an I/O failure that happened while producing an artifact.
    pub fn archive_write(path: impl Into<PathBuf>, err: impl std::fmt::Display) -> Self {
        BackupError::ArchiveWrite {
            path: path.into(),
            reason: err.to_string(),
        }
    }

    pub fn archive_read(path: impl Into<PathBuf>, err: impl std::fmt::Display) -> Self {
        BackupError::ArchiveRead {
            path: path.into(),
            reason: err.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, BackupError>;
