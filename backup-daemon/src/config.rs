//! Configuration management for the backup daemon.
//!
//! Loads configuration from a TOML file. Every optional key has a serde
//! default so a minimal file only needs the two directories.

use crate::utils::errors::{BackupError, Result};
use chrono::Duration;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Root of the tree to back up
    pub source_directory: PathBuf,

    /// Where artifacts, metadata and the sync queue are written
    pub local_backup_directory: PathBuf,

    /// Glob patterns matched against every path component
    #[serde(default = "default_exclude_patterns")]
    pub exclude_patterns: Vec<String>,

    /// Cloud provider: "google_drive", "onedrive" or "none"
    #[serde(default = "default_cloud_provider")]
    pub cloud_provider: String,

    /// Remote folder artifacts are uploaded into
    #[serde(default = "default_cloud_directory")]
    pub cloud_directory: String,

    #[serde(default)]
    pub compression: CompressionConfig,

    #[serde(default)]
    pub retention_policy: RetentionPolicy,

    #[serde(default)]
    pub backup_schedule: BackupSchedule,

    #[serde(default)]
    pub scheduler: SchedulerConfig,

    #[serde(default)]
    pub sync: SyncConfig,

    #[serde(default)]
    pub cloud_credentials: CloudCredentials,

    #[serde(default)]
    pub log: LogConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompressionConfig {
    /// Zip archive when true, mirrored directory tree otherwise
    #[serde(default = "default_true")]
    pub enabled: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetentionPolicy {
    /// Number of most recent full backups to keep
    #[serde(default = "default_keep_full_backups")]
    pub keep_full_backups: u32,

    /// Incremental backups younger than this many days are kept
    #[serde(default = "default_keep_incremental_days")]
    pub keep_incremental_days: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupSchedule {
    #[serde(default = "default_full_backup_interval_days")]
    pub full_backup_interval_days: u32,

    #[serde(default = "default_incremental_interval_hours")]
    pub incremental_interval_hours: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Seconds between two evaluations of the schedule
    #[serde(default = "default_tick_seconds")]
    pub tick_seconds: u64,

    /// Hours between two retention passes
    #[serde(default = "default_retention_interval_hours")]
    pub retention_interval_hours: u32,

    /// How long `stop()` waits for the loop to finish
    #[serde(default = "default_stop_timeout_seconds")]
    pub stop_timeout_seconds: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Maximum concurrent uploads
    #[serde(default = "default_sync_workers")]
    pub workers: usize,

    /// Failed uploads are dropped from the queue after this many attempts
    #[serde(default = "default_sync_max_attempts")]
    pub max_attempts: u32,

    /// How long one-shot commands wait for uploads before exiting
    #[serde(default = "default_sync_drain_timeout_seconds")]
    pub drain_timeout_seconds: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CloudCredentials {
    #[serde(default)]
    pub google_drive: GoogleDriveCredentials,

    #[serde(default)]
    pub onedrive: OneDriveCredentials,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GoogleDriveCredentials {
    /// OAuth access token with the drive.file scope
    #[serde(default)]
    pub access_token: String,

    /// Drive folder id uploads are placed in (root when empty)
    #[serde(default)]
    pub folder_id: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OneDriveCredentials {
    /// Microsoft Graph access token with Files.ReadWrite
    #[serde(default)]
    pub access_token: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Also write `logs/backup.log` under the backup directory
    #[serde(default = "default_true")]
    pub to_file: bool,
}

// Default values
fn default_exclude_patterns() -> Vec<String> {
    vec![
        "*.tmp".to_string(),
        "*.log".to_string(),
        "__pycache__".to_string(),
        ".git".to_string(),
    ]
}

fn default_cloud_provider() -> String {
    "none".to_string()
}

fn default_cloud_directory() -> String {
    "/Backups".to_string()
}

fn default_true() -> bool {
    true
}

fn default_keep_full_backups() -> u32 {
    4
}

fn default_keep_incremental_days() -> u32 {
    30
}

fn default_full_backup_interval_days() -> u32 {
    7
}

fn default_incremental_interval_hours() -> u32 {
    24
}

fn default_tick_seconds() -> u64 {
    60
}

fn default_retention_interval_hours() -> u32 {
    24
}

fn default_stop_timeout_seconds() -> u64 {
    10
}

fn default_sync_workers() -> usize {
    2
}

fn default_sync_max_attempts() -> u32 {
    5
}

fn default_sync_drain_timeout_seconds() -> u64 {
    300
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            keep_full_backups: default_keep_full_backups(),
            keep_incremental_days: default_keep_incremental_days(),
        }
    }
}

impl Default for BackupSchedule {
    fn default() -> Self {
        Self {
            full_backup_interval_days: default_full_backup_interval_days(),
            incremental_interval_hours: default_incremental_interval_hours(),
        }
    }
}

impl BackupSchedule {
    pub fn full_interval(&self) -> Duration {
        Duration::days(i64::from(self.full_backup_interval_days))
    }

    pub fn incremental_interval(&self) -> Duration {
        Duration::hours(i64::from(self.incremental_interval_hours))
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_seconds: default_tick_seconds(),
            retention_interval_hours: default_retention_interval_hours(),
            stop_timeout_seconds: default_stop_timeout_seconds(),
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            workers: default_sync_workers(),
            max_attempts: default_sync_max_attempts(),
            drain_timeout_seconds: default_sync_drain_timeout_seconds(),
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            to_file: true,
        }
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Parse and validate configuration from TOML text
    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Config =
            toml::from_str(content).map_err(|e| BackupError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Create a configuration with defaults for everything but the two directories
    pub fn new(source_directory: impl Into<PathBuf>, local_backup_directory: impl Into<PathBuf>) -> Self {
        Config {
            source_directory: source_directory.into(),
            local_backup_directory: local_backup_directory.into(),
            exclude_patterns: default_exclude_patterns(),
            cloud_provider: default_cloud_provider(),
            cloud_directory: default_cloud_directory(),
            compression: CompressionConfig::default(),
            retention_policy: RetentionPolicy::default(),
            backup_schedule: BackupSchedule::default(),
            scheduler: SchedulerConfig::default(),
            sync: SyncConfig::default(),
            cloud_credentials: CloudCredentials::default(),
            log: LogConfig::default(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.source_directory.as_os_str().is_empty() {
            return Err(BackupError::Config("source_directory must be set".into()));
        }
        if self.local_backup_directory.as_os_str().is_empty() {
            return Err(BackupError::Config("local_backup_directory must be set".into()));
        }
        if self.scheduler.tick_seconds == 0 {
            return Err(BackupError::Config("scheduler.tick_seconds must be positive".into()));
        }
        if self.sync.workers == 0 {
            return Err(BackupError::Config("sync.workers must be positive".into()));
        }
        Ok(())
    }

    /// Directory the log file is written to
    pub fn log_directory(&self) -> PathBuf {
        self.local_backup_directory.join("logs")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimal_config_uses_defaults() {
        let config = Config::from_toml(
            r#"
            source_directory = "/data"
            local_backup_directory = "/backup"
            "#,
        )
        .unwrap();

        assert_eq!(config.source_directory, PathBuf::from("/data"));
        assert!(config.compression.enabled);
        assert_eq!(config.retention_policy.keep_full_backups, 4);
        assert_eq!(config.retention_policy.keep_incremental_days, 30);
        assert_eq!(config.backup_schedule.full_interval(), Duration::days(7));
        assert_eq!(config.backup_schedule.incremental_interval(), Duration::hours(24));
        assert_eq!(config.scheduler.tick_seconds, 60);
        assert_eq!(config.cloud_provider, "none");
        assert!(config.exclude_patterns.contains(&".git".to_string()));
    }

    #[test]
    fn test_nested_sections() {
        let config = Config::from_toml(
            r#"
            source_directory = "/data"
            local_backup_directory = "/backup"
            exclude_patterns = ["target"]
            cloud_provider = "onedrive"

            [compression]
            enabled = false

            [retention_policy]
            keep_full_backups = 2
            keep_incremental_days = 7

            [backup_schedule]
            full_backup_interval_days = 1
            incremental_interval_hours = 6

            [cloud_credentials.onedrive]
            access_token = "token"
            "#,
        )
        .unwrap();

        assert!(!config.compression.enabled);
        assert_eq!(config.exclude_patterns, vec!["target".to_string()]);
        assert_eq!(config.retention_policy.keep_full_backups, 2);
        assert_eq!(config.backup_schedule.incremental_interval_hours, 6);
        assert_eq!(config.cloud_credentials.onedrive.access_token, "token");
    }

    #[test]
    fn test_missing_source_is_rejected() {
        let err = Config::from_toml(r#"local_backup_directory = "/backup""#).unwrap_err();
        assert!(matches!(err, BackupError::Config(_)));

        let err = Config::from_toml(
            r#"
            source_directory = ""
            local_backup_directory = "/backup"
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, BackupError::Config(_)));
    }
}
