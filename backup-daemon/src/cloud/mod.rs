//! Cloud sync of finished snapshots.
//!
//! The backup core only knows the [`SyncProvider`] capability. Concrete
//! providers wrap a pre-issued OAuth access token; acquiring that token is
//! left to the operator.

pub mod google_drive;
pub mod onedrive;
pub mod queue;

pub use google_drive::GoogleDriveProvider;
pub use onedrive::OneDriveProvider;
pub use queue::{PendingSync, SyncQueue};

use crate::config::Config;
use crate::utils::errors::{BackupError, Result};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, error, info};
use walkdir::WalkDir;

#[async_trait]
pub trait SyncProvider: Send + Sync {
    /// Short provider name for logs
    fn name(&self) -> &'static str;

    /// Upload one artifact (archive file or snapshot directory)
    async fn upload_artifact(&self, artifact_path: &Path) -> Result<()>;

    /// Upload and report success only; failures are logged
    async fn upload(&self, artifact_path: &Path) -> bool {
        let result = self.upload_artifact(artifact_path).await;
        log_upload(self.name(), artifact_path, &result)
    }
}

/// Log the outcome of one upload. Returns whether it succeeded.
pub(crate) fn log_upload(provider: &str, artifact_path: &Path, result: &Result<()>) -> bool {
    match result {
        Ok(()) => {
            info!(provider, path = %artifact_path.display(), "Artifact synced");
            true
        }
        Err(e) => {
            error!(provider, path = %artifact_path.display(), error = %e, "Sync failed");
            false
        }
    }
}

/// Provider used when no cloud is configured; accepts every artifact.
pub struct NullProvider;

#[async_trait]
impl SyncProvider for NullProvider {
    fn name(&self) -> &'static str {
        "none"
    }

    async fn upload_artifact(&self, artifact_path: &Path) -> Result<()> {
        debug!(path = %artifact_path.display(), "No cloud provider configured, skipping upload");
        Ok(())
    }
}

/// Build the provider selected by `cloud_provider`
pub fn provider_from_config(config: &Config) -> Result<Arc<dyn SyncProvider>> {
    let credentials = &config.cloud_credentials;
    match config.cloud_provider.as_str() {
        "" | "none" => Ok(Arc::new(NullProvider)),
        "google_drive" => {
            let creds = &credentials.google_drive;
            if creds.access_token.is_empty() {
                return Err(BackupError::Config(
                    "cloud_credentials.google_drive.access_token is empty".into(),
                ));
            }
            Ok(Arc::new(GoogleDriveProvider::new(
                creds.access_token.clone(),
                creds.folder_id.clone(),
            )))
        }
        "onedrive" => {
            let creds = &credentials.onedrive;
            if creds.access_token.is_empty() {
                return Err(BackupError::Config(
                    "cloud_credentials.onedrive.access_token is empty".into(),
                ));
            }
            Ok(Arc::new(OneDriveProvider::new(
                creds.access_token.clone(),
                config.cloud_directory.clone(),
            )))
        }
        other => Err(BackupError::Config(format!("unknown cloud_provider '{other}'"))),
    }
}

/// `{cloud_directory}/{name}` with `/` separators and no duplicate slashes
pub fn remote_path(cloud_directory: &str, name: &str) -> String {
    let dir = cloud_directory.replace('\\', "/");
    let dir = dir.trim_end_matches('/');
    let name = name.trim_start_matches('/');
    if dir.is_empty() {
        format!("/{name}")
    } else if dir.starts_with('/') {
        format!("{dir}/{name}")
    } else {
        format!("/{dir}/{name}")
    }
}

/// Local files making up an artifact, each with its remote name.
///
/// An archive maps to its file name; a snapshot directory maps every file
/// inside it to `{dir name}/{relative path}`.
pub fn artifact_files(artifact_path: &Path) -> Result<Vec<(PathBuf, String)>> {
    let name = artifact_path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .ok_or_else(|| BackupError::Sync(format!("{} has no file name", artifact_path.display())))?;

    let metadata = std::fs::metadata(artifact_path)?;
    if !metadata.is_dir() {
        return Ok(vec![(artifact_path.to_path_buf(), name)]);
    }

    let mut files = Vec::new();
    for entry in WalkDir::new(artifact_path).sort_by_file_name() {
        let entry = entry.map_err(std::io::Error::from)?;
        if !entry.file_type().is_file() {
            continue;
        }
        let relative = entry
            .path()
            .strip_prefix(artifact_path)
            .unwrap_or(entry.path())
            .components()
            .map(|c| c.as_os_str().to_string_lossy().to_string())
            .collect::<Vec<_>>()
            .join("/");
        files.push((entry.path().to_path_buf(), format!("{name}/{relative}")));
    }
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_remote_path() {
        assert_eq!(remote_path("/Backups", "a.zip"), "/Backups/a.zip");
        assert_eq!(remote_path("/Backups/", "a.zip"), "/Backups/a.zip");
        assert_eq!(remote_path("Backups\\daily", "a.zip"), "/Backups/daily/a.zip");
        assert_eq!(remote_path("", "a.zip"), "/a.zip");
    }

    #[test]
    fn test_artifact_files_for_archive_and_directory() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let archive = temp_dir.path().join("backup_full_20240101_000000.zip");
        fs::write(&archive, b"zip")?;

        let files = artifact_files(&archive)?;
        assert_eq!(files, vec![(archive.clone(), "backup_full_20240101_000000.zip".to_string())]);

        let dir = temp_dir.path().join("backup_full_20240102_000000");
        fs::create_dir_all(dir.join("sub"))?;
        fs::write(dir.join("a.txt"), b"a")?;
        fs::write(dir.join("sub/b.txt"), b"b")?;

        let names: Vec<String> = artifact_files(&dir)?.into_iter().map(|(_, n)| n).collect();
        assert_eq!(
            names,
            vec![
                "backup_full_20240102_000000/a.txt".to_string(),
                "backup_full_20240102_000000/sub/b.txt".to_string()
            ]
        );
        Ok(())
    }

    #[test]
    fn test_provider_selection() {
        let mut config = Config::new("/data", "/backup");
        assert_eq!(provider_from_config(&config).unwrap().name(), "none");

        config.cloud_provider = "onedrive".into();
        assert!(matches!(provider_from_config(&config), Err(BackupError::Config(_))));

        config.cloud_credentials.onedrive.access_token = "token".into();
        assert_eq!(provider_from_config(&config).unwrap().name(), "onedrive");

        config.cloud_provider = "dropbox".into();
        assert!(provider_from_config(&config).is_err());
    }

    struct RejectingProvider;

    #[async_trait]
    impl SyncProvider for RejectingProvider {
        fn name(&self) -> &'static str {
            "rejecting"
        }

        async fn upload_artifact(&self, _artifact_path: &Path) -> Result<()> {
            Err(BackupError::Sync("quota exceeded".into()))
        }
    }

    #[tokio::test]
    async fn test_null_provider_accepts_everything() {
        assert!(NullProvider.upload(Path::new("/does/not/matter.zip")).await);
    }

    #[tokio::test]
    async fn test_failed_upload_reports_false() {
        assert!(!RejectingProvider.upload(Path::new("/backups/a.zip")).await);
    }
}
