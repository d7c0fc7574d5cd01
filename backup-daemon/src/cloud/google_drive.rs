//! Google Drive uploads via the Drive v3 resumable upload protocol.

use super::{artifact_files, SyncProvider};
use crate::utils::errors::{BackupError, Result};
use async_trait::async_trait;
use reqwest::header::{AUTHORIZATION, CONTENT_LENGTH, LOCATION};
use reqwest::{Client, StatusCode};
use std::path::Path;
use tracing::{debug, info};

const UPLOAD_ENDPOINT: &str = "https://www.googleapis.com/upload/drive/v3/files?uploadType=resumable";

pub struct GoogleDriveProvider {
    client: Client,
    access_token: String,
    /// Parent folder id; "root" when not configured
    folder_id: String,
    endpoint: String,
}

impl GoogleDriveProvider {
    pub fn new(access_token: String, folder_id: String) -> Self {
        Self {
            client: Client::new(),
            access_token,
            folder_id: if folder_id.is_empty() {
                "root".to_string()
            } else {
                folder_id
            },
            endpoint: UPLOAD_ENDPOINT.to_string(),
        }
    }

    /// Drive file metadata for a new upload
    fn file_metadata(&self, name: &str) -> serde_json::Value {
        serde_json::json!({
            "name": name,
            "parents": [self.folder_id],
        })
    }

    async fn upload_file(&self, local_path: &Path, name: &str) -> Result<()> {
        let size = tokio::fs::metadata(local_path).await?.len();

        // Open a resumable session
        let session = self
            .client
            .post(&self.endpoint)
            .header(AUTHORIZATION, format!("Bearer {}", self.access_token))
            .header("X-Upload-Content-Length", size.to_string())
            .json(&self.file_metadata(name))
            .send()
            .await?;

        if !session.status().is_success() {
            let status = session.status();
            let body = session.text().await.unwrap_or_default();
            return Err(BackupError::Sync(format!(
                "Drive session request failed with status {status}: {body}"
            )));
        }

        let location = session
            .headers()
            .get(LOCATION)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.to_string())
            .ok_or_else(|| BackupError::Sync("Drive session response has no Location header".into()))?;
        debug!(name, "Drive upload session opened");

        let file = tokio::fs::File::open(local_path).await?;
        let resp = self
            .client
            .put(&location)
            .header(CONTENT_LENGTH, size)
            .body(reqwest::Body::from(file))
            .send()
            .await?;

        match resp.status() {
            StatusCode::OK | StatusCode::CREATED => {
                info!(name, bytes = size, "Uploaded to Google Drive");
                Ok(())
            }
            status => {
                let body = resp.text().await.unwrap_or_default();
                Err(BackupError::Sync(format!(
                    "Drive upload of {name} failed with status {status}: {body}"
                )))
            }
        }
    }
}

#[async_trait]
impl SyncProvider for GoogleDriveProvider {
    fn name(&self) -> &'static str {
        "google_drive"
    }

    async fn upload_artifact(&self, artifact_path: &Path) -> Result<()> {
        for (local, name) in artifact_files(artifact_path)? {
            self.upload_file(&local, &name).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_folder_is_root() {
        let provider = GoogleDriveProvider::new("token".into(), String::new());
        let metadata = provider.file_metadata("backup_full_20240101_000000.zip");
        assert_eq!(metadata["parents"][0], "root");
        assert_eq!(metadata["name"], "backup_full_20240101_000000.zip");
    }

    #[test]
    fn test_configured_folder() {
        let provider = GoogleDriveProvider::new("token".into(), "abc123".into());
        assert_eq!(provider.file_metadata("x")["parents"][0], "abc123");
    }
}
