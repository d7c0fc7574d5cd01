//! OneDrive uploads via Microsoft Graph simple upload (PUT by path).

use super::{artifact_files, remote_path, SyncProvider};
use crate::utils::errors::{BackupError, Result};
use async_trait::async_trait;
use reqwest::header::{AUTHORIZATION, CONTENT_LENGTH};
use reqwest::{Client, Url};
use std::path::Path;
use tracing::info;

const GRAPH_DRIVE_ROOT: &str = "https://graph.microsoft.com/v1.0/me/drive/";

pub struct OneDriveProvider {
    client: Client,
    access_token: String,
    cloud_directory: String,
}

impl OneDriveProvider {
    pub fn new(access_token: String, cloud_directory: String) -> Self {
        Self {
            client: Client::new(),
            access_token,
            cloud_directory,
        }
    }

    /// `.../drive/root:/{remote path}:/content` with each segment escaped
    pub(crate) fn upload_url(&self, name: &str) -> Result<Url> {
        let remote = remote_path(&self.cloud_directory, name);
        let mut url = Url::parse(GRAPH_DRIVE_ROOT).map_err(|e| BackupError::Sync(e.to_string()))?;
        {
            let mut segments = url
                .path_segments_mut()
                .map_err(|_| BackupError::Sync("graph url cannot be a base".into()))?;
            segments.pop_if_empty().push("root:");

            let parts: Vec<&str> = remote.split('/').filter(|p| !p.is_empty()).collect();
            let last = parts.len().saturating_sub(1);
            for (i, part) in parts.iter().enumerate() {
                if i == last {
                    segments.push(&format!("{part}:"));
                } else {
                    segments.push(part);
                }
            }
            segments.push("content");
        }
        Ok(url)
    }

    async fn upload_file(&self, local_path: &Path, name: &str) -> Result<()> {
        let size = tokio::fs::metadata(local_path).await?.len();
        let url = self.upload_url(name)?;
        let file = tokio::fs::File::open(local_path).await?;

        let resp = self
            .client
            .put(url)
            .header(AUTHORIZATION, format!("Bearer {}", self.access_token))
            .header(CONTENT_LENGTH, size)
            .body(reqwest::Body::from(file))
            .send()
            .await?;

        if resp.status().is_success() {
            info!(name, bytes = size, "Uploaded to OneDrive");
            Ok(())
        } else {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            Err(BackupError::Sync(format!(
                "OneDrive upload of {name} failed with status {status}: {body}"
            )))
        }
    }
}

#[async_trait]
impl SyncProvider for OneDriveProvider {
    fn name(&self) -> &'static str {
        "onedrive"
    }

    async fn upload_artifact(&self, artifact_path: &Path) -> Result<()> {
        for (local, name) in artifact_files(artifact_path)? {
            self.upload_file(&local, &name).await?;
        }
        Ok(())
    }
}
