//! Durable, bounded sync dispatch.
//!
//! Every artifact handed to the queue is first recorded in
//! `sync_queue.json`, then uploaded by a task holding one of `workers`
//! semaphore permits. Successful uploads leave the queue; failures stay
//! queued (with an attempt counter) until `retry_pending` picks them up
//! again or `max_attempts` is reached. Local backup state is never touched.

use super::{log_upload, SyncProvider};
use crate::store::write_json_atomic;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::Semaphore;
use tracing::{debug, error, info, warn};

/// File name of the queue inside the backup directory
pub const QUEUE_FILE_NAME: &str = "sync_queue.json";

/// One artifact waiting for upload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingSync {
    pub path: PathBuf,
    pub attempts: u32,
    pub last_error: Option<String>,
    pub enqueued_at: DateTime<Utc>,
}

pub struct SyncQueue {
    provider: Arc<dyn SyncProvider>,
    queue_path: PathBuf,
    max_attempts: u32,
    pending: Mutex<Vec<PendingSync>>,
    in_flight: Mutex<HashSet<PathBuf>>,
    permits: Arc<Semaphore>,
    runtime: Handle,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl SyncQueue {
    /// Open the queue stored in `backup_dir`. Must be called from within a
    /// tokio runtime; upload tasks are spawned onto it.
    pub fn open(
        provider: Arc<dyn SyncProvider>,
        backup_dir: &Path,
        workers: usize,
        max_attempts: u32,
    ) -> Arc<Self> {
        let queue_path = backup_dir.join(QUEUE_FILE_NAME);
        let pending = read_queue(&queue_path);
        if !pending.is_empty() {
            info!(pending = pending.len(), "Loaded pending uploads");
        }

        Arc::new(Self {
            provider,
            queue_path,
            max_attempts: max_attempts.max(1),
            pending: Mutex::new(pending),
            in_flight: Mutex::new(HashSet::new()),
            permits: Arc::new(Semaphore::new(workers.max(1))),
            runtime: Handle::current(),
        })
    }

    pub fn provider_name(&self) -> &'static str {
        self.provider.name()
    }

    /// Snapshot of the durable queue
    pub fn pending(&self) -> Vec<PendingSync> {
        lock(&self.pending).clone()
    }

    pub fn in_flight(&self) -> usize {
        lock(&self.in_flight).len()
    }

    /// Record `artifact_path` durably and start uploading it.
    /// Enqueuing a path that is already queued only re-dispatches it.
    pub fn enqueue(self: &Arc<Self>, artifact_path: &Path) {
        {
            let mut pending = lock(&self.pending);
            if !pending.iter().any(|p| p.path == artifact_path) {
                pending.push(PendingSync {
                    path: artifact_path.to_path_buf(),
                    attempts: 0,
                    last_error: None,
                    enqueued_at: Utc::now(),
                });
                self.persist(&pending);
            }
        }
        self.dispatch(artifact_path.to_path_buf());
    }

    /// Dispatch every queued entry that is not already uploading
    pub fn retry_pending(self: &Arc<Self>) {
        let paths: Vec<PathBuf> = lock(&self.pending).iter().map(|p| p.path.clone()).collect();
        for path in paths {
            self.dispatch(path);
        }
    }

    /// Wait until no upload is running, up to `timeout`. Returns false on timeout.
    pub async fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        while self.in_flight() > 0 {
            if tokio::time::Instant::now() >= deadline {
                warn!(in_flight = self.in_flight(), "Uploads still running");
                return false;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        true
    }

    fn dispatch(self: &Arc<Self>, path: PathBuf) {
        if !lock(&self.in_flight).insert(path.clone()) {
            debug!(path = %path.display(), "Upload already in flight");
            return;
        }

        let queue = Arc::clone(self);
        self.runtime.spawn(async move {
            let permit = Arc::clone(&queue.permits).acquire_owned().await;
            if permit.is_ok() {
                queue.process(&path).await;
            }
            lock(&queue.in_flight).remove(&path);
        });
    }

    async fn process(&self, path: &Path) {
        if tokio::fs::symlink_metadata(path).await.is_err() {
            warn!(path = %path.display(), "Artifact no longer exists, dropping from sync queue");
            self.finish(path, None);
            return;
        }

        let result = self.provider.upload_artifact(path).await;
        log_upload(self.provider.name(), path, &result);
        self.finish(path, result.err().map(|e| e.to_string()));
    }

    /// Remove the entry on success, otherwise count the failed attempt
    fn finish(&self, path: &Path, failure: Option<String>) {
        let mut pending = lock(&self.pending);
        match failure {
            None => pending.retain(|p| p.path != path),
            Some(reason) => {
                let max_attempts = self.max_attempts;
                if let Some(entry) = pending.iter_mut().find(|p| p.path == path) {
                    entry.attempts += 1;
                    entry.last_error = Some(reason);
                    if entry.attempts >= max_attempts {
                        error!(
                            path = %path.display(),
                            attempts = entry.attempts,
                            "Giving up on upload"
                        );
                    }
                }
                pending.retain(|p| p.attempts < max_attempts);
            }
        }
        self.persist(&pending);
    }

    fn persist(&self, pending: &[PendingSync]) {
        if let Err(e) = write_json_atomic(&self.queue_path, &pending) {
            error!(path = %self.queue_path.display(), error = %e, "Failed to persist sync queue");
        }
    }
}

fn read_queue(path: &Path) -> Vec<PendingSync> {
    let content = match std::fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Vec::new(),
        Err(e) => {
            error!(path = %path.display(), error = %e, "Failed to read sync queue");
            return Vec::new();
        }
    };

    match serde_json::from_str(&content) {
        Ok(pending) => pending,
        Err(e) => {
            error!(path = %path.display(), error = %e, "Sync queue is corrupt, starting empty");
            Vec::new()
        }
    }
}

/// Read the persisted queue without a running queue (for status output)
pub fn load_pending(backup_dir: &Path) -> Vec<PendingSync> {
    read_queue(&backup_dir.join(QUEUE_FILE_NAME))
}
