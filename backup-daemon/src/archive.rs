//! Snapshot materialization.
//!
//! A snapshot is either a single zip archive (deflate) or a mirrored
//! directory tree. Both are built under a temporary name inside the
//! destination directory and published with a rename once complete, so a
//! failed or interrupted build never leaves an artifact under its final name.

use crate::fs::metadata::{copy_preserving, set_mode, sync_dir};
use crate::utils::errors::{BackupError, Result};
use chrono::{DateTime, Utc};
use std::collections::BTreeSet;
use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::path::{Component, Path, PathBuf};
use tracing::{debug, info, warn};
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

/// Suffix of compressed snapshots
pub const ARCHIVE_EXTENSION: &str = "zip";

/// Prefix of in-progress builds inside the destination directory
const STAGING_PREFIX: &str = ".partial-";

/// Modes of published artifacts; staging files are created owner-only
const ARCHIVE_MODE: u32 = 0o644;
const MIRROR_DIR_MODE: u32 = 0o755;

/// Deterministic artifact name: `{label}_{YYYYmmdd_HHMMSS}[.zip]`
pub fn artifact_name(label: &str, timestamp: DateTime<Utc>, compressed: bool) -> String {
    let stamp = timestamp.format("%Y%m%d_%H%M%S");
    if compressed {
        format!("{label}_{stamp}.{ARCHIVE_EXTENSION}")
    } else {
        format!("{label}_{stamp}")
    }
}

/// Zip entry name for a relative path, always `/`-separated
fn entry_name(relative: &Path) -> String {
    relative
        .components()
        .filter_map(|c| match c {
            Component::Normal(part) => Some(part.to_string_lossy()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("/")
}

pub struct ArchiveBuilder {
    destination_root: PathBuf,
    compression: bool,
}

impl ArchiveBuilder {
    pub fn new(destination_root: impl Into<PathBuf>, compression: bool) -> Self {
        Self {
            destination_root: destination_root.into(),
            compression,
        }
    }

    /// Materialize `files` (absolute paths under `source_root`) into a new
    /// artifact and return its published path.
    pub fn build(
        &self,
        files: &BTreeSet<PathBuf>,
        source_root: &Path,
        label: &str,
        timestamp: DateTime<Utc>,
    ) -> Result<PathBuf> {
        let name = artifact_name(label, timestamp, self.compression);
        let final_path = self.destination_root.join(&name);
        let fail = |e: &dyn std::fmt::Display| BackupError::archive_write(&final_path, e);

        fs::create_dir_all(&self.destination_root).map_err(|e| fail(&e))?;
        if final_path.exists() {
            return Err(fail(&"artifact already exists"));
        }

        let mut entries = Vec::with_capacity(files.len());
        for file in files {
            let relative = file
                .strip_prefix(source_root)
                .map_err(|_| fail(&format!("{} is outside {}", file.display(), source_root.display())))?;
            entries.push((file.as_path(), relative));
        }

        info!(
            artifact = %final_path.display(),
            files = entries.len(),
            compressed = self.compression,
            "Building snapshot"
        );

        if self.compression {
            self.build_zip(&entries, &final_path).map_err(|e| fail(&e))?;
        } else {
            self.build_mirror(&entries, &final_path).map_err(|e| fail(&e))?;
        }

        info!(artifact = %final_path.display(), "Snapshot published");
        Ok(final_path)
    }

    /// Remove staging leftovers from builds interrupted by a crash.
    /// Returns how many entries were removed.
    pub fn sweep_staging(&self) -> usize {
        let Ok(entries) = fs::read_dir(&self.destination_root) else {
            return 0;
        };

        let mut removed = 0;
        for entry in entries.filter_map(|e| e.ok()) {
            if !entry.file_name().to_string_lossy().starts_with(STAGING_PREFIX) {
                continue;
            }
            let path = entry.path();
            let result = if path.is_dir() {
                fs::remove_dir_all(&path)
            } else {
                fs::remove_file(&path)
            };
            match result {
                Ok(()) => {
                    info!(path = %path.display(), "Removed interrupted build");
                    removed += 1;
                }
                Err(e) => warn!(path = %path.display(), error = %e, "Failed to remove interrupted build"),
            }
        }
        removed
    }

    fn build_zip(&self, entries: &[(&Path, &Path)], final_path: &Path) -> io::Result<()> {
        let staging = tempfile::Builder::new()
            .prefix(STAGING_PREFIX)
            .suffix(&format!(".{ARCHIVE_EXTENSION}"))
            .tempfile_in(&self.destination_root)?;

        {
            let mut zip = ZipWriter::new(BufWriter::new(staging.as_file()));
            for (source, relative) in entries {
                let size = fs::metadata(source)?.len();
                let options = SimpleFileOptions::default()
                    .compression_method(CompressionMethod::Deflated)
                    .large_file(size >= u64::from(u32::MAX));

                zip.start_file(entry_name(relative), options)
                    .map_err(io::Error::other)?;
                let mut input = File::open(source)?;
                io::copy(&mut input, &mut zip)?;
                debug!(path = %relative.display(), size, "Archived file");
            }
            let mut writer = zip.finish().map_err(io::Error::other)?;
            writer.flush()?;
        }
        staging.as_file().sync_all()?;
        set_mode(staging.path(), ARCHIVE_MODE)?;

        staging.persist_noclobber(final_path).map_err(|e| e.error)?;
        sync_dir(&self.destination_root)
    }

    fn build_mirror(&self, entries: &[(&Path, &Path)], final_path: &Path) -> io::Result<()> {
        let staging = tempfile::Builder::new()
            .prefix(STAGING_PREFIX)
            .tempdir_in(&self.destination_root)?;

        for (source, relative) in entries {
            copy_preserving(source, &staging.path().join(relative))?;
            debug!(path = %relative.display(), "Copied file");
        }

        set_mode(staging.path(), MIRROR_DIR_MODE)?;

        // Renaming over an existing non-empty directory fails, which keeps
        // publication no-clobber like the zip path.
        fs::rename(staging.path(), final_path)?;
        sync_dir(&self.destination_root)
    }
}
