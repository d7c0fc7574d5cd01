//! Restoring snapshots onto disk.
//!
//! A zip snapshot is unpacked entry by entry, a mirrored snapshot is copied
//! file by file with its modification times. Entries whose names would land
//! outside the destination are skipped. Existing files are overwritten.
//!
//! An incremental snapshot only holds the files that changed, so a
//! point-in-time tree is rebuilt by restoring the full snapshot first and
//! then every later incremental in order.

use crate::fs::hash::hash_file;
use crate::fs::metadata::copy_preserving;
use crate::utils::errors::{BackupError, Result};
use std::fs::{self, File};
use std::io;
use std::path::Path;
use tracing::{debug, info, warn};
use walkdir::WalkDir;
use zip::ZipArchive;

/// What a restore wrote
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RestoreReport {
    pub files: usize,
    pub bytes: u64,

    /// Archive entries refused because of unsafe names
    pub skipped: usize,
}

/// Read every file of `artifact` back in full and return how many there are.
///
/// Zip entries are decompressed, which checks their CRC-32. Mirrored files
/// are read to the end.
pub fn verify_artifact(artifact: &Path) -> Result<usize> {
    let metadata = fs::metadata(artifact).map_err(|e| BackupError::archive_read(artifact, e))?;
    let files = if metadata.is_dir() {
        verify_mirror(artifact)?
    } else {
        verify_zip(artifact)?
    };

    info!(artifact = %artifact.display(), files, "Backup verified");
    Ok(files)
}

/// Write the contents of `artifact` below `destination`
pub fn restore_artifact(artifact: &Path, destination: &Path) -> Result<RestoreReport> {
    let metadata = fs::metadata(artifact).map_err(|e| BackupError::archive_read(artifact, e))?;
    fs::create_dir_all(destination)?;

    let report = if metadata.is_dir() {
        restore_mirror(artifact, destination)?
    } else {
        restore_zip(artifact, destination)?
    };

    info!(
        artifact = %artifact.display(),
        destination = %destination.display(),
        files = report.files,
        bytes = report.bytes,
        skipped = report.skipped,
        "Backup restored"
    );
    Ok(report)
}

fn open_zip(artifact: &Path) -> Result<ZipArchive<File>> {
    let file = File::open(artifact).map_err(|e| BackupError::archive_read(artifact, e))?;
    ZipArchive::new(file).map_err(|e| BackupError::archive_read(artifact, e))
}

fn verify_zip(artifact: &Path) -> Result<usize> {
    let mut archive = open_zip(artifact)?;
    let mut files = 0;

    for index in 0..archive.len() {
        let mut entry = archive
            .by_index(index)
            .map_err(|e| BackupError::archive_read(artifact, e))?;
        if entry.is_dir() {
            continue;
        }
        let name = entry.name().to_string();
        io::copy(&mut entry, &mut io::sink())
            .map_err(|e| BackupError::archive_read(artifact, format!("{name}: {e}")))?;
        files += 1;
    }

    Ok(files)
}

fn verify_mirror(artifact: &Path) -> Result<usize> {
    let mut files = 0;
    for entry in WalkDir::new(artifact) {
        let entry = entry.map_err(|e| BackupError::archive_read(artifact, e))?;
        if !entry.file_type().is_file() {
            continue;
        }
        hash_file(entry.path()).map_err(|e| BackupError::archive_read(entry.path(), e))?;
        files += 1;
    }
    Ok(files)
}

fn restore_zip(artifact: &Path, destination: &Path) -> Result<RestoreReport> {
    let mut archive = open_zip(artifact)?;
    let mut report = RestoreReport::default();

    for index in 0..archive.len() {
        let mut entry = archive
            .by_index(index)
            .map_err(|e| BackupError::archive_read(artifact, e))?;

        let Some(relative) = entry.enclosed_name() else {
            warn!(entry = entry.name(), "Skipping archive entry with unsafe name");
            report.skipped += 1;
            continue;
        };
        let target = destination.join(relative);

        if entry.is_dir() {
            fs::create_dir_all(&target)?;
            continue;
        }
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }

        let mut output = File::create(&target)?;
        let bytes = io::copy(&mut entry, &mut output)
            .map_err(|e| BackupError::archive_read(artifact, format!("{}: {e}", target.display())))?;
        debug!(path = %target.display(), bytes, "Restored file");

        report.files += 1;
        report.bytes += bytes;
    }

    Ok(report)
}

fn restore_mirror(artifact: &Path, destination: &Path) -> Result<RestoreReport> {
    let mut report = RestoreReport::default();

    for entry in WalkDir::new(artifact).sort_by_file_name() {
        let entry = entry.map_err(|e| BackupError::archive_read(artifact, e))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let relative = entry.path().strip_prefix(artifact).unwrap_or(entry.path());
        let target = destination.join(relative);

        let bytes = copy_preserving(entry.path(), &target)?;
        debug!(path = %target.display(), bytes, "Restored file");

        report.files += 1;
        report.bytes += bytes;
    }

    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::ArchiveBuilder;
    use chrono::{TimeZone, Utc};
    use std::collections::BTreeSet;
    use std::io::Write;
    use std::path::PathBuf;
    use tempfile::TempDir;
    use zip::write::SimpleFileOptions;
    use zip::ZipWriter;

    fn snapshot(temp_dir: &TempDir, compression: bool) -> Result<(PathBuf, PathBuf)> {
        let source = temp_dir.path().join("source");
        fs::create_dir_all(source.join("docs"))?;
        fs::write(source.join("top.txt"), b"top")?;
        fs::write(source.join("docs/inner.txt"), b"inner text")?;

        let files = BTreeSet::from([source.join("top.txt"), source.join("docs/inner.txt")]);
        let stamp = Utc.with_ymd_and_hms(2024, 7, 1, 8, 0, 0).unwrap();
        let artifact = ArchiveBuilder::new(temp_dir.path().join("backups"), compression).build(
            &files,
            &source,
            "backup_full",
            stamp,
        )?;
        Ok((source, artifact))
    }

    #[test]
    fn test_restore_zip_snapshot() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let (_, artifact) = snapshot(&temp_dir, true)?;
        let dest = temp_dir.path().join("restored");

        assert_eq!(verify_artifact(&artifact)?, 2);

        let report = restore_artifact(&artifact, &dest)?;
        assert_eq!(report.files, 2);
        assert_eq!(report.bytes, 13);
        assert_eq!(fs::read(dest.join("top.txt"))?, b"top");
        assert_eq!(fs::read(dest.join("docs/inner.txt"))?, b"inner text");
        Ok(())
    }

    #[test]
    fn test_restore_mirror_snapshot_keeps_mtime() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let (source, artifact) = snapshot(&temp_dir, false)?;
        let dest = temp_dir.path().join("restored");

        assert_eq!(verify_artifact(&artifact)?, 2);

        let report = restore_artifact(&artifact, &dest)?;
        assert_eq!(report.files, 2);
        assert_eq!(fs::read(dest.join("docs/inner.txt"))?, b"inner text");
        assert_eq!(
            fs::metadata(dest.join("top.txt"))?.modified()?,
            fs::metadata(source.join("top.txt"))?.modified()?
        );
        Ok(())
    }

    #[test]
    fn test_restore_overwrites_existing_files() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let (_, artifact) = snapshot(&temp_dir, true)?;
        let dest = temp_dir.path().join("restored");
        fs::create_dir_all(&dest)?;
        fs::write(dest.join("top.txt"), b"local edit")?;
        fs::write(dest.join("unrelated.txt"), b"keep")?;

        restore_artifact(&artifact, &dest)?;
        assert_eq!(fs::read(dest.join("top.txt"))?, b"top");
        assert_eq!(fs::read(dest.join("unrelated.txt"))?, b"keep");
        Ok(())
    }

    #[test]
    fn test_unsafe_entry_names_are_skipped() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let artifact = temp_dir.path().join("crafted.zip");
        {
            let mut zip = ZipWriter::new(File::create(&artifact)?);
            zip.start_file("../escape.txt", SimpleFileOptions::default()).unwrap();
            zip.write_all(b"outside")?;
            zip.start_file("safe.txt", SimpleFileOptions::default()).unwrap();
            zip.write_all(b"inside")?;
            zip.finish().unwrap();
        }

        let dest = temp_dir.path().join("restored");
        let report = restore_artifact(&artifact, &dest)?;
        assert_eq!(report.files, 1);
        assert_eq!(report.skipped, 1);
        assert!(!temp_dir.path().join("escape.txt").exists());
        assert_eq!(fs::read(dest.join("safe.txt"))?, b"inside");
        Ok(())
    }

    #[test]
    fn test_damaged_archive_fails_verification() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let (_, artifact) = snapshot(&temp_dir, true)?;

        // Cut off the central directory
        let bytes = fs::read(&artifact)?;
        fs::write(&artifact, &bytes[..bytes.len() / 2])?;

        let err = verify_artifact(&artifact).unwrap_err();
        assert!(matches!(err, BackupError::ArchiveRead { .. }));
        assert!(restore_artifact(&artifact, &temp_dir.path().join("restored")).is_err());
        Ok(())
    }

    #[test]
    fn test_missing_artifact() {
        let temp_dir = TempDir::new().unwrap();
        let err = verify_artifact(&temp_dir.path().join("nope.zip")).unwrap_err();
        assert!(matches!(err, BackupError::ArchiveRead { .. }));
    }
}
