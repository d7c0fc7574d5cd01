//! File metadata handling for mirrored snapshots.
//!
//! Uncompressed snapshots are byte-identical copies that also carry the
//! source's modification time and permission bits.

use std::fs::{self, File};
use std::path::Path;
use std::time::SystemTime;

/// The subset of file metadata preserved by a mirrored copy
#[derive(Debug, Clone)]
pub struct FileMetadata {
    /// File size in bytes
    pub size: u64,

    /// Last modified time
    pub modified: SystemTime,

    /// File permissions (Unix mode bits)
    pub permissions: Option<u32>,
}

impl FileMetadata {
    /// Extract metadata from a file path (symlinks are followed)
    pub fn from_path(path: &Path) -> std::io::Result<Self> {
        let metadata = fs::metadata(path)?;

        #[cfg(unix)]
        let permissions = {
            use std::os::unix::fs::PermissionsExt;
            Some(metadata.permissions().mode())
        };

        #[cfg(not(unix))]
        let permissions = None;

        Ok(Self {
            size: metadata.len(),
            modified: metadata.modified()?,
            permissions,
        })
    }

    /// Apply modification time and permissions to a file
    pub fn apply_to_path(&self, path: &Path) -> std::io::Result<()> {
        // futimens only needs ownership, so read-only copies still work on unix
        #[cfg(unix)]
        let file = File::open(path)?;
        #[cfg(not(unix))]
        let file = File::options().write(true).open(path)?;
        file.set_modified(self.modified)?;
        drop(file);

        #[cfg(unix)]
        if let Some(mode) = self.permissions {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(path, fs::Permissions::from_mode(mode))?;
        }

        Ok(())
    }
}

/// Copy `src` to `dest`, creating parent directories and preserving
/// modification time and permissions. Returns the number of bytes copied.
pub fn copy_preserving(src: &Path, dest: &Path) -> std::io::Result<u64> {
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent)?;
    }

    let metadata = FileMetadata::from_path(src)?;
    let copied = fs::copy(src, dest)?;
    metadata.apply_to_path(dest)?;

    Ok(copied)
}

/// Flush a directory entry change (create, rename) to disk
pub fn sync_dir(dir: &Path) -> std::io::Result<()> {
    #[cfg(unix)]
    File::open(dir)?.sync_all()?;
    #[cfg(not(unix))]
    let _ = dir;
    Ok(())
}

/// Set plain permission bits on a published artifact
pub fn set_mode(path: &Path, mode: u32) -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(mode))?;
    }
    #[cfg(not(unix))]
    let _ = (path, mode);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::TempDir;

    #[test]
    fn test_copy_preserves_contents_and_mtime() -> std::io::Result<()> {
        let temp_dir = TempDir::new()?;
        let src = temp_dir.path().join("src.txt");
        let dest = temp_dir.path().join("nested/dir/dest.txt");
        fs::write(&src, b"test content")?;

        let old = SystemTime::UNIX_EPOCH + Duration::from_secs(1_600_000_000);
        File::options().write(true).open(&src)?.set_modified(old)?;

        let copied = copy_preserving(&src, &dest)?;
        assert_eq!(copied, 12);
        assert_eq!(fs::read(&dest)?, b"test content");

        let metadata = FileMetadata::from_path(&dest)?;
        assert_eq!(metadata.size, 12);
        assert_eq!(metadata.modified, old);

        Ok(())
    }

    #[test]
    #[cfg(unix)]
    fn test_permissions_preservation() -> std::io::Result<()> {
        use std::os::unix::fs::PermissionsExt;

        let temp_dir = TempDir::new()?;
        let src = temp_dir.path().join("script.sh");
        let dest = temp_dir.path().join("copy.sh");
        fs::write(&src, b"#!/bin/sh")?;
        fs::set_permissions(&src, fs::Permissions::from_mode(0o750))?;

        copy_preserving(&src, &dest)?;

        let metadata = FileMetadata::from_path(&dest)?;
        assert_eq!(metadata.permissions.unwrap() & 0o777, 0o750);

        Ok(())
    }
}
