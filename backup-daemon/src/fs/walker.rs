//! Directory traversal with component-wise exclusion.
//!
//! Every path component below the root is tested against the exclude globs,
//! so an excluded directory name prunes its whole subtree. Individual
//! directories can also be pruned by path.

use crate::utils::errors::Result;
use globset::{Glob, GlobSet, GlobSetBuilder};
use std::path::{Path, PathBuf};
use tracing::warn;
use walkdir::{DirEntry, WalkDir};

/// Compiled exclude patterns plus directories skipped by path
#[derive(Debug, Clone)]
pub struct ExcludeMatcher {
    set: GlobSet,
    pruned: Vec<PathBuf>,
}

impl ExcludeMatcher {
    pub fn new(patterns: &[String]) -> Result<Self> {
        let mut builder = GlobSetBuilder::new();
        for pattern in patterns {
            builder.add(Glob::new(pattern)?);
        }
        Ok(Self {
            set: builder.build()?,
            pruned: Vec::new(),
        })
    }

    /// Skip `path` and everything below it. Compared against walked paths
    /// as-is, so pass it in the same (canonical) form as the walk root.
    pub fn prune_path(&mut self, path: PathBuf) {
        self.pruned.push(path);
    }

    /// True if a single file or directory name matches any pattern
    pub fn matches_name(&self, name: &std::ffi::OsStr) -> bool {
        self.set.is_match(Path::new(name))
    }

    fn skips(&self, entry: &DirEntry) -> bool {
        self.matches_name(entry.file_name()) || self.pruned.iter().any(|p| p == entry.path())
    }
}

/// Information about a file discovered during walking
#[derive(Debug, Clone)]
pub struct FileInfo {
    /// Full path to the file
    pub path: PathBuf,

    /// Relative path from the root
    pub relative_path: PathBuf,

    /// File size in bytes (of the target for symlinks)
    pub size: u64,
}

impl FileInfo {
    /// Create FileInfo from a DirEntry.
    /// For symlinks, resolves to the target to get the real file size.
    /// Returns None if the symlink target is a directory or cannot be resolved.
    fn from_entry(entry: &DirEntry, root: &Path) -> std::io::Result<Option<Self>> {
        let raw_metadata = entry.metadata().map_err(std::io::Error::from)?;
        let path = entry.path().to_path_buf();
        let relative_path = path.strip_prefix(root).unwrap_or(&path).to_path_buf();
        let size = if raw_metadata.is_symlink() {
            match std::fs::metadata(&path) {
                Ok(resolved) if resolved.is_file() => resolved.len(),
                // Symlink to a directory, or broken
                _ => return Ok(None),
            }
        } else {
            raw_metadata.len()
        };

        Ok(Some(Self {
            path,
            relative_path,
            size,
        }))
    }
}

/// Walk a directory tree and collect every non-excluded file, sorted by path.
///
/// Unreadable directories and entries are logged and skipped; the walk
/// itself only fails if `root` cannot be opened at all.
pub fn walk_directory(root: &Path, excludes: &ExcludeMatcher) -> std::io::Result<Vec<FileInfo>> {
    std::fs::read_dir(root)?;

    let mut files = Vec::new();

    let walker = WalkDir::new(root)
        .follow_links(false)
        .sort_by_file_name()
        .into_iter()
        // depth 0 is the root itself, whose own name is never matched
        .filter_entry(|entry| entry.depth() == 0 || !excludes.skips(entry));

    for entry in walker {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                warn!(path = ?e.path(), error = %e, "Skipping unreadable entry");
                continue;
            }
        };

        if entry.file_type().is_dir() {
            continue;
        }

        match FileInfo::from_entry(&entry, root) {
            Ok(Some(info)) => files.push(info),
            Ok(None) => {}
            Err(e) => warn!(path = %entry.path().display(), error = %e, "Skipping file without metadata"),
        }
    }

    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn matcher(patterns: &[&str]) -> ExcludeMatcher {
        let patterns: Vec<String> = patterns.iter().map(|p| p.to_string()).collect();
        ExcludeMatcher::new(&patterns).unwrap()
    }

    #[test]
    fn test_walk_empty_directory() -> std::io::Result<()> {
        let temp_dir = TempDir::new()?;
        let files = walk_directory(temp_dir.path(), &matcher(&[]))?;
        assert_eq!(files.len(), 0);
        Ok(())
    }

    #[test]
    fn test_walk_with_subdirectories() -> std::io::Result<()> {
        let temp_dir = TempDir::new()?;

        fs::create_dir(temp_dir.path().join("subdir"))?;
        fs::write(temp_dir.path().join("file1.txt"), b"content1")?;
        fs::write(temp_dir.path().join("subdir/file2.txt"), b"content2")?;

        let files = walk_directory(temp_dir.path(), &matcher(&[]))?;
        let relative: Vec<_> = files.iter().map(|f| f.relative_path.clone()).collect();
        assert_eq!(
            relative,
            vec![PathBuf::from("file1.txt"), PathBuf::from("subdir/file2.txt")]
        );
        assert_eq!(files[0].size, 8);

        Ok(())
    }

    #[test]
    fn test_excluded_directory_prunes_descendants() -> std::io::Result<()> {
        let temp_dir = TempDir::new()?;

        fs::create_dir_all(temp_dir.path().join("src/__pycache__/deep"))?;
        fs::write(temp_dir.path().join("src/main.py"), b"print()")?;
        fs::write(temp_dir.path().join("src/__pycache__/main.pyc"), b"x")?;
        fs::write(temp_dir.path().join("src/__pycache__/deep/other.txt"), b"x")?;
        fs::write(temp_dir.path().join("notes.tmp"), b"x")?;

        let files = walk_directory(temp_dir.path(), &matcher(&["__pycache__", "*.tmp"]))?;
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].relative_path, PathBuf::from("src/main.py"));

        Ok(())
    }

    #[test]
    fn test_pruned_path_skips_subtree() -> std::io::Result<()> {
        let temp_dir = TempDir::new()?;
        fs::create_dir_all(temp_dir.path().join("data/backups/old"))?;
        fs::write(temp_dir.path().join("data/keep.txt"), b"k")?;
        fs::write(temp_dir.path().join("data/backups/a.zip"), b"z")?;
        fs::write(temp_dir.path().join("data/backups/old/b.zip"), b"z")?;
        // Same name elsewhere is not affected
        fs::create_dir_all(temp_dir.path().join("backups"))?;
        fs::write(temp_dir.path().join("backups/c.txt"), b"c")?;

        let mut excludes = matcher(&[]);
        excludes.prune_path(temp_dir.path().join("data/backups"));

        let files = walk_directory(temp_dir.path(), &excludes)?;
        let relative: Vec<_> = files.iter().map(|f| f.relative_path.clone()).collect();
        assert_eq!(
            relative,
            vec![PathBuf::from("backups/c.txt"), PathBuf::from("data/keep.txt")]
        );
        Ok(())
    }

    #[test]
    fn test_missing_root_is_an_error() {
        let temp_dir = TempDir::new().unwrap();
        let result = walk_directory(&temp_dir.path().join("nope"), &matcher(&[]));
        assert!(result.is_err());
    }

    #[test]
    #[cfg(unix)]
    fn test_symlink_to_directory_is_skipped() -> std::io::Result<()> {
        let temp_dir = TempDir::new()?;
        fs::create_dir(temp_dir.path().join("real"))?;
        fs::write(temp_dir.path().join("real/file.txt"), b"data")?;
        std::os::unix::fs::symlink(temp_dir.path().join("real"), temp_dir.path().join("link"))?;

        let files = walk_directory(temp_dir.path(), &matcher(&[]))?;
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].relative_path, PathBuf::from("real/file.txt"));
        Ok(())
    }
}
