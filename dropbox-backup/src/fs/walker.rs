//! Lazy directory traversal producing file records for change detection.
//!
//! Relative paths are normalized once here: components are joined with `/`
//! on every platform and case is preserved exactly as the filesystem reports
//! it (paths that collide under Dropbox's case folding are sorted out by
//! change detection). Non-UTF-8 names are converted lossily.

use std::path::{Component, Path, PathBuf};
use std::sync::OnceLock;
use walkdir::{DirEntry, WalkDir};

use super::fingerprint::Fingerprint;
use super::metadata::FileMetadata;
use crate::utils::errors::{BackupError, Result};

/// Options for directory walking
#[derive(Debug, Clone)]
pub struct WalkOptions {
    /// Follow symbolic links
    pub follow_links: bool,

    /// Maximum depth (None = unlimited)
    pub max_depth: Option<usize>,

    /// Exclude patterns (substring of the file name)
    pub exclude_patterns: Vec<String>,

    /// Exact relative paths to leave out (the manifest and its temp file)
    pub exclude_paths: Vec<String>,
}

impl Default for WalkOptions {
    fn default() -> Self {
        Self {
            follow_links: false,
            max_depth: None,
            exclude_patterns: vec![".git".to_string(), ".DS_Store".to_string()],
            exclude_paths: Vec::new(),
        }
    }
}

/// A regular file discovered during a scan.
///
/// Size and mtime are read eagerly; the content fingerprint is computed at
/// most once, on first request.
#[derive(Debug)]
pub struct FileRecord {
    /// Normalized path relative to the scan root
    pub relative_path: String,

    /// Full path to the file
    pub path: PathBuf,

    pub metadata: FileMetadata,

    fingerprint: OnceLock<Fingerprint>,
}

impl FileRecord {
    pub fn new(relative_path: impl Into<String>, path: PathBuf, metadata: FileMetadata) -> Self {
        Self {
            relative_path: relative_path.into(),
            path,
            metadata,
            fingerprint: OnceLock::new(),
        }
    }

    pub fn size(&self) -> u64 {
        self.metadata.size
    }

    pub fn mtime_ns(&self) -> i64 {
        self.metadata.mtime_ns
    }

    /// Content fingerprint, hashing the file on first call
    pub fn fingerprint(&self) -> std::io::Result<Fingerprint> {
        if let Some(fp) = self.fingerprint.get() {
            return Ok(fp.clone());
        }
        let fp = Fingerprint::of_file(&self.path)?;
        Ok(self.fingerprint.get_or_init(|| fp).clone())
    }

    /// Fingerprint if it has already been computed
    pub fn cached_fingerprint(&self) -> Option<&Fingerprint> {
        self.fingerprint.get()
    }
}

/// One item of a scan: a file, or something that could not be read.
#[derive(Debug)]
pub enum ScanEntry {
    File(FileRecord),
    Skipped { path: String, reason: String },
}

/// Walks a backup root. Holds no state between scans.
#[derive(Debug, Clone)]
pub struct Scanner {
    root: PathBuf,
    options: WalkOptions,
}

impl Scanner {
    pub fn new(root: impl Into<PathBuf>, options: WalkOptions) -> Self {
        Self {
            root: root.into(),
            options,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Fail unless the root exists and is a directory.
    ///
    /// Must pass before detection: an unmounted root would otherwise look
    /// like every file was deleted.
    pub fn check_root(&self) -> Result<()> {
        match std::fs::metadata(&self.root) {
            Ok(meta) if meta.is_dir() => Ok(()),
            Ok(_) => Err(BackupError::SourceUnavailable {
                path: self.root.clone(),
                reason: "not a directory".to_string(),
            }),
            Err(e) => Err(BackupError::SourceUnavailable {
                path: self.root.clone(),
                reason: e.to_string(),
            }),
        }
    }

    /// Walk the root lazily, yielding files in file-name order
    pub fn scan(&self) -> impl Iterator<Item = ScanEntry> + '_ {
        let mut walker = WalkDir::new(&self.root)
            .follow_links(self.options.follow_links)
            .sort_by_file_name();

        if let Some(max_depth) = self.options.max_depth {
            walker = walker.max_depth(max_depth);
        }

        walker
            .into_iter()
            .filter_entry(move |entry| !self.should_exclude(entry))
            .filter_map(move |entry| self.classify(entry))
    }

    fn classify(&self, entry: walkdir::Result<DirEntry>) -> Option<ScanEntry> {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                let path = e
                    .path()
                    .map(|p| normalize_relative(&self.root, p))
                    .unwrap_or_default();
                tracing::warn!("Skipping unreadable entry {:?}: {}", path, e);
                return Some(ScanEntry::Skipped {
                    path,
                    reason: e.to_string(),
                });
            }
        };

        if entry.file_type().is_dir() {
            return None;
        }

        let relative_path = normalize_relative(&self.root, entry.path());

        // Symlinks only show up here when not following links: resolve
        // them to a regular file or drop them.
        let metadata = if entry.path_is_symlink() && !self.options.follow_links {
            match std::fs::metadata(entry.path()) {
                Ok(resolved) if resolved.is_file() => resolved,
                _ => return None,
            }
        } else {
            match entry.metadata() {
                Ok(meta) if meta.is_file() => meta,
                Ok(_) => return None,
                Err(e) => {
                    return Some(ScanEntry::Skipped {
                        path: relative_path,
                        reason: e.to_string(),
                    })
                }
            }
        };

        match FileMetadata::from_std(&metadata) {
            Ok(meta) => Some(ScanEntry::File(FileRecord::new(
                relative_path,
                entry.path().to_path_buf(),
                meta,
            ))),
            Err(e) => Some(ScanEntry::Skipped {
                path: relative_path,
                reason: e.to_string(),
            }),
        }
    }

    /// Check if a directory entry should be excluded; the root never is
    fn should_exclude(&self, entry: &DirEntry) -> bool {
        if entry.depth() == 0 {
            return false;
        }

        let file_name = entry.file_name().to_string_lossy();
        if self
            .options
            .exclude_patterns
            .iter()
            .any(|pattern| file_name.contains(pattern.as_str()))
        {
            return true;
        }

        if self.options.exclude_paths.is_empty() {
            return false;
        }
        let relative = normalize_relative(&self.root, entry.path());
        self.options.exclude_paths.iter().any(|p| *p == relative)
    }
}

/// Relative path from `root` with `/` separators. `""` for the root itself.
pub fn normalize_relative(root: &Path, path: &Path) -> String {
    let relative = path.strip_prefix(root).unwrap_or(path);
    relative
        .components()
        .filter_map(|c| match c {
            Component::Normal(part) => Some(part.to_string_lossy()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("/")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn files(scanner: &Scanner) -> Vec<FileRecord> {
        scanner
            .scan()
            .filter_map(|e| match e {
                ScanEntry::File(f) => Some(f),
                ScanEntry::Skipped { .. } => None,
            })
            .collect()
    }

    #[test]
    fn test_walk_empty_directory() -> std::io::Result<()> {
        let temp_dir = TempDir::new()?;
        let scanner = Scanner::new(temp_dir.path(), WalkOptions::default());
        assert_eq!(scanner.scan().count(), 0);
        Ok(())
    }

    #[test]
    fn test_walk_with_subdirectories() -> std::io::Result<()> {
        let temp_dir = TempDir::new()?;

        fs::create_dir_all(temp_dir.path().join("sub/deeper"))?;
        fs::write(temp_dir.path().join("file1.txt"), b"content1")?;
        fs::write(temp_dir.path().join("sub/deeper/file2.txt"), b"content22")?;

        let scanner = Scanner::new(temp_dir.path(), WalkOptions::default());
        let records = files(&scanner);
        let paths: Vec<_> = records.iter().map(|r| r.relative_path.as_str()).collect();

        assert_eq!(paths, vec!["file1.txt", "sub/deeper/file2.txt"]);
        assert_eq!(records[1].size(), 9);
        assert!(records[1].cached_fingerprint().is_none());
        Ok(())
    }

    #[test]
    fn test_scan_is_restartable() -> std::io::Result<()> {
        let temp_dir = TempDir::new()?;
        fs::write(temp_dir.path().join("a"), b"1")?;

        let scanner = Scanner::new(temp_dir.path(), WalkOptions::default());
        assert_eq!(files(&scanner).len(), 1);

        fs::write(temp_dir.path().join("b"), b"2")?;
        assert_eq!(files(&scanner).len(), 2);
        Ok(())
    }

    #[test]
    fn test_exclude_patterns_prune_subtrees() -> std::io::Result<()> {
        let temp_dir = TempDir::new()?;

        fs::create_dir(temp_dir.path().join(".git"))?;
        fs::write(temp_dir.path().join(".git/HEAD"), b"ref")?;
        fs::write(temp_dir.path().join("file.txt"), b"keep")?;
        fs::write(temp_dir.path().join(".DS_Store"), b"exclude")?;

        let scanner = Scanner::new(temp_dir.path(), WalkOptions::default());
        let records = files(&scanner);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].relative_path, "file.txt");
        Ok(())
    }

    #[test]
    fn test_exclude_exact_paths() -> std::io::Result<()> {
        let temp_dir = TempDir::new()?;
        fs::write(temp_dir.path().join("manifest.json"), b"{}")?;
        fs::write(temp_dir.path().join("data.bin"), b"x")?;

        let options = WalkOptions {
            exclude_paths: vec!["manifest.json".to_string()],
            ..WalkOptions::default()
        };
        let records = files(&Scanner::new(temp_dir.path(), options));
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].relative_path, "data.bin");
        Ok(())
    }

    #[test]
    fn test_fingerprint_is_lazy_and_cached() -> std::io::Result<()> {
        let temp_dir = TempDir::new()?;
        fs::write(temp_dir.path().join("a"), b"abc")?;

        let records = files(&Scanner::new(temp_dir.path(), WalkOptions::default()));
        let record = &records[0];
        assert!(record.cached_fingerprint().is_none());

        let fp = record.fingerprint()?;
        assert_eq!(fp, Fingerprint::of_bytes(b"abc"));
        assert_eq!(record.cached_fingerprint(), Some(&fp));
        Ok(())
    }

    #[test]
    fn test_check_root() -> std::io::Result<()> {
        let temp_dir = TempDir::new()?;
        let file = temp_dir.path().join("plain");
        fs::write(&file, b"x")?;

        assert!(Scanner::new(temp_dir.path(), WalkOptions::default()).check_root().is_ok());
        assert!(matches!(
            Scanner::new(&file, WalkOptions::default()).check_root(),
            Err(BackupError::SourceUnavailable { .. })
        ));
        assert!(Scanner::new(temp_dir.path().join("missing"), WalkOptions::default())
            .check_root()
            .is_err());
        Ok(())
    }

    #[test]
    #[cfg(unix)]
    fn test_symlinks_resolve_to_files_only() -> std::io::Result<()> {
        let temp_dir = TempDir::new()?;
        fs::create_dir(temp_dir.path().join("dir"))?;
        fs::write(temp_dir.path().join("target.txt"), b"12345")?;
        std::os::unix::fs::symlink(temp_dir.path().join("target.txt"), temp_dir.path().join("link"))?;
        std::os::unix::fs::symlink(temp_dir.path().join("dir"), temp_dir.path().join("dirlink"))?;
        std::os::unix::fs::symlink(temp_dir.path().join("nowhere"), temp_dir.path().join("broken"))?;

        let records = files(&Scanner::new(temp_dir.path(), WalkOptions::default()));
        let paths: Vec<_> = records.iter().map(|r| r.relative_path.as_str()).collect();
        assert_eq!(paths, vec!["link", "target.txt"]);
        assert_eq!(records[0].size(), 5);
        Ok(())
    }

    #[test]
    #[cfg(unix)]
    fn test_unreadable_directory_is_skipped_not_fatal() -> std::io::Result<()> {
        use std::os::unix::fs::PermissionsExt;

        let temp_dir = TempDir::new()?;
        let locked = temp_dir.path().join("locked");
        fs::create_dir(&locked)?;
        fs::write(locked.join("secret"), b"x")?;
        fs::write(temp_dir.path().join("open.txt"), b"y")?;
        fs::set_permissions(&locked, fs::Permissions::from_mode(0o000))?;

        // Root ignores permission bits; nothing to observe in that case.
        if fs::read_dir(&locked).is_ok() {
            fs::set_permissions(&locked, fs::Permissions::from_mode(0o755))?;
            return Ok(());
        }

        let entries: Vec<_> = Scanner::new(temp_dir.path(), WalkOptions::default())
            .scan()
            .collect();
        fs::set_permissions(&locked, fs::Permissions::from_mode(0o755))?;

        assert!(entries
            .iter()
            .any(|e| matches!(e, ScanEntry::Skipped { path, .. } if path == "locked")));
        assert!(entries
            .iter()
            .any(|e| matches!(e, ScanEntry::File(f) if f.relative_path == "open.txt")));
        Ok(())
    }

    #[test]
    fn test_normalize_relative() {
        let root = Path::new("/data/root");
        assert_eq!(normalize_relative(root, Path::new("/data/root/a/b.txt")), "a/b.txt");
        assert_eq!(normalize_relative(root, root), "");
    }
}
