//! Manifest types and persistence for incremental backup support.
//!
//! A manifest records every uploaded file with the fingerprint, size and
//! mtime it had at upload time, plus the Dropbox id of the remote copy. The
//! next run diffs the live tree against it and only transfers what changed.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::fs::fingerprint::Fingerprint;
use crate::utils::errors::{BackupError, Result};

/// Only manifest version this build reads or writes
pub const MANIFEST_VERSION: u32 = 1;

/// Backup manifest, serialized as pretty JSON at `backup.manifest_path`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    pub version: u32,

    /// Local root the paths are relative to
    #[serde(default)]
    pub root: Option<PathBuf>,

    /// Remote destination prefix the files were uploaded under
    #[serde(default)]
    pub destination: Option<String>,

    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,

    /// Machine that wrote the manifest
    #[serde(default)]
    pub host: Option<String>,

    /// Run that wrote the manifest
    #[serde(default)]
    pub run_id: Option<String>,

    pub files: BTreeMap<String, ManifestEntry>,
}

/// State of a single file as of its last successful upload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub fingerprint: Fingerprint,
    pub size: u64,
    pub mtime_ns: i64,
    pub uploaded_at: DateTime<Utc>,

    /// Dropbox file id (`id:...`)
    pub remote_id: String,

    /// Dropbox revision of the uploaded content
    #[serde(default)]
    pub remote_rev: Option<String>,

    /// Set when the local file is gone but the remote copy was kept
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retained_at: Option<DateTime<Utc>>,
}

impl ManifestEntry {
    pub fn is_tombstone(&self) -> bool {
        self.retained_at.is_some()
    }
}

impl Default for Manifest {
    fn default() -> Self {
        Self::new()
    }
}

impl Manifest {
    pub fn new() -> Self {
        Self {
            version: MANIFEST_VERSION,
            root: None,
            destination: None,
            updated_at: None,
            host: None,
            run_id: None,
            files: BTreeMap::new(),
        }
    }

    pub fn get(&self, path: &str) -> Option<&ManifestEntry> {
        self.files.get(path)
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// Total bytes of live (non-tombstoned) entries
    pub fn total_bytes(&self) -> u64 {
        self.files
            .values()
            .filter(|e| !e.is_tombstone())
            .map(|e| e.size)
            .sum()
    }
}

/// Loads and atomically replaces the manifest file.
#[derive(Debug, Clone)]
pub struct ManifestStore {
    path: PathBuf,
}

impl ManifestStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Sibling file the next manifest is written to before the rename
    pub fn temp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| "manifest".into());
        name.push(".tmp");
        self.path.with_file_name(name)
    }

    /// Load the manifest; a missing file is a first run and yields an empty one.
    pub fn load(&self) -> Result<Manifest> {
        let content = match fs::read(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                info!("No manifest at {}, starting a full backup", self.path.display());
                return Ok(Manifest::new());
            }
            Err(e) => {
                return Err(BackupError::ManifestUnavailable {
                    path: self.path.clone(),
                    source: e,
                })
            }
        };

        // Check the version before the full parse so a future format is
        // reported as such rather than as a shape mismatch.
        let value: serde_json::Value =
            serde_json::from_slice(&content).map_err(|e| self.corrupt(e.to_string()))?;
        match value.get("version").and_then(|v| v.as_u64()) {
            Some(v) if v == u64::from(MANIFEST_VERSION) => {}
            Some(v) => return Err(self.corrupt(format!("unsupported manifest version {}", v))),
            None => return Err(self.corrupt("missing manifest version".to_string())),
        }

        let manifest: Manifest =
            serde_json::from_value(value).map_err(|e| self.corrupt(e.to_string()))?;

        info!(
            "Loaded manifest: {} files, {} bytes",
            manifest.len(),
            manifest.total_bytes()
        );
        Ok(manifest)
    }

    /// Write the manifest to a temp file, fsync it, and rename it into place.
    pub fn save(&self, manifest: &Manifest) -> Result<()> {
        let json = serde_json::to_vec_pretty(manifest)?;
        let temp_path = self.temp_path();

        self.write_atomic(&temp_path, &json).map_err(|e| {
            let _ = fs::remove_file(&temp_path);
            BackupError::ManifestUnavailable {
                path: self.path.clone(),
                source: e,
            }
        })?;

        debug!("Saved manifest to {} ({} bytes)", self.path.display(), json.len());
        Ok(())
    }

    fn write_atomic(&self, temp_path: &Path, data: &[u8]) -> std::io::Result<()> {
        let parent = match self.path.parent() {
            Some(p) if !p.as_os_str().is_empty() => Some(p),
            _ => None,
        };
        if let Some(parent) = parent {
            fs::create_dir_all(parent)?;
        }

        {
            let mut file = File::create(temp_path)?;
            file.write_all(data)?;
            file.sync_all()?;
        }
        fs::rename(temp_path, &self.path)?;

        // Persist the rename itself
        #[cfg(unix)]
        if let Some(parent) = parent {
            File::open(parent)?.sync_all()?;
        }

        Ok(())
    }

    fn corrupt(&self, reason: String) -> BackupError {
        BackupError::CorruptManifest {
            path: self.path.clone(),
            reason,
        }
    }
}
