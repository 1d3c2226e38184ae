//! Configuration management for the backup tool.
//!
//! Loads configuration from a TOML file with environment variable overrides.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::utils::errors::{BackupError, Result};

/// Environment variable holding the Dropbox access token.
pub const TOKEN_ENV: &str = "DROPBOX_TOKEN";

/// Environment variable overriding `backup.root`.
pub const ROOT_ENV: &str = "DROPBOX_BACKUP_ROOT";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub backup: BackupConfig,

    #[serde(default)]
    pub remote: RemoteConfig,

    #[serde(default)]
    pub upload: UploadConfig,

    #[serde(default)]
    pub selection: SelectionConfig,

    #[serde(default)]
    pub log: LogConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupConfig {
    /// Local directory to back up
    pub root: PathBuf,

    /// Where the manifest of uploaded files is kept between runs
    #[serde(default = "default_manifest_path")]
    pub manifest_path: PathBuf,

    /// File-name patterns excluded from the scan (substring match)
    #[serde(default = "default_exclude")]
    pub exclude: Vec<String>,

    /// Follow symbolic links while walking
    #[serde(default)]
    pub follow_links: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteConfig {
    /// Dropbox folder that receives the backup
    #[serde(default = "default_destination")]
    pub destination: String,

    /// Dropbox access token (falls back to DROPBOX_TOKEN)
    #[serde(default)]
    pub token: String,

    #[serde(default = "default_api_url")]
    pub api_url: String,

    #[serde(default = "default_content_url")]
    pub content_url: String,

    /// Per-request timeout in seconds
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

/// What happens to the remote copy of a file deleted locally.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DeletionPolicy {
    /// Keep the remote copy, tombstone the manifest entry
    #[default]
    Retain,
    /// Delete the remote copy and drop the manifest entry
    Propagate,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadConfig {
    /// Maximum concurrent uploads
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// Attempts per file, including the first one
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,

    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,

    #[serde(default)]
    pub deletion: DeletionPolicy,

    /// Stop submitting uploads after this many seconds
    #[serde(default)]
    pub run_timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SelectionConfig {
    /// Only files whose name starts with one of these (case-insensitive)
    #[serde(default)]
    pub prefixes: Vec<String>,

    /// chrono format of the date following the prefix
    #[serde(default)]
    pub date_format: Option<String>,

    /// Newest dated files kept per prefix
    #[serde(default)]
    pub keep: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
}

// Default values
fn default_manifest_path() -> PathBuf {
    PathBuf::from("dropbox-backup-manifest.json")
}

fn default_exclude() -> Vec<String> {
    vec![".git".to_string(), ".DS_Store".to_string()]
}

fn default_destination() -> String {
    "/Backups".to_string()
}

fn default_api_url() -> String {
    "https://api.dropboxapi.com".to_string()
}

fn default_content_url() -> String {
    "https://content.dropboxapi.com".to_string()
}

fn default_timeout_secs() -> u64 {
    300
}

fn default_concurrency() -> usize {
    4
}

fn default_max_attempts() -> u32 {
    3
}

fn default_backoff_base_ms() -> u64 {
    500
}

fn default_backoff_max_ms() -> u64 {
    30_000
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            destination: default_destination(),
            token: String::new(),
            api_url: default_api_url(),
            content_url: default_content_url(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            max_attempts: default_max_attempts(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_max_ms: default_backoff_max_ms(),
            deletion: DeletionPolicy::default(),
            run_timeout_secs: None,
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl UploadConfig {
    pub fn backoff_base(&self) -> Duration {
        Duration::from_millis(self.backoff_base_ms)
    }

    pub fn backoff_max(&self) -> Duration {
        Duration::from_millis(self.backoff_max_ms)
    }

    pub fn run_timeout(&self) -> Option<Duration> {
        self.run_timeout_secs.map(Duration::from_secs)
    }
}

impl Config {
    /// Load configuration from a TOML file, then apply environment overrides
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            BackupError::Config(format!("cannot read {}: {}", path.display(), e))
        })?;
        let mut config = Self::from_toml(&content)?;
        config.apply_env();
        Ok(config)
    }

    /// Parse configuration from TOML text without consulting the environment
    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| BackupError::Config(e.to_string()))
    }

    /// Minimal configuration for a root directory, everything else defaulted
    pub fn for_root(root: impl Into<PathBuf>) -> Self {
        Config {
            backup: BackupConfig {
                root: root.into(),
                manifest_path: default_manifest_path(),
                exclude: default_exclude(),
                follow_links: false,
            },
            remote: RemoteConfig::default(),
            upload: UploadConfig::default(),
            selection: SelectionConfig::default(),
            log: LogConfig::default(),
        }
    }

    fn apply_env(&mut self) {
        if self.remote.token.is_empty() {
            if let Ok(token) = std::env::var(TOKEN_ENV) {
                self.remote.token = token;
            }
        }
        if let Ok(root) = std::env::var(ROOT_ENV) {
            if !root.is_empty() {
                self.backup.root = PathBuf::from(root);
            }
        }
    }

    /// Check invariants the rest of the crate relies on.
    ///
    /// `needs_token` is false for dry runs, which never contact Dropbox.
    pub fn validate(&self, needs_token: bool) -> Result<()> {
        if self.backup.root.as_os_str().is_empty() {
            return Err(BackupError::Config("backup.root must not be empty".into()));
        }
        if self.upload.concurrency == 0 {
            return Err(BackupError::Config("upload.concurrency must be at least 1".into()));
        }
        if self.upload.max_attempts == 0 {
            return Err(BackupError::Config("upload.max_attempts must be at least 1".into()));
        }
        if self.selection.keep == Some(0) {
            return Err(BackupError::Config("selection.keep must be at least 1".into()));
        }
        if self.selection.keep.is_some() && self.selection.date_format.is_none() {
            return Err(BackupError::Config(
                "selection.keep requires selection.date_format".into(),
            ));
        }
        if needs_token && self.remote.token.is_empty() {
            return Err(BackupError::Config(format!(
                "remote.token is empty and {} is not set",
                TOKEN_ENV
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimal_config_uses_defaults() {
        let config = Config::from_toml("[backup]\nroot = \"/data\"\n").unwrap();

        assert_eq!(config.backup.root, PathBuf::from("/data"));
        assert_eq!(config.backup.exclude, vec![".git", ".DS_Store"]);
        assert_eq!(config.remote.destination, "/Backups");
        assert_eq!(config.upload.concurrency, 4);
        assert_eq!(config.upload.max_attempts, 3);
        assert_eq!(config.upload.deletion, DeletionPolicy::Retain);
        assert!(config.upload.run_timeout().is_none());
        assert_eq!(config.log.level, "info");
    }

    #[test]
    fn test_full_config() {
        let toml = r#"
            [backup]
            root = "/var/backups/postgres"
            manifest_path = "/var/lib/dropbox-backup/manifest.json"

            [remote]
            destination = "/db"
            token = "sl.abc"

            [upload]
            concurrency = 2
            max_attempts = 5
            backoff_base_ms = 100
            deletion = "propagate"
            run_timeout_secs = 60

            [selection]
            prefixes = ["db_dump_"]
            date_format = "%Y-%m-%d"
            keep = 7
        "#;
        let config = Config::from_toml(toml).unwrap();

        assert_eq!(config.upload.deletion, DeletionPolicy::Propagate);
        assert_eq!(config.upload.backoff_base(), Duration::from_millis(100));
        assert_eq!(config.upload.run_timeout(), Some(Duration::from_secs(60)));
        assert_eq!(config.selection.keep, Some(7));
        assert!(config.validate(true).is_ok());
    }

    #[test]
    fn test_example_config_parses() {
        let config = Config::from_toml(include_str!("../../config.example.toml")).unwrap();
        assert_eq!(config.upload.deletion, DeletionPolicy::Retain);
        assert!(config.validate(false).is_ok());
    }

    #[test]
    fn test_unknown_deletion_policy_rejected() {
        let toml = "[backup]\nroot = \"/data\"\n[upload]\ndeletion = \"shred\"\n";
        assert!(matches!(Config::from_toml(toml), Err(BackupError::Config(_))));
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = Config::for_root("/data");
        assert!(config.validate(false).is_ok());
        assert!(config.validate(true).is_err());

        config.upload.concurrency = 0;
        assert!(config.validate(false).is_err());

        let mut config = Config::for_root("/data");
        config.selection.keep = Some(3);
        assert!(config.validate(false).is_err());
        config.selection.date_format = Some("%Y%m%d".into());
        assert!(config.validate(false).is_ok());
    }
}
