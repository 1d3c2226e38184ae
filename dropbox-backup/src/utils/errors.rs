//! Custom error types for the backup tool.

use std::path::PathBuf;
use thiserror::Error;

use crate::remote::RemoteError;

#[derive(Error, Debug)]
pub enum BackupError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Corrupt manifest {}: {reason}", path.display())]
    CorruptManifest { path: PathBuf, reason: String },

    #[error("Manifest unavailable {}: {source}", path.display())]
    ManifestUnavailable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Backup source unavailable {}: {reason}", path.display())]
    SourceUnavailable { path: PathBuf, reason: String },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Remote error: {0}")]
    Remote(#[from] RemoteError),

    #[error("Task error: {0}")]
    Task(#[from] tokio::task::JoinError),
}

impl BackupError {
    /// Process exit code the CLI uses when a run aborts with this error.
    pub fn exit_code(&self) -> i32 {
        match self {
            BackupError::CorruptManifest { .. } => 2,
            _ => 3,
        }
    }
}

pub type Result<T> = std::result::Result<T, BackupError>;
