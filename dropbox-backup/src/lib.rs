//! Dropbox Backup Library
//!
//! Incremental directory backup to Dropbox driven by a local manifest:
//! scan, detect changes, upload with bounded concurrency, persist.

pub mod config;
pub mod daemon;
pub mod detect;
pub mod executor;
pub mod fs;
pub mod manifest;
pub mod remote;
pub mod upload;
pub mod utils;

// Re-export commonly used types
pub use config::Config;
pub use executor::{BackupExecutor, Plan, RunSummary};
pub use utils::errors::{BackupError, Result};
