//! File metadata used for cheap change detection.

use chrono::{DateTime, Utc};
use std::fs;
use std::path::Path;
use std::time::SystemTime;

/// Size and modification time of a local file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileMetadata {
    /// File size in bytes
    pub size: u64,

    /// Last modified time (nanoseconds since Unix epoch)
    pub mtime_ns: i64,
}

impl FileMetadata {
    /// Extract metadata from a file path, following symlinks
    pub fn from_path(path: &Path) -> std::io::Result<Self> {
        let metadata = fs::metadata(path)?;
        Self::from_std(&metadata)
    }

    pub fn from_std(metadata: &fs::Metadata) -> std::io::Result<Self> {
        Ok(Self {
            size: metadata.len(),
            mtime_ns: system_time_to_ns(metadata.modified()?),
        })
    }

    /// Modification time as a UTC timestamp
    pub fn modified(&self) -> DateTime<Utc> {
        DateTime::from_timestamp_nanos(self.mtime_ns)
    }
}

/// Nanoseconds relative to the Unix epoch; pre-epoch times are negative.
fn system_time_to_ns(time: SystemTime) -> i64 {
    match time.duration_since(SystemTime::UNIX_EPOCH) {
        Ok(d) => i64::try_from(d.as_nanos()).unwrap_or(i64::MAX),
        Err(e) => i64::try_from(e.duration().as_nanos())
            .map(|n| -n)
            .unwrap_or(i64::MIN),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::time::Duration;
    use tempfile::NamedTempFile;

    #[test]
    fn test_extract_metadata() -> std::io::Result<()> {
        let mut temp_file = NamedTempFile::new()?;
        temp_file.write_all(b"test content")?;
        temp_file.flush()?;

        let metadata = FileMetadata::from_path(temp_file.path())?;

        assert_eq!(metadata.size, 12);
        assert!(metadata.mtime_ns > 0);
        Ok(())
    }

    #[test]
    fn test_set_mtime_is_observed() -> std::io::Result<()> {
        let temp_file = NamedTempFile::new()?;
        let when = SystemTime::UNIX_EPOCH + Duration::from_secs(1_600_000_000);
        temp_file.as_file().set_modified(when)?;

        let metadata = FileMetadata::from_path(temp_file.path())?;
        assert_eq!(metadata.mtime_ns, 1_600_000_000_000_000_000);
        assert_eq!(metadata.modified().timestamp(), 1_600_000_000);
        Ok(())
    }

    #[test]
    fn test_pre_epoch_times_are_negative() {
        let before = SystemTime::UNIX_EPOCH - Duration::from_secs(5);
        assert_eq!(system_time_to_ns(before), -5_000_000_000);
    }
}
