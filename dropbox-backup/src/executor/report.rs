//! Run summaries and the text report printed at the end of a run.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use std::time::Duration;

use crate::detect::{ChangeAction, Detection, SkippedPath};
use crate::upload::{FailureKind, SkipReason, UploadOutcome, UploadResult};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailedPath {
    pub path: String,
    pub kind: FailureKind,
    pub message: String,
    pub attempts: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SkippedUpload {
    pub path: String,
    pub reason: SkipReason,
}

/// Outcome of one backup run
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: String,
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,

    /// Files in the backup set
    pub scanned: usize,
    pub unchanged: usize,
    pub uploaded: usize,
    pub uploaded_bytes: u64,
    pub deleted: usize,
    pub retained: usize,

    pub failed: Vec<FailedPath>,
    pub skipped: Vec<SkippedUpload>,

    /// Paths the scanner could not read
    pub unreadable: Vec<SkippedPath>,

    pub cancelled: bool,
}

impl RunSummary {
    pub fn new(run_id: impl Into<String>, started_at: DateTime<Utc>) -> Self {
        Self {
            run_id: run_id.into(),
            started_at,
            duration_ms: 0,
            scanned: 0,
            unchanged: 0,
            uploaded: 0,
            uploaded_bytes: 0,
            deleted: 0,
            retained: 0,
            failed: Vec::new(),
            skipped: Vec::new(),
            unreadable: Vec::new(),
            cancelled: false,
        }
    }

    pub fn record(&mut self, result: &UploadResult) {
        match &result.outcome {
            UploadOutcome::Uploaded(file) => {
                self.uploaded += 1;
                self.uploaded_bytes += file.size;
            }
            UploadOutcome::Deleted => self.deleted += 1,
            UploadOutcome::Retained => self.retained += 1,
            UploadOutcome::Failed { kind, message } => self.failed.push(FailedPath {
                path: result.path.clone(),
                kind: *kind,
                message: message.clone(),
                attempts: result.attempts,
            }),
            UploadOutcome::Skipped(reason) => self.skipped.push(SkippedUpload {
                path: result.path.clone(),
                reason: *reason,
            }),
        }
    }

    pub fn set_duration(&mut self, duration: Duration) {
        self.duration_ms = u64::try_from(duration.as_millis()).unwrap_or(u64::MAX);
    }

    pub fn is_success(&self) -> bool {
        self.failed.is_empty() && !self.cancelled
    }

    /// 0 when every action succeeded, 1 on any failed action or cancellation
    pub fn exit_code(&self) -> i32 {
        if self.is_success() {
            0
        } else {
            1
        }
    }
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let status = if self.cancelled {
            "cancelled"
        } else if self.failed.is_empty() {
            "completed"
        } else {
            "completed with failures"
        };
        writeln!(
            f,
            "Backup run {} {} in {}",
            self.run_id,
            status,
            format_duration(self.duration_ms / 1000)
        )?;
        writeln!(f, "  scanned:   {}", self.scanned)?;
        writeln!(f, "  unchanged: {}", self.unchanged)?;
        writeln!(
            f,
            "  uploaded:  {} ({})",
            self.uploaded,
            format_bytes(self.uploaded_bytes)
        )?;
        writeln!(f, "  deleted:   {}", self.deleted)?;
        writeln!(f, "  retained:  {}", self.retained)?;
        writeln!(f, "  failed:    {}", self.failed.len())?;
        writeln!(f, "  skipped:   {}", self.skipped.len())?;

        if !self.failed.is_empty() {
            writeln!(f, "Failed:")?;
            for failed in &self.failed {
                writeln!(f, "  {} [{}] {}", failed.path, failed.kind, failed.message)?;
            }
        }
        if !self.skipped.is_empty() {
            writeln!(f, "Skipped:")?;
            for skipped in &self.skipped {
                writeln!(f, "  {} ({})", skipped.path, skipped.reason)?;
            }
        }
        if !self.unreadable.is_empty() {
            writeln!(f, "Unreadable:")?;
            for entry in &self.unreadable {
                writeln!(f, "  {} ({})", display_path(&entry.path), entry.reason)?;
            }
        }
        Ok(())
    }
}

/// What a run would do, without touching the remote
#[derive(Debug)]
pub struct Plan {
    pub scanned: usize,
    pub detection: Detection,
}

impl Plan {
    fn paths(&self, pred: impl Fn(&ChangeAction) -> bool) -> Vec<&str> {
        self.detection
            .actions
            .iter()
            .filter(|a| pred(a))
            .map(|a| a.path())
            .collect()
    }
}

impl fmt::Display for Plan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let new = self.paths(|a| matches!(a, ChangeAction::New(_)));
        let modified = self.paths(|a| matches!(a, ChangeAction::Modified { .. }));
        let deleted = self.paths(|a| matches!(a, ChangeAction::Deleted { retained: false, .. }));
        let unchanged = self.detection.count(|a| matches!(a, ChangeAction::Unchanged { .. }));
        let conflicts = self.paths(|a| matches!(a, ChangeAction::CaseConflict { .. }));

        writeln!(f, "Dry run: {} files scanned", self.scanned)?;
        writeln!(f, "  new:       {}", new.len())?;
        writeln!(f, "  modified:  {}", modified.len())?;
        writeln!(f, "  deleted:   {}", deleted.len())?;
        writeln!(f, "  unchanged: {}", unchanged)?;

        if !conflicts.is_empty() {
            writeln!(f, "  conflicts: {}", conflicts.len())?;
        }

        for (label, paths) in [
            ("New", &new),
            ("Modified", &modified),
            ("Deleted", &deleted),
            ("Differs only in case, not uploaded", &conflicts),
        ] {
            if paths.is_empty() {
                continue;
            }
            writeln!(f, "{}:", label)?;
            for path in paths.iter() {
                writeln!(f, "  {}", path)?;
            }
        }
        if !self.detection.skipped.is_empty() {
            writeln!(f, "Unreadable:")?;
            for entry in &self.detection.skipped {
                writeln!(f, "  {} ({})", display_path(&entry.path), entry.reason)?;
            }
        }
        Ok(())
    }
}

fn display_path(path: &str) -> &str {
    if path.is_empty() {
        "."
    } else {
        path
    }
}

/// Format bytes as human-readable string
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    let mut size = bytes as f64;
    let mut unit_index = 0;

    while size >= 1024.0 && unit_index < UNITS.len() - 1 {
        size /= 1024.0;
        unit_index += 1;
    }

    format!("{:.2} {}", size, UNITS[unit_index])
}

/// Format duration in seconds as human-readable string
pub fn format_duration(seconds: u64) -> String {
    if seconds < 60 {
        format!("{}s", seconds)
    } else if seconds < 3600 {
        format!("{}m {}s", seconds / 60, seconds % 60)
    } else {
        format!("{}h {}m", seconds / 3600, (seconds % 3600) / 60)
    }
}
