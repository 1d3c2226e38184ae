//! Backup-set selection by file-name prefix and dated retention.
//!
//! Dump files are typically named `<prefix><date>...` (for example
//! `db_dump_2024-03-01.sql.gz`). A selection keeps only files matching one
//! of the configured prefixes and, when `keep` is set, only the newest
//! `keep` dated files per prefix. Files left out are treated as absent by
//! change detection.

use chrono::{NaiveDate, NaiveDateTime};
use std::collections::HashMap;
use tracing::{debug, warn};

use super::walker::ScanEntry;
use crate::config::SelectionConfig;

#[derive(Debug, Clone, Default)]
pub struct Selection {
    /// Lowercased prefixes; empty matches every file
    prefixes: Vec<String>,
    date_format: Option<String>,
    keep: Option<usize>,
}

impl Selection {
    pub fn new(prefixes: Vec<String>, date_format: Option<String>, keep: Option<usize>) -> Self {
        Self {
            prefixes: prefixes.iter().map(|p| p.to_lowercase()).collect(),
            date_format,
            keep,
        }
    }

    pub fn from_config(config: &SelectionConfig) -> Self {
        Self::new(
            config.prefixes.clone(),
            config.date_format.clone(),
            config.keep,
        )
    }

    /// Whether this selection can drop anything at all
    pub fn is_active(&self) -> bool {
        !self.prefixes.is_empty() || self.retention().is_some()
    }

    fn retention(&self) -> Option<(&str, usize)> {
        match (&self.date_format, self.keep) {
            (Some(format), Some(keep)) => Some((format.as_str(), keep)),
            _ => None,
        }
    }

    /// Longest configured prefix the file name starts with.
    ///
    /// Returns the prefix and the lowercased remainder of the name.
    fn match_prefix<'a>(&'a self, file_name: &str) -> Option<(&'a str, String)> {
        let lower = file_name.to_lowercase();
        if self.prefixes.is_empty() {
            return Some(("", lower));
        }
        self.prefixes
            .iter()
            .filter(|p| lower.starts_with(p.as_str()))
            .max_by_key(|p| p.len())
            .map(|p| (p.as_str(), lower[p.len()..].to_string()))
    }

    /// Filter scan output down to the backup set. Skipped entries pass through.
    pub fn apply<I>(&self, entries: I) -> Vec<ScanEntry>
    where
        I: IntoIterator<Item = ScanEntry>,
    {
        let mut kept: Vec<Option<ScanEntry>> = Vec::new();
        let mut dated: HashMap<&str, Vec<(NaiveDateTime, usize)>> = HashMap::new();

        for entry in entries {
            let record = match &entry {
                ScanEntry::File(record) => record,
                ScanEntry::Skipped { .. } => {
                    kept.push(Some(entry));
                    continue;
                }
            };

            let file_name = record
                .relative_path
                .rsplit('/')
                .next()
                .unwrap_or(record.relative_path.as_str());

            let Some((prefix, rest)) = self.match_prefix(file_name) else {
                continue;
            };

            if let Some((format, _)) = self.retention() {
                match parse_leading_date(&rest, format) {
                    Some(date) => dated.entry(prefix).or_default().push((date, kept.len())),
                    None => warn!(
                        "Cannot parse a {:?} date in {}, keeping it",
                        format, record.relative_path
                    ),
                }
            }
            kept.push(Some(entry));
        }

        if let Some((_, keep)) = self.retention() {
            for (prefix, mut files) in dated {
                // Newest first; equal dates fall back to scan order
                files.sort_by(|a, b| b.0.cmp(&a.0).then(b.1.cmp(&a.1)));
                for (date, idx) in files.into_iter().skip(keep) {
                    if let Some(ScanEntry::File(record)) = kept[idx].take() {
                        debug!(
                            "Retention drops {} (prefix {:?}, dated {})",
                            record.relative_path, prefix, date
                        );
                    }
                }
            }
        }

        kept.into_iter().flatten().collect()
    }
}

/// Parse a date (or date-time) at the start of `text`, ignoring what follows.
pub fn parse_leading_date(text: &str, format: &str) -> Option<NaiveDateTime> {
    if let Ok((datetime, _)) = NaiveDateTime::parse_and_remainder(text, format) {
        return Some(datetime);
    }
    NaiveDate::parse_and_remainder(text, format)
        .ok()
        .and_then(|(date, _)| date.and_hms_opt(0, 0, 0))
}
