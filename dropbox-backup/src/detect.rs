//! Change detection against the previous manifest.
//!
//! Two tiers: size and mtime are compared first, and the content fingerprint
//! is computed only when they differ. When a fingerprint is computed it is
//! authoritative, so a touched-but-identical file is unchanged and a
//! mtime-preserving edit of a different size is still caught.
//!
//! Dropbox paths are case-insensitive. Of several live paths that differ
//! only in case, one owns the remote file and the others are reported as
//! conflicts; a manifest entry whose path now belongs to a case-variant is
//! dropped without touching the remote.

use serde::Serialize;
use std::collections::{HashMap, HashSet};
use tracing::{debug, info};

use crate::fs::fingerprint::Fingerprint;
use crate::fs::walker::{FileRecord, ScanEntry};
use crate::manifest::Manifest;
use crate::remote::path_key;

/// What has to happen to one path
#[derive(Debug)]
pub enum ChangeAction {
    /// Content matches the manifest. `refresh` carries the live record when
    /// the entry's size/mtime or tombstone should be updated locally.
    Unchanged {
        path: String,
        refresh: Option<FileRecord>,
    },
    New(FileRecord),
    Modified {
        record: FileRecord,
        previous: Fingerprint,
    },
    /// In the manifest but gone locally. `retained` marks an entry that is
    /// already a tombstone.
    Deleted {
        path: String,
        remote_id: String,
        retained: bool,
    },
    /// Differs from the live path `with` only in case, so both would land
    /// on one remote file. Not uploaded.
    CaseConflict { path: String, with: String },
    /// Gone locally, but the live path `by` maps to the same remote file.
    /// Forgotten locally, never deleted remotely.
    Superseded { path: String, by: String },
}

impl ChangeAction {
    pub fn path(&self) -> &str {
        match self {
            ChangeAction::Unchanged { path, .. } => path,
            ChangeAction::New(record) => &record.relative_path,
            ChangeAction::Modified { record, .. } => &record.relative_path,
            ChangeAction::Deleted { path, .. } => path,
            ChangeAction::CaseConflict { path, .. } => path,
            ChangeAction::Superseded { path, .. } => path,
        }
    }

    /// Whether the upload coordinator has anything to do for this action
    pub fn needs_remote(&self) -> bool {
        !matches!(
            self,
            ChangeAction::Unchanged { .. } | ChangeAction::Superseded { .. }
        )
    }
}

/// A path the scanner could not read
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SkippedPath {
    pub path: String,
    pub reason: String,
}

/// Output of a detection pass
#[derive(Debug, Default)]
pub struct Detection {
    pub actions: Vec<ChangeAction>,
    pub skipped: Vec<SkippedPath>,
}

impl Detection {
    pub fn count(&self, pred: impl Fn(&ChangeAction) -> bool) -> usize {
        self.actions.iter().filter(|a| pred(a)).count()
    }
}

/// Classify every scanned file and every manifest entry.
///
/// Output order: manifest-only paths first, then live files in path order.
pub fn detect<I>(entries: I, manifest: &Manifest) -> Detection
where
    I: IntoIterator<Item = ScanEntry>,
{
    let mut live: HashMap<String, FileRecord> = HashMap::new();
    let mut skipped = Vec::new();

    for entry in entries {
        match entry {
            ScanEntry::File(record) => {
                live.insert(record.relative_path.clone(), record);
            }
            ScanEntry::Skipped { path, reason } => skipped.push(SkippedPath { path, reason }),
        }
    }

    let unreadable: HashSet<&str> = skipped.iter().map(|s| s.path.as_str()).collect();
    let owners = case_owners(&live, manifest);
    let mut actions = Vec::with_capacity(live.len());

    for (path, entry) in &manifest.files {
        if live.contains_key(path) {
            continue;
        }
        if is_under_unreadable(path, &unreadable) {
            debug!("{} is under an unreadable path, not treating it as deleted", path);
            actions.push(ChangeAction::Unchanged {
                path: path.clone(),
                refresh: None,
            });
            continue;
        }
        if let Some(owner) = owners.get(&path_key(path)) {
            debug!("{} is gone, {} now maps to the same remote file", path, owner);
            actions.push(ChangeAction::Superseded {
                path: path.clone(),
                by: owner.clone(),
            });
            continue;
        }
        actions.push(ChangeAction::Deleted {
            path: path.clone(),
            remote_id: entry.remote_id.clone(),
            retained: entry.is_tombstone(),
        });
    }

    let mut records: Vec<FileRecord> = live.into_values().collect();
    records.sort_by(|a, b| a.relative_path.cmp(&b.relative_path));

    for record in records {
        let owner = owners
            .get(&path_key(&record.relative_path))
            .filter(|owner| **owner != record.relative_path)
            .cloned();
        match owner {
            Some(with) => actions.push(ChangeAction::CaseConflict {
                path: record.relative_path,
                with,
            }),
            None => actions.push(classify(record, manifest)),
        }
    }

    let detection = Detection { actions, skipped };
    info!(
        "Change detection: {} new, {} modified, {} deleted, {} unchanged, {} unreadable",
        detection.count(|a| matches!(a, ChangeAction::New(_))),
        detection.count(|a| matches!(a, ChangeAction::Modified { .. })),
        detection.count(|a| matches!(a, ChangeAction::Deleted { .. })),
        detection.count(|a| matches!(a, ChangeAction::Unchanged { .. })),
        detection.skipped.len(),
    );
    detection
}

fn classify(record: FileRecord, manifest: &Manifest) -> ChangeAction {
    let Some(entry) = manifest.get(&record.relative_path) else {
        return ChangeAction::New(record);
    };

    if entry.size == record.size() && entry.mtime_ns == record.mtime_ns() {
        let path = record.relative_path.clone();
        let refresh = entry.is_tombstone().then_some(record);
        return ChangeAction::Unchanged { path, refresh };
    }

    match record.fingerprint() {
        Ok(fp) if fp == entry.fingerprint => ChangeAction::Unchanged {
            path: record.relative_path.clone(),
            refresh: Some(record),
        },
        Ok(_) => ChangeAction::Modified {
            previous: entry.fingerprint.clone(),
            record,
        },
        Err(e) => {
            // The uploader re-reads the file and reports the real error.
            debug!("Cannot fingerprint {}: {}", record.relative_path, e);
            ChangeAction::Modified {
                previous: entry.fingerprint.clone(),
                record,
            }
        }
    }
}

/// Map each case-folded live path to the path that owns its remote file:
/// the one already in the manifest, else the first in path order.
fn case_owners(live: &HashMap<String, FileRecord>, manifest: &Manifest) -> HashMap<String, String> {
    let mut paths: Vec<&String> = live.keys().collect();
    paths.sort();

    let mut owners: HashMap<String, String> = HashMap::with_capacity(paths.len());
    for path in paths {
        let key = path_key(path);
        let take_over = match owners.get(&key) {
            Some(owner) => manifest.get(owner).is_none() && manifest.get(path).is_some(),
            None => true,
        };
        if take_over {
            owners.insert(key, path.clone());
        }
    }
    owners
}

/// True when `path` equals or lies below one of the unreadable paths.
/// An unreadable root (`""`) covers everything.
fn is_under_unreadable(path: &str, unreadable: &HashSet<&str>) -> bool {
    if unreadable.is_empty() {
        return false;
    }
    if unreadable.contains("") || unreadable.contains(path) {
        return true;
    }
    path.match_indices('/')
        .any(|(idx, _)| unreadable.contains(&path[..idx]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::metadata::FileMetadata;
    use crate::manifest::ManifestEntry;
    use chrono::Utc;
    use std::fs;
    use std::path::Path;
    use tempfile::TempDir;

    fn record(root: &Path, rel: &str) -> FileRecord {
        let path = root.join(rel);
        let metadata = FileMetadata::from_path(&path).unwrap();
        FileRecord::new(rel, path, metadata)
    }

    fn entry_for(root: &Path, rel: &str) -> ManifestEntry {
        let path = root.join(rel);
        let metadata = FileMetadata::from_path(&path).unwrap();
        ManifestEntry {
            fingerprint: Fingerprint::of_file(&path).unwrap(),
            size: metadata.size,
            mtime_ns: metadata.mtime_ns,
            uploaded_at: Utc::now(),
            remote_id: format!("id:{}", rel),
            remote_rev: None,
            retained_at: None,
        }
    }

    fn kinds(detection: &Detection) -> Vec<(String, &'static str)> {
        detection
            .actions
            .iter()
            .map(|a| {
                let kind = match a {
                    ChangeAction::Unchanged { refresh: None, .. } => "unchanged",
                    ChangeAction::Unchanged { refresh: Some(_), .. } => "unchanged+refresh",
                    ChangeAction::New(_) => "new",
                    ChangeAction::Modified { .. } => "modified",
                    ChangeAction::Deleted { .. } => "deleted",
                    ChangeAction::CaseConflict { .. } => "conflict",
                    ChangeAction::Superseded { .. } => "superseded",
                };
                (a.path().to_string(), kind)
            })
            .collect()
    }

    #[test]
    fn test_classification() {
        let dir = TempDir::new().unwrap();
        let root = dir.path();
        fs::write(root.join("same"), b"same").unwrap();
        fs::write(root.join("edited"), b"before").unwrap();
        fs::write(root.join("new"), b"new").unwrap();
        fs::write(root.join("gone"), b"gone").unwrap();

        let mut manifest = Manifest::new();
        for rel in ["same", "edited", "gone"] {
            manifest.files.insert(rel.to_string(), entry_for(root, rel));
        }
        fs::write(root.join("edited"), b"after!!").unwrap();
        fs::remove_file(root.join("gone")).unwrap();

        let entries = ["edited", "new", "same"]
            .into_iter()
            .map(|rel| ScanEntry::File(record(root, rel)));
        let detection = detect(entries, &manifest);

        assert_eq!(
            kinds(&detection),
            vec![
                ("gone".to_string(), "deleted"),
                ("edited".to_string(), "modified"),
                ("new".to_string(), "new"),
                ("same".to_string(), "unchanged"),
            ]
        );
    }

    #[test]
    fn test_unchanged_metadata_skips_hashing() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("big"), vec![1u8; 1024]).unwrap();

        let mut manifest = Manifest::new();
        let mut entry = entry_for(dir.path(), "big");
        // A fingerprint that cannot match proves no hash was compared.
        entry.fingerprint = Fingerprint::from_hex("00");
        manifest.files.insert("big".into(), entry);

        let detection = detect(vec![ScanEntry::File(record(dir.path(), "big"))], &manifest);
        match &detection.actions[0] {
            ChangeAction::Unchanged { path, refresh: None } => assert_eq!(path, "big"),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_touch_without_edit_is_unchanged() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("touched");
        fs::write(&path, b"stable content").unwrap();

        let mut manifest = Manifest::new();
        let mut entry = entry_for(dir.path(), "touched");
        entry.mtime_ns -= 5_000_000_000;
        manifest.files.insert("touched".into(), entry);

        let detection = detect(vec![ScanEntry::File(record(dir.path(), "touched"))], &manifest);
        match &detection.actions[0] {
            ChangeAction::Unchanged { refresh: Some(r), .. } => {
                assert!(r.cached_fingerprint().is_some())
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_same_size_different_content_is_modified() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("a");
        fs::write(&path, vec![b'x'; 100]).unwrap();

        let mut manifest = Manifest::new();
        let mut entry = entry_for(dir.path(), "a");
        entry.mtime_ns += 1;
        manifest.files.insert("a".into(), entry.clone());
        fs::write(&path, vec![b'y'; 100]).unwrap();

        let detection = detect(vec![ScanEntry::File(record(dir.path(), "a"))], &manifest);
        match &detection.actions[0] {
            ChangeAction::Modified { previous, .. } => assert_eq!(*previous, entry.fingerprint),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_unreadable_directory_is_not_a_deletion() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("f"), b"1").unwrap();

        let mut manifest = Manifest::new();
        let entry = entry_for(dir.path(), "f");
        manifest.files.insert("locked/inner/file".into(), entry.clone());
        manifest.files.insert("lockedness".into(), entry);

        let entries = vec![ScanEntry::Skipped {
            path: "locked".into(),
            reason: "Permission denied".into(),
        }];
        let detection = detect(entries, &manifest);

        assert_eq!(
            kinds(&detection),
            vec![
                ("locked/inner/file".to_string(), "unchanged"),
                ("lockedness".to_string(), "deleted"),
            ]
        );
        assert_eq!(detection.skipped.len(), 1);
    }

    #[test]
    fn test_tombstone_reported_as_retained_deletion() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("f"), b"1").unwrap();

        let mut manifest = Manifest::new();
        let mut entry = entry_for(dir.path(), "f");
        entry.retained_at = Some(Utc::now());
        manifest.files.insert("old".into(), entry);

        let detection = detect(Vec::new(), &manifest);
        assert!(matches!(
            detection.actions[0],
            ChangeAction::Deleted { retained: true, .. }
        ));
    }

    #[test]
    fn test_reappeared_tombstone_is_refreshed() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("back"), b"1").unwrap();

        let mut manifest = Manifest::new();
        let mut entry = entry_for(dir.path(), "back");
        entry.retained_at = Some(Utc::now());
        manifest.files.insert("back".into(), entry);

        let detection = detect(vec![ScanEntry::File(record(dir.path(), "back"))], &manifest);
        assert_eq!(kinds(&detection), vec![("back".to_string(), "unchanged+refresh")]);
    }

    #[test]
    fn test_paths_differing_in_case_conflict() {
        let dir = TempDir::new().unwrap();
        for rel in ["Report.txt", "report.txt", "REPORT.TXT", "other.txt"] {
            fs::write(dir.path().join(rel), rel.as_bytes()).unwrap();
        }

        let entries = ["report.txt", "REPORT.TXT", "Report.txt", "other.txt"]
            .into_iter()
            .map(|rel| ScanEntry::File(record(dir.path(), rel)));
        let detection = detect(entries, &Manifest::new());

        assert_eq!(
            kinds(&detection),
            vec![
                ("REPORT.TXT".to_string(), "new"),
                ("Report.txt".to_string(), "conflict"),
                ("other.txt".to_string(), "new"),
                ("report.txt".to_string(), "conflict"),
            ]
        );
        match &detection.actions[1] {
            ChangeAction::CaseConflict { with, .. } => assert_eq!(with, "REPORT.TXT"),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_backed_up_path_keeps_ownership_over_case_variant() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("Report.txt"), b"v1").unwrap();
        fs::write(dir.path().join("report.txt"), b"v2").unwrap();

        let mut manifest = Manifest::new();
        manifest.files.insert("report.txt".into(), entry_for(dir.path(), "report.txt"));

        let entries = ["Report.txt", "report.txt"]
            .into_iter()
            .map(|rel| ScanEntry::File(record(dir.path(), rel)));
        let detection = detect(entries, &manifest);

        assert_eq!(
            kinds(&detection),
            vec![
                ("Report.txt".to_string(), "conflict"),
                ("report.txt".to_string(), "unchanged"),
            ]
        );
    }

    #[test]
    fn test_renamed_case_supersedes_old_entry() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("Report.txt"), b"v1").unwrap();

        let mut manifest = Manifest::new();
        manifest.files.insert("report.txt".into(), entry_for(dir.path(), "Report.txt"));

        let detection = detect(vec![ScanEntry::File(record(dir.path(), "Report.txt"))], &manifest);
        assert_eq!(
            kinds(&detection),
            vec![
                ("report.txt".to_string(), "superseded"),
                ("Report.txt".to_string(), "new"),
            ]
        );
        assert!(!detection.actions[0].needs_remote());
    }

    #[test]
    fn test_is_under_unreadable() {
        let set: HashSet<&str> = ["a/b"].into_iter().collect();
        assert!(is_under_unreadable("a/b", &set));
        assert!(is_under_unreadable("a/b/c/d", &set));
        assert!(!is_under_unreadable("a/bc", &set));
        assert!(!is_under_unreadable("a", &set));

        let root: HashSet<&str> = [""].into_iter().collect();
        assert!(is_under_unreadable("anything", &root));
    }
}
