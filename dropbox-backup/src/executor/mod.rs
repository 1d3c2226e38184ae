//! Backup run executor - Orchestrates one incremental backup run.
//!
//! Loads the manifest, scans and diffs the tree on a blocking task, hands the
//! resulting actions to the upload coordinator, then folds the results back
//! into the manifest and saves it once.

pub mod report;

use chrono::Utc;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::detect::{detect, ChangeAction, Detection};
use crate::fs::selection::Selection;
use crate::fs::walker::{normalize_relative, FileRecord, ScanEntry, Scanner, WalkOptions};
use crate::manifest::{Manifest, ManifestEntry, ManifestStore};
use crate::remote::{path_key, remote_path, RemoteStore};
use crate::upload::{UploadCoordinator, UploadOutcome, UploadResult};
use crate::utils::errors::Result;
pub use report::{Plan, RunSummary};

/// Main backup executor
pub struct BackupExecutor {
    config: Config,
    store: Arc<dyn RemoteStore>,
    cancel_token: CancellationToken,
}

impl BackupExecutor {
    /// Create a new backup executor (no external cancellation)
    pub fn new(config: Config, store: Arc<dyn RemoteStore>) -> Self {
        Self::with_cancel(config, store, CancellationToken::new())
    }

    /// Create a new backup executor cancelled by `cancel_token`
    pub fn with_cancel(config: Config, store: Arc<dyn RemoteStore>, cancel_token: CancellationToken) -> Self {
        Self {
            config,
            store,
            cancel_token,
        }
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel_token.clone()
    }

    fn manifest_store(&self) -> ManifestStore {
        ManifestStore::new(self.config.backup.manifest_path.clone())
    }

    /// Load the manifest, discarding it when it describes a different root
    /// or destination: its entries say nothing about what exists there.
    fn load_manifest(&self, store: &ManifestStore) -> Result<Manifest> {
        let manifest = store.load()?;
        let root = &self.config.backup.root;
        let destination = &self.config.remote.destination;

        if let Some(previous) = manifest.root.as_ref().filter(|p| *p != root) {
            warn!(
                "Manifest was written for root {}, not {}; starting a full backup",
                previous.display(),
                root.display()
            );
            return Ok(Manifest::new());
        }
        if let Some(previous) = manifest
            .destination
            .as_deref()
            .filter(|d| !same_destination(d, destination))
        {
            warn!(
                "Manifest was written for destination {}, not {}; starting a full backup",
                previous, destination
            );
            return Ok(Manifest::new());
        }
        Ok(manifest)
    }

    /// Scan and diff without contacting the remote or saving anything
    pub async fn plan(&self) -> Result<Plan> {
        let manifest = self.load_manifest(&self.manifest_store())?;
        let (_, plan) = self.scan_and_detect(manifest).await?;
        Ok(plan)
    }

    /// Execute one backup run
    pub async fn run(&self) -> Result<RunSummary> {
        let start_time = Instant::now();
        let run_id = Uuid::new_v4().to_string();
        let mut summary = RunSummary::new(run_id.clone(), Utc::now());

        info!(
            "Starting backup run {}: {} -> {}",
            run_id,
            self.config.backup.root.display(),
            self.config.remote.destination
        );

        let manifest_store = self.manifest_store();
        let manifest = self.load_manifest(&manifest_store)?;
        let (mut manifest, plan) = self.scan_and_detect(manifest).await?;

        summary.scanned = plan.scanned;
        summary.unchanged = plan.detection.count(|a| matches!(a, ChangeAction::Unchanged { .. }));
        summary.unreadable = plan.detection.skipped.clone();

        let mut refreshes = Vec::new();
        let mut superseded = Vec::new();
        let mut remote_actions = Vec::new();
        for action in plan.detection.actions {
            match action {
                ChangeAction::Unchanged {
                    refresh: Some(record),
                    ..
                } => refreshes.push(record),
                ChangeAction::Unchanged { refresh: None, .. } => {}
                ChangeAction::Superseded { path, by } => superseded.push((path, by)),
                other => remote_actions.push(other),
            }
        }

        let run_token = self.cancel_token.child_token();
        let watchdog = self.config.upload.run_timeout().map(|limit| {
            let token = run_token.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = tokio::time::sleep(limit) => {
                        warn!("Run timeout of {:?} reached, cancelling remaining uploads", limit);
                        token.cancel();
                    }
                    _ = token.cancelled() => {}
                }
            })
        });

        let coordinator = UploadCoordinator::from_config(Arc::clone(&self.store), &self.config);
        let results = coordinator.run(remote_actions, &run_token).await;

        if let Some(watchdog) = watchdog {
            watchdog.abort();
        }
        summary.cancelled = run_token.is_cancelled();

        for record in &refreshes {
            refresh_entry(&mut manifest, record);
        }
        for (path, by) in &superseded {
            info!("Forgetting {}: now backed up as {}", path, by);
            manifest.files.remove(path);
        }
        for result in &results {
            summary.record(result);
            apply_result(&mut manifest, result);
        }

        manifest.updated_at = Some(Utc::now());
        manifest.run_id = Some(run_id);
        manifest.host = hostname::get().ok().map(|h| h.to_string_lossy().into_owned());
        manifest.root = Some(self.config.backup.root.clone());
        manifest.destination = Some(self.config.remote.destination.clone());

        summary.set_duration(start_time.elapsed());
        info!(
            "Backup run {} finished: {} uploaded ({} bytes), {} unchanged, {} deleted, {} retained, {} failed, {} skipped{}",
            summary.run_id,
            summary.uploaded,
            summary.uploaded_bytes,
            summary.unchanged,
            summary.deleted,
            summary.retained,
            summary.failed.len(),
            summary.skipped.len(),
            if summary.cancelled { " (cancelled)" } else { "" }
        );

        if let Err(e) = manifest_store.save(&manifest) {
            error!("Failed to save manifest: {}", e);
            for failed in &summary.failed {
                error!("  {} failed ({}): {}", failed.path, failed.kind, failed.message);
            }
            if summary.uploaded > 0 {
                error!(
                    "{} upload(s) of this run are not recorded and will be repeated next run",
                    summary.uploaded
                );
            }
            return Err(e);
        }
        info!(
            "Manifest saved to {}: {} files",
            manifest_store.path().display(),
            manifest.len()
        );

        Ok(summary)
    }

    /// Scan, select and detect on a blocking task. The manifest is moved in
    /// and handed back.
    async fn scan_and_detect(&self, manifest: Manifest) -> Result<(Manifest, Plan)> {
        let scanner = Scanner::new(self.config.backup.root.clone(), self.walk_options());
        let selection = Selection::from_config(&self.config.selection);

        tokio::task::spawn_blocking(move || -> Result<(Manifest, Plan)> {
            scanner.check_root()?;

            let entries = selection.apply(scanner.scan());
            let scanned = entries
                .iter()
                .filter(|e| matches!(e, ScanEntry::File(_)))
                .count();
            info!(
                "Scanned {}: {} files in backup set",
                scanner.root().display(),
                scanned
            );

            let detection: Detection = detect(entries, &manifest);
            Ok((manifest, Plan { scanned, detection }))
        })
        .await?
    }

    fn walk_options(&self) -> WalkOptions {
        WalkOptions {
            follow_links: self.config.backup.follow_links,
            max_depth: None,
            exclude_patterns: self.config.backup.exclude.clone(),
            exclude_paths: manifest_exclusions(&self.config.backup.root, &self.manifest_store()),
        }
    }
}

/// Relative paths of the manifest and its temp file when they live inside
/// the backup root.
fn manifest_exclusions(root: &Path, store: &ManifestStore) -> Vec<String> {
    let Ok(root) = root.canonicalize() else {
        return Vec::new();
    };

    [store.path().to_path_buf(), store.temp_path()]
        .iter()
        .filter_map(|path| {
            let name = path.file_name()?;
            let parent = match path.parent() {
                Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
                _ => PathBuf::from("."),
            };
            let full = parent.canonicalize().ok()?.join(name);
            full.starts_with(&root).then(|| normalize_relative(&root, &full))
        })
        .collect()
}

/// Destinations name the same Dropbox folder when their normalized paths
/// match case-insensitively.
fn same_destination(a: &str, b: &str) -> bool {
    path_key(&remote_path(a, "")) == path_key(&remote_path(b, ""))
}

/// Touch-without-edit or a reappeared tombstone: adopt the live metadata.
fn refresh_entry(manifest: &mut Manifest, record: &FileRecord) {
    if let Some(entry) = manifest.files.get_mut(&record.relative_path) {
        entry.size = record.size();
        entry.mtime_ns = record.mtime_ns();
        entry.retained_at = None;
    }
}

fn apply_result(manifest: &mut Manifest, result: &UploadResult) {
    match &result.outcome {
        UploadOutcome::Uploaded(file) => {
            manifest.files.insert(
                result.path.clone(),
                ManifestEntry {
                    fingerprint: file.fingerprint.clone(),
                    size: file.size,
                    mtime_ns: file.mtime_ns,
                    uploaded_at: Utc::now(),
                    remote_id: file.remote_id.clone(),
                    remote_rev: file.remote_rev.clone(),
                    retained_at: None,
                },
            );
        }
        UploadOutcome::Deleted => {
            manifest.files.remove(&result.path);
        }
        UploadOutcome::Retained => {
            if let Some(entry) = manifest.files.get_mut(&result.path) {
                entry.retained_at = Some(Utc::now());
            }
        }
        // The previous entry, if any, stays so the path is retried next run.
        UploadOutcome::Failed { .. } | UploadOutcome::Skipped(_) => {}
    }
}
