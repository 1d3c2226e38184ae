//! Upload coordinator - pushes change actions to the remote store.
//!
//! At most `concurrency` tasks run at once. The submission loop takes a
//! semaphore permit before spawning, so it blocks while the pool is full.
//! Each task reports exactly one [`UploadResult`] over a channel, and the
//! channel is drained only after every task has been joined.

pub mod retry;

use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{Config, DeletionPolicy};
use crate::detect::ChangeAction;
use crate::fs::fingerprint::Fingerprint;
use crate::fs::walker::FileRecord;
use crate::remote::{remote_path, PermanentKind, RemoteError, RemoteFile, RemoteStore, UploadSource};
pub use retry::{RetryOutcome, RetryPolicy};

/// Why an action failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Transient errors persisted past the last attempt
    Transient,
    InvalidPath,
    QuotaExceeded,
    Authentication,
    /// Any other permanent remote rejection
    Remote,
    LocalIo,
    Internal,
}

impl From<&RemoteError> for FailureKind {
    fn from(err: &RemoteError) -> Self {
        match err {
            RemoteError::Transient { .. } => FailureKind::Transient,
            RemoteError::Permanent { kind, .. } => match kind {
                PermanentKind::InvalidPath => FailureKind::InvalidPath,
                PermanentKind::QuotaExceeded => FailureKind::QuotaExceeded,
                PermanentKind::Authentication => FailureKind::Authentication,
                PermanentKind::LocalIo => FailureKind::LocalIo,
                PermanentKind::NotFound | PermanentKind::Other => FailureKind::Remote,
            },
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FailureKind::Transient => "transient",
            FailureKind::InvalidPath => "invalid path",
            FailureKind::QuotaExceeded => "quota exceeded",
            FailureKind::Authentication => "authentication",
            FailureKind::Remote => "remote",
            FailureKind::LocalIo => "local I/O",
            FailureKind::Internal => "internal",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    Cancelled,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::Cancelled => f.write_str("cancelled"),
        }
    }
}

/// A file the remote accepted
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadedFile {
    pub remote_id: String,
    pub remote_rev: Option<String>,
    /// Fingerprint of the bytes that were sent
    pub fingerprint: Fingerprint,
    pub size: u64,
    pub mtime_ns: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UploadOutcome {
    Uploaded(UploadedFile),
    Deleted,
    /// Deleted locally, remote copy kept
    Retained,
    Failed { kind: FailureKind, message: String },
    Skipped(SkipReason),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadResult {
    pub path: String,
    pub outcome: UploadOutcome,
    /// Remote calls made, including retries
    pub attempts: u32,
}

impl UploadResult {
    fn new(path: impl Into<String>, outcome: UploadOutcome, attempts: u32) -> Self {
        Self {
            path: path.into(),
            outcome,
            attempts,
        }
    }

    fn failed(path: impl Into<String>, kind: FailureKind, message: impl Into<String>, attempts: u32) -> Self {
        Self::new(
            path,
            UploadOutcome::Failed {
                kind,
                message: message.into(),
            },
            attempts,
        )
    }

    fn cancelled(path: impl Into<String>, attempts: u32) -> Self {
        Self::new(path, UploadOutcome::Skipped(SkipReason::Cancelled), attempts)
    }

    pub fn is_failure(&self) -> bool {
        matches!(self.outcome, UploadOutcome::Failed { .. })
    }
}

/// Remote work derived from a change action
#[derive(Debug)]
enum Task {
    Upload(FileRecord),
    Delete { path: String, remote_id: String },
}

impl Task {
    fn path(&self) -> &str {
        match self {
            Task::Upload(record) => &record.relative_path,
            Task::Delete { path, .. } => path,
        }
    }
}

/// State shared with every spawned task
struct Worker {
    store: Arc<dyn RemoteStore>,
    destination: String,
    retry: RetryPolicy,
}

pub struct UploadCoordinator {
    worker: Arc<Worker>,
    concurrency: usize,
    deletion: DeletionPolicy,
}

impl UploadCoordinator {
    pub fn new(
        store: Arc<dyn RemoteStore>,
        destination: impl Into<String>,
        concurrency: usize,
        retry: RetryPolicy,
        deletion: DeletionPolicy,
    ) -> Self {
        Self {
            worker: Arc::new(Worker {
                store,
                destination: destination.into(),
                retry,
            }),
            concurrency: concurrency.max(1),
            deletion,
        }
    }

    pub fn from_config(store: Arc<dyn RemoteStore>, config: &Config) -> Self {
        Self::new(
            store,
            config.remote.destination.clone(),
            config.upload.concurrency,
            RetryPolicy::from_config(&config.upload),
            config.upload.deletion,
        )
    }

    /// Execute every action that needs the remote and report one result per
    /// action. `Unchanged` and `Superseded` actions, and deletions already
    /// retained under the retain policy, produce no result.
    pub async fn run(&self, actions: Vec<ChangeAction>, cancel: &CancellationToken) -> Vec<UploadResult> {
        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        let (tx, mut rx) = mpsc::unbounded_channel::<UploadResult>();
        let mut handles: Vec<(String, JoinHandle<()>)> = Vec::new();
        let mut results = Vec::new();

        info!(
            "Starting upload phase: {} actions, concurrency {}",
            actions.len(),
            self.concurrency
        );

        for action in actions {
            let task = match action {
                ChangeAction::Unchanged { .. } | ChangeAction::Superseded { .. } => continue,
                ChangeAction::CaseConflict { path, with } => {
                    warn!("Not uploading {}: it differs only in case from {}", path, with);
                    results.push(UploadResult::failed(
                        path,
                        FailureKind::InvalidPath,
                        format!("differs only in case from {}", with),
                        0,
                    ));
                    continue;
                }
                ChangeAction::New(record) | ChangeAction::Modified { record, .. } => {
                    Task::Upload(record)
                }
                ChangeAction::Deleted {
                    path,
                    remote_id,
                    retained,
                } => match self.deletion {
                    DeletionPolicy::Retain if retained => continue,
                    DeletionPolicy::Retain => {
                        debug!("Retaining remote copy of {}", path);
                        results.push(UploadResult::new(path, UploadOutcome::Retained, 0));
                        continue;
                    }
                    DeletionPolicy::Propagate => Task::Delete { path, remote_id },
                },
            };

            if cancel.is_cancelled() {
                results.push(UploadResult::cancelled(task.path(), 0));
                continue;
            }

            let permit = tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                permit = Arc::clone(&semaphore).acquire_owned() => permit.ok(),
            };
            let Some(permit) = permit else {
                results.push(UploadResult::cancelled(task.path(), 0));
                continue;
            };

            let path = task.path().to_string();
            let worker = Arc::clone(&self.worker);
            let tx = tx.clone();
            let cancel = cancel.clone();

            let handle = tokio::spawn(async move {
                let result = worker.execute(task, &cancel).await;
                drop(permit);
                // The receiver lives until every handle has been joined.
                let _ = tx.send(result);
            });
            handles.push((path, handle));
        }
        drop(tx);

        for (path, handle) in handles {
            if let Err(e) = handle.await {
                warn!("Upload task for {} panicked: {}", path, e);
                results.push(UploadResult::failed(
                    path,
                    FailureKind::Internal,
                    format!("task failed: {}", e),
                    0,
                ));
            }
        }

        while let Some(result) = rx.recv().await {
            results.push(result);
        }

        let failed = results.iter().filter(|r| r.is_failure()).count();
        info!(
            "Upload phase finished: {} results, {} failed",
            results.len(),
            failed
        );
        results
    }
}

impl Worker {
    async fn execute(&self, task: Task, cancel: &CancellationToken) -> UploadResult {
        match task {
            Task::Upload(record) => self.upload(record, cancel).await,
            Task::Delete { path, remote_id } => self.delete(path, remote_id, cancel).await,
        }
    }

    async fn upload(&self, record: FileRecord, cancel: &CancellationToken) -> UploadResult {
        let path = record.relative_path.clone();

        // Detection may already have hashed the file; otherwise hash it now,
        // streaming, so the content is never held in memory.
        let (fingerprint, size) = match record.cached_fingerprint() {
            Some(fp) => (fp.clone(), record.size()),
            None => {
                let local = record.path.clone();
                match tokio::task::spawn_blocking(move || Fingerprint::of_file_with_len(&local)).await {
                    Ok(Ok(hashed)) => hashed,
                    Ok(Err(e)) => {
                        warn!("Cannot read {}: {}", record.path.display(), e);
                        return UploadResult::failed(path, FailureKind::LocalIo, e.to_string(), 0);
                    }
                    Err(e) => {
                        return UploadResult::failed(path, FailureKind::Internal, e.to_string(), 0);
                    }
                }
            }
        };

        let upload_source = UploadSource::new(record.path.clone(), size);
        let source = &upload_source;
        let target_path = remote_path(&self.destination, &path);
        let target = target_path.as_str();
        let client_modified = Some(record.metadata.modified());
        let store = &self.store;
        let expected = &fingerprint;

        let outcome = self
            .retry
            .run(&path, cancel, || async move {
                let file = store.put_file(target, source, client_modified).await?;
                verify_content_hash(&file, expected).map(|()| file)
            })
            .await;

        match outcome {
            RetryOutcome::Succeeded { value, attempts } => {
                info!("Uploaded {} ({} bytes, {} attempt(s))", path, size, attempts);
                let uploaded = UploadedFile {
                    remote_id: value.id,
                    remote_rev: value.rev,
                    fingerprint,
                    size,
                    mtime_ns: record.mtime_ns(),
                };
                UploadResult::new(path, UploadOutcome::Uploaded(uploaded), attempts)
            }
            RetryOutcome::Failed { error, attempts } => {
                warn!("Failed to upload {}: {}", path, error);
                UploadResult::failed(path, FailureKind::from(&error), error.to_string(), attempts)
            }
            RetryOutcome::Cancelled { attempts } => UploadResult::cancelled(path, attempts),
        }
    }

    async fn delete(&self, path: String, remote_id: String, cancel: &CancellationToken) -> UploadResult {
        let store = &self.store;
        let id = remote_id.as_str();

        let outcome = self
            .retry
            .run(&path, cancel, || async move {
                match store.delete_file(id).await {
                    Err(RemoteError::Permanent {
                        kind: PermanentKind::NotFound,
                        ..
                    }) => {
                        debug!("{} was already gone remotely", id);
                        Ok(())
                    }
                    other => other,
                }
            })
            .await;

        match outcome {
            RetryOutcome::Succeeded { attempts, .. } => {
                info!("Deleted remote copy of {}", path);
                UploadResult::new(path, UploadOutcome::Deleted, attempts)
            }
            RetryOutcome::Failed { error, attempts } => {
                warn!("Failed to delete remote copy of {}: {}", path, error);
                UploadResult::failed(path, FailureKind::from(&error), error.to_string(), attempts)
            }
            RetryOutcome::Cancelled { attempts } => UploadResult::cancelled(path, attempts),
        }
    }
}

/// A remote hash that disagrees with what was sent means the body was
/// damaged in transit.
fn verify_content_hash(file: &RemoteFile, expected: &Fingerprint) -> Result<(), RemoteError> {
    match &file.content_hash {
        Some(hash) if hash != expected.as_str() => Err(RemoteError::transient(format!(
            "content hash mismatch: sent {}, remote has {}",
            expected, hash
        ))),
        _ => Ok(()),
    }
}
