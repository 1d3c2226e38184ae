//! In-memory remote store.
//!
//! Keeps uploaded files in a map keyed by [`path_key`] (Dropbox paths are
//! case-insensitive), can be scripted to fail specific paths, and records
//! how many calls were in flight at once.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::io::AsyncReadExt;

use super::{path_key, PermanentKind, RemoteError, RemoteFile, RemoteStore, UploadSource};
use crate::fs::fingerprint::Fingerprint;

/// A file held by [`MemoryStore`]
#[derive(Debug, Clone)]
pub struct StoredObject {
    pub path: String,
    pub id: String,
    pub rev: String,
    pub content: Bytes,
    pub client_modified: Option<DateTime<Utc>>,
}

#[derive(Debug, Default)]
struct State {
    objects: HashMap<String, StoredObject>,
    /// Errors returned, in order, before a path succeeds
    failures: HashMap<String, VecDeque<RemoteError>>,
    /// Errors returned on every call
    rejected: HashMap<String, RemoteError>,
    puts: Vec<String>,
    deletes: Vec<String>,
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<State>,
    latency: Option<Duration>,
    next_id: AtomicU64,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

/// Decrements the in-flight counter when a call finishes
struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay every call by `latency` so concurrent calls overlap
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Make the next calls for `path` fail with `errors`, in order
    pub fn fail_path(&self, path: &str, errors: impl IntoIterator<Item = RemoteError>) {
        let mut state = self.lock();
        state
            .failures
            .entry(path_key(path))
            .or_default()
            .extend(errors);
    }

    /// Make every call for `path` fail permanently with `kind`
    pub fn reject_path(&self, path: &str, kind: PermanentKind) {
        self.lock().rejected.insert(
            path_key(path),
            RemoteError::permanent(kind, "scripted rejection"),
        );
    }

    pub fn get(&self, path: &str) -> Option<StoredObject> {
        self.lock().objects.get(&path_key(path)).cloned()
    }

    pub fn paths(&self) -> Vec<String> {
        let mut paths: Vec<_> = self.lock().objects.values().map(|o| o.path.clone()).collect();
        paths.sort();
        paths
    }

    /// Store `content` at `path` directly, bypassing scripted failures
    pub fn insert(&self, path: &str, content: impl Into<Bytes>) -> RemoteFile {
        let mut state = self.lock();
        self.store_object(&mut state, path, content.into(), None)
    }

    /// Every put attempt, successful or not, in call order
    pub fn put_calls(&self) -> Vec<String> {
        self.lock().puts.clone()
    }

    pub fn delete_calls(&self) -> Vec<String> {
        self.lock().deletes.clone()
    }

    /// Highest number of simultaneous calls observed
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        // A panic while holding the lock cannot leave the maps half-updated.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    async fn enter(&self) -> InFlight<'_> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        let guard = InFlight(&self.in_flight);
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        guard
    }

    fn store_object(
        &self,
        state: &mut State,
        path: &str,
        content: Bytes,
        client_modified: Option<DateTime<Utc>>,
    ) -> RemoteFile {
        let key = path_key(path);
        let n = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let id = match state.objects.get(&key) {
            Some(existing) => existing.id.clone(),
            None => format!("id:{}", n),
        };
        let rev = format!("{:012x}", n);
        let content_hash = Fingerprint::of_bytes(&content).to_string();

        state.objects.insert(
            key,
            StoredObject {
                path: path.to_string(),
                id: id.clone(),
                rev: rev.clone(),
                content,
                client_modified,
            },
        );

        RemoteFile {
            id,
            rev: Some(rev),
            content_hash: Some(content_hash),
        }
    }

    fn scripted_failure(&self, state: &mut State, key: &str) -> Option<RemoteError> {
        if let Some(err) = state.rejected.get(key) {
            return Some(err.clone());
        }
        let queue = state.failures.get_mut(key)?;
        let err = queue.pop_front();
        if queue.is_empty() {
            state.failures.remove(key);
        }
        err
    }
}

#[async_trait]
impl RemoteStore for MemoryStore {
    async fn put_file(
        &self,
        path: &str,
        source: &UploadSource,
        client_modified: Option<DateTime<Utc>>,
    ) -> Result<RemoteFile, RemoteError> {
        let _guard = self.enter().await;
        let mut content = Vec::new();
        source
            .open()
            .await?
            .read_to_end(&mut content)
            .await
            .map_err(|e| RemoteError::permanent(PermanentKind::LocalIo, e.to_string()))?;

        let mut state = self.lock();
        state.puts.push(path.to_string());

        if let Some(err) = self.scripted_failure(&mut state, &path_key(path)) {
            return Err(err);
        }
        Ok(self.store_object(&mut state, path, Bytes::from(content), client_modified))
    }

    async fn delete_file(&self, remote_id: &str) -> Result<(), RemoteError> {
        let _guard = self.enter().await;
        let mut state = self.lock();
        state.deletes.push(remote_id.to_string());

        if let Some(err) = self.scripted_failure(&mut state, &path_key(remote_id)) {
            return Err(err);
        }

        let key = state
            .objects
            .iter()
            .find(|(_, o)| o.id == remote_id)
            .map(|(k, _)| k.clone());
        match key {
            Some(key) => {
                state.objects.remove(&key);
                Ok(())
            }
            None => Err(RemoteError::permanent(
                PermanentKind::NotFound,
                format!("path_lookup/not_found/ {}", remote_id),
            )),
        }
    }
}
