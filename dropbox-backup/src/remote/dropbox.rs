//! Dropbox v2 HTTP API client.
//!
//! Files up to [`SINGLE_UPLOAD_LIMIT`] are streamed straight from disk to
//! `files/upload`; larger ones go through an upload session one chunk at a
//! time. HTTP failures are mapped onto the transient / permanent split the
//! upload coordinator retries on.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::header::{AUTHORIZATION, CONTENT_LENGTH, CONTENT_TYPE, RETRY_AFTER};
use reqwest::{Body, StatusCode};
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;
use tokio_util::io::ReaderStream;
use tracing::debug;

use super::{PermanentKind, RemoteError, RemoteFile, RemoteStore, UploadSource};
use crate::config::RemoteConfig;
use crate::utils::errors::{BackupError, Result};

/// Largest body `files/upload` accepts
pub const SINGLE_UPLOAD_LIMIT: u64 = 150 * 1024 * 1024;

/// Chunk size for upload sessions (must be a multiple of 4 MiB)
pub const SESSION_CHUNK_SIZE: u64 = 8 * 1024 * 1024;

const API_ARG_HEADER: &str = "Dropbox-API-Arg";

/// File metadata as returned by upload endpoints
#[derive(Debug, Deserialize)]
struct FileMetadata {
    id: String,
    #[serde(default)]
    rev: Option<String>,
    #[serde(default)]
    content_hash: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SessionStart {
    session_id: String,
}

#[derive(Debug, Clone)]
pub struct DropboxStore {
    client: reqwest::Client,
    token: String,
    api_url: String,
    content_url: String,
    session_threshold: u64,
    chunk_size: u64,
}

impl DropboxStore {
    pub fn new(
        token: impl Into<String>,
        api_url: impl Into<String>,
        content_url: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("dropbox-backup/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| BackupError::Config(format!("cannot build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            token: token.into(),
            api_url: api_url.into().trim_end_matches('/').to_string(),
            content_url: content_url.into().trim_end_matches('/').to_string(),
            session_threshold: SINGLE_UPLOAD_LIMIT,
            chunk_size: SESSION_CHUNK_SIZE,
        })
    }

    pub fn from_config(config: &RemoteConfig) -> Result<Self> {
        Self::new(
            config.token.clone(),
            config.api_url.clone(),
            config.content_url.clone(),
            Duration::from_secs(config.timeout_secs),
        )
    }

    /// Override when upload sessions kick in and their chunk size
    pub fn with_session_threshold(mut self, threshold: u64, chunk_size: u64) -> Self {
        self.session_threshold = threshold;
        self.chunk_size = chunk_size.max(1);
        self
    }

    /// POST to a content endpoint: JSON argument in a header, raw body of
    /// `len` bytes.
    async fn content_call(
        &self,
        endpoint: &str,
        arg: &Value,
        body: Body,
        len: u64,
    ) -> std::result::Result<reqwest::Response, RemoteError> {
        let url = format!("{}/2/{}", self.content_url, endpoint);
        let response = self
            .client
            .post(&url)
            .header(AUTHORIZATION, format!("Bearer {}", self.token))
            .header(API_ARG_HEADER, header_safe_json(arg))
            .header(CONTENT_TYPE, "application/octet-stream")
            .header(CONTENT_LENGTH, len)
            .body(body)
            .send()
            .await
            .map_err(|e| RemoteError::transient(format!("{}: {}", endpoint, e)))?;
        check_status(response).await
    }

    /// POST to an RPC endpoint with a JSON body.
    async fn api_call(
        &self,
        endpoint: &str,
        body: &Value,
    ) -> std::result::Result<reqwest::Response, RemoteError> {
        let url = format!("{}/2/{}", self.api_url, endpoint);
        let response = self
            .client
            .post(&url)
            .header(AUTHORIZATION, format!("Bearer {}", self.token))
            .json(body)
            .send()
            .await
            .map_err(|e| RemoteError::transient(format!("{}: {}", endpoint, e)))?;
        check_status(response).await
    }

    async fn upload_single(
        &self,
        commit: Value,
        source: &UploadSource,
    ) -> std::result::Result<RemoteFile, RemoteError> {
        let reader = source.open().await?;
        let body = Body::wrap_stream(ReaderStream::new(reader));
        let response = self
            .content_call("files/upload", &commit, body, source.size)
            .await?;
        parse_file_metadata(response).await
    }

    /// Send the file in `chunk_size` pieces, holding one chunk in memory.
    async fn upload_session(
        &self,
        commit: Value,
        source: &UploadSource,
    ) -> std::result::Result<RemoteFile, RemoteError> {
        let total = source.size;
        let chunk_size = self.chunk_size;
        let first_len = chunk_size.min(total);
        let mut reader = source.open().await?;

        let first = source.read_chunk(&mut reader, first_len).await?;
        let response = self
            .content_call(
                "files/upload_session/start",
                &json!({ "close": false }),
                Body::from(first),
                first_len,
            )
            .await?;
        let session: SessionStart = response
            .json()
            .await
            .map_err(|e| RemoteError::transient(format!("upload_session/start: {}", e)))?;
        debug!("Opened upload session {} for {} bytes", session.session_id, total);

        // Everything except the final chunk is appended; the final chunk
        // travels with the finish call.
        let last_start = if total > first_len {
            first_len + ((total - first_len - 1) / chunk_size) * chunk_size
        } else {
            first_len
        };

        let mut offset = first_len;
        while offset < last_start {
            let chunk = source.read_chunk(&mut reader, chunk_size).await?;
            self.content_call(
                "files/upload_session/append_v2",
                &json!({
                    "cursor": { "session_id": session.session_id, "offset": offset },
                    "close": false,
                }),
                Body::from(chunk),
                chunk_size,
            )
            .await?;
            offset += chunk_size;
        }

        let rest_len = total - offset;
        let rest = source.read_chunk(&mut reader, rest_len).await?;
        let response = self
            .content_call(
                "files/upload_session/finish",
                &json!({
                    "cursor": { "session_id": session.session_id, "offset": offset },
                    "commit": commit,
                }),
                Body::from(rest),
                rest_len,
            )
            .await?;
        parse_file_metadata(response).await
    }
}

#[async_trait]
impl RemoteStore for DropboxStore {
    async fn put_file(
        &self,
        path: &str,
        source: &UploadSource,
        client_modified: Option<DateTime<Utc>>,
    ) -> std::result::Result<RemoteFile, RemoteError> {
        let mut commit = json!({
            "path": path,
            "mode": "overwrite",
            "autorename": false,
            "mute": true,
        });
        if let Some(modified) = client_modified {
            commit["client_modified"] = json!(modified.format("%Y-%m-%dT%H:%M:%SZ").to_string());
        }

        if source.size > self.session_threshold {
            self.upload_session(commit, source).await
        } else {
            self.upload_single(commit, source).await
        }
    }

    async fn delete_file(&self, remote_id: &str) -> std::result::Result<(), RemoteError> {
        self.api_call("files/delete_v2", &json!({ "path": remote_id }))
            .await
            .map(|_| ())
    }
}

async fn parse_file_metadata(
    response: reqwest::Response,
) -> std::result::Result<RemoteFile, RemoteError> {
    let metadata: FileMetadata = response
        .json()
        .await
        .map_err(|e| RemoteError::transient(format!("unreadable upload response: {}", e)))?;
    Ok(RemoteFile {
        id: metadata.id,
        rev: metadata.rev,
        content_hash: metadata.content_hash,
    })
}

async fn check_status(
    response: reqwest::Response,
) -> std::result::Result<reqwest::Response, RemoteError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let retry_after = response
        .headers()
        .get(RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_secs);
    let body = response.text().await.unwrap_or_default();

    Err(classify_status(status, retry_after, &body))
}

/// Map a non-success HTTP response onto the remote error taxonomy
pub fn classify_status(status: StatusCode, retry_after: Option<Duration>, body: &str) -> RemoteError {
    match status.as_u16() {
        429 => RemoteError::Transient {
            message: format!("rate limited: {}", body.trim()),
            retry_after,
        },
        401 => RemoteError::permanent(PermanentKind::Authentication, body.trim()),
        409 => classify_endpoint_error(body),
        500..=599 => RemoteError::Transient {
            message: format!("HTTP {}: {}", status.as_u16(), body.trim()),
            retry_after,
        },
        _ => RemoteError::permanent(
            PermanentKind::Other,
            format!("HTTP {}: {}", status.as_u16(), body.trim()),
        ),
    }
}

/// Classify a 409 by its `error_summary`, e.g. `path/insufficient_space/..`
fn classify_endpoint_error(body: &str) -> RemoteError {
    let summary = serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|v| v.get("error_summary").and_then(|s| s.as_str()).map(str::to_string))
        .unwrap_or_else(|| body.trim().to_string());

    if summary.contains("too_many_write_operations") {
        return RemoteError::transient(summary);
    }

    let kind = if summary.contains("insufficient_space") {
        PermanentKind::QuotaExceeded
    } else if summary.contains("not_found") {
        PermanentKind::NotFound
    } else if ["malformed_path", "disallowed_name", "conflict", "no_write_permission", "too_long"]
        .iter()
        .any(|needle| summary.contains(needle))
    {
        PermanentKind::InvalidPath
    } else {
        PermanentKind::Other
    };
    RemoteError::permanent(kind, summary)
}

/// Serialize `value` as JSON with every non-ASCII character escaped, as
/// required for the `Dropbox-API-Arg` header.
pub fn header_safe_json(value: &Value) -> String {
    let raw = value.to_string();
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        if c.is_ascii() {
            out.push(c);
        } else {
            let mut units = [0u16; 2];
            for unit in c.encode_utf16(&mut units) {
                out.push_str(&format!("\\u{:04x}", unit));
            }
        }
    }
    out
}
