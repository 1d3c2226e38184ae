//! Remote storage the backup is written to.
//!
//! The engine only needs to put a file and delete a file; everything
//! provider-specific lives behind [`RemoteStore`]. File content is never
//! buffered whole: stores read it from an [`UploadSource`] as they send.

pub mod dropbox;
pub mod memory;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncReadExt, Take};

pub use dropbox::DropboxStore;
pub use memory::MemoryStore;

/// What the remote reports for a stored file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteFile {
    /// Stable identifier, usable for deletion
    pub id: String,

    /// Revision token of this content
    pub rev: Option<String>,

    /// Remote-computed content hash, when the provider reports one
    pub content_hash: Option<String>,
}

/// Why a remote call will not succeed on retry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PermanentKind {
    InvalidPath,
    QuotaExceeded,
    Authentication,
    NotFound,
    /// The local file could not be read while sending it
    LocalIo,
    Other,
}

impl fmt::Display for PermanentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PermanentKind::InvalidPath => "invalid path",
            PermanentKind::QuotaExceeded => "quota exceeded",
            PermanentKind::Authentication => "authentication failed",
            PermanentKind::NotFound => "not found",
            PermanentKind::LocalIo => "local read failed",
            PermanentKind::Other => "rejected",
        };
        f.write_str(s)
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RemoteError {
    /// Likely to succeed on retry (network blip, rate limit, server error)
    #[error("transient remote error: {message}")]
    Transient {
        message: String,
        retry_after: Option<Duration>,
    },

    /// Will not succeed without outside intervention
    #[error("remote error ({kind}): {message}")]
    Permanent { kind: PermanentKind, message: String },
}

impl RemoteError {
    pub fn transient(message: impl Into<String>) -> Self {
        RemoteError::Transient {
            message: message.into(),
            retry_after: None,
        }
    }

    pub fn permanent(kind: PermanentKind, message: impl Into<String>) -> Self {
        RemoteError::Permanent {
            kind,
            message: message.into(),
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, RemoteError::Transient { .. })
    }

    fn local(path: &Path, err: impl fmt::Display) -> Self {
        RemoteError::permanent(PermanentKind::LocalIo, format!("{}: {}", path.display(), err))
    }
}

/// A local file to upload. It is re-opened for every attempt and read no
/// further than `size` bytes, the length its fingerprint covers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadSource {
    pub path: PathBuf,
    pub size: u64,
}

impl UploadSource {
    pub fn new(path: impl Into<PathBuf>, size: u64) -> Self {
        Self {
            path: path.into(),
            size,
        }
    }

    /// Open the file, limited to `size` bytes
    pub async fn open(&self) -> Result<Take<tokio::fs::File>, RemoteError> {
        let file = tokio::fs::File::open(&self.path)
            .await
            .map_err(|e| RemoteError::local(&self.path, e))?;
        Ok(file.take(self.size))
    }

    /// Read exactly `len` bytes from `reader`. A file that ends early was
    /// truncated after it was fingerprinted.
    pub async fn read_chunk<R>(&self, reader: &mut R, len: u64) -> Result<Vec<u8>, RemoteError>
    where
        R: tokio::io::AsyncRead + Unpin,
    {
        let mut buf = Vec::with_capacity(usize::try_from(len).unwrap_or(0));
        (&mut *reader)
            .take(len)
            .read_to_end(&mut buf)
            .await
            .map_err(|e| RemoteError::local(&self.path, e))?;
        if buf.len() as u64 != len {
            return Err(RemoteError::local(
                &self.path,
                format!("file shrank to {} bytes while uploading", buf.len()),
            ));
        }
        Ok(buf)
    }
}

/// Narrow contract the upload coordinator depends on
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Store the content of `source` at `path`, overwriting any previous
    /// version
    async fn put_file(
        &self,
        path: &str,
        source: &UploadSource,
        client_modified: Option<DateTime<Utc>>,
    ) -> Result<RemoteFile, RemoteError>;

    /// Delete the file identified by `remote_id`
    async fn delete_file(&self, remote_id: &str) -> Result<(), RemoteError>;
}

/// Join the destination prefix and a relative path into an absolute remote
/// path with exactly one leading `/` and no doubled separators.
pub fn remote_path(destination: &str, relative: &str) -> String {
    let mut out = String::with_capacity(destination.len() + relative.len() + 2);
    for part in destination
        .split('/')
        .chain(relative.split('/'))
        .filter(|p| !p.is_empty())
    {
        out.push('/');
        out.push_str(part);
    }
    if out.is_empty() {
        out.push('/');
    }
    out
}

/// Key under which Dropbox considers two paths the same file
pub fn path_key(path: &str) -> String {
    path.to_lowercase()
}
