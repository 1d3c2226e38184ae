//! Content fingerprints.
//!
//! Uses the Dropbox content hash so a local fingerprint can be compared with
//! the `content_hash` Dropbox reports for an uploaded file: the content is
//! split into 4 MiB blocks, each block is hashed with SHA-256, and the
//! concatenated block digests are hashed again.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::fs::File;
use std::io::Read;
use std::path::Path;

/// Dropbox hashes content in blocks of this size.
pub const BLOCK_SIZE: usize = 4 * 1024 * 1024;

/// Hex-encoded Dropbox content hash of a file's full content.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    /// Wrap an already computed hex digest (e.g. one returned by Dropbox)
    pub fn from_hex(hex: impl Into<String>) -> Self {
        Self(hex.into().to_ascii_lowercase())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Fingerprint an in-memory buffer
    pub fn of_bytes(data: &[u8]) -> Self {
        let mut hasher = ContentHasher::new();
        hasher.update(data);
        hasher.finish()
    }

    /// Fingerprint a file by streaming it block by block
    pub fn of_file(path: &Path) -> std::io::Result<Self> {
        Self::of_file_with_len(path).map(|(fp, _)| fp)
    }

    /// Fingerprint a file and count the bytes the fingerprint covers
    pub fn of_file_with_len(path: &Path) -> std::io::Result<(Self, u64)> {
        let mut file = File::open(path)?;
        let mut hasher = ContentHasher::new();
        let mut buf = vec![0u8; 64 * 1024];
        let mut len = 0u64;
        loop {
            let n = file.read(&mut buf)?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
            len += n as u64;
        }
        Ok((hasher.finish(), len))
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Incremental Dropbox content hasher.
struct ContentHasher {
    overall: Sha256,
    block: Sha256,
    block_len: usize,
}

impl ContentHasher {
    fn new() -> Self {
        Self {
            overall: Sha256::new(),
            block: Sha256::new(),
            block_len: 0,
        }
    }

    fn update(&mut self, mut data: &[u8]) {
        while !data.is_empty() {
            let take = (BLOCK_SIZE - self.block_len).min(data.len());
            self.block.update(&data[..take]);
            self.block_len += take;
            data = &data[take..];

            if self.block_len == BLOCK_SIZE {
                self.flush_block();
            }
        }
    }

    fn flush_block(&mut self) {
        let block = std::mem::replace(&mut self.block, Sha256::new());
        self.overall.update(block.finalize());
        self.block_len = 0;
    }

    fn finish(mut self) -> Fingerprint {
        if self.block_len > 0 {
            self.flush_block();
        }
        Fingerprint(hex::encode(self.overall.finalize()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_empty_content_hashes_no_blocks() {
        // SHA-256 of the empty string: zero blocks were concatenated.
        assert_eq!(
            Fingerprint::of_bytes(b"").as_str(),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn test_single_block_is_hash_of_block_hash() {
        let data = b"hello dropbox";
        let block = Sha256::digest(data);
        let expected = hex::encode(Sha256::digest(block));
        assert_eq!(Fingerprint::of_bytes(data).as_str(), expected);
    }

    #[test]
    fn test_multi_block_boundary() {
        let data = vec![7u8; BLOCK_SIZE + 10];
        let mut concat = Vec::new();
        concat.extend_from_slice(&Sha256::digest(&data[..BLOCK_SIZE]));
        concat.extend_from_slice(&Sha256::digest(&data[BLOCK_SIZE..]));
        let expected = hex::encode(Sha256::digest(&concat));

        assert_eq!(Fingerprint::of_bytes(&data).as_str(), expected);
    }

    #[test]
    fn test_file_and_bytes_agree() -> std::io::Result<()> {
        let data: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
        let mut temp_file = NamedTempFile::new()?;
        temp_file.write_all(&data)?;
        temp_file.flush()?;

        assert_eq!(Fingerprint::of_file(temp_file.path())?, Fingerprint::of_bytes(&data));
        assert_eq!(
            Fingerprint::of_file_with_len(temp_file.path())?,
            (Fingerprint::of_bytes(&data), data.len() as u64)
        );
        Ok(())
    }

    #[test]
    fn test_from_hex_normalizes_case() {
        assert_eq!(Fingerprint::from_hex("ABCD"), Fingerprint::from_hex("abcd"));
    }
}
