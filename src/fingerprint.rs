//! Streaming content fingerprints
//!
//! Files are pushed through SHA-256 in fixed-size chunks so that memory use
//! stays flat no matter how large the tracked files are.

use crate::error::{MemoizeError, MemoizeResult};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::path::Path;
use tokio::fs::File;
use tokio::io::AsyncReadExt;

/// Read size for hashing
pub const CHUNK_SIZE: usize = 64 * 1024;

/// Hex-encoded SHA-256 of a file's contents
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    /// Wrap an already hex-encoded digest
    pub fn from_hex(hex: impl Into<String>) -> Self {
        Self(hex.into())
    }

    /// Hex representation
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First 12 hex chars, for log lines
    pub fn short(&self) -> &str {
        &self.0[..12.min(self.0.len())]
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Digest a file by streaming it through SHA-256.
///
/// A file that vanishes or becomes unreadable part-way through yields
/// `MemoizeError::Digest`; callers decide whether that is fatal.
pub async fn digest(path: &Path) -> MemoizeResult<Fingerprint> {
    let to_err = |source| MemoizeError::Digest {
        path: path.to_path_buf(),
        source,
    };

    let mut file = File::open(path).await.map_err(to_err)?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; CHUNK_SIZE];

    loop {
        let n = file.read(&mut buf).await.map_err(to_err)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }

    Ok(Fingerprint(hex::encode(hasher.finalize())))
}
