//! Fingerprint store
//!
//! One JSON document per signature key under the cache directory:
//!
//! ```text
//! <cache>/entries/<key>.json   committed entries
//! <cache>/locks/<key>.lock     per-key advisory locks
//! ```
//!
//! Commits write a temporary file in the entries directory and rename it over
//! the final name, so a lookup sees either the previous entry or the new one,
//! never a partial write.

pub mod entry;
pub mod lock;

pub use entry::{CacheEntry, CapturedOutput, FileRecord, ENTRY_VERSION};
pub use lock::{KeyLock, LockPolicy};

use crate::error::{MemoizeError, MemoizeResult};
use crate::invocation::SignatureKey;
use std::io::Write;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::debug;

const ENTRIES_DIR: &str = "entries";
const LOCKS_DIR: &str = "locks";

/// Persistent map from signature key to cache entry
#[derive(Debug, Clone)]
pub struct FingerprintStore {
    root: PathBuf,
}

impl FingerprintStore {
    /// Open (creating if needed) the store rooted at `root`
    pub async fn open(root: impl Into<PathBuf>) -> MemoizeResult<Self> {
        let root = root.into();
        for dir in [root.join(ENTRIES_DIR), root.join(LOCKS_DIR)] {
            fs::create_dir_all(&dir).await.map_err(|e| {
                MemoizeError::io(format!("creating cache directory {}", dir.display()), e)
            })?;
        }
        Ok(Self { root })
    }

    fn entry_path(&self, key: &SignatureKey) -> PathBuf {
        self.root.join(ENTRIES_DIR).join(format!("{key}.json"))
    }

    fn lock_path(&self, key: &SignatureKey) -> PathBuf {
        self.root.join(LOCKS_DIR).join(format!("{key}.lock"))
    }

    /// Take the exclusive region for `key`
    pub async fn lock(&self, key: &SignatureKey, policy: LockPolicy) -> MemoizeResult<KeyLock> {
        KeyLock::acquire(self.lock_path(key), policy).await
    }

    /// Read the entry for `key`.
    ///
    /// Returns `Ok(None)` when no entry exists and `CacheCorruption` when one
    /// exists but cannot be used.
    pub async fn lookup(&self, key: &SignatureKey) -> MemoizeResult<Option<CacheEntry>> {
        let path = self.entry_path(key);

        let content = match fs::read(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("No cache entry for {}", key.short());
                return Ok(None);
            }
            Err(e) => {
                return Err(MemoizeError::CacheCorruption {
                    path,
                    reason: e.to_string(),
                })
            }
        };

        let entry: CacheEntry =
            serde_json::from_slice(&content).map_err(|e| MemoizeError::CacheCorruption {
                path: path.clone(),
                reason: e.to_string(),
            })?;

        if entry.version != ENTRY_VERSION {
            return Err(MemoizeError::CacheCorruption {
                path,
                reason: format!("unsupported entry version {}", entry.version),
            });
        }
        if &entry.key != key {
            return Err(MemoizeError::CacheCorruption {
                path,
                reason: format!("entry belongs to key {}", entry.key.short()),
            });
        }

        debug!(
            "Loaded cache entry {} ({} files)",
            key.short(),
            entry.files.len()
        );
        Ok(Some(entry))
    }

    /// Atomically replace the entry for `entry.key`.
    pub async fn commit(&self, entry: &CacheEntry) -> MemoizeResult<()> {
        let path = self.entry_path(&entry.key);
        let content = serde_json::to_vec_pretty(entry)?;
        let dir = self.root.join(ENTRIES_DIR);

        tokio::task::spawn_blocking(move || write_atomic(&dir, &path, &content))
            .await
            .map_err(|e| MemoizeError::Internal(format!("commit task failed: {e}")))??;

        debug!("Committed cache entry {}", entry.key.short());
        Ok(())
    }

    /// Delete the entry for `key`; returns whether one existed.
    pub async fn remove(&self, key: &SignatureKey) -> MemoizeResult<bool> {
        let path = self.entry_path(key);
        match fs::remove_file(&path).await {
            Ok(()) => {
                debug!("Removed cache entry {}", key.short());
                Ok(true)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(MemoizeError::io(
                format!("removing cache entry {}", path.display()),
                e,
            )),
        }
    }
}

fn write_atomic(dir: &Path, path: &Path, content: &[u8]) -> MemoizeResult<()> {
    let mut tmp = tempfile::Builder::new()
        .prefix(".entry-")
        .suffix(".tmp")
        .tempfile_in(dir)
        .map_err(|e| MemoizeError::io(format!("creating temp file in {}", dir.display()), e))?;

    tmp.write_all(content)
        .and_then(|()| tmp.as_file().sync_all())
        .map_err(|e| MemoizeError::io(format!("writing {}", tmp.path().display()), e))?;

    tmp.persist(path)
        .map_err(|e| MemoizeError::io(format!("renaming into {}", path.display()), e.error))?;
    Ok(())
}
