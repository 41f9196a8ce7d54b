//! Per-signature advisory locks
//!
//! The lock spans CHECK through RECORD so that two identical invocations can
//! never both execute, nor read an entry the other is about to replace.
//! Locks are `flock(2)` locks on `<cache>/locks/<key>.lock`; the kernel drops
//! them when the holder exits, so a crashed run never wedges the key.

use crate::error::{MemoizeError, MemoizeResult};
use fs4::fs_std::FileExt;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::path::PathBuf;
use tracing::{debug, info};

/// What to do when another invocation holds the lock
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LockPolicy {
    /// Block until the holder finishes
    #[default]
    Wait,
    /// Give up immediately with `LockContention`
    Fail,
}

impl fmt::Display for LockPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Wait => write!(f, "wait"),
            Self::Fail => write!(f, "fail"),
        }
    }
}

/// Held exclusive lock; released on drop
#[derive(Debug)]
pub struct KeyLock {
    _file: File,
    path: PathBuf,
}

impl KeyLock {
    /// Acquire the lock at `path` according to `policy`.
    pub async fn acquire(path: PathBuf, policy: LockPolicy) -> MemoizeResult<Self> {
        tokio::task::spawn_blocking(move || Self::acquire_blocking(path, policy))
            .await
            .map_err(|e| MemoizeError::Internal(format!("lock task failed: {e}")))?
    }

    fn acquire_blocking(path: PathBuf, policy: LockPolicy) -> MemoizeResult<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| {
                MemoizeError::io(format!("creating lock directory {}", parent.display()), e)
            })?;
        }

        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|e| MemoizeError::io(format!("opening lock {}", path.display()), e))?;

        let acquired = FileExt::try_lock_exclusive(&file)
            .map_err(|e| MemoizeError::io(format!("locking {}", path.display()), e))?;

        if !acquired {
            match policy {
                LockPolicy::Fail => return Err(MemoizeError::LockContention(path)),
                LockPolicy::Wait => {
                    info!("Waiting for another run of this command to finish");
                    FileExt::lock_exclusive(&file)
                        .map_err(|e| MemoizeError::io(format!("locking {}", path.display()), e))?;
                }
            }
        }

        debug!("Acquired lock {}", path.display());
        Ok(Self { _file: file, path })
    }

}

impl Drop for KeyLock {
    fn drop(&mut self) {
        debug!("Released lock {}", self.path.display());
    }
}
