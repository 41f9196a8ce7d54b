//! Captured invocations and the signature keys derived from them

use crate::error::{MemoizeError, MemoizeResult};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

/// One request to run a command: argv, working directory and the
/// environment variables that are allowed to influence the cache key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Invocation {
    argv: Vec<String>,
    cwd: PathBuf,
    env: BTreeMap<String, String>,
}

impl Invocation {
    /// Capture an invocation. `cwd` is canonicalized so that runs from a
    /// symlinked path share entries with runs from the real directory.
    pub fn new(
        argv: Vec<String>,
        cwd: &Path,
        env: BTreeMap<String, String>,
    ) -> MemoizeResult<Self> {
        if argv.is_empty() {
            return Err(MemoizeError::EmptyCommand);
        }
        let cwd = cwd.canonicalize().map_err(|e| {
            MemoizeError::io(format!("resolving working directory {}", cwd.display()), e)
        })?;
        Ok(Self { argv, cwd, env })
    }

    /// Capture from the current process: current directory plus the listed
    /// environment variables (unset variables are left out).
    pub fn from_current(argv: Vec<String>, env_keys: &[String]) -> MemoizeResult<Self> {
        let cwd = std::env::current_dir()
            .map_err(|e| MemoizeError::io("getting current directory", e))?;
        let env = env_keys
            .iter()
            .filter_map(|key| std::env::var(key).ok().map(|value| (key.clone(), value)))
            .collect();
        Self::new(argv, &cwd, env)
    }

    pub fn argv(&self) -> &[String] {
        &self.argv
    }

    pub fn program(&self) -> &str {
        &self.argv[0]
    }

    pub fn args(&self) -> &[String] {
        &self.argv[1..]
    }

    pub fn cwd(&self) -> &Path {
        &self.cwd
    }

    /// Shell-style rendering for log lines
    pub fn display_command(&self) -> String {
        self.argv
            .iter()
            .map(|arg| quote(arg))
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Derive the key identifying this invocation's cache entry.
    ///
    /// Every field is length-prefixed so that `["a b"]` and `["a", "b"]`
    /// never collide.
    pub fn signature(&self) -> SignatureKey {
        let mut hasher = Sha256::new();

        hasher.update(b"argv");
        hasher.update((self.argv.len() as u64).to_le_bytes());
        for arg in &self.argv {
            update_field(&mut hasher, arg.as_bytes());
        }

        hasher.update(b"cwd");
        update_field(&mut hasher, self.cwd.to_string_lossy().as_bytes());

        hasher.update(b"env");
        hasher.update((self.env.len() as u64).to_le_bytes());
        for (key, value) in &self.env {
            update_field(&mut hasher, key.as_bytes());
            update_field(&mut hasher, value.as_bytes());
        }

        SignatureKey(hex::encode(hasher.finalize()))
    }
}

fn update_field(hasher: &mut Sha256, bytes: &[u8]) {
    hasher.update((bytes.len() as u64).to_le_bytes());
    hasher.update(bytes);
}

fn quote(arg: &str) -> String {
    let plain = !arg.is_empty()
        && arg
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./=:,+@%".contains(c));
    if plain {
        arg.to_string()
    } else {
        format!("'{}'", arg.replace('\'', r"'\''"))
    }
}

/// Hex SHA-256 identifying one cache entry
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SignatureKey(String);

impl SignatureKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First 12 hex chars, for log lines
    pub fn short(&self) -> &str {
        &self.0[..12.min(self.0.len())]
    }
}

impl fmt::Display for SignatureKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
