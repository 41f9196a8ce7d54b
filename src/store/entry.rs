//! Cache entry records

use crate::fingerprint::Fingerprint;
use crate::invocation::{Invocation, SignatureKey};
use crate::monitor::FileRole;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// On-disk format version; entries with another version are treated as corrupt
pub const ENTRY_VERSION: u32 = 1;

/// One tracked file at the time the entry was recorded
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRecord {
    /// Canonical absolute path
    #[serde(with = "os_path")]
    pub path: PathBuf,
    /// Content digest, the only basis for "unchanged"
    pub digest: Fingerprint,
    pub role: FileRole,
    /// Size when recorded. Ordering hint only.
    pub size: u64,
    /// Modification time when recorded. Ordering hint only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub modified: Option<DateTime<Utc>>,
}

/// stdout/stderr bytes of the recorded run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapturedOutput {
    #[serde(with = "hex_bytes")]
    pub stdout: Vec<u8>,
    #[serde(with = "hex_bytes")]
    pub stderr: Vec<u8>,
}

mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let text = String::deserialize(deserializer)?;
        hex::decode(text).map_err(serde::de::Error::custom)
    }
}

/// Paths are plain strings when they are UTF-8 and `{"hex": ...}` of the
/// raw bytes otherwise.
mod os_path {
    use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
    use std::path::{Path, PathBuf};

    #[derive(Serialize, Deserialize)]
    #[serde(untagged)]
    enum Repr {
        Text(String),
        Raw { hex: String },
    }

    pub fn serialize<S: Serializer>(path: &Path, serializer: S) -> Result<S::Ok, S::Error> {
        match path.to_str() {
            Some(text) => serializer.serialize_str(text),
            None => Repr::Raw {
                hex: hex::encode(raw_bytes(path)),
            }
            .serialize(serializer),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<PathBuf, D::Error> {
        match Repr::deserialize(deserializer)? {
            Repr::Text(text) => Ok(PathBuf::from(text)),
            Repr::Raw { hex } => hex::decode(hex)
                .map(from_raw_bytes)
                .map_err(de::Error::custom),
        }
    }

    #[cfg(unix)]
    fn raw_bytes(path: &Path) -> Vec<u8> {
        use std::os::unix::ffi::OsStrExt;
        path.as_os_str().as_bytes().to_vec()
    }

    #[cfg(not(unix))]
    fn raw_bytes(path: &Path) -> Vec<u8> {
        path.to_string_lossy().into_owned().into_bytes()
    }

    #[cfg(unix)]
    fn from_raw_bytes(bytes: Vec<u8>) -> PathBuf {
        use std::os::unix::ffi::OsStringExt;
        PathBuf::from(std::ffi::OsString::from_vec(bytes))
    }

    #[cfg(not(unix))]
    fn from_raw_bytes(bytes: Vec<u8>) -> PathBuf {
        PathBuf::from(String::from_utf8_lossy(&bytes).into_owned())
    }
}

/// Everything remembered about one signature key
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub version: u32,
    pub key: SignatureKey,
    /// Recorded for `--explain` and debugging; the key is authoritative
    pub command: Vec<String>,
    #[serde(with = "os_path")]
    pub cwd: PathBuf,
    /// Sorted by path, one record per path
    pub files: Vec<FileRecord>,
    pub exit_code: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<CapturedOutput>,
    pub recorded_at: DateTime<Utc>,
}

impl CacheEntry {
    /// Build an entry for `invocation`
    pub fn new(
        invocation: &Invocation,
        mut files: Vec<FileRecord>,
        exit_code: i32,
        output: Option<CapturedOutput>,
    ) -> Self {
        files.sort_by(|a, b| a.path.cmp(&b.path));
        files.dedup_by(|a, b| a.path == b.path);

        Self {
            version: ENTRY_VERSION,
            key: invocation.signature(),
            command: invocation.argv().to_vec(),
            cwd: invocation.cwd().to_path_buf(),
            files,
            exit_code,
            output,
            recorded_at: Utc::now(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}
