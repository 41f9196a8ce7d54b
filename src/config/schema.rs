//! Configuration schema for memoize
//!
//! Configuration is stored at `~/.config/memoize/config.toml`

use crate::monitor::Backend;
use crate::store::LockPolicy;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

/// Default cap on captured stdout+stderr per entry (16 MiB)
pub const DEFAULT_MAX_OUTPUT_BYTES: usize = 16 * 1024 * 1024;

/// Root configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// General settings
    pub general: GeneralConfig,

    /// Cache entry settings
    pub cache: CacheConfig,

    /// Tracing backend settings
    pub trace: TraceConfig,

    /// Path filtering
    pub filter: FilterConfig,

    /// Environment variables that distinguish invocations
    pub env: EnvConfig,
}

/// General application settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Log format: "text" or "json"
    pub log_format: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_format: "text".to_string(),
        }
    }
}

/// Policy for entries that track no files at all
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EmptyEntryPolicy {
    /// Nothing to verify, so never a hit
    #[default]
    AlwaysRun,
    /// Hit whenever an entry exists
    CacheForever,
}

impl fmt::Display for EmptyEntryPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AlwaysRun => write!(f, "always-run"),
            Self::CacheForever => write!(f, "cache-forever"),
        }
    }
}

/// Cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Cache directory (default: platform cache dir + "memoize")
    pub dir: Option<PathBuf>,

    /// Behavior when the same command is already running: "wait" or "fail"
    pub lock: LockPolicy,

    /// Record entries for non-zero exits (default: true)
    pub record_failures: bool,

    /// "always-run" or "cache-forever"
    pub empty_entries: EmptyEntryPolicy,

    /// Capture stdout/stderr for replay on hits
    pub capture_output: bool,

    /// Largest combined output stored per entry
    pub max_output_bytes: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            dir: None,
            lock: LockPolicy::Wait,
            record_failures: true,
            empty_entries: EmptyEntryPolicy::AlwaysRun,
            capture_output: true,
            max_output_bytes: DEFAULT_MAX_OUTPUT_BYTES,
        }
    }
}

/// Tracing configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TraceConfig {
    /// "auto", "strace" or "none"
    pub backend: Backend,

    /// strace binary (default: found on PATH)
    pub strace_path: Option<PathBuf>,

    /// Fail instead of running untracked when tracing is unavailable
    pub require: bool,
}

/// Path filter configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FilterConfig {
    /// Extra prefixes excluded from tracking (added to /proc, /sys, /dev)
    pub ignore_dirs: Vec<PathBuf>,

    /// When non-empty, only paths under these prefixes are tracked
    pub watch_dirs: Vec<PathBuf>,
}

/// Environment subset configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EnvConfig {
    /// Variables folded into the signature key
    pub keys: Vec<String>,
}

impl Default for EnvConfig {
    fn default() -> Self {
        Self {
            keys: vec!["PATH".to_string()],
        }
    }
}
