//! File access monitoring
//!
//! Runs a command and reports every file its process tree read or wrote:
//! - Linux: strace (`-f` follows forks, threads and exec'd children)
//! - Elsewhere: no backend; commands run untracked

pub mod access;
pub mod spawn;
pub mod strace;
pub mod syscall;

pub use access::{AccessSet, AccessedPath, FileRole, PathState};
pub use spawn::{CaptureSettings, ChildOutcome};
pub use strace::StraceTracer;

use crate::error::{MemoizeError, MemoizeResult};
use crate::invocation::Invocation;
use crate::store::CapturedOutput;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

/// Outcome of one monitored execution
#[derive(Debug)]
pub struct TracedRun {
    pub exit_code: i32,
    /// Surviving paths after rename merging, in first-access order
    pub accesses: Vec<AccessedPath>,
    pub output: Option<CapturedOutput>,
    /// False when the trace was lost; such a run must not be recorded
    pub complete: bool,
}

/// Abstract file access monitor
///
/// Implementations must observe the whole process tree, report canonical
/// absolute paths, and must not hide the command's own stdin/stdout/stderr.
#[async_trait]
pub trait Tracer: Send + Sync {
    /// Fail with `UnsupportedPlatform` unless tracing will work
    async fn ensure_ready(&self) -> MemoizeResult<()>;

    /// Run the invocation to completion under the monitor
    async fn run(&self, invocation: &Invocation, capture: CaptureSettings)
        -> MemoizeResult<TracedRun>;

    /// Human-readable backend name
    fn backend_name(&self) -> &'static str;
}

/// Detected platform
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Platform {
    /// Linux - uses strace
    Linux,
    /// No tracing backend
    Unsupported,
}

impl Platform {
    /// Detect the current platform
    pub fn detect() -> Self {
        match std::env::consts::OS {
            "linux" => Platform::Linux,
            _ => Platform::Unsupported,
        }
    }
}

/// Which tracer to use
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    /// Pick the platform's native backend
    #[default]
    Auto,
    Strace,
    /// Never trace; every run is untracked
    None,
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Auto => write!(f, "auto"),
            Self::Strace => write!(f, "strace"),
            Self::None => write!(f, "none"),
        }
    }
}

/// Create the tracer for `backend` on the current platform
pub fn create_tracer(
    backend: Backend,
    strace_path: Option<PathBuf>,
) -> MemoizeResult<Box<dyn Tracer>> {
    match (backend, Platform::detect()) {
        (Backend::None, _) => Err(MemoizeError::UnsupportedPlatform(
            "tracing disabled by configuration".to_string(),
        )),
        (Backend::Auto | Backend::Strace, Platform::Linux) => {
            Ok(Box::new(StraceTracer::new(strace_path)))
        }
        (Backend::Auto | Backend::Strace, Platform::Unsupported) => Err(
            MemoizeError::UnsupportedPlatform(std::env::consts::OS.to_string()),
        ),
    }
}
