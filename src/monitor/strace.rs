//! strace-backed tracer for Linux
//!
//! Runs the command under `strace -f` writing to a private log file, then
//! replays the log to recover which files the whole process tree touched.

use crate::error::{MemoizeError, MemoizeResult};
use crate::invocation::Invocation;
use crate::monitor::spawn::{self, CaptureSettings};
use crate::monitor::syscall::replay_trace;
use crate::monitor::{AccessedPath, TracedRun, Tracer};
use async_trait::async_trait;
use std::ffi::OsString;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::Command;
use tracing::{debug, info, warn};

/// Syscall classes needed to follow file accesses and working directories
const TRACE_FILTER: &str = "trace=%file,%process,fchdir";

/// Tracer using the `strace` binary
#[derive(Debug, Clone, Default)]
pub struct StraceTracer {
    /// Explicit binary; `None` searches `PATH`
    strace_path: Option<PathBuf>,
}

impl StraceTracer {
    pub fn new(strace_path: Option<PathBuf>) -> Self {
        Self { strace_path }
    }

    /// Find the strace binary
    fn locate(&self) -> Option<PathBuf> {
        match &self.strace_path {
            Some(path) if path.is_file() => Some(path.clone()),
            Some(path) => {
                debug!("Configured strace {} does not exist", path.display());
                None
            }
            None => which::which("strace").ok(),
        }
    }

    /// Check that strace can actually attach here (ptrace may be forbidden
    /// in containers even when the binary is installed).
    async fn probe(strace: &Path) -> bool {
        Command::new(strace)
            .args(["-f", "-qq", "-o", "/dev/null", "-e", "trace=none", "--"])
            .arg(strace)
            .arg("-V")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .map(|s| s.success())
            .unwrap_or(false)
    }

    /// Arguments placed before the traced program
    fn trace_args(log: &Path) -> Vec<OsString> {
        let mut args: Vec<OsString> = ["-f", "-qq", "-y", "-o"]
            .into_iter()
            .map(OsString::from)
            .collect();
        args.push(log.as_os_str().to_os_string());
        for arg in ["-e", TRACE_FILTER, "-e", "signal=none", "--"] {
            args.push(arg.into());
        }
        args
    }
}

#[async_trait]
impl Tracer for StraceTracer {
    async fn ensure_ready(&self) -> MemoizeResult<()> {
        let strace = self.locate().ok_or_else(|| {
            MemoizeError::UnsupportedPlatform("strace is not installed".to_string())
        })?;
        if !Self::probe(&strace).await {
            return Err(MemoizeError::UnsupportedPlatform(format!(
                "{} cannot trace processes here (ptrace denied?)",
                strace.display()
            )));
        }
        debug!("Using {}", strace.display());
        Ok(())
    }

    async fn run(
        &self,
        invocation: &Invocation,
        capture: CaptureSettings,
    ) -> MemoizeResult<TracedRun> {
        let strace = self.locate().ok_or_else(|| {
            MemoizeError::UnsupportedPlatform("strace is not installed".to_string())
        })?;
        // Resolve up front so a missing program is reported as such rather
        // than as a strace failure. strace does its own PATH lookup and keeps
        // argv[0] as given.
        spawn::resolve_program(invocation)?;

        let log = tempfile::Builder::new()
            .prefix("memoize-trace-")
            .suffix(".log")
            .tempfile()
            .map_err(|e| MemoizeError::io("creating trace log", e))?;

        let mut command = Command::new(&strace);
        command
            .args(Self::trace_args(log.path()))
            .arg(invocation.program())
            .args(invocation.args())
            .current_dir(invocation.cwd());

        info!("Tracing: {}", invocation.display_command());
        let outcome = spawn::run_child(command, invocation.program(), capture).await?;

        let path = log.path().to_path_buf();
        let cwd = invocation.cwd().to_path_buf();
        let replayed = tokio::task::spawn_blocking(move || read_trace(&path, &cwd))
            .await
            .map_err(|e| MemoizeError::Internal(format!("trace replay failed: {e}")))?;

        let accesses = match replayed {
            Ok(accesses) => accesses,
            Err(e) => {
                warn!("{}; this run will not be recorded", e);
                return Ok(TracedRun {
                    exit_code: outcome.exit_code,
                    accesses: Vec::new(),
                    output: outcome.output,
                    complete: false,
                });
            }
        };

        debug!("Trace recorded {} accessed paths", accesses.len());
        Ok(TracedRun {
            exit_code: outcome.exit_code,
            accesses,
            output: outcome.output,
            complete: true,
        })
    }

    fn backend_name(&self) -> &'static str {
        "strace"
    }
}

/// Stream the log through the replayer. Blocking; run off the runtime.
fn read_trace(path: &Path, cwd: &Path) -> MemoizeResult<Vec<AccessedPath>> {
    let trace_error =
        |e: std::io::Error| MemoizeError::TraceOutput(format!("{}: {}", path.display(), e));
    let file = std::fs::File::open(path).map_err(trace_error)?;
    let replayed = replay_trace(BufReader::new(file), cwd).map_err(trace_error)?;
    if replayed.calls == 0 {
        return Err(MemoizeError::TraceOutput(
            "strace produced no output".to_string(),
        ));
    }
    Ok(replayed.accesses.into_accessed())
}
