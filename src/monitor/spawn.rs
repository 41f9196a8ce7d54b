//! Child process plumbing shared by every backend
//!
//! The child runs in its own process group so that Ctrl-C can take down the
//! whole tree (tracer and tracees alike). stdout/stderr are forwarded live
//! and captured up to a byte limit.

use crate::error::{MemoizeError, MemoizeResult};
use crate::invocation::Invocation;
use crate::store::CapturedOutput;
use std::future::Future;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::process::{Child, Command};
use tracing::{debug, warn};

/// Grace period between SIGTERM and SIGKILL on interrupt
const TERMINATE_GRACE: Duration = Duration::from_secs(2);

const READ_BUF: usize = 8 * 1024;

/// Output capture limits
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureSettings {
    pub enabled: bool,
    /// Combined stdout+stderr bytes to keep; beyond this nothing is kept
    pub max_bytes: usize,
}

impl Default for CaptureSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            max_bytes: 16 * 1024 * 1024,
        }
    }
}

/// Result of running a child to completion
#[derive(Debug)]
pub struct ChildOutcome {
    pub exit_code: i32,
    /// `None` when capture was disabled or the limit was exceeded
    pub output: Option<CapturedOutput>,
}

/// Locate the program the way `execvp` would, reporting the distinct
/// not-found / not-executable failures.
pub fn resolve_program(invocation: &Invocation) -> MemoizeResult<PathBuf> {
    let program = invocation.program();
    let search = std::env::var_os("PATH");

    match which::which_in(program, search, invocation.cwd()) {
        Ok(path) => Ok(path),
        Err(_) => {
            let candidate = invocation.cwd().join(program);
            if program.contains('/') && candidate.exists() {
                Err(MemoizeError::CommandNotExecutable {
                    program: program.to_string(),
                    source: std::io::Error::from(std::io::ErrorKind::PermissionDenied),
                })
            } else {
                Err(MemoizeError::CommandNotFound(program.to_string()))
            }
        }
    }
}

/// Run the invocation with no tracing at all.
pub async fn run_direct(
    invocation: &Invocation,
    capture: CaptureSettings,
) -> MemoizeResult<ChildOutcome> {
    let program = resolve_program(invocation)?;
    let mut command = Command::new(&program);
    #[cfg(unix)]
    command.arg0(invocation.program());
    command.args(invocation.args());
    command.current_dir(invocation.cwd());
    run_child(command, invocation.program(), capture).await
}

/// Spawn `command`, stream its output, and wait for it.
///
/// On Ctrl-C the child's process group is terminated and
/// `MemoizeError::Interrupted` is returned.
pub async fn run_child(
    command: Command,
    label: &str,
    capture: CaptureSettings,
) -> MemoizeResult<ChildOutcome> {
    run_child_until(command, label, capture, ctrl_c()).await
}

/// Resolves on Ctrl-C; never, if the handler cannot be installed
async fn ctrl_c() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        debug!("Cannot listen for Ctrl-C: {}", e);
        std::future::pending::<()>().await;
    }
}

async fn run_child_until<F>(
    mut command: Command,
    label: &str,
    capture: CaptureSettings,
    interrupt: F,
) -> MemoizeResult<ChildOutcome>
where
    F: Future<Output = ()>,
{
    command
        .stdin(Stdio::inherit())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    #[cfg(unix)]
    command.process_group(0);

    let mut child = command.spawn().map_err(|e| match e.kind() {
        std::io::ErrorKind::NotFound => MemoizeError::CommandNotFound(label.to_string()),
        std::io::ErrorKind::PermissionDenied => MemoizeError::CommandNotExecutable {
            program: label.to_string(),
            source: e,
        },
        _ => MemoizeError::command_failed(label, e),
    })?;
    let pid = child.id();
    debug!("Spawned {} (pid {:?})", label, pid);

    let driven = tokio::select! {
        result = drive(&mut child, capture) => Some(result),
        () = interrupt => None,
    };

    match driven {
        Some(result) => {
            let (status, output) = result?;
            Ok(ChildOutcome {
                exit_code: exit_code(status),
                output,
            })
        }
        None => {
            warn!("Interrupted, terminating {}", label);
            terminate_group(&mut child, pid).await;
            Err(MemoizeError::Interrupted)
        }
    }
}

async fn drive(
    child: &mut Child,
    capture: CaptureSettings,
) -> MemoizeResult<(ExitStatus, Option<CapturedOutput>)> {
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| MemoizeError::Internal("child stdout not piped".into()))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| MemoizeError::Internal("child stderr not piped".into()))?;

    let limit = if capture.enabled { capture.max_bytes } else { 0 };
    let (out, err) = tokio::join!(
        pump(stdout, tokio::io::stdout(), limit),
        pump(stderr, tokio::io::stderr(), limit)
    );
    let out = out.map_err(|e| MemoizeError::io("reading child stdout", e))?;
    let err = err.map_err(|e| MemoizeError::io("reading child stderr", e))?;

    let status = child
        .wait()
        .await
        .map_err(|e| MemoizeError::io("waiting for child", e))?;

    let output = match (capture.enabled, out, err) {
        (true, Some(stdout), Some(stderr)) if stdout.len() + stderr.len() <= capture.max_bytes => {
            Some(CapturedOutput { stdout, stderr })
        }
        (true, ..) => {
            warn!(
                "Output exceeded {} bytes and will not be replayed on later hits",
                capture.max_bytes
            );
            None
        }
        (false, ..) => None,
    };

    Ok((status, output))
}

/// Copy `reader` to `writer`, keeping at most `limit` bytes.
///
/// Returns `None` if more than `limit` bytes went through. Write failures on
/// our side (closed pipe) stop forwarding but keep draining the child.
async fn pump<R, W>(mut reader: R, mut writer: W, limit: usize) -> std::io::Result<Option<Vec<u8>>>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; READ_BUF];
    let mut kept = Some(Vec::new());
    let mut forwarding = true;

    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            break;
        }

        if forwarding {
            if let Err(e) = writer.write_all(&buf[..n]).await.and(writer.flush().await) {
                debug!("Stopped forwarding output: {}", e);
                forwarding = false;
            }
        }

        if let Some(bytes) = kept.as_mut() {
            if bytes.len() + n > limit {
                kept = None;
            } else {
                bytes.extend_from_slice(&buf[..n]);
            }
        }
    }

    Ok(kept)
}

/// Map an exit status to a shell-style code (128 + signal for signal deaths).
pub fn exit_code(status: ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return 128 + signal;
        }
    }
    1
}

async fn terminate_group(child: &mut Child, pid: Option<u32>) {
    #[cfg(unix)]
    if let Some(pid) = pid {
        signal_group(pid, libc::SIGTERM);
        if tokio::time::timeout(TERMINATE_GRACE, child.wait()).await.is_ok() {
            // Leader is gone; stragglers in the group still get SIGKILL
            signal_group(pid, libc::SIGKILL);
            return;
        }
        signal_group(pid, libc::SIGKILL);
    }
    #[cfg(not(unix))]
    let _ = pid;

    let _ = child.kill().await;
    let _ = child.wait().await;
}

#[cfg(unix)]
fn signal_group(pgid: u32, signal: libc::c_int) {
    // SAFETY: kill(2) with a negative pid signals the process group created
    // for this child via process_group(0); it has no memory-safety impact.
    #[allow(unsafe_code)]
    unsafe {
        libc::kill(-(pgid as libc::pid_t), signal);
    }
}
