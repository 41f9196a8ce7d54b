//! Error types for memoize
//!
//! All modules use `MemoizeResult<T>` as their return type.

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for memoize operations
pub type MemoizeResult<T> = Result<T, MemoizeError>;

/// Exit code for tool-internal failures (also used when tracing is required but unavailable)
pub const EXIT_INTERNAL: u8 = 125;

/// Exit code when the wrapped command exists but cannot be executed
pub const EXIT_NOT_EXECUTABLE: u8 = 126;

/// Exit code when the wrapped command cannot be found
pub const EXIT_NOT_FOUND: u8 = 127;

/// Exit code when another invocation holds the signature lock (fail-fast mode)
pub const EXIT_LOCK_CONTENDED: u8 = 75;

/// Exit code after Ctrl-C terminated the monitored process group
pub const EXIT_INTERRUPTED: u8 = 130;

/// All errors that can occur in memoize
#[derive(Error, Debug)]
pub enum MemoizeError {
    // Tracing errors
    #[error("File access tracing unavailable: {0}")]
    UnsupportedPlatform(String),

    #[error("Tracer output could not be read: {0}")]
    TraceOutput(String),

    // Child process errors
    #[error("Command not found: {0}")]
    CommandNotFound(String),

    #[error("Command is not executable: {program}: {source}")]
    CommandNotExecutable {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("No command given")]
    EmptyCommand,

    #[error("Interrupted, monitored process group terminated")]
    Interrupted,

    // Cache errors
    #[error("Corrupted cache entry {path}: {reason}")]
    CacheCorruption { path: PathBuf, reason: String },

    #[error("Another invocation of this command is running (lock held on {0})")]
    LockContention(PathBuf),

    #[error("Failed to digest {path}: {source}")]
    Digest {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // Configuration errors
    #[error("Invalid configuration at {path}: {reason}")]
    ConfigInvalid { path: PathBuf, reason: String },

    #[error("Invalid value for {key}: {value}")]
    ConfigValue { key: String, value: String },

    // IO errors
    #[error("IO error: {context}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Command failed: {command}")]
    CommandFailed {
        command: String,
        #[source]
        source: std::io::Error,
    },

    // Serialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    // General errors
    #[error("Internal error: {0}")]
    Internal(String),
}

impl MemoizeError {
    /// Create an IO error with context
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    /// Create a command failed error
    pub fn command_failed(command: impl Into<String>, source: std::io::Error) -> Self {
        Self::CommandFailed {
            command: command.into(),
            source,
        }
    }

    /// Process exit code reported for this error
    pub fn exit_code(&self) -> u8 {
        match self {
            Self::CommandNotFound(_) => EXIT_NOT_FOUND,
            Self::CommandNotExecutable { .. } => EXIT_NOT_EXECUTABLE,
            Self::LockContention(_) => EXIT_LOCK_CONTENDED,
            Self::Interrupted => EXIT_INTERRUPTED,
            _ => EXIT_INTERNAL,
        }
    }

    /// Get actionable hint for the error
    pub fn hint(&self) -> Option<&'static str> {
        match self {
            Self::UnsupportedPlatform(_) => {
                Some("Install strace and allow ptrace (kernel.yama.ptrace_scope), or drop --require-tracing")
            }
            Self::LockContention(_) => Some("Wait for the other run to finish, or set [cache] lock = \"wait\""),
            Self::EmptyCommand => Some("Usage: memoize [OPTIONS] -- <COMMAND> [ARGS]..."),
            Self::CacheCorruption { .. } => Some("Run with --forget to drop the entry"),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        let err = MemoizeError::CommandNotFound("frobnicate".to_string());
        assert!(err.to_string().contains("Command not found: frobnicate"));
    }

    #[test]
    fn error_hint() {
        let err = MemoizeError::EmptyCommand;
        assert!(err.hint().unwrap().contains("--"));
        assert!(MemoizeError::Internal("x".into()).hint().is_none());
    }

    #[test]
    fn exit_codes_are_distinct() {
        let not_found = MemoizeError::CommandNotFound("x".into()).exit_code();
        let not_exec = MemoizeError::CommandNotExecutable {
            program: "x".into(),
            source: std::io::Error::from(std::io::ErrorKind::PermissionDenied),
        }
        .exit_code();
        let contended = MemoizeError::LockContention(PathBuf::from("/c/k.lock")).exit_code();
        let internal = MemoizeError::UnsupportedPlatform("macos".into()).exit_code();

        assert_eq!(not_found, EXIT_NOT_FOUND);
        assert_eq!(not_exec, EXIT_NOT_EXECUTABLE);
        assert_eq!(contended, EXIT_LOCK_CONTENDED);
        assert_eq!(internal, EXIT_INTERNAL);
    }
}
