//! CLI argument definitions using clap derive

use clap::{ArgAction, Parser, ValueEnum};
use std::path::PathBuf;

/// Skip re-running a command when nothing it read or wrote has changed
///
/// Runs COMMAND under a file access tracer and records a content digest of
/// every file it read or wrote. Later runs of the same command line in the
/// same directory are skipped, replaying the recorded output and exit code,
/// as long as every recorded file still has the same contents.
#[derive(Parser, Debug)]
#[command(name = "memoize")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Increase verbosity (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = ArgAction::Count)]
    pub verbose: u8,

    /// Configuration file path
    #[arg(short, long, env = "MEMOIZE_CONFIG")]
    pub config: Option<PathBuf>,

    /// Cache directory (overrides config)
    #[arg(long, env = "MEMOIZE_CACHE_DIR", value_name = "PATH")]
    pub cache_dir: Option<PathBuf>,

    /// Exclude files under PATH from tracking (repeatable)
    #[arg(short = 'i', long = "ignore-dir", value_name = "PATH")]
    pub ignore_dirs: Vec<PathBuf>,

    /// Only track files under PATH (repeatable)
    #[arg(short = 'd', long = "watch-dir", value_name = "PATH")]
    pub watch_dirs: Vec<PathBuf>,

    /// Environment variable that distinguishes invocations (repeatable)
    #[arg(short = 'e', long = "env-key", value_name = "NAME")]
    pub env_keys: Vec<String>,

    /// Fail immediately if the same command is already running
    #[arg(long)]
    pub no_wait: bool,

    /// Do not cache runs that exit non-zero
    #[arg(long)]
    pub skip_failed: bool,

    /// Treat runs that touch no files as cacheable
    #[arg(long)]
    pub cache_empty: bool,

    /// Fail instead of running untracked when tracing is unavailable
    #[arg(long)]
    pub require_tracing: bool,

    /// Do not capture output for replay
    #[arg(long)]
    pub no_capture: bool,

    /// Tracing backend
    #[arg(long, value_enum)]
    pub backend: Option<BackendArg>,

    /// Report whether COMMAND would be skipped, without running it
    #[arg(long, conflicts_with = "forget")]
    pub explain: bool,

    /// Drop the recorded entry for COMMAND
    #[arg(long)]
    pub forget: bool,

    /// Log format
    #[arg(long, value_enum)]
    pub log_format: Option<LogFormat>,

    /// Command to run
    #[arg(last = true, value_name = "COMMAND")]
    pub command: Vec<String>,
}

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    /// Human-readable lines
    Text,
    /// One JSON object per line
    Json,
}

/// Tracing backend selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum BackendArg {
    Auto,
    Strace,
    None,
}
