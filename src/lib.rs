//! memoize - skip re-running commands whose files have not changed
//!
//! Traces a command's file accesses, fingerprints every file it read or
//! wrote, and on the next identical invocation skips execution when all of
//! those fingerprints still match.

pub mod cli;
pub mod config;
pub mod engine;
pub mod error;
pub mod fingerprint;
pub mod invocation;
pub mod monitor;
pub mod paths;
pub mod store;

pub use error::{MemoizeError, MemoizeResult};
