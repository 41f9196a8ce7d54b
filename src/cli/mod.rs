//! Command-line interface

pub mod args;
pub mod commands;

pub use args::{BackendArg, Cli, LogFormat};

use crate::config::Overrides;
use crate::monitor::Backend;
use crate::store::LockPolicy;

impl Cli {
    /// Flags that take precedence over the configuration file
    pub fn overrides(&self) -> Overrides {
        Overrides {
            cache_dir: self.cache_dir.clone(),
            ignore_dirs: self.ignore_dirs.clone(),
            watch_dirs: self.watch_dirs.clone(),
            env_keys: self.env_keys.clone(),
            lock: self.no_wait.then_some(LockPolicy::Fail),
            skip_failed: self.skip_failed,
            cache_empty: self.cache_empty,
            require_tracing: self.require_tracing,
            no_capture: self.no_capture,
            backend: self.backend.map(Backend::from),
        }
    }
}

impl From<BackendArg> for Backend {
    fn from(arg: BackendArg) -> Self {
        match arg {
            BackendArg::Auto => Backend::Auto,
            BackendArg::Strace => Backend::Strace,
            BackendArg::None => Backend::None,
        }
    }
}
