//! Configuration management for memoize

pub mod schema;

pub use schema::{Config, EmptyEntryPolicy};

use crate::error::{MemoizeError, MemoizeResult};
use crate::monitor::{Backend, CaptureSettings};
use crate::paths::{PathFilter, DEFAULT_IGNORED};
use crate::store::LockPolicy;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::debug;

/// Configuration manager
pub struct ConfigManager {
    config_path: PathBuf,
}

impl ConfigManager {
    /// Create a new config manager with default path
    pub fn new() -> Self {
        Self {
            config_path: Self::default_config_path(),
        }
    }

    /// Create a config manager with a custom path
    pub fn with_path(path: PathBuf) -> Self {
        Self { config_path: path }
    }

    /// Get the default config file path
    pub fn default_config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("memoize")
            .join("config.toml")
    }

    /// Get the default cache directory
    pub fn default_cache_dir() -> PathBuf {
        dirs::cache_dir()
            .or_else(dirs::data_local_dir)
            .unwrap_or_else(std::env::temp_dir)
            .join("memoize")
    }

    /// Load configuration, using defaults if the file does not exist
    pub async fn load(&self) -> MemoizeResult<Config> {
        if !self.config_path.exists() {
            debug!("Config file not found, using defaults");
            return Ok(Config::default());
        }

        self.load_from_file(&self.config_path).await
    }

    /// Load configuration from a specific file
    pub async fn load_from_file(&self, path: &Path) -> MemoizeResult<Config> {
        let content = fs::read_to_string(path)
            .await
            .map_err(|e| MemoizeError::io(format!("reading config from {}", path.display()), e))?;

        let config: Config = toml::from_str(&content).map_err(|e| MemoizeError::ConfigInvalid {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        validate(&config)?;
        debug!("Loaded config from {}", path.display());
        Ok(config)
    }
}

impl Default for ConfigManager {
    fn default() -> Self {
        Self::new()
    }
}

fn validate(config: &Config) -> MemoizeResult<()> {
    match config.general.log_format.as_str() {
        "text" | "json" => {}
        other => {
            return Err(MemoizeError::ConfigValue {
                key: "general.log_format".to_string(),
                value: other.to_string(),
            })
        }
    }
    if config.env.keys.iter().any(|k| k.is_empty() || k.contains('=')) {
        return Err(MemoizeError::ConfigValue {
            key: "env.keys".to_string(),
            value: config.env.keys.join(","),
        });
    }
    Ok(())
}

/// Command-line values that take precedence over the file
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub cache_dir: Option<PathBuf>,
    pub ignore_dirs: Vec<PathBuf>,
    pub watch_dirs: Vec<PathBuf>,
    pub env_keys: Vec<String>,
    pub lock: Option<LockPolicy>,
    pub skip_failed: bool,
    pub cache_empty: bool,
    pub require_tracing: bool,
    pub no_capture: bool,
    pub backend: Option<Backend>,
}

/// Fully resolved, immutable settings for one invocation
#[derive(Debug, Clone)]
pub struct Settings {
    pub cache_dir: PathBuf,
    pub filter: PathFilter,
    pub env_keys: Vec<String>,
    pub lock_policy: LockPolicy,
    pub empty_entries: EmptyEntryPolicy,
    pub record_failures: bool,
    pub capture: CaptureSettings,
    pub backend: Backend,
    pub strace_path: Option<PathBuf>,
    pub require_tracing: bool,
}

impl Settings {
    /// Merge `config` with `overrides`.
    ///
    /// Relative directories are taken relative to `cwd`. The cache directory
    /// is created so it can be canonicalized and excluded from tracking.
    pub async fn resolve(config: &Config, overrides: Overrides, cwd: &Path) -> MemoizeResult<Self> {
        let cache_dir = overrides
            .cache_dir
            .or_else(|| config.cache.dir.clone())
            .unwrap_or_else(ConfigManager::default_cache_dir);
        let cache_dir = if cache_dir.is_absolute() {
            cache_dir
        } else {
            cwd.join(cache_dir)
        };
        fs::create_dir_all(&cache_dir).await.map_err(|e| {
            MemoizeError::io(format!("creating cache directory {}", cache_dir.display()), e)
        })?;

        let ignore = DEFAULT_IGNORED
            .iter()
            .map(PathBuf::from)
            .chain(std::iter::once(cache_dir.clone()))
            .chain(config.filter.ignore_dirs.iter().cloned())
            .chain(overrides.ignore_dirs);
        let watch = config
            .filter
            .watch_dirs
            .iter()
            .cloned()
            .chain(overrides.watch_dirs);
        let filter = PathFilter::new(ignore, watch, cwd);

        let mut env_keys = config.env.keys.clone();
        env_keys.extend(overrides.env_keys);
        env_keys.sort();
        env_keys.dedup();

        let empty_entries = if overrides.cache_empty {
            EmptyEntryPolicy::CacheForever
        } else {
            config.cache.empty_entries
        };

        Ok(Self {
            cache_dir,
            filter,
            env_keys,
            lock_policy: overrides.lock.unwrap_or(config.cache.lock),
            empty_entries,
            record_failures: config.cache.record_failures && !overrides.skip_failed,
            capture: CaptureSettings {
                enabled: config.cache.capture_output && !overrides.no_capture,
                max_bytes: config.cache.max_output_bytes,
            },
            backend: overrides.backend.unwrap_or(config.trace.backend),
            strace_path: config.trace.strace_path.clone(),
            require_tracing: config.trace.require || overrides.require_tracing,
        })
    }
}
