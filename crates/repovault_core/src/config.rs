//! Process configuration loaded from TOML.
//!
//! # Example
//!
//! ```toml
//! db_path = "/var/lib/repovault/repovault.db"
//! log_level = "info"
//! log_dir = "/var/log/repovault"
//!
//! [worker]
//! count = 4
//! poll_interval_ms = 50
//! name_prefix = "node-a"
//! heartbeat_interval_ms = 5000
//! stale_after_ms = 30000
//! ```
//!
//! # Invariants
//! - Paths are absolute after loading.
//! - `stale_after_ms` is at least twice `heartbeat_interval_ms`.

use crate::logging::default_log_level;
use crate::queue::worker::WorkerConfig;
use serde::{Deserialize, Serialize};
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoreConfig {
    pub db_path: PathBuf,
    #[serde(default = "default_log_level_string")]
    pub log_level: String,
    /// File logging is disabled when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_dir: Option<PathBuf>,
    #[serde(default)]
    pub worker: WorkerSection,
}

/// `[worker]` table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerSection {
    #[serde(default = "default_worker_count")]
    pub count: usize,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_name_prefix")]
    pub name_prefix: String,
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,
    /// Heartbeat age after which a worker's running tasks are failed.
    #[serde(default = "default_stale_after_ms")]
    pub stale_after_ms: u64,
}

fn default_log_level_string() -> String {
    default_log_level().to_string()
}

fn default_worker_count() -> usize {
    2
}

fn default_poll_interval_ms() -> u64 {
    50
}

fn default_name_prefix() -> String {
    "worker".to_string()
}

fn default_heartbeat_interval_ms() -> u64 {
    5_000
}

fn default_stale_after_ms() -> u64 {
    30_000
}

impl Default for WorkerSection {
    fn default() -> Self {
        Self {
            count: default_worker_count(),
            poll_interval_ms: default_poll_interval_ms(),
            name_prefix: default_name_prefix(),
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            stale_after_ms: default_stale_after_ms(),
        }
    }
}

/// Configuration loading errors.
#[derive(Debug)]
pub enum ConfigError {
    Io { path: PathBuf, source: std::io::Error },
    Parse(toml::de::Error),
    Invalid(String),
}

impl Display for ConfigError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io { path, source } => {
                write!(f, "failed to read config `{}`: {source}", path.display())
            }
            Self::Parse(err) => write!(f, "invalid config: {err}"),
            Self::Invalid(message) => write!(f, "invalid config: {message}"),
        }
    }
}

impl Error for ConfigError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Io { source, .. } => Some(source),
            Self::Parse(err) => Some(err),
            Self::Invalid(_) => None,
        }
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(value: toml::de::Error) -> Self {
        Self::Parse(value)
    }
}

impl CoreConfig {
    /// Reads and validates a config file. Relative paths inside it resolve
    /// against the file's directory.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let mut config = Self::from_toml_str(&text)?;
        let base = path.parent().unwrap_or_else(|| Path::new("."));
        config.db_path = absolutize(base, &config.db_path)?;
        if let Some(log_dir) = config.log_dir.take() {
            config.log_dir = Some(absolutize(base, &log_dir)?);
        }
        Ok(config)
    }

    /// Parses and validates config text without touching the filesystem.
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Worker pool settings for non-burst operation.
    pub fn worker_config(&self) -> WorkerConfig {
        WorkerConfig {
            count: self.worker.count,
            poll_interval: Duration::from_millis(self.worker.poll_interval_ms),
            name_prefix: self.worker.name_prefix.trim().to_string(),
            burst: false,
            heartbeat_interval: Duration::from_millis(self.worker.heartbeat_interval_ms),
            stale_after: Duration::from_millis(self.worker.stale_after_ms),
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.db_path.as_os_str().is_empty() {
            return Err(ConfigError::Invalid("db_path cannot be empty".to_string()));
        }
        if self.worker.count == 0 {
            return Err(ConfigError::Invalid(
                "worker.count must be at least 1".to_string(),
            ));
        }
        if self.worker.poll_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "worker.poll_interval_ms must be positive".to_string(),
            ));
        }
        if self.worker.name_prefix.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "worker.name_prefix cannot be empty".to_string(),
            ));
        }
        if self.worker.heartbeat_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "worker.heartbeat_interval_ms must be positive".to_string(),
            ));
        }
        if self.worker.stale_after_ms < self.worker.heartbeat_interval_ms.saturating_mul(2) {
            return Err(ConfigError::Invalid(
                "worker.stale_after_ms must be at least twice worker.heartbeat_interval_ms"
                    .to_string(),
            ));
        }
        Ok(())
    }
}

fn absolutize(base: &Path, path: &Path) -> Result<PathBuf, ConfigError> {
    if path.is_absolute() {
        return Ok(path.to_path_buf());
    }
    let joined = base.join(path);
    if joined.is_absolute() {
        return Ok(joined);
    }
    std::env::current_dir()
        .map(|cwd| cwd.join(joined))
        .map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })
}
