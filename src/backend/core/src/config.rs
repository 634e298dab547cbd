//! Configuration management.
//!
//! Runtime settings for the engine are layered from an optional
//! `queuectl.toml` in the data directory and `QUEUECTL__*` environment
//! variables. Job defaults (`maxRetries`, `backoffBase`) are not part of this
//! file: they live in the persisted `config` collection, see
//! [`crate::jobs::JobDefaults`].

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::Result;
use crate::telemetry::LoggingConfig;

/// Environment variable that overrides the data directory.
pub const DATA_DIR_ENV: &str = "QUEUECTL_DATA_DIR";

/// Name of the optional settings file inside the data directory.
pub const CONFIG_FILE_NAME: &str = "queuectl.toml";

/// Main engine configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct QueueConfig {
    /// Directory holding collections, lock markers and worker logs
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Worker loop settings
    #[serde(default)]
    pub worker: WorkerSettings,

    /// Lock marker settings
    #[serde(default)]
    pub lock: LockSettings,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            worker: WorkerSettings::default(),
            lock: LockSettings::default(),
            logging: LoggingConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct WorkerSettings {
    /// Maximum number of commands in flight per worker process
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// Idle wait between scans when nothing is claimable
    #[serde(default = "default_poll_interval", with = "humantime_serde")]
    pub poll_interval: Duration,

    /// Upper bound on how long a stopping worker waits for in-flight
    /// commands. Unset means it waits for them to finish.
    #[serde(default, with = "humantime_serde")]
    pub shutdown_timeout: Option<Duration>,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            poll_interval: default_poll_interval(),
            shutdown_timeout: None,
        }
    }
}

/// Collection mutex settings. Job claim markers have no age limit: they are
/// reclaimed only once their owner process is gone.
#[derive(Debug, Clone, Deserialize)]
pub struct LockSettings {
    /// Age after which a collection mutex marker is reclaimable
    #[serde(default = "default_collection_stale_after", with = "humantime_serde")]
    pub collection_stale_after: Duration,

    /// How long to wait for a collection mutex before giving up
    #[serde(default = "default_collection_timeout", with = "humantime_serde")]
    pub collection_timeout: Duration,
}

impl Default for LockSettings {
    fn default() -> Self {
        Self {
            collection_stale_after: default_collection_stale_after(),
            collection_timeout: default_collection_timeout(),
        }
    }
}

// Default value functions
fn default_concurrency() -> usize { 4 }
fn default_poll_interval() -> Duration { Duration::from_secs(1) }
fn default_collection_stale_after() -> Duration { Duration::from_secs(30) }
fn default_collection_timeout() -> Duration { Duration::from_secs(10) }

/// Resolve the default data directory.
///
/// `$QUEUECTL_DATA_DIR` wins, then the platform data directory, then `./data`.
pub fn default_data_dir() -> PathBuf {
    if let Ok(dir) = std::env::var(DATA_DIR_ENV) {
        if !dir.trim().is_empty() {
            return PathBuf::from(dir);
        }
    }
    dirs::data_dir()
        .map(|d| d.join("queuectl"))
        .unwrap_or_else(|| PathBuf::from("data"))
}

impl QueueConfig {
    /// Load configuration from the default data directory and environment.
    pub fn load() -> Result<Self> {
        Self::load_from(&default_data_dir())
    }

    /// Load configuration rooted at a specific data directory.
    ///
    /// A `queuectl.toml` inside `data_dir` is optional; `QUEUECTL__*`
    /// variables override it (for example `QUEUECTL__WORKER__CONCURRENCY=8`).
    pub fn load_from(data_dir: &Path) -> Result<Self> {
        let file = data_dir.join(CONFIG_FILE_NAME);
        let config = config::Config::builder()
            .add_source(config::File::from(file).required(false))
            .add_source(config::Environment::with_prefix("QUEUECTL").separator("__"))
            .build()?;

        let mut cfg: QueueConfig = config.try_deserialize()?;
        cfg.data_dir = data_dir.to_path_buf();
        Ok(cfg)
    }

    /// Configuration rooted at `data_dir` with every other field defaulted.
    pub fn with_data_dir(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            ..Self::default()
        }
    }
}
