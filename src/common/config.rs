//! Configuration for minishard components

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Global configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Node ID (unique identifier)
    #[serde(default = "default_node_id")]
    pub node_id: String,

    /// Shard server settings
    #[serde(default)]
    pub server: ServerConfig,

    /// Background range deleter settings
    #[serde(default)]
    pub range_deleter: RangeDeleterConfig,

    /// Split and migration command settings
    #[serde(default)]
    pub split: SplitConfig,

    /// Logging level
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_node_id() -> String {
    "shard-node".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            node_id: default_node_id(),
            server: ServerConfig::default(),
            range_deleter: RangeDeleterConfig::default(),
            split: SplitConfig::default(),
            log_level: default_log_level(),
        }
    }
}

impl Config {
    /// Load configuration from `minishard.toml` (optional) and
    /// `MINISHARD__*` environment variables. Falls back to defaults.
    pub fn load() -> Self {
        match Self::load_from("minishard") {
            Ok(config) => config,
            Err(e) => {
                tracing::warn!("Using default configuration: {}", e);
                Self::default()
            }
        }
    }

    /// Load configuration from the named file (extension optional)
    pub fn load_from(name: &str) -> crate::Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::with_name(name).required(false))
            .add_source(config::Environment::with_prefix("MINISHARD").separator("__"))
            .build()?;
        let config: Config = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> crate::Result<()> {
        if self.range_deleter.batch_size == 0 {
            return Err(crate::Error::InvalidConfig(
                "range_deleter.batch_size must be positive".into(),
            ));
        }
        if self.split.commit_retries == 0 {
            return Err(crate::Error::InvalidConfig(
                "split.commit_retries must be positive".into(),
            ));
        }
        Ok(())
    }
}

/// Shard server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Bind address for the HTTP admin API
    #[serde(default = "default_bind_addr")]
    pub bind_addr: SocketAddr,

    /// RocksDB path for the local metadata store
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

fn default_bind_addr() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 7000))
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("./shard-data")
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            data_dir: default_data_dir(),
        }
    }
}

/// Range deleter driver configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RangeDeleterConfig {
    /// Maximum documents deleted per `clean_up_next_range` step
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Sleep between passes when no queue has pending work
    #[serde(default = "default_idle_interval")]
    pub idle_interval_ms: u64,

    /// Upper bound for the failure backoff
    #[serde(default = "default_max_backoff")]
    pub max_backoff_ms: u64,
}

fn default_batch_size() -> usize {
    128
}
fn default_idle_interval() -> u64 {
    1_000
}
fn default_max_backoff() -> u64 {
    30_000
}

impl Default for RangeDeleterConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            idle_interval_ms: default_idle_interval(),
            max_backoff_ms: default_max_backoff(),
        }
    }
}

impl RangeDeleterConfig {
    pub fn idle_interval(&self) -> Duration {
        Duration::from_millis(self.idle_interval_ms)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms)
    }
}

/// Split / migration command configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SplitConfig {
    /// Single attempt timeout for the collection distributed lock
    #[serde(default = "default_lock_timeout")]
    pub lock_timeout_ms: u64,

    /// Attempts for idempotent config service commands
    #[serde(default = "default_commit_retries")]
    pub commit_retries: usize,

    /// Fixed delay between attempts
    #[serde(default = "default_retry_delay")]
    pub retry_delay_ms: u64,
}

fn default_lock_timeout() -> u64 {
    5_000
}
fn default_commit_retries() -> usize {
    3
}
fn default_retry_delay() -> u64 {
    100
}

impl Default for SplitConfig {
    fn default() -> Self {
        Self {
            lock_timeout_ms: default_lock_timeout(),
            commit_retries: default_commit_retries(),
            retry_delay_ms: default_retry_delay(),
        }
    }
}

impl SplitConfig {
    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}
