//! Configuration for relay-ledger

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::backoff::{BackoffPolicy, MAX_RECONNECTION_ATTEMPTS, MAX_RETRIES};

/// Default data directory
pub fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("relay-ledger")
}

/// Configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Directory for the local store (queue + ledger)
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Shared team database. Defaults to `shared.db` inside `data_dir`.
    #[serde(default)]
    pub remote_db_path: Option<PathBuf>,

    /// Failed syncs before a completion job is dropped
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// First retry delay for completion jobs
    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,

    /// Consecutive reconnect failures before a listener gives up
    #[serde(default = "default_max_reconnection_attempts")]
    pub max_reconnection_attempts: u32,

    /// First reconnect delay for listeners
    #[serde(default = "default_reconnect_base_delay_ms")]
    pub reconnect_base_delay_ms: u64,

    /// Upper bound for any backoff delay
    #[serde(default = "default_max_backoff_delay_ms")]
    pub max_backoff_delay_ms: u64,

    /// How long a shared-store transaction waits on a competing writer
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,

    /// Buffered team changes per subscriber before it must resubscribe
    #[serde(default = "default_change_feed_capacity")]
    pub change_feed_capacity: usize,

    /// How often a live read checks for commits made by other clients
    #[serde(default = "default_change_poll_interval_ms")]
    pub change_poll_interval_ms: u64,

    /// Buffered completion events per receiver (synced, race lost, ...)
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
}

fn default_max_retries() -> u32 {
    MAX_RETRIES
}

fn default_retry_base_delay_ms() -> u64 {
    1_000
}

fn default_max_reconnection_attempts() -> u32 {
    MAX_RECONNECTION_ATTEMPTS
}

fn default_reconnect_base_delay_ms() -> u64 {
    1_000
}

fn default_max_backoff_delay_ms() -> u64 {
    300_000
}

fn default_busy_timeout_ms() -> u64 {
    5_000
}

fn default_change_feed_capacity() -> usize {
    256
}

fn default_change_poll_interval_ms() -> u64 {
    250
}

fn default_event_capacity() -> usize {
    256
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            remote_db_path: None,
            max_retries: MAX_RETRIES,
            retry_base_delay_ms: 1_000,
            max_reconnection_attempts: MAX_RECONNECTION_ATTEMPTS,
            reconnect_base_delay_ms: 1_000,
            max_backoff_delay_ms: 300_000,
            busy_timeout_ms: 5_000,
            change_feed_capacity: 256,
            change_poll_interval_ms: 250,
            event_capacity: 256,
        }
    }
}

impl Config {
    /// Load config from file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, std::io::Error> {
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
    }

    /// Save config to file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), std::io::Error> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        std::fs::write(path, content)
    }

    /// Local sled database holding the queue and the ledger
    pub fn local_store_path(&self) -> PathBuf {
        self.data_dir.join("local.sled")
    }

    /// Shared team database
    pub fn remote_db_path(&self) -> PathBuf {
        self.remote_db_path
            .clone()
            .unwrap_or_else(|| self.data_dir.join("shared.db"))
    }

    /// Get config file path
    pub fn config_path(&self) -> PathBuf {
        self.data_dir.join("config.toml")
    }

    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }

    pub fn change_poll_interval(&self) -> Duration {
        Duration::from_millis(self.change_poll_interval_ms)
    }

    /// Backoff for completion job retries
    pub fn queue_backoff(&self) -> BackoffPolicy {
        BackoffPolicy::new(
            Duration::from_millis(self.retry_base_delay_ms),
            Duration::from_millis(self.max_backoff_delay_ms),
            self.max_retries,
        )
    }

    /// Backoff for listener reconnects
    pub fn listener_backoff(&self) -> BackoffPolicy {
        BackoffPolicy::new(
            Duration::from_millis(self.reconnect_base_delay_ms),
            Duration::from_millis(self.max_backoff_delay_ms),
            self.max_reconnection_attempts,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_partial_file_uses_defaults() {
        let config: Config = toml::from_str("max_retries = 3\n").unwrap();
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.max_reconnection_attempts, MAX_RECONNECTION_ATTEMPTS);
        assert_eq!(config.queue_backoff().max_attempts, 3);
        assert_eq!(config.listener_backoff().base_delay, Duration::from_secs(1));
        assert_eq!(config.change_poll_interval(), Duration::from_millis(250));
        assert_eq!(config.event_capacity, 256);
    }

    #[test]
    fn test_save_and_load() {
        let temp_dir = TempDir::new().unwrap();
        let config = Config {
            data_dir: temp_dir.path().to_path_buf(),
            ..Default::default()
        };
        config.save(config.config_path()).unwrap();

        let loaded = Config::load(config.config_path()).unwrap();
        assert_eq!(loaded.data_dir, config.data_dir);
        assert_eq!(loaded.remote_db_path(), temp_dir.path().join("shared.db"));
    }
}
