//! Configuration management for TrinityChain block synchronization

use serde::Deserialize;
use std::fs;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub sync: SyncConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SyncConfig {
    /// A peer is a sync candidate when its height is at least local height
    /// plus this margin.
    #[serde(default = "default_candidate_height_margin")]
    pub candidate_height_margin: u64,
    #[serde(default = "default_max_headers_per_batch")]
    pub max_headers_per_batch: usize,
    #[serde(default = "default_max_in_flight_per_peer")]
    pub max_in_flight_per_peer: usize,
    #[serde(default = "default_max_blocks_in_flight")]
    pub max_blocks_in_flight: usize,
    /// How many pending headers ahead of the chain tip may have their blocks
    /// requested.
    #[serde(default = "default_download_window")]
    pub download_window: usize,
    #[serde(default = "default_request_timeout_secs")]
    pub header_request_timeout_secs: u64,
    #[serde(default = "default_request_timeout_secs")]
    pub block_request_timeout_secs: u64,
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,
    #[serde(default = "default_max_orphans")]
    pub max_orphans: usize,
    #[serde(default = "default_orphan_ttl_secs")]
    pub orphan_ttl_secs: u64,
    #[serde(default = "default_max_strikes")]
    pub max_stalls: u32,
    #[serde(default = "default_max_strikes")]
    pub max_rejects: u32,
    #[serde(default = "default_no_retry_capacity")]
    pub no_retry_capacity: usize,
    #[serde(default = "default_rejected_cache_capacity")]
    pub rejected_cache_capacity: usize,
    #[serde(default = "default_event_queue_capacity")]
    pub event_queue_capacity: usize,
    #[serde(default = "default_progress_log_interval_secs")]
    pub progress_log_interval_secs: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            candidate_height_margin: default_candidate_height_margin(),
            max_headers_per_batch: default_max_headers_per_batch(),
            max_in_flight_per_peer: default_max_in_flight_per_peer(),
            max_blocks_in_flight: default_max_blocks_in_flight(),
            download_window: default_download_window(),
            header_request_timeout_secs: default_request_timeout_secs(),
            block_request_timeout_secs: default_request_timeout_secs(),
            tick_interval_ms: default_tick_interval_ms(),
            max_orphans: default_max_orphans(),
            orphan_ttl_secs: default_orphan_ttl_secs(),
            max_stalls: default_max_strikes(),
            max_rejects: default_max_strikes(),
            no_retry_capacity: default_no_retry_capacity(),
            rejected_cache_capacity: default_rejected_cache_capacity(),
            event_queue_capacity: default_event_queue_capacity(),
            progress_log_interval_secs: default_progress_log_interval_secs(),
        }
    }
}

impl SyncConfig {
    pub fn header_request_timeout(&self) -> Duration {
        Duration::from_secs(self.header_request_timeout_secs)
    }

    pub fn block_request_timeout(&self) -> Duration {
        Duration::from_secs(self.block_request_timeout_secs)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    pub fn orphan_ttl(&self) -> Duration {
        Duration::from_secs(self.orphan_ttl_secs)
    }

    pub fn progress_log_interval(&self) -> Duration {
        Duration::from_secs(self.progress_log_interval_secs)
    }

    /// Reject values that would stall or disable synchronization.
    pub fn validate(&self) -> Result<(), String> {
        if self.max_headers_per_batch == 0 {
            return Err("sync.max_headers_per_batch must be greater than zero".to_string());
        }
        if self.max_in_flight_per_peer == 0 || self.max_blocks_in_flight == 0 {
            return Err("sync in-flight limits must be greater than zero".to_string());
        }
        if self.download_window == 0 {
            return Err("sync.download_window must be greater than zero".to_string());
        }
        if self.tick_interval_ms == 0 {
            return Err("sync.tick_interval_ms must be greater than zero".to_string());
        }
        if self.header_request_timeout_secs == 0 || self.block_request_timeout_secs == 0 {
            return Err("sync request timeouts must be greater than zero".to_string());
        }
        if self.event_queue_capacity == 0 {
            return Err("sync.event_queue_capacity must be greater than zero".to_string());
        }
        if self.max_stalls == 0 || self.max_rejects == 0 {
            return Err("sync.max_stalls and sync.max_rejects must be greater than zero".to_string());
        }
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

/// Load `config.toml` from the working directory.
pub fn load_config() -> Result<Config, Box<dyn std::error::Error>> {
    load_config_from("config.toml")
}

/// Load configuration from `path`, falling back to defaults when the file is
/// absent or empty.
pub fn load_config_from(path: impl AsRef<Path>) -> Result<Config, Box<dyn std::error::Error>> {
    let config_str = fs::read_to_string(path.as_ref()).unwrap_or_default();
    let config: Config = if config_str.trim().is_empty() {
        Config::default()
    } else {
        toml::from_str(&config_str)?
    };

    config.sync.validate()?;

    if config.logging.level.parse::<tracing::Level>().is_err() {
        return Err(format!("logging.level '{}' is not a valid level", config.logging.level).into());
    }

    Ok(config)
}

fn default_candidate_height_margin() -> u64 {
    1
}

fn default_max_headers_per_batch() -> usize {
    2000
}

fn default_max_in_flight_per_peer() -> usize {
    16
}

fn default_max_blocks_in_flight() -> usize {
    256
}

fn default_download_window() -> usize {
    1024
}

fn default_request_timeout_secs() -> u64 {
    30
}

fn default_tick_interval_ms() -> u64 {
    1000
}

fn default_max_orphans() -> usize {
    100
}

fn default_orphan_ttl_secs() -> u64 {
    3600
}

fn default_max_strikes() -> u32 {
    3
}

fn default_no_retry_capacity() -> usize {
    256
}

fn default_rejected_cache_capacity() -> usize {
    1024
}

fn default_event_queue_capacity() -> usize {
    1024
}

fn default_progress_log_interval_secs() -> u64 {
    10
}

fn default_log_level() -> String {
    "info".to_string()
}
