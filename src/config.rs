use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Upstream feed endpoint and fetch behavior
    pub feed: FeedConfig,
    #[serde(default)]
    pub poller: PollerConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
}

/// Configuration for the upstream GTFS-RT feed client
#[derive(Debug, Clone, Deserialize)]
pub struct FeedConfig {
    /// Trip update feed URL. Required.
    pub url: String,
    /// Per-request timeout in seconds (default: 30)
    #[serde(default = "FeedConfig::default_timeout_secs")]
    pub timeout_secs: u64,
    /// Total fetch attempts before giving up (default: 3)
    #[serde(default = "FeedConfig::default_max_retries")]
    pub max_retries: u32,
    /// Base delay for exponential backoff between attempts (default: 1000)
    #[serde(default = "FeedConfig::default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,
}

impl FeedConfig {
    fn default_timeout_secs() -> u64 {
        30
    }
    fn default_max_retries() -> u32 {
        3
    }
    fn default_retry_base_delay_ms() -> u64 {
        1000
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Configuration for the delay poller
#[derive(Debug, Clone, Deserialize)]
pub struct PollerConfig {
    /// Seconds between scheduled polls (default: 30)
    #[serde(default = "PollerConfig::default_interval_secs")]
    pub interval_secs: u64,
    /// Delays at or above this many minutes raise a significant-delay event (default: 60)
    #[serde(default = "PollerConfig::default_significant_delay_minutes")]
    pub significant_delay_minutes: i32,
    /// Consecutive failures before the circuit opens (default: 5)
    #[serde(default = "PollerConfig::default_circuit_breaker_threshold")]
    pub circuit_breaker_threshold: u32,
    /// Seconds the circuit stays open before a half-open probe (default: 60)
    #[serde(default = "PollerConfig::default_circuit_breaker_reset_secs")]
    pub circuit_breaker_reset_secs: u64,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            interval_secs: Self::default_interval_secs(),
            significant_delay_minutes: Self::default_significant_delay_minutes(),
            circuit_breaker_threshold: Self::default_circuit_breaker_threshold(),
            circuit_breaker_reset_secs: Self::default_circuit_breaker_reset_secs(),
        }
    }
}

impl PollerConfig {
    fn default_interval_secs() -> u64 {
        30
    }
    fn default_significant_delay_minutes() -> i32 {
        60
    }
    fn default_circuit_breaker_threshold() -> u32 {
        5
    }
    fn default_circuit_breaker_reset_secs() -> u64 {
        60
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn reset_window(&self) -> Duration {
        Duration::from_secs(self.circuit_breaker_reset_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// SQLite database file path (default: database/delays.db)
    #[serde(default = "DatabaseConfig::default_path")]
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: Self::default_path(),
        }
    }
}

impl DatabaseConfig {
    fn default_path() -> String {
        "database/delays.db".to_string()
    }
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| ConfigError::ReadError(e.to_string()))?;

        serde_yaml::from_str(&content).map_err(|e| ConfigError::ParseError(e.to_string()))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(String),
    #[error("Failed to parse config: {0}")]
    ParseError(String),
}
