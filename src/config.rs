//! Configuration management for Pacer.

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::FixedOffset;
use serde::{Deserialize, Serialize};

use crate::error::{PacerError, Result};

/// Main configuration for the Pacer service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PacerConfig {
    /// Send pacing and volume caps
    #[serde(default)]
    pub rate_limiting: RateLimitingConfig,

    /// Per-message retry policy
    #[serde(default)]
    pub retry: RetryConfig,

    /// Where persistent state lives
    #[serde(default)]
    pub storage: StorageConfig,

    /// Log output
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Rate limiting configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitingConfig {
    /// Maximum sends within one sliding window
    #[serde(default = "default_hourly_cap")]
    pub hourly_cap: u32,

    /// Maximum sends per calendar day
    #[serde(default = "default_daily_cap")]
    pub daily_cap: u32,

    /// Sliding window length in seconds
    #[serde(default = "default_window_secs")]
    pub window_secs: u64,

    /// Minimum spacing between two sends in milliseconds
    #[serde(default = "default_min_interval_ms")]
    pub min_interval_ms: u64,

    /// Lower bound of the random extra delay in milliseconds
    #[serde(default)]
    pub jitter_min_ms: u64,

    /// Upper bound of the random extra delay in milliseconds
    #[serde(default = "default_jitter_max_ms")]
    pub jitter_max_ms: u64,

    /// UTC offset used to find midnight for the daily reset.
    /// When unset the host's local time zone is used.
    #[serde(default)]
    pub reset_utc_offset_minutes: Option<i32>,
}

impl Default for RateLimitingConfig {
    fn default() -> Self {
        Self {
            hourly_cap: default_hourly_cap(),
            daily_cap: default_daily_cap(),
            window_secs: default_window_secs(),
            min_interval_ms: default_min_interval_ms(),
            jitter_min_ms: 0,
            jitter_max_ms: default_jitter_max_ms(),
            reset_utc_offset_minutes: None,
        }
    }
}

fn default_hourly_cap() -> u32 {
    60
}

fn default_daily_cap() -> u32 {
    1000
}

fn default_window_secs() -> u64 {
    3600
}

fn default_min_interval_ms() -> u64 {
    2000
}

fn default_jitter_max_ms() -> u64 {
    1000
}

impl RateLimitingConfig {
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }

    pub fn min_interval(&self) -> Duration {
        Duration::from_millis(self.min_interval_ms)
    }

    /// Offset for the daily reset boundary, `None` meaning local time.
    pub fn reset_offset(&self) -> Result<Option<FixedOffset>> {
        match self.reset_utc_offset_minutes {
            None => Ok(None),
            Some(minutes) => FixedOffset::east_opt(minutes * 60).map(Some).ok_or_else(|| {
                PacerError::Config(format!("reset_utc_offset_minutes out of range: {}", minutes))
            }),
        }
    }
}

/// Retry configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Total attempts per message, including the first one
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Backoff before the second attempt in milliseconds
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    /// Backoff growth factor per attempt
    #[serde(default = "default_multiplier")]
    pub multiplier: u32,

    /// Backoff ceiling in milliseconds
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            multiplier: default_multiplier(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

fn default_max_attempts() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    5000
}

fn default_multiplier() -> u32 {
    2
}

fn default_max_delay_ms() -> u64 {
    60_000
}

/// Storage configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Directory for persisted state. In-memory only when unset.
    pub data_dir: Option<PathBuf>,
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter directive, overridden by `RUST_LOG`
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Emit JSON lines instead of human-readable output
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl PacerConfig {
    /// Load configuration from an optional file layered under
    /// `PACER__`-prefixed environment variables.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }
        let config: PacerConfig = builder
            .add_source(
                config::Environment::with_prefix("PACER")
                    .prefix_separator("__")
                    .separator("__"),
            )
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| PacerError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: PacerConfig = serde_yaml::from_str(yaml)
            .map_err(|e| PacerError::Config(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let rl = &self.rate_limiting;
        if rl.hourly_cap == 0 || rl.daily_cap == 0 {
            return Err(PacerError::Config("rate caps must be positive".into()));
        }
        if rl.window_secs == 0 {
            return Err(PacerError::Config("window_secs must be positive".into()));
        }
        if rl.jitter_min_ms > rl.jitter_max_ms {
            return Err(PacerError::Config(format!(
                "jitter_min_ms ({}) exceeds jitter_max_ms ({})",
                rl.jitter_min_ms, rl.jitter_max_ms
            )));
        }
        rl.reset_offset()?;
        if self.retry.max_attempts == 0 {
            return Err(PacerError::Config("max_attempts must be at least 1".into()));
        }
        if self.retry.multiplier == 0 {
            return Err(PacerError::Config("multiplier must be at least 1".into()));
        }
        Ok(())
    }
}
