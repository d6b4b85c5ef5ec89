//! Configuration for deferral-core.
//!
//! Loaded from TOML. Every section and field has a default, so an empty file
//! (or no file at all) yields a working configuration:
//!
//! ```toml
//! [queue]
//! tick_interval_ms = 16
//! unfreeze_grace_ms = 2000
//!
//! [batch]
//! delay_ms = 300
//! max_batch_size = 50
//! mode = "strict"
//!
//! [undo]
//! default_window_ms = 5000
//! system_id = "undoable_actions"
//!
//! [undo.retry]
//! max_attempts = 1
//!
//! [http]
//! timeout_ms = 10000
//!
//! [logging]
//! level = "info"
//! format = "pretty"
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::logging::LogConfig;
use crate::retry::RetryPolicy;

/// Log output format
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable output
    #[default]
    Pretty,
    /// JSON lines
    Json,
}

impl std::fmt::Display for LogFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pretty => f.write_str("pretty"),
            Self::Json => f.write_str("json"),
        }
    }
}

impl std::str::FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pretty" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            _ => Err(format!(
                "unknown log format: {s}. Expected one of: pretty, json"
            )),
        }
    }
}

/// Countdown queue settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Tick loop resolution. Entries decrement by measured elapsed time, so
    /// this only affects expiry latency and progress smoothness.
    pub tick_interval_ms: u64,
    /// Delay between `unfreeze_all` and countdowns actually resuming.
    pub unfreeze_grace_ms: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: 16,
            unfreeze_grace_ms: 2_000,
        }
    }
}

impl QueueConfig {
    #[must_use]
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    #[must_use]
    pub fn unfreeze_grace(&self) -> Duration {
        Duration::from_millis(self.unfreeze_grace_ms)
    }
}

/// How a coalescer treats a second request for a key that is still pending.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchMode {
    /// Reject the second request with `BatchError::Duplicate`.
    #[default]
    Strict,
    /// Attach the second caller to the pending key; still one fetch per key.
    FanOut,
}

/// Request coalescing settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    /// Debounce window between the first enqueue and the flush.
    pub delay_ms: u64,
    /// Upper bound on keys per bulk call.
    pub max_batch_size: usize,
    pub mode: BatchMode,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            delay_ms: 300,
            max_batch_size: 50,
            mode: BatchMode::Strict,
        }
    }
}

impl BatchConfig {
    #[must_use]
    pub fn delay(&self) -> Duration {
        Duration::from_millis(self.delay_ms)
    }

    #[must_use]
    pub fn with_mode(mut self, mode: BatchMode) -> Self {
        self.mode = mode;
        self
    }
}

/// Executor retry settings (see [`RetryPolicy`]).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Total attempts including the first. 1 disables retry.
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub backoff_factor: f64,
    pub jitter_percent: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 1,
            initial_delay_ms: 250,
            max_delay_ms: 5_000,
            backoff_factor: 2.0,
            jitter_percent: 0.1,
        }
    }
}

impl RetryConfig {
    /// Upper bound on `max_attempts`.
    pub const MAX_ATTEMPTS: u32 = 100;
    /// Upper bound on `backoff_factor`.
    pub const MAX_BACKOFF_FACTOR: f64 = 10.0;

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(1..=Self::MAX_ATTEMPTS).contains(&self.max_attempts) {
            return Err(ConfigError::Invalid(format!(
                "undo.retry.max_attempts must be between 1 and {}",
                Self::MAX_ATTEMPTS
            )));
        }
        if !(1.0..=Self::MAX_BACKOFF_FACTOR).contains(&self.backoff_factor) {
            return Err(ConfigError::Invalid(format!(
                "undo.retry.backoff_factor must be a number between 1 and {}",
                Self::MAX_BACKOFF_FACTOR
            )));
        }
        if !(0.0..=1.0).contains(&self.jitter_percent) {
            return Err(ConfigError::Invalid(
                "undo.retry.jitter_percent must be a number between 0 and 1".to_string(),
            ));
        }
        if self.initial_delay_ms > self.max_delay_ms {
            return Err(ConfigError::Invalid(
                "undo.retry.initial_delay_ms must not exceed max_delay_ms".to_string(),
            ));
        }
        Ok(())
    }

    #[must_use]
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.max_attempts,
            Duration::from_millis(self.initial_delay_ms),
            Duration::from_millis(self.max_delay_ms),
            self.backoff_factor,
            self.jitter_percent,
        )
    }
}

/// Undoable action settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UndoConfig {
    /// Cancellation window used when a request does not specify one.
    pub default_window_ms: u64,
    /// Id the service registers under with the freeze coordinator.
    pub system_id: String,
    pub retry: RetryConfig,
}

impl Default for UndoConfig {
    fn default() -> Self {
        Self {
            default_window_ms: 5_000,
            system_id: "undoable_actions".to_string(),
            retry: RetryConfig::default(),
        }
    }
}

impl UndoConfig {
    #[must_use]
    pub fn default_window(&self) -> Duration {
        Duration::from_millis(self.default_window_ms)
    }
}

/// Bulk endpoint transport settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    pub timeout_ms: u64,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self { timeout_ms: 10_000 }
    }
}

impl HttpConfig {
    #[must_use]
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeferralConfig {
    pub queue: QueueConfig,
    pub batch: BatchConfig,
    pub undo: UndoConfig,
    pub http: HttpConfig,
    pub logging: LogConfig,
}

impl DeferralConfig {
    /// Parse and validate a TOML document.
    pub fn from_toml_str(source: &str) -> Result<Self, ConfigError> {
        let config: Self =
            toml::from_str(source).map_err(|err| ConfigError::Parse(err.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load, parse and validate a TOML file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let source = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        let config = Self::from_toml_str(&source)?;
        tracing::debug!(path = %path.display(), "Loaded deferral config");
        Ok(config)
    }

    /// Serialize back to TOML.
    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(|err| ConfigError::Parse(err.to_string()))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.queue.tick_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "queue.tick_interval_ms must be greater than zero".to_string(),
            ));
        }
        if self.batch.max_batch_size == 0 {
            return Err(ConfigError::Invalid(
                "batch.max_batch_size must be greater than zero".to_string(),
            ));
        }
        if self.undo.system_id.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "undo.system_id must not be empty".to_string(),
            ));
        }
        self.undo.retry.validate()?;
        if self.logging.level.parse::<crate::logging::LogLevel>().is_err() {
            return Err(ConfigError::Invalid(format!(
                "logging.level `{}` is not a known level",
                self.logging.level
            )));
        }
        Ok(())
    }
}
