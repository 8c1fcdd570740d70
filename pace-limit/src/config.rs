//! Construction parameters.
//!
//! Limiters never read configuration themselves. An external loader builds
//! these structs (directly or from JSON) and hands them to the constructors,
//! which validate them and fail with [`LimitError::Configuration`].

use std::collections::BTreeMap;
use std::path::Path;
use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;
use serde::Serialize;

use crate::LimitError;

/// Consumption ratio above which a token bucket logs a warning.
pub const DEFAULT_HIGH_WATER: f64 = 0.8;
/// Upper bound on waiting for the cross-process lock.
pub const DEFAULT_LOCK_TIMEOUT_MS: u64 = 5_000;
/// Interval between attempts to take a contended lock.
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 10;

fn default_high_water() -> f64 {
    DEFAULT_HIGH_WATER
}

fn default_lock_timeout_ms() -> u64 {
    DEFAULT_LOCK_TIMEOUT_MS
}

fn default_poll_interval_ms() -> u64 {
    DEFAULT_POLL_INTERVAL_MS
}

fn positive(name: &str, value: f64) -> Result<(), LimitError> {
    if value.is_finite() && value > 0.0 {
        Ok(())
    } else {
        Err(LimitError::config(format!(
            "{name} must be a positive finite number, got {value}"
        )))
    }
}

fn representable(name: &str, secs: f64) -> Result<(), LimitError> {
    Duration::try_from_secs_f64(secs).map(drop).map_err(|_| {
        LimitError::config(format!("{name} of {secs}s is too long to represent"))
    })
}

/// Convert seconds to a `Duration`, clamping negatives and NaN to zero and
/// anything too large to `Duration::MAX`.
pub(crate) fn saturating_secs(secs: f64) -> Duration {
    if secs.is_nan() || secs <= 0.0 {
        return Duration::ZERO;
    }
    Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX)
}

/// Parameters for an in-process [`crate::TokenBucketLimiter`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BucketConfig {
    /// Requests allowed per `per_secs`.
    pub requests: f64,
    /// Length of the rate period in seconds.
    pub per_secs: f64,
    /// Burst capacity (maximum banked tokens).
    pub burst: u32,
    /// Fraction of capacity consumed that triggers a utilisation warning.
    #[serde(default = "default_high_water")]
    pub high_water: f64,
}

impl BucketConfig {
    pub fn new(requests: f64, per: Duration, burst: u32) -> Self {
        Self {
            requests,
            per_secs: per.as_secs_f64(),
            burst,
            high_water: DEFAULT_HIGH_WATER,
        }
    }

    pub fn per_second(requests: f64, burst: u32) -> Self {
        Self::new(requests, Duration::from_secs(1), burst)
    }

    pub fn per_minute(requests: f64, burst: u32) -> Self {
        Self::new(requests, Duration::from_secs(60), burst)
    }

    pub fn with_high_water(mut self, high_water: f64) -> Self {
        self.high_water = high_water;
        self
    }

    /// Tokens added per second.
    pub fn refill_rate(&self) -> f64 {
        self.requests / self.per_secs
    }

    pub fn validate(&self) -> Result<(), LimitError> {
        positive("requests", self.requests)?;
        positive("per_secs", self.per_secs)?;
        positive("refill rate", self.refill_rate())?;
        representable("time per token", 1.0 / self.refill_rate())?;
        if self.burst == 0 {
            return Err(LimitError::config("burst must be at least 1"));
        }
        if !(self.high_water > 0.0 && self.high_water <= 1.0) {
            return Err(LimitError::config(format!(
                "high_water must be in (0, 1], got {}",
                self.high_water
            )));
        }
        Ok(())
    }
}

/// Parameters for a [`crate::CrossProcessCoordinator`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WindowConfig {
    /// Tokens allowed inside any rolling window.
    pub limit: u32,
    /// Window length in seconds.
    pub window_secs: f64,
    /// Shared state file. The lock lives beside it with a `.lock` suffix.
    pub state_path: PathBuf,
    #[serde(default = "default_lock_timeout_ms")]
    pub lock_timeout_ms: u64,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

impl WindowConfig {
    pub fn new(limit: u32, window: Duration, state_path: impl Into<PathBuf>) -> Self {
        Self {
            limit,
            window_secs: window.as_secs_f64(),
            state_path: state_path.into(),
            lock_timeout_ms: DEFAULT_LOCK_TIMEOUT_MS,
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
        }
    }

    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval_ms = u64::try_from(interval.as_millis()).unwrap_or(u64::MAX);
        self
    }

    pub fn window(&self) -> Duration {
        saturating_secs(self.window_secs)
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Path of the advisory lock file guarding `state_path`.
    pub fn lock_path(&self) -> PathBuf {
        let mut name = self.state_path.as_os_str().to_owned();
        name.push(".lock");
        PathBuf::from(name)
    }

    pub fn validate(&self) -> Result<(), LimitError> {
        if self.limit == 0 {
            return Err(LimitError::config("limit must be at least 1"));
        }
        positive("window_secs", self.window_secs)?;
        representable("window_secs", self.window_secs)?;
        if self.state_path.as_os_str().is_empty() {
            return Err(LimitError::config("state_path must not be empty"));
        }
        if self.poll_interval_ms == 0 {
            return Err(LimitError::config("poll_interval_ms must be at least 1"));
        }
        Ok(())
    }
}

/// Parameters for a [`crate::RetryPolicy`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_delay_secs: f64,
    pub max_delay_secs: f64,
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_secs: 1.0,
            max_delay_secs: 60.0,
            jitter: true,
        }
    }
}

impl RetryConfig {
    pub fn validate(&self) -> Result<(), LimitError> {
        if !(self.base_delay_secs.is_finite() && self.base_delay_secs >= 0.0) {
            return Err(LimitError::config(format!(
                "base_delay_secs must be a non-negative finite number, got {}",
                self.base_delay_secs
            )));
        }
        if !(self.max_delay_secs.is_finite() && self.max_delay_secs >= self.base_delay_secs) {
            return Err(LimitError::config(format!(
                "max_delay_secs ({}) must be finite and not less than base_delay_secs ({})",
                self.max_delay_secs, self.base_delay_secs
            )));
        }
        representable("max_delay_secs", self.max_delay_secs)?;
        Ok(())
    }
}

/// Which limiter to build for one logical resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LimiterConfig {
    TokenBucket(BucketConfig),
    CrossProcess(WindowConfig),
}

impl LimiterConfig {
    pub fn validate(&self) -> Result<(), LimitError> {
        match self {
            LimiterConfig::TokenBucket(config) => config.validate(),
            LimiterConfig::CrossProcess(config) => config.validate(),
        }
    }
}

/// One limiter per named resource, plus an optional shared retry policy.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RegistryConfig {
    #[serde(default)]
    pub limiters: BTreeMap<String, LimiterConfig>,
    #[serde(default)]
    pub retry: Option<RetryConfig>,
}

impl RegistryConfig {
    pub fn from_json_str(json: &str) -> Result<Self, LimitError> {
        let config: RegistryConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, LimitError> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|e| LimitError::io(path, e))?;
        Self::from_json_str(&json)
    }

    pub fn validate(&self) -> Result<(), LimitError> {
        for (name, limiter) in &self.limiters {
            limiter
                .validate()
                .map_err(|e| LimitError::config(format!("limiter '{name}': {e}")))?;
        }
        if let Some(retry) = &self.retry {
            retry.validate()?;
        }
        Ok(())
    }
}
