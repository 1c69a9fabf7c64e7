//! # Resilience Policy Configuration
//!
//! Plain configuration records for the per-dependency resilience primitives:
//! rate limiting, retry/backoff and circuit breaking. Behavioural hooks (the
//! retryable predicate and the on-retry observer) are attached to the
//! [`Retrier`](crate::resilience::Retrier) itself since they are not data.

use crate::config::{ConfigResult, ConfigurationError};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Backoff strategy used between retry attempts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// `base_delay * backoff_factor^attempt`
    Exponential,
    /// `base_delay * (attempt + 1)`
    Linear,
    /// `base_delay`
    Fixed,
    /// `base_delay * fib(attempt + 2)`
    Fibonacci,
}

/// Retry policy for a protected dependency
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Maximum number of attempts, including the first one
    pub max_attempts: u32,

    /// Delay unit all strategies scale from
    #[serde(with = "duration_millis")]
    pub base_delay: Duration,

    /// Upper bound applied to every computed delay
    #[serde(with = "duration_millis")]
    pub max_delay: Duration,

    /// Growth factor for the exponential strategy
    pub backoff_factor: f64,

    pub strategy: BackoffStrategy,

    /// Jitter fraction (0.0-1.0). A value of 0.1 means ±10% randomness.
    pub jitter: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            backoff_factor: 2.0,
            strategy: BackoffStrategy::Exponential,
            jitter: 0.0,
        }
    }
}

impl RetryConfig {
    /// Policy that runs the operation exactly once
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    pub fn with_backoff_factor(mut self, factor: f64) -> Self {
        self.backoff_factor = factor;
        self
    }

    pub fn with_strategy(mut self, strategy: BackoffStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    /// Set the jitter fraction, clamped to 0.0-1.0
    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    /// Validate configuration parameters
    pub fn validate(&self) -> ConfigResult<()> {
        if self.max_attempts == 0 {
            return Err(ConfigurationError::invalid_value(
                "retry.max_attempts",
                self.max_attempts,
                "must be at least 1",
            ));
        }

        if self.max_delay < self.base_delay {
            return Err(ConfigurationError::invalid_value(
                "retry.max_delay",
                format!("{:?}", self.max_delay),
                "must not be smaller than base_delay",
            ));
        }

        if !self.backoff_factor.is_finite() || self.backoff_factor < 1.0 {
            return Err(ConfigurationError::invalid_value(
                "retry.backoff_factor",
                self.backoff_factor,
                "must be a finite number >= 1.0",
            ));
        }

        if !(0.0..=1.0).contains(&self.jitter) {
            return Err(ConfigurationError::invalid_value(
                "retry.jitter",
                self.jitter,
                "must be within 0.0..=1.0",
            ));
        }

        Ok(())
    }
}

/// Token bucket settings for a protected dependency
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Refill rate of the bucket
    pub calls_per_second: f64,

    /// Bucket capacity; the largest burst that can be admitted at once
    pub burst_size: u32,

    /// Informational window in seconds; refill is continuous
    pub time_window: f64,

    /// Sleep between admission attempts in `wait_for_tokens`
    #[serde(with = "duration_millis")]
    pub poll_interval: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            calls_per_second: 10.0,
            burst_size: 10,
            time_window: 1.0,
            poll_interval: Duration::from_millis(100),
        }
    }
}

impl RateLimitConfig {
    pub fn new(calls_per_second: f64, burst_size: u32) -> Self {
        Self {
            calls_per_second,
            burst_size,
            ..Self::default()
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Validate configuration parameters
    pub fn validate(&self) -> ConfigResult<()> {
        if !self.calls_per_second.is_finite() || self.calls_per_second <= 0.0 {
            return Err(ConfigurationError::invalid_value(
                "rate_limit.calls_per_second",
                self.calls_per_second,
                "must be greater than 0",
            ));
        }

        if self.burst_size == 0 {
            return Err(ConfigurationError::invalid_value(
                "rate_limit.burst_size",
                self.burst_size,
                "must be at least 1",
            ));
        }

        if self.poll_interval.is_zero() {
            return Err(ConfigurationError::invalid_value(
                "rate_limit.poll_interval",
                "0ms",
                "must be greater than 0",
            ));
        }

        Ok(())
    }
}

/// Configuration for a single circuit breaker
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Number of consecutive failures before opening circuit
    pub failure_threshold: u32,

    /// Time since the last failure before an open circuit admits a trial call
    #[serde(with = "duration_millis")]
    pub recovery_timeout: Duration,

    /// Number of successful trial calls in half-open state to close circuit
    pub success_threshold: u32,
}

impl CircuitBreakerConfig {
    /// Create configuration for language-model completion calls
    pub fn for_completion_api() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(60),
            success_threshold: 1,
        }
    }

    /// Create configuration for platform upload calls
    pub fn for_upload_api() -> Self {
        Self {
            failure_threshold: 3,
            recovery_timeout: Duration::from_secs(120),
            success_threshold: 1,
        }
    }

    /// Validate configuration parameters
    pub fn validate(&self) -> ConfigResult<()> {
        if self.failure_threshold == 0 {
            return Err(ConfigurationError::invalid_value(
                "circuit_breaker.failure_threshold",
                self.failure_threshold,
                "must be greater than 0",
            ));
        }

        if self.failure_threshold > 100 {
            return Err(ConfigurationError::invalid_value(
                "circuit_breaker.failure_threshold",
                self.failure_threshold,
                "should not exceed 100",
            ));
        }

        if self.recovery_timeout.is_zero() {
            return Err(ConfigurationError::invalid_value(
                "circuit_breaker.recovery_timeout",
                "0ms",
                "must be greater than 0",
            ));
        }

        if self.success_threshold == 0 {
            return Err(ConfigurationError::invalid_value(
                "circuit_breaker.success_threshold",
                self.success_threshold,
                "must be greater than 0",
            ));
        }

        if self.success_threshold > 50 {
            return Err(ConfigurationError::invalid_value(
                "circuit_breaker.success_threshold",
                self.success_threshold,
                "should not exceed 50",
            ));
        }

        Ok(())
    }
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(30),
            success_threshold: 1,
        }
    }
}

/// Serde support for Duration as milliseconds
pub(crate) mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        (duration.as_millis() as u64).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

/// Serde support for Option<Duration> as milliseconds
pub(crate) mod option_duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration
            .map(|d| d.as_millis() as u64)
            .serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = Option::<u64>::deserialize(deserializer)?;
        Ok(millis.map(Duration::from_millis))
    }
}
