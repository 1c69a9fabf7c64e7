//! # Configuration System
//!
//! Structured configuration records for every component of the framework,
//! gathered under [`ResilienceConfig`]. Configuration is plain data: callers
//! construct it in code, from environment variables, or from a file through
//! the [`loader`], and pass the validated records to the components they build.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use taskguard::config::ResilienceConfig;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = ResilienceConfig::load_from_file("config/taskguard.toml")?;
//!
//! let pool = &config.worker_pool;
//! let llm = config.dependency_config("llm_completion");
//! println!("{} workers, {} llm calls/s", pool.max_concurrency, llm.rate_limit.calls_per_second);
//! # Ok(())
//! # }
//! ```

pub mod error;
pub mod loader;

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

pub use crate::execution::background::BackgroundConfig;
pub use crate::execution::worker_pool::WorkerPoolConfig;
pub use crate::resilience::config::{
    BackoffStrategy, CircuitBreakerConfig, RateLimitConfig, RetryConfig,
};
pub use error::{ConfigResult, ConfigurationError};

use crate::resilience::config::option_duration_millis;

/// Resilience policy for one protected dependency
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DependencyConfig {
    pub rate_limit: RateLimitConfig,
    pub retry: RetryConfig,
    pub circuit_breaker: CircuitBreakerConfig,
    /// Per-attempt timeout; a timed out attempt counts as a failed attempt
    #[serde(with = "option_duration_millis")]
    pub attempt_timeout: Option<Duration>,
}

impl DependencyConfig {
    pub fn validate(&self) -> ConfigResult<()> {
        self.rate_limit.validate()?;
        self.retry.validate()?;
        self.circuit_breaker.validate()?;

        if let Some(timeout) = self.attempt_timeout {
            if timeout.is_zero() {
                return Err(ConfigurationError::invalid_value(
                    "attempt_timeout",
                    "0ms",
                    "must be greater than 0 when set",
                ));
            }
        }

        Ok(())
    }
}

/// Top-level configuration for the framework
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResilienceConfig {
    /// Policy used for any dependency without an explicit entry
    pub defaults: DependencyConfig,

    /// Per-dependency overrides keyed by dependency name
    pub dependencies: HashMap<String, DependencyConfig>,

    /// Soft limit on registered dependencies
    pub max_dependencies: usize,

    pub worker_pool: WorkerPoolConfig,

    pub background: BackgroundConfig,
}

impl Default for ResilienceConfig {
    fn default() -> Self {
        Self {
            defaults: DependencyConfig::default(),
            dependencies: HashMap::new(),
            max_dependencies: 64,
            worker_pool: WorkerPoolConfig::default(),
            background: BackgroundConfig::default(),
        }
    }
}

impl ResilienceConfig {
    /// Build configuration from defaults with flat environment overrides
    pub fn from_env() -> ConfigResult<Self> {
        let mut config = Self::default();

        if let Ok(value) = std::env::var("TASKGUARD_MAX_CONCURRENCY") {
            config.worker_pool.max_concurrency = value.parse().map_err(|e| {
                ConfigurationError::environment_override("TASKGUARD_MAX_CONCURRENCY", e)
            })?;
        }

        if let Ok(value) = std::env::var("TASKGUARD_MAX_QUEUE_SIZE") {
            config.worker_pool.max_queue_size = value.parse().map_err(|e| {
                ConfigurationError::environment_override("TASKGUARD_MAX_QUEUE_SIZE", e)
            })?;
        }

        if let Ok(value) = std::env::var("TASKGUARD_CALLS_PER_SECOND") {
            config.defaults.rate_limit.calls_per_second = value.parse().map_err(|e| {
                ConfigurationError::environment_override("TASKGUARD_CALLS_PER_SECOND", e)
            })?;
        }

        if let Ok(value) = std::env::var("TASKGUARD_RETRY_MAX_ATTEMPTS") {
            config.defaults.retry.max_attempts = value.parse().map_err(|e| {
                ConfigurationError::environment_override("TASKGUARD_RETRY_MAX_ATTEMPTS", e)
            })?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Policy for a named dependency, falling back to the defaults
    pub fn dependency_config(&self, name: &str) -> &DependencyConfig {
        self.dependencies.get(name).unwrap_or(&self.defaults)
    }

    /// Add or replace the policy for a named dependency
    pub fn with_dependency(mut self, name: impl Into<String>, config: DependencyConfig) -> Self {
        self.dependencies.insert(name.into(), config);
        self
    }

    /// Validate every record
    pub fn validate(&self) -> ConfigResult<()> {
        self.defaults.validate()?;

        for (name, dependency) in &self.dependencies {
            dependency.validate().map_err(|e| {
                ConfigurationError::invalid_value(
                    format!("dependencies.{name}"),
                    name,
                    e.to_string(),
                )
            })?;
        }

        if self.max_dependencies == 0 {
            return Err(ConfigurationError::invalid_value(
                "max_dependencies",
                self.max_dependencies,
                "must be greater than 0",
            ));
        }

        self.worker_pool.validate()?;
        self.background.validate()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = ResilienceConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.max_dependencies, 64);
    }

    #[test]
    fn test_dependency_config_falls_back_to_defaults() {
        let mut upload = DependencyConfig::default();
        upload.circuit_breaker = CircuitBreakerConfig::for_upload_api();

        let config = ResilienceConfig::default().with_dependency("upload", upload.clone());

        assert_eq!(config.dependency_config("upload"), &upload);
        assert_eq!(config.dependency_config("trends"), &config.defaults);
    }

    #[test]
    fn test_invalid_dependency_is_reported_by_name() {
        let mut broken = DependencyConfig::default();
        broken.retry.max_attempts = 0;

        let config = ResilienceConfig::default().with_dependency("llm", broken);
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("dependencies.llm"));
    }

    #[test]
    fn test_zero_attempt_timeout_is_invalid() {
        let dependency = DependencyConfig {
            attempt_timeout: Some(Duration::ZERO),
            ..DependencyConfig::default()
        };
        assert!(dependency.validate().is_err());
    }

    #[test]
    fn test_json_round_trip_preserves_overrides() {
        let mut llm = DependencyConfig::default();
        llm.rate_limit = RateLimitConfig::new(2.0, 4);
        llm.attempt_timeout = Some(Duration::from_secs(30));
        let config = ResilienceConfig::default().with_dependency("llm", llm);

        let json = serde_json::to_string(&config).unwrap();
        let parsed: ResilienceConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, config);
    }
}
