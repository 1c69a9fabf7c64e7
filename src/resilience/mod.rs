//! # Resilience Module
//!
//! Fault tolerance primitives for calls to unreliable or rate-limited
//! dependencies such as LLM completion APIs, search/trends providers and
//! storage uploads.
//!
//! ## Architecture
//!
//! - **Rate Limiter**: token bucket admission control, shared by every caller
//!   of a dependency
//! - **Retrier**: bounded re-execution with backoff for transient failures
//! - **Circuit Breaker**: fails fast while a dependency is down, tests for
//!   recovery with a single trial call
//! - **Protected Dependency / Registry**: the three composed per dependency,
//!   created from configuration
//!
//! Composition order is Limiter → Retrier → CircuitBreaker: each retry
//! attempt takes a fresh rate-limit token and is counted by the breaker.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use taskguard::config::ResilienceConfig;
//! use taskguard::error::ResilienceError;
//! use taskguard::resilience::DependencyRegistry;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let registry = DependencyRegistry::new(ResilienceConfig::default())?;
//! let llm = registry.dependency("llm_completion")?;
//!
//! let result = llm
//!     .call_with_retryable(
//!         || async { Ok::<_, ResilienceError>("completion text") },
//!         ResilienceError::is_retryable,
//!     )
//!     .await;
//! println!("{:?} after {} retries", result.value(), result.retries());
//! # Ok(())
//! # }
//! ```

pub mod circuit_breaker;
pub mod config;
pub mod metrics;
pub mod protected;
pub mod rate_limiter;
pub mod registry;
pub mod retry;

pub use circuit_breaker::{CircuitBreaker, CircuitBreakerError, CircuitState};
pub use config::{BackoffStrategy, CircuitBreakerConfig, RateLimitConfig, RetryConfig};
pub use metrics::{CircuitBreakerMetrics, SystemCircuitBreakerMetrics};
pub use protected::ProtectedDependency;
pub use rate_limiter::RateLimiter;
pub use registry::DependencyRegistry;
pub use retry::{backoff_delay, Retrier, RetryObserver, RetryPredicate};
