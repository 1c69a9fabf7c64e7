#![allow(clippy::doc_markdown)] // Allow technical terms like LLM, API in docs
#![allow(clippy::missing_errors_doc)] // Allow public functions without # Errors sections
#![allow(clippy::must_use_candidate)] // Allow methods without must_use when context is clear

//! # TaskGuard
//!
//! Async task execution and resilience primitives for services that fan out
//! to rate-limited, occasionally failing dependencies.
//!
//! ## Overview
//!
//! Outbound calls to LLM completion APIs, search/trends providers and storage
//! uploads are wrapped with a rate limiter, a retrier and a circuit breaker.
//! The composed call can run directly or be submitted to a bounded priority
//! queue drained by a fixed worker pool. Independent maintenance work runs
//! under a background task manager.
//!
//! ## Module Organization
//!
//! - [`resilience`] - Rate limiter, retrier, circuit breaker, protected dependencies
//! - [`execution`] - Priority task queue, worker pool, background task manager
//! - [`config`] - Configuration records and file/environment loading
//! - [`error`] - Structured error handling
//! - [`logging`] - Structured logging initialization
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use taskguard::config::ResilienceConfig;
//! use taskguard::error::ResilienceError;
//! use taskguard::execution::{PriorityTaskQueue, TaskPriority};
//! use taskguard::resilience::DependencyRegistry;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! taskguard::logging::init_structured_logging();
//!
//! let config = ResilienceConfig::from_env()?;
//! let registry = DependencyRegistry::new(config.clone())?;
//! let queue = PriorityTaskQueue::new("requests", config.worker_pool.clone())?;
//! queue.start()?;
//!
//! let llm = registry.dependency("llm_completion")?;
//! let handle = queue.submit_with_priority(TaskPriority::High, move || async move {
//!     llm.call_with_retryable(
//!         || async { Ok::<_, ResilienceError>("summary") },
//!         ResilienceError::is_retryable,
//!     )
//!     .await
//!     .into_result()
//!     .map_err(ResilienceError::from)
//! })?;
//!
//! let result = handle.await;
//! println!("{:?}", result.value());
//!
//! queue.shutdown(Duration::from_secs(10)).await;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod execution;
pub mod logging;
pub mod resilience;

pub use config::{ConfigurationError, DependencyConfig, ResilienceConfig};
pub use error::{ResilienceError, Result};
pub use execution::{
    BackgroundHandle, BackgroundTaskManager, PeriodicJob, PriorityTaskQueue, TaskError,
    TaskHandle, TaskPriority, TaskResult,
};
pub use resilience::{
    CircuitBreaker, CircuitBreakerError, CircuitState, DependencyRegistry, ProtectedDependency,
    RateLimiter, Retrier,
};
