//! # Protected Dependency
//!
//! One rate limiter, one circuit breaker and one retry policy bundled for a
//! single outbound dependency. Composition order per call:
//!
//! ```text
//! Retrier ─► every attempt: RateLimiter.wait (1 token) ─► CircuitBreaker.call(op)
//! ```
//!
//! Each attempt re-acquires a token and is counted by the breaker. An open
//! circuit is never retried, since waiting out the backoff would only hit the
//! same open circuit again.

use crate::config::DependencyConfig;
use crate::error::Result;
use crate::execution::TaskResult;
use crate::resilience::{
    CircuitBreaker, CircuitBreakerError, RateLimiter, RetryConfig, Retrier,
};
use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Rate limited, retried and circuit-broken access to one dependency
#[derive(Debug, Clone)]
pub struct ProtectedDependency {
    name: String,
    limiter: Arc<RateLimiter>,
    breaker: Arc<CircuitBreaker>,
    retry: RetryConfig,
    attempt_timeout: Option<Duration>,
}

impl ProtectedDependency {
    /// Build every component from a validated policy
    pub fn new(name: impl Into<String>, config: &DependencyConfig) -> Result<Self> {
        config.validate()?;
        let name = name.into();

        Ok(Self {
            limiter: Arc::new(RateLimiter::new(name.clone(), config.rate_limit.clone())?),
            breaker: Arc::new(CircuitBreaker::new(
                name.clone(),
                config.circuit_breaker.clone(),
            )),
            retry: config.retry.clone(),
            attempt_timeout: config.attempt_timeout,
            name,
        })
    }

    /// Assemble from existing components, e.g. a limiter shared by several dependencies
    pub fn from_parts(
        name: impl Into<String>,
        limiter: Arc<RateLimiter>,
        breaker: Arc<CircuitBreaker>,
        retry: RetryConfig,
    ) -> Self {
        Self {
            name: name.into(),
            limiter,
            breaker,
            retry,
            attempt_timeout: None,
        }
    }

    pub fn with_attempt_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.attempt_timeout = timeout;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    pub fn retry_config(&self) -> &RetryConfig {
        &self.retry
    }

    pub fn attempt_timeout(&self) -> Option<Duration> {
        self.attempt_timeout
    }

    /// Call with every operation error treated as retryable
    pub async fn call<F, Fut, T, E>(&self, operation: F) -> TaskResult<T, CircuitBreakerError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
        E: Display + Send + Sync + 'static,
    {
        self.call_with_retryable(operation, |_: &E| true).await
    }

    /// Call, retrying only operation errors accepted by `retryable`.
    ///
    /// Timeouts are always retryable and an open circuit never is.
    pub async fn call_with_retryable<F, Fut, T, E, P>(
        &self,
        mut operation: F,
        retryable: P,
    ) -> TaskResult<T, CircuitBreakerError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
        E: Display + Send + Sync + 'static,
        P: Fn(&E) -> bool + Send + Sync + 'static,
    {
        let retrier = Retrier::new(self.name.clone(), self.retry.clone()).with_retryable(
            move |error: &CircuitBreakerError<E>| match error {
                CircuitBreakerError::CircuitOpen { .. } => false,
                CircuitBreakerError::TimedOut { .. } => true,
                CircuitBreakerError::OperationFailed(inner) => retryable(inner),
            },
        );

        retrier
            .execute(|| {
                let attempt = operation();
                async move {
                    self.limiter.wait_for_token().await;
                    debug!(dependency = %self.name, "Rate limit token acquired");

                    match self.attempt_timeout {
                        Some(timeout) => self.breaker.call_with_timeout(timeout, || attempt).await,
                        None => self.breaker.call(|| attempt).await,
                    }
                }
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CircuitBreakerConfig, RateLimitConfig};
    use crate::error::ResilienceError;
    use crate::resilience::CircuitState;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn policy() -> DependencyConfig {
        DependencyConfig {
            // Slow refill so token usage is observable
            rate_limit: RateLimitConfig::new(0.001, 10),
            retry: RetryConfig::default()
                .with_max_attempts(3)
                .with_base_delay(Duration::from_millis(10)),
            circuit_breaker: CircuitBreakerConfig {
                failure_threshold: 5,
                recovery_timeout: Duration::from_secs(30),
                success_threshold: 1,
            },
            attempt_timeout: None,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_every_attempt_takes_a_token_and_hits_the_breaker() {
        let dependency = ProtectedDependency::new("llm_completion", &policy()).unwrap();
        let calls = Arc::new(AtomicU32::new(0));

        let result = dependency
            .call(|| {
                let calls = Arc::clone(&calls);
                async move {
                    let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                    if n < 3 {
                        Err(ResilienceError::Transient(format!("attempt {n}")))
                    } else {
                        Ok("completion")
                    }
                }
            })
            .await;

        assert_eq!(result.value(), Some(&"completion"));
        assert_eq!(result.retries(), 2);
        assert!((dependency.limiter().available_tokens() - 7.0).abs() < 0.01);
        let metrics = dependency.breaker().metrics();
        assert_eq!(metrics.total_calls, 3);
        assert_eq!(metrics.failure_count, 2);
        assert_eq!(dependency.breaker().failure_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_circuit_is_not_retried() {
        let dependency = ProtectedDependency::new("upload", &policy()).unwrap();
        dependency.breaker().force_open();
        let calls = Arc::new(AtomicU32::new(0));

        let result = dependency
            .call(|| {
                let calls = Arc::clone(&calls);
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, ResilienceError>(())
                }
            })
            .await;

        assert!(result.error().is_some_and(CircuitBreakerError::is_circuit_open));
        assert_eq!(result.retries(), 0);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_permanent_errors_stop_immediately() {
        let dependency = ProtectedDependency::new("trends", &policy()).unwrap();

        let result = dependency
            .call_with_retryable(
                || async { Err::<(), _>(ResilienceError::Permanent("bad request".into())) },
                ResilienceError::is_retryable,
            )
            .await;

        assert_eq!(result.retries(), 0);
        assert_eq!(
            result.error().and_then(CircuitBreakerError::operation_error),
            Some(&ResilienceError::Permanent("bad request".into()))
        );
        assert_eq!(dependency.breaker().state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_attempt_timeout_counts_as_failed_attempt() {
        let dependency = ProtectedDependency::new("slow", &policy())
            .unwrap()
            .with_attempt_timeout(Some(Duration::from_millis(50)));

        let result = dependency
            .call(|| async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok::<_, ResilienceError>(())
            })
            .await;

        assert!(matches!(
            result.error(),
            Some(CircuitBreakerError::TimedOut { .. })
        ));
        assert_eq!(result.retries(), 2);
        assert_eq!(dependency.breaker().metrics().failure_count, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_repeated_failures_trip_breaker_mid_retry() {
        let mut config = policy();
        config.circuit_breaker.failure_threshold = 2;
        config.retry = config.retry.with_max_attempts(5);
        let dependency = ProtectedDependency::new("flaky", &config).unwrap();
        let calls = Arc::new(AtomicU32::new(0));

        let result = dependency
            .call(|| {
                let calls = Arc::clone(&calls);
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err::<(), _>(ResilienceError::Transient("503".into()))
                }
            })
            .await;

        // Third attempt hits the open circuit and stops the retry loop
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(result.retries(), 2);
        assert!(result.error().is_some_and(CircuitBreakerError::is_circuit_open));
    }
}
