//! # Retrier
//!
//! Re-executes a failing operation according to a [`RetryConfig`] backoff
//! strategy. The Retrier never returns an error itself: every execution ends
//! in a [`TaskResult`] and the caller decides whether to propagate.

use crate::error::ResilienceError;
use crate::execution::TaskResult;
use crate::resilience::{BackoffStrategy, RetryConfig};
use rand::Rng;
use std::fmt::{self, Display};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, error, warn};

/// Decides whether a failure is worth another attempt
pub type RetryPredicate<E> = Arc<dyn Fn(&E) -> bool + Send + Sync>;

/// Invoked with `(attempt_index, error)` before sleeping for the next attempt
pub type RetryObserver<E> = Arc<dyn Fn(u32, &E) -> anyhow::Result<()> + Send + Sync>;

/// Delay before the attempt following the failed 0-based `attempt`, clamped to `max_delay`
pub fn backoff_delay(config: &RetryConfig, attempt: u32) -> Duration {
    let base = config.base_delay.as_secs_f64();
    if base == 0.0 {
        return Duration::ZERO;
    }
    let raw = match config.strategy {
        BackoffStrategy::Exponential => {
            base * config.backoff_factor.powi(attempt.min(i32::MAX as u32) as i32)
        }
        BackoffStrategy::Linear => base * (f64::from(attempt) + 1.0),
        BackoffStrategy::Fixed => base,
        BackoffStrategy::Fibonacci => base * fibonacci(attempt.saturating_add(2)),
    };

    let capped = raw.min(config.max_delay.as_secs_f64());
    let jittered = if config.jitter > 0.0 && capped > 0.0 {
        let jitter_range = capped * config.jitter;
        let offset = rand::thread_rng().gen_range(-jitter_range..=jitter_range);
        (capped + offset).clamp(0.0, config.max_delay.as_secs_f64())
    } else {
        capped
    };

    if jittered.is_finite() {
        Duration::from_secs_f64(jittered.max(0.0))
    } else {
        config.max_delay
    }
}

/// n-th Fibonacci number with fib(1) = fib(2) = 1
fn fibonacci(n: u32) -> f64 {
    let (mut previous, mut current) = (0.0_f64, 1.0_f64);
    for _ in 1..n {
        let next = previous + current;
        previous = current;
        current = next;
        if !current.is_finite() {
            break;
        }
    }
    current
}

/// Executes operations with retries.
///
/// `E` is the operation's error type. The retryable predicate defaults to
/// "everything is retryable"; [`Retrier::for_resilience_errors`] uses
/// [`ResilienceError::is_retryable`] instead.
pub struct Retrier<E> {
    name: String,
    config: RetryConfig,
    retryable: RetryPredicate<E>,
    on_retry: Option<RetryObserver<E>>,
}

impl<E> Clone for Retrier<E> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            config: self.config.clone(),
            retryable: Arc::clone(&self.retryable),
            on_retry: self.on_retry.clone(),
        }
    }
}

impl<E> fmt::Debug for Retrier<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Retrier")
            .field("name", &self.name)
            .field("config", &self.config)
            .field("has_observer", &self.on_retry.is_some())
            .finish()
    }
}

impl<E> Retrier<E>
where
    E: Display + Send + 'static,
{
    pub fn new(name: impl Into<String>, config: RetryConfig) -> Self {
        Self {
            name: name.into(),
            config,
            retryable: Arc::new(|_: &E| true),
            on_retry: None,
        }
    }

    /// Restrict retries to failures accepted by `predicate`
    pub fn with_retryable<P>(mut self, predicate: P) -> Self
    where
        P: Fn(&E) -> bool + Send + Sync + 'static,
    {
        self.retryable = Arc::new(predicate);
        self
    }

    /// Observe each retry. Errors and panics from the observer are logged and ignored.
    pub fn on_retry<O>(mut self, observer: O) -> Self
    where
        O: Fn(u32, &E) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.on_retry = Some(Arc::new(observer));
        self
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Run `operation` until it succeeds, fails permanently, or attempts run out
    pub async fn execute<F, Fut, T>(&self, mut operation: F) -> TaskResult<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let started = Instant::now();
        let max_attempts = self.config.max_attempts.max(1);
        let mut attempt: u32 = 0;

        loop {
            let error = match operation().await {
                Ok(value) => {
                    if attempt > 0 {
                        debug!(
                            component = %self.name,
                            attempts = attempt + 1,
                            "Operation succeeded after retries"
                        );
                    }
                    return TaskResult::success(value, started.elapsed(), attempt);
                }
                Err(error) => error,
            };

            if !(self.retryable)(&error) {
                warn!(
                    component = %self.name,
                    attempt = attempt + 1,
                    error = %error,
                    "Non-retryable failure, giving up"
                );
                return TaskResult::failure(error, started.elapsed(), attempt);
            }

            if attempt + 1 >= max_attempts {
                error!(
                    component = %self.name,
                    attempts = max_attempts,
                    error = %error,
                    "Retry attempts exhausted"
                );
                return TaskResult::failure(error, started.elapsed(), attempt);
            }

            let delay = backoff_delay(&self.config, attempt);
            warn!(
                component = %self.name,
                attempt = attempt + 1,
                max_attempts,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "Retryable failure, backing off"
            );
            self.notify_observer(attempt, &error);

            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }

    fn notify_observer(&self, attempt: u32, error: &E) {
        let Some(observer) = &self.on_retry else {
            return;
        };

        match std::panic::catch_unwind(AssertUnwindSafe(|| observer(attempt, error))) {
            Ok(Ok(())) => {}
            Ok(Err(observer_error)) => {
                warn!(
                    component = %self.name,
                    attempt,
                    error = %observer_error,
                    "Retry observer failed"
                );
            }
            Err(_) => {
                warn!(component = %self.name, attempt, "Retry observer panicked");
            }
        }
    }
}

impl<E> Retrier<E>
where
    E: Display + From<ResilienceError> + Send + 'static,
{
    /// Like [`execute`](Self::execute) but bounds every attempt by `timeout`.
    ///
    /// A timed out attempt is cancelled by dropping its future and is
    /// reported to the retry loop as `ResilienceError::OperationTimeout`.
    pub async fn execute_with_timeout<F, Fut, T>(
        &self,
        timeout: Duration,
        mut operation: F,
    ) -> TaskResult<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.execute(|| {
            let attempt = operation();
            async move {
                match tokio::time::timeout(timeout, attempt).await {
                    Ok(result) => result,
                    Err(_) => Err(E::from(ResilienceError::OperationTimeout(timeout))),
                }
            }
        })
        .await
    }
}

impl Retrier<ResilienceError> {
    /// Retrier that retries only [`ResilienceError::is_retryable`] failures
    pub fn for_resilience_errors(name: impl Into<String>, config: RetryConfig) -> Self {
        Self::new(name, config).with_retryable(ResilienceError::is_retryable)
    }
}
