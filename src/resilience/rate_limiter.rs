//! # Token Bucket Rate Limiter
//!
//! Admission control for outbound calls to a rate-limited dependency. The
//! bucket holds up to `burst_size` tokens and refills continuously at
//! `calls_per_second`. Refill is computed lazily on every access, and all
//! bucket mutation happens under one mutex so concurrent callers never lose
//! updates.

use crate::error::{ResilienceError, Result};
use crate::resilience::RateLimitConfig;
use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::{debug, info};

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

/// Token bucket rate limiter
#[derive(Debug)]
pub struct RateLimiter {
    /// Dependency name for logging
    name: String,
    config: RateLimitConfig,
    bucket: Mutex<Bucket>,
}

impl RateLimiter {
    /// Create a limiter with a full bucket
    pub fn new(name: impl Into<String>, config: RateLimitConfig) -> Result<Self> {
        config.validate()?;
        let name = name.into();

        info!(
            component = %name,
            calls_per_second = config.calls_per_second,
            burst_size = config.burst_size,
            "Rate limiter initialized"
        );

        Ok(Self {
            name,
            bucket: Mutex::new(Bucket {
                tokens: f64::from(config.burst_size),
                last_refill: Instant::now(),
            }),
            config,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    /// Try to consume `n` tokens without waiting.
    ///
    /// Returns `Ok(false)` when the bucket does not currently hold enough
    /// tokens, and `RateLimitMisconfigured` when `n` exceeds the bucket capacity
    /// since such a request could never be admitted.
    pub fn acquire(&self, n: u32) -> Result<bool> {
        self.check_request(n)?;
        Ok(self.take(f64::from(n)))
    }

    /// Suspend until `n` tokens have been consumed.
    pub async fn wait_for_tokens(&self, n: u32) -> Result<()> {
        let mut waited = false;
        while !self.acquire(n)? {
            if !waited {
                debug!(component = %self.name, tokens = n, "Rate limited, waiting for tokens");
                waited = true;
            }
            tokio::time::sleep(self.config.poll_interval).await;
        }
        Ok(())
    }

    /// Wait for a single token. Cannot fail since a validated bucket holds at least one.
    pub(crate) async fn wait_for_token(&self) {
        while !self.take(1.0) {
            tokio::time::sleep(self.config.poll_interval).await;
        }
    }

    /// Tokens currently in the bucket, after applying pending refill
    pub fn available_tokens(&self) -> f64 {
        let mut bucket = self.bucket.lock();
        self.refill(&mut bucket);
        bucket.tokens
    }

    fn check_request(&self, n: u32) -> Result<()> {
        if n > self.config.burst_size {
            return Err(ResilienceError::RateLimitMisconfigured {
                requested: n,
                burst_size: self.config.burst_size,
            });
        }
        Ok(())
    }

    fn take(&self, requested: f64) -> bool {
        let mut bucket = self.bucket.lock();
        self.refill(&mut bucket);

        if bucket.tokens >= requested {
            bucket.tokens -= requested;
            true
        } else {
            false
        }
    }

    fn refill(&self, bucket: &mut Bucket) {
        let now = Instant::now();
        let elapsed = now.saturating_duration_since(bucket.last_refill);
        let capacity = f64::from(self.config.burst_size);
        bucket.tokens =
            (bucket.tokens + elapsed.as_secs_f64() * self.config.calls_per_second).min(capacity);
        bucket.last_refill = now;
    }
}
