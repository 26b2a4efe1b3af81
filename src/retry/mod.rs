// Retry and deadline helpers
// Shared by ingestion (embedding/upsert retries) and the query path (per-call timeouts)

#[cfg(test)]
mod tests;

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use tokio::time::error::Elapsed;
use tokio::time::{Instant, sleep, timeout_at};
use tracing::{debug, warn};

const EXPONENTIAL_BACKOFF_BASE: u32 = 2;
const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(30);

/// Bounded exponential backoff policy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total number of attempts, including the first one
    pub max_attempts: u32,
    /// Delay after the first failed attempt; doubled after every further failure
    pub base_delay: Duration,
    /// Upper bound for any single delay
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    #[inline]
    fn default() -> Self {
        Self::new(3, Duration::from_millis(500))
    }
}

impl RetryPolicy {
    #[inline]
    pub const fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            max_delay: DEFAULT_MAX_DELAY,
        }
    }

    /// A policy that makes exactly one attempt
    #[inline]
    pub const fn no_retry() -> Self {
        Self::new(1, Duration::ZERO)
    }

    /// Delay to wait after the given (1-based) attempt failed
    #[inline]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = EXPONENTIAL_BACKOFF_BASE.saturating_pow(attempt.saturating_sub(1));
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }

    /// Run `operation` until it succeeds, fails with a non-transient error,
    /// or the attempt budget is exhausted. The last error is returned.
    #[inline]
    pub async fn run<T, E, F, Fut, P>(&self, name: &str, is_transient: P, mut operation: F) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        P: Fn(&E) -> bool,
        E: Display,
    {
        let attempts = self.max_attempts.max(1);
        let mut attempt = 1;

        loop {
            match operation().await {
                Ok(value) => {
                    if attempt > 1 {
                        debug!("{} succeeded on attempt {}", name, attempt);
                    }
                    return Ok(value);
                }
                Err(error) => {
                    if !is_transient(&error) {
                        debug!("{} failed with non-retryable error: {}", name, error);
                        return Err(error);
                    }
                    if attempt >= attempts {
                        warn!("{} failed after {} attempts: {}", name, attempts, error);
                        return Err(error);
                    }

                    let delay = self.delay_for(attempt);
                    warn!(
                        "{} failed: {}, attempt {}/{}, retrying in {:?}",
                        name, error, attempt, attempts, delay
                    );
                    sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}

/// Time budget for the remote calls of one query.
///
/// Every call is bounded by its own timeout, and no call may outlive the
/// deadline of the query it belongs to.
#[derive(Debug, Clone, Copy)]
pub struct CallBudget {
    per_call: Duration,
    query_deadline: Instant,
}

impl CallBudget {
    #[inline]
    pub fn new(per_call: Duration, query_timeout: Duration) -> Self {
        Self {
            per_call,
            query_deadline: Instant::now() + query_timeout,
        }
    }

    /// Deadline for a call started now
    #[inline]
    pub fn call_deadline(&self) -> Instant {
        (Instant::now() + self.per_call).min(self.query_deadline)
    }

    #[inline]
    pub fn query_expired(&self) -> bool {
        Instant::now() >= self.query_deadline
    }

    /// Drive `call` to completion or drop it once its deadline passes
    #[inline]
    pub async fn run<F: Future>(&self, call: F) -> Result<F::Output, Elapsed> {
        timeout_at(self.call_deadline(), call).await
    }
}
