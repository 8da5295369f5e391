//! Retrying remote calls.
//!
//! Pact sources on brokers and URLs, and result publication, go through a
//! [`RetryPolicy`]. Only failures that [`TransportError::is_retryable`]
//! classifies as transient are retried. The wait doubles per attempt up to
//! a ceiling, plus up to a quarter of random spread.

use std::future::Future;
use std::time::Duration;

use tracing::debug;

use crate::TransportError;

/// Wait between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    first: Duration,
    ceiling: Duration,
    spread: bool,
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(Duration::from_millis(100), Duration::from_secs(10))
    }
}

impl Backoff {
    /// Doubling backoff from `first`, never longer than `ceiling`.
    #[must_use]
    pub const fn new(first: Duration, ceiling: Duration) -> Self {
        Self {
            first,
            ceiling,
            spread: true,
        }
    }

    /// Exact waits, without random spread.
    #[must_use]
    pub const fn without_spread(mut self) -> Self {
        self.spread = false;
        self
    }

    /// Wait before retry number `attempt` (zero based).
    #[must_use]
    pub fn wait(&self, attempt: u32) -> Duration {
        let doubled = self.first.saturating_mul(2u32.saturating_pow(attempt));
        let capped = doubled.min(self.ceiling);
        if self.spread {
            capped.mul_f64(1.0 + rand::random::<f64>() / 4.0)
        } else {
            capped
        }
    }
}

/// How often and how patiently a remote call is retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    retries: u32,
    backoff: Backoff,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::with_defaults()
    }
}

impl RetryPolicy {
    /// Retry up to `retries` times after the first attempt.
    #[must_use]
    pub const fn new(retries: u32, backoff: Backoff) -> Self {
        Self { retries, backoff }
    }

    /// Three retries starting at 100ms.
    #[must_use]
    pub fn with_defaults() -> Self {
        Self::new(3, Backoff::default())
    }

    /// Single attempt.
    #[must_use]
    pub fn no_retries() -> Self {
        Self::new(0, Backoff::default())
    }

    /// Retries after the first attempt.
    #[must_use]
    pub const fn max_retries(&self) -> u32 {
        self.retries
    }

    fn should_retry(&self, error: &TransportError, attempt: u32) -> bool {
        attempt < self.retries && error.is_retryable()
    }

    /// Run `operation` until it succeeds, fails permanently, or the retries
    /// run out.
    ///
    /// # Errors
    ///
    /// Returns the last error seen.
    pub async fn execute<F, Fut, T>(&self, mut operation: F) -> Result<T, TransportError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, TransportError>>,
    {
        let mut attempt = 0;
        loop {
            let error = match operation().await {
                Ok(value) => return Ok(value),
                Err(error) => error,
            };
            if !self.should_retry(&error, attempt) {
                return Err(error);
            }
            let wait = self.backoff.wait(attempt);
            debug!(attempt, wait_ms = wait.as_millis(), error = %error, "Retrying remote call");
            tokio::time::sleep(wait).await;
            attempt += 1;
        }
    }
}
