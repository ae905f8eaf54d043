//! Timeout and bounded retry for remote calls.
//!
//! Every oracle and evidence call site goes through [`CallPolicy::run`]. A call
//! that exceeds the timeout counts as a transient failure; transient failures
//! are retried with exponential backoff up to `max_retries` times, anything
//! else surfaces immediately.

use std::future::Future;
use std::time::Duration;

/// Errors that know whether retrying the same call can help.
pub trait RetryableError: std::fmt::Display {
    /// Whether the same call may succeed if repeated.
    fn is_transient(&self) -> bool;

    /// Server-suggested delay, if any (e.g. Retry-After).
    fn retry_after(&self) -> Option<Duration> {
        None
    }

    /// The error to report when a call exceeds its timeout.
    fn timed_out(after: Duration) -> Self;
}

/// Timeout and retry settings for one class of remote call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallPolicy {
    /// Per-attempt timeout
    pub timeout: Duration,
    /// Retries after the first attempt (total attempts = max_retries + 1)
    pub max_retries: u32,
    /// First backoff delay, doubled every attempt
    pub base_delay: Duration,
    /// Upper bound on a single backoff delay
    pub max_delay: Duration,
}

impl Default for CallPolicy {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(60),
            max_retries: 2,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl CallPolicy {
    /// Delay before retry number `attempt + 1`.
    ///
    /// `base * 2^attempt` plus a small deterministic jitter, capped at `max_delay`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let base_ms = self.base_delay.as_millis() as u64;
        let delay_ms = base_ms.saturating_mul(2u64.saturating_pow(attempt));
        let jitter_range = delay_ms / 4;
        let jitter = if jitter_range > 0 {
            (attempt as u64 * 7) % jitter_range
        } else {
            0
        };
        Duration::from_millis(delay_ms.saturating_add(jitter)).min(self.max_delay)
    }

    /// Run `op` under this policy.
    ///
    /// # Postconditions
    /// - `op` is invoked at most `max_retries + 1` times
    /// - Non-transient errors are returned after the first attempt that produced them
    pub async fn run<T, E, F, Fut>(&self, what: &str, mut op: F) -> Result<T, E>
    where
        E: RetryableError,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let mut attempt = 0u32;
        loop {
            let result = match tokio::time::timeout(self.timeout, op()).await {
                Ok(result) => result,
                Err(_) => Err(E::timed_out(self.timeout)),
            };

            match result {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() && attempt < self.max_retries => {
                    let delay = e
                        .retry_after()
                        .unwrap_or_else(|| self.backoff(attempt))
                        .min(self.max_delay);
                    tracing::warn!(
                        "{} failed (attempt {}/{}): {}. Retrying in {:?}",
                        what,
                        attempt + 1,
                        self.max_retries + 1,
                        e,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => {
                    if e.is_transient() {
                        tracing::warn!(
                            "{} exhausted {} attempts: {}",
                            what,
                            attempt + 1,
                            e
                        );
                    }
                    return Err(e);
                }
            }
        }
    }
}
