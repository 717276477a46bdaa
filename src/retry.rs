//! Bounded retry with exponential backoff.

use std::time::Duration;

use tracing::warn;

use crate::{Result, SyncError};

/// How often, and how patiently, to retry an operation which failed on connectivity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// retries after the first attempt.
    pub max_retries: u32,
    /// delay before the first retry, doubled for every following retry.
    pub base_delay: Duration,
    /// upper bound of one delay.
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (starts from 0).
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .map(|d| d.min(self.max_delay))
            .unwrap_or(self.max_delay)
    }

    /// Run `op`, retrying connectivity errors.
    pub fn run<T, F>(&self, what: &str, op: F) -> Result<T>
    where
        F: FnMut() -> Result<T>,
    {
        self.run_if(what, op, SyncError::is_connectivity)
    }

    /// Run `op`, retrying errors for which `retryable` returns true.
    pub fn run_if<T, E, F, R>(&self, what: &str, mut op: F, retryable: R) -> std::result::Result<T, E>
    where
        E: std::fmt::Display,
        F: FnMut() -> std::result::Result<T, E>,
        R: Fn(&E) -> bool,
    {
        let mut attempt = 0;
        loop {
            match op() {
                Ok(value) => return Ok(value),
                Err(e) if attempt < self.max_retries && retryable(&e) => {
                    let delay = self.delay(attempt);
                    warn!(%what, attempt, ?delay, error = %e, "Operation failed, retry later.");
                    std::thread::sleep(delay);
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}
