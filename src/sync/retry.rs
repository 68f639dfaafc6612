//! Retry with exponential backoff for transfer calls.
//!
//! ```text
//! attempt 1: immediate
//! attempt 2: wait initial_backoff
//! attempt 3: wait initial_backoff * multiplier
//! ...        capped at max_backoff
//! ```
//!
//! With `jitter` set each wait is scaled by a random factor in
//! `[0.75, 1.25)` so parallel uploads do not retry in lockstep.
//!
//! Only faults for which [`TransferError::is_retryable`] holds are retried:
//! network errors, timeouts, 5xx and 429. Everything else fails at once.

use std::future::Future;
use std::time::Duration;

use tokio::time::sleep;
use tracing::{debug, warn};

use crate::config::SyncConfig;
use crate::error::TransferError;

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Attempts in total, including the first one.
    pub attempts: usize,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub backoff_multiplier: f64,
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            initial_backoff: Duration::from_millis(200),
            max_backoff: Duration::from_secs(10),
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }
}

impl RetryPolicy {
    pub fn from_config(config: &SyncConfig) -> Self {
        Self {
            attempts: config.attempts.max(1),
            initial_backoff: Duration::from_millis(config.initial_backoff_ms),
            ..Self::default()
        }
    }

    /// `min(initial_backoff * multiplier^retry, max_backoff)`, `retry` counted
    /// from zero.
    pub fn backoff(&self, retry: usize) -> Duration {
        let ms = self.initial_backoff.as_millis() as f64 * self.backoff_multiplier.powi(retry as i32);
        Duration::from_millis(ms as u64).min(self.max_backoff)
    }

    /// The wait before retry `retry`, jittered by ±25% when enabled.
    pub fn delay(&self, retry: usize) -> Duration {
        let backoff = self.backoff(retry);
        if !self.jitter {
            return backoff;
        }
        let factor = 0.75 + rand::random::<f64>() * 0.5;
        Duration::from_millis((backoff.as_millis() as f64 * factor) as u64)
    }
}

/// Runs `operation` until it succeeds, fails with a permanent error, or the
/// policy's attempts run out; the last error is returned.
pub async fn retry_with_backoff<F, Fut, T>(policy: &RetryPolicy, what: &str, mut operation: F) -> Result<T, TransferError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, TransferError>>,
{
    let mut attempt = 1;
    loop {
        match operation().await {
            Ok(value) => {
                if attempt > 1 {
                    debug!(what, attempt, "Transfer succeeded after retry");
                }
                return Ok(value);
            }
            Err(err) if !err.is_retryable() => {
                warn!(what, attempt, error = %err, "Permanent transfer error, giving up");
                return Err(err);
            }
            Err(err) if attempt >= policy.attempts => {
                warn!(what, attempt, error = %err, "Transfer attempts exhausted");
                return Err(err);
            }
            Err(err) => {
                let backoff = policy.delay(attempt - 1);
                warn!(
                    what,
                    attempt,
                    backoff_ms = backoff.as_millis() as u64,
                    error = %err,
                    "Transient transfer error, backing off"
                );
                sleep(backoff).await;
                attempt += 1;
            }
        }
    }
}
