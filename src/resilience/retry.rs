// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Backoff policies and the async [`retry`] helper.
//!
//! Three callers share one policy type:
//! - opening the local SQLite store and connecting to the remote
//!   ([`RetryConfig::startup`]),
//! - deleting a purged submission from the queue ([`RetryConfig::query`]),
//! - spacing out reconciliation attempts of a queued submission
//!   ([`RetryConfig::reconcile`]). The reconciler does not loop here; it
//!   asks [`RetryConfig::delay_for_attempt`] and [`RetryConfig::exhausted`]
//!   between passes.
//!
//! ```
//! use healthing_sync::RetryConfig;
//! use std::time::Duration;
//!
//! let reconcile = RetryConfig::reconcile();
//! assert_eq!(reconcile.delay_for_attempt(1), Duration::from_secs(1));
//! assert_eq!(reconcile.delay_for_attempt(4), Duration::from_secs(8));
//! assert!(reconcile.exhausted(10));
//! ```

use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

/// Exponential backoff policy. `max_retries` counts attempts in total;
/// `None` never gives up.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub factor: f64,
    pub max_retries: Option<usize>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::reconcile()
    }
}

impl RetryConfig {
    /// Store open / remote connect: 5 attempts, 200ms doubling to 2s.
    /// A wrong path or URL surfaces within a few seconds.
    #[must_use]
    pub fn startup() -> Self {
        Self {
            max_retries: Some(5),
            initial_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(2),
            factor: 2.0,
        }
    }

    /// Per-submission reconciliation backoff: 1s doubling to 5 min, parked
    /// after 10 failed automatic attempts.
    #[must_use]
    pub fn reconcile() -> Self {
        Self {
            max_retries: Some(10),
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(300),
            factor: 2.0,
        }
    }

    /// Single local statement (queue delete): 3 attempts, 100ms apart and up.
    #[must_use]
    pub fn query() -> Self {
        Self {
            max_retries: Some(3),
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(2),
            factor: 2.0,
        }
    }

    #[cfg(test)]
    pub fn test() -> Self {
        Self {
            max_retries: Some(3),
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(10),
            factor: 2.0,
        }
    }

    /// Delay to wait after the `attempt`-th consecutive failure (1-based).
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let mut delay = self.initial_delay;
        for _ in 1..attempt {
            delay = delay.mul_f64(self.factor).min(self.max_delay);
            if delay == self.max_delay {
                break;
            }
        }
        delay.min(self.max_delay)
    }

    /// Whether `attempts` failures exhaust this policy.
    #[must_use]
    pub fn exhausted(&self, attempts: u32) -> bool {
        self.max_retries.is_some_and(|max| attempts as usize >= max)
    }
}

/// Run `operation` until it succeeds or `config` is exhausted, sleeping
/// [`RetryConfig::delay_for_attempt`] between tries. Returns the last error.
pub async fn retry<F, Fut, T, E>(operation_name: &str, config: &RetryConfig, mut operation: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut failures: u32 = 0;
    loop {
        let err = match operation().await {
            Ok(value) => {
                if failures > 0 {
                    debug!(operation = operation_name, failures, "Recovered after retrying");
                }
                return Ok(value);
            }
            Err(err) => err,
        };

        failures += 1;
        if config.exhausted(failures) {
            warn!(operation = operation_name, attempts = failures, error = %err, "Giving up");
            return Err(err);
        }

        let delay = config.delay_for_attempt(failures);
        warn!(
            operation = operation_name,
            attempt = failures,
            error = %err,
            delay_ms = delay.as_millis() as u64,
            "Attempt failed, retrying"
        );
        tokio::time::sleep(delay).await;
    }
}
