//! Bounded exponential backoff with jitter.
//!
//! The backup-mode transitions of the instance manager are asynchronous:
//! a start or stop request only asks for a transition, and the caller has
//! to poll until the instance reports it. [`RetryPolicy::retry`] runs such
//! a poll, retrying only the errors its predicate classifies as retryable
//! and giving up after a fixed number of attempts.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::{Error, Result};

/// Backoff schedule for a retried operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of attempts, including the first one (default: 10)
    #[serde(default = "default_steps")]
    pub steps: u32,

    /// Delay before the second attempt in milliseconds (default: 1000)
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,

    /// Multiplier applied to the delay after every attempt (default: 5.0)
    #[serde(default = "default_factor")]
    pub factor: f64,

    /// Relative jitter applied to every delay, in [0, 1) (default: 0.1)
    #[serde(default = "default_jitter")]
    pub jitter: f64,

    /// Upper bound for a single delay in milliseconds (default: unbounded)
    #[serde(default)]
    pub max_delay_ms: Option<u64>,
}

fn default_steps() -> u32 {
    10
}

fn default_initial_delay_ms() -> u64 {
    1_000
}

fn default_factor() -> f64 {
    5.0
}

fn default_jitter() -> f64 {
    0.1
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            steps: default_steps(),
            initial_delay_ms: default_initial_delay_ms(),
            factor: default_factor(),
            jitter: default_jitter(),
            max_delay_ms: None,
        }
    }
}

impl RetryPolicy {
    /// Validate the policy
    pub fn validate(&self) -> Result<()> {
        if self.steps == 0 {
            return Err(Error::Config("retry steps must be > 0".to_string()));
        }
        if !(self.factor >= 1.0) {
            return Err(Error::Config(format!(
                "retry factor must be >= 1.0, got {}",
                self.factor
            )));
        }
        if !(0.0..1.0).contains(&self.jitter) {
            return Err(Error::Config(format!(
                "retry jitter must be in [0, 1), got {}",
                self.jitter
            )));
        }
        Ok(())
    }

    /// Un-jittered delay slept after the given failed attempt (1-based).
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let millis = self.initial_delay_ms as f64 * self.factor.powi(exponent);
        let millis = match self.max_delay_ms {
            Some(max) => millis.min(max as f64),
            None => millis,
        };
        Duration::from_millis(millis.min(u64::MAX as f64) as u64)
    }

    /// Sum of the un-jittered delays slept when every attempt fails.
    pub fn total_base_delay(&self) -> Duration {
        (1..self.steps).map(|attempt| self.base_delay(attempt)).sum()
    }

    fn jittered(&self, delay: Duration) -> Duration {
        if self.jitter <= 0.0 {
            return delay;
        }
        let spread = rand::thread_rng().gen_range(-self.jitter..=self.jitter);
        delay.mul_f64(1.0 + spread)
    }

    /// Run `op` until it succeeds, fails with a non-retryable error, or the
    /// attempt budget is spent.
    ///
    /// Cancellation is checked before every attempt and raced against every
    /// sleep, so a cancelled token surfaces as [`Error::Cancelled`] without
    /// waiting out the current delay.
    pub async fn retry<T, F, Fut, P>(
        &self,
        operation: &str,
        cancel: &CancellationToken,
        is_retryable: P,
        mut op: F,
    ) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
        P: Fn(&Error) -> bool,
    {
        let mut attempt = 0u32;

        loop {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }

            attempt += 1;
            let err = match op().await {
                Ok(value) => return Ok(value),
                Err(e) => e,
            };

            if !is_retryable(&err) {
                return Err(err);
            }

            if attempt >= self.steps {
                return Err(Error::RetryExhausted {
                    operation: operation.to_string(),
                    attempts: attempt,
                    source: Box::new(err),
                });
            }

            let delay = self.jittered(self.base_delay(attempt));
            debug!(
                "{}: attempt {}/{} failed ({}), retrying in {:?}",
                operation, attempt, self.steps, err, delay
            );

            tokio::select! {
                _ = cancel.cancelled() => return Err(Error::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }
}

/// Run `fut` unless `cancel` fires first, in which case the future is
/// dropped and [`Error::Cancelled`] is returned.
pub async fn cancellable<T>(
    cancel: &CancellationToken,
    fut: impl Future<Output = Result<T>>,
) -> Result<T> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(Error::Cancelled),
        result = fut => result,
    }
}
