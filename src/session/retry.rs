//! Retry policy for managed transactions.
//!
//! Only `read_transaction`/`write_transaction` consult this policy.
//! Auto-commit statements and explicit transactions surface every failure to
//! the caller.

use crate::config::RetryConfig;
use crate::error::DriverError;
use rand::Rng;
use std::time::Duration;

/// Outcome of classifying a failed unit of work.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Retryability {
    /// Connectivity loss, leader switch, deadlock or another transient server error.
    Retryable,
    NonRetryable,
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    config: RetryConfig,
}

impl RetryPolicy {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    pub fn classify(&self, err: &DriverError) -> Retryability {
        if err.is_retryable() {
            Retryability::Retryable
        } else {
            Retryability::NonRetryable
        }
    }

    /// Delay before re-running after `attempt` failed, without jitter.
    ///
    /// `initial_delay * multiplier^(attempt - 1)`, capped at `max_delay`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let factor = self.config.multiplier.powi(exponent);
        let delay_secs = self.config.initial_delay.as_secs_f64() * factor;
        let max_secs = self.config.max_delay.as_secs_f64();
        if !delay_secs.is_finite() || delay_secs >= max_secs {
            self.config.max_delay
        } else {
            Duration::from_secs_f64(delay_secs)
        }
    }

    /// Decide whether to run the work again after attempt number `attempt`
    /// (1-based) failed with `err`, `elapsed` after the first attempt started.
    ///
    /// Returns the delay to wait, or None when the error must be surfaced.
    pub fn next_delay(&self, attempt: u32, elapsed: Duration, err: &DriverError) -> Option<Duration> {
        if self.classify(err) == Retryability::NonRetryable {
            return None;
        }
        if attempt >= self.config.max_attempts {
            return None;
        }

        let delay = self.jittered(self.backoff(attempt));
        if elapsed + delay > self.config.max_retry_time {
            return None;
        }
        Some(delay)
    }

    fn jittered(&self, delay: Duration) -> Duration {
        let jitter = self.config.jitter_factor;
        if jitter <= 0.0 || delay.is_zero() {
            return delay;
        }
        let factor = rand::thread_rng().gen_range((1.0 - jitter)..=(1.0 + jitter));
        delay.mul_f64(factor.max(0.0))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(RetryConfig::default())
    }
}
