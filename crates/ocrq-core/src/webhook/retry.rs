//! Exponential backoff for webhook delivery.
//!
//! Pure functions only; the dispatcher turns [`RetryPolicy::next_delay`] into
//! a delayed re-enqueue on the broker.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total delivery attempts, the first one included.
    pub max_attempts: u32,
    /// Delay before the second attempt.
    pub base_delay: Duration,
    /// Multiplier applied per further attempt; must be greater than 1.
    pub backoff_factor: f64,
    /// Upper bound for any single delay.
    pub max_delay: Duration,
}

#[derive(Debug, Clone, PartialEq, Error)]
#[error("invalid retry policy: {0}")]
pub struct InvalidPolicy(pub &'static str);

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_secs(5),
            backoff_factor: 2.0,
            max_delay: Duration::from_secs(600),
        }
    }
}

impl RetryPolicy {
    pub fn validate(&self) -> Result<(), InvalidPolicy> {
        if self.max_attempts == 0 {
            return Err(InvalidPolicy("max_attempts must be at least 1"));
        }
        if self.base_delay.is_zero() {
            return Err(InvalidPolicy("base_delay must be positive"));
        }
        if !(self.backoff_factor.is_finite() && self.backoff_factor > 1.0) {
            return Err(InvalidPolicy("backoff_factor must be a finite number above 1"));
        }
        if self.max_delay < self.base_delay {
            return Err(InvalidPolicy("max_delay must not be below base_delay"));
        }
        let mut previous = Duration::ZERO;
        for attempt in 1..self.max_attempts {
            let delay = self.next_delay(attempt);
            if delay <= previous {
                return Err(InvalidPolicy(
                    "delays must strictly increase; raise max_delay or backoff_factor, or lower max_attempts",
                ));
            }
            previous = delay;
        }
        Ok(())
    }

    /// Delay to wait after attempt `attempt` (1-indexed) failed:
    /// `base_delay * backoff_factor^(attempt - 1)`, capped at `max_delay`.
    pub fn next_delay(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let exponent = i32::try_from(attempt - 1).unwrap_or(i32::MAX);
        let millis = self.base_delay.as_millis() as f64 * self.backoff_factor.powi(exponent);
        let cap = self.max_delay.as_millis() as f64;
        if !millis.is_finite() || millis >= cap {
            self.max_delay
        } else {
            Duration::from_millis(millis as u64)
        }
    }

    /// Whether another attempt may follow attempt `attempt`.
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }

    /// Every delay between consecutive attempts, in order.
    pub fn schedule(&self) -> Vec<Duration> {
        (1..self.max_attempts).map(|n| self.next_delay(n)).collect()
    }
}

// ── Tests ──────────────────────────────────────────────────────────────────────
