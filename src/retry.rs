//! Exponential backoff between publish attempts
//!
//! The next delay is a function of the attempt count and the current delay:
//! the first retry waits the initial delay, every later one multiplies the
//! previous delay, capped at the configured maximum. Jitter is applied to
//! the sleep only, never to the carried delay.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::{PublishError, Result};

/// Retry budget and backoff parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Retries allowed after the first attempt
    pub max_retries: u32,

    /// Delay before the first retry, in milliseconds
    pub initial_delay_ms: u64,

    /// Upper bound for any delay, in milliseconds
    pub max_delay_ms: u64,

    /// Growth factor applied per retry
    pub multiplier: f64,

    /// Randomization (0.0 to 1.0) applied to each sleep
    pub jitter_factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 5,
            initial_delay_ms: 100,
            max_delay_ms: 10_000,
            multiplier: 2.0,
            jitter_factor: 0.0,
        }
    }
}

impl RetryConfig {
    /// Check the parameters are usable
    pub fn validate(&self) -> Result<()> {
        if self.multiplier < 1.0 || !self.multiplier.is_finite() {
            return Err(PublishError::Config(format!(
                "Backoff multiplier must be >= 1.0, got {}",
                self.multiplier
            )));
        }
        if !(0.0..=1.0).contains(&self.jitter_factor) {
            return Err(PublishError::Config(format!(
                "Jitter factor must be within 0.0..=1.0, got {}",
                self.jitter_factor
            )));
        }
        if self.initial_delay_ms > self.max_delay_ms {
            return Err(PublishError::Config(format!(
                "Initial delay {}ms exceeds max delay {}ms",
                self.initial_delay_ms, self.max_delay_ms
            )));
        }
        Ok(())
    }

    /// Delay the retry state starts with
    pub fn initial_delay(&self) -> Duration {
        Duration::from_millis(self.initial_delay_ms)
    }

    /// Whether another retry fits in the budget after `attempt` retries
    pub fn can_retry(&self, attempt: u32) -> bool {
        attempt < self.max_retries
    }

    /// Next un-jittered delay given the attempt count and the current delay
    pub fn next_delay(&self, attempt: u32, current: Duration) -> Duration {
        let max = Duration::from_millis(self.max_delay_ms);
        if attempt == 0 {
            return current.min(max);
        }
        let scaled = current.as_secs_f64() * self.multiplier;
        if !scaled.is_finite() || scaled >= max.as_secs_f64() {
            return max;
        }
        Duration::from_secs_f64(scaled)
    }

    /// Sleep duration for a delay, with jitter applied
    pub fn jittered(&self, delay: Duration) -> Duration {
        apply_jitter(delay, self.jitter_factor).min(Duration::from_millis(self.max_delay_ms))
    }
}

/// Randomizes a delay by ±jitter_factor
fn apply_jitter(duration: Duration, jitter_factor: f64) -> Duration {
    if jitter_factor <= 0.0 || duration.is_zero() {
        return duration;
    }

    let jitter_range = duration.as_secs_f64() * jitter_factor.clamp(0.0, 1.0);
    let offset = rand::thread_rng().gen_range(-jitter_range..=jitter_range);
    Duration::from_secs_f64((duration.as_secs_f64() + offset).max(0.0))
}
