//! Retry and backoff decisions for failed attempts.

use std::time::Duration;

use rand::Rng;

use crate::{Job, QueueConfig};

/// What to do with a job whose attempt just failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Schedule another attempt after `delay`.
    Retry { delay: Duration },
    /// No attempts left.
    DeadLetter,
}

/// Exponential backoff with jitter, capped at `max_delay`.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Relative jitter, e.g. `0.2` for ±20%.
    pub jitter: f64,
}

impl RetryPolicy {
    pub fn new(base_delay: Duration, max_delay: Duration, jitter: f64) -> Self {
        Self {
            base_delay,
            max_delay,
            jitter: jitter.clamp(0.0, 1.0),
        }
    }

    /// Same policy without randomness.
    pub fn without_jitter(mut self) -> Self {
        self.jitter = 0.0;
        self
    }

    pub fn from_config(config: &QueueConfig) -> Self {
        Self::new(
            Duration::from_millis(config.base_delay_ms),
            Duration::from_millis(config.max_delay_ms),
            config.jitter,
        )
    }

    /// Decide the fate of `job` after a failed attempt.
    pub fn decide(&self, job: &Job) -> RetryDecision {
        if job.attempts_exhausted() {
            RetryDecision::DeadLetter
        } else {
            RetryDecision::Retry {
                delay: self.jittered(self.backoff(job.attempt_count)),
            }
        }
    }

    /// `base_delay * 2^(attempt - 1)` capped at `max_delay`, before jitter.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(31);
        self.base_delay
            .checked_mul(1u32 << exp)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    fn jittered(&self, delay: Duration) -> Duration {
        if self.jitter <= 0.0 || delay.is_zero() {
            return delay;
        }
        let factor = rand::rng().random_range(-self.jitter..=self.jitter);
        delay.mul_f64(1.0 + factor).min(self.max_delay)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&QueueConfig::default())
    }
}
