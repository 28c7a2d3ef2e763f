//! Retry and backoff policy.
//!
//! Pure scheduling logic: given how many claims a task has burned and its
//! retry budget, decide when it becomes eligible again and whether it is
//! done for good. No I/O; the store applies the resulting schedule.

use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};

/// Backoff strategy for retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// Fixed delay between retries
    Fixed,
    /// Linear backoff: base * attempt
    Linear,
    /// Exponential backoff: base * 2^(attempt - 1)
    Exponential,
}

impl Default for BackoffStrategy {
    fn default() -> Self {
        Self::Exponential
    }
}

/// Retry policy configuration.
///
/// Jitter is a fraction (0.0–1.0) of the computed delay, drawn uniformly in
/// `±jitter * delay`. It desynchronizes retry storms when many workers hit
/// the same failing resource at once.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Base delay for the first retry
    pub base_delay: Duration,
    /// Maximum delay cap
    pub max_delay: Duration,
    /// Backoff strategy
    pub strategy: BackoffStrategy,
    /// Jitter fraction (0.0-1.0)
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(30),
            max_delay: Duration::from_secs(3600),
            strategy: BackoffStrategy::Exponential,
            jitter: 0.1,
        }
    }
}

/// Outcome of a scheduling decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Schedule {
    /// Instant before which the task must not be claimed again.
    pub not_before: DateTime<Utc>,
    /// The retry budget is exhausted; the task dead-letters instead.
    pub terminal: bool,
}

impl RetryPolicy {
    /// Policy with constant delays and no jitter.
    pub fn fixed(delay: Duration) -> Self {
        Self {
            base_delay: delay,
            max_delay: delay,
            strategy: BackoffStrategy::Fixed,
            jitter: 0.0,
        }
    }

    /// Policy with exponential backoff.
    pub fn exponential(base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            base_delay,
            max_delay,
            strategy: BackoffStrategy::Exponential,
            jitter: 0.1,
        }
    }

    /// Calculate the raw delay for a given attempt number (1-indexed),
    /// before jitter.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let base_ms = self.base_delay.as_millis() as f64;
        let max_ms = self.max_delay.as_millis() as f64;

        let delay_ms = match self.strategy {
            BackoffStrategy::Fixed => base_ms.min(max_ms),
            BackoffStrategy::Linear => (base_ms * attempt as f64).min(max_ms),
            BackoffStrategy::Exponential => {
                let exp = 2_f64.powi((attempt - 1).min(62) as i32);
                (base_ms * exp).min(max_ms)
            }
        };

        Duration::from_millis(delay_ms as u64)
    }

    /// Decide the next schedule after a failed attempt.
    ///
    /// `attempts` is the number of claims already granted (the failing one
    /// included); `terminal` is true once it reaches `max_attempts`.
    pub fn next_schedule(
        &self,
        attempts: u32,
        max_attempts: u32,
        now: DateTime<Utc>,
    ) -> Schedule {
        let terminal = attempts >= max_attempts;
        if terminal {
            return Schedule {
                not_before: now,
                terminal: true,
            };
        }

        let delay = self.delay_for_attempt(attempts);
        let jittered = self.apply_jitter(delay);

        Schedule {
            not_before: now + chrono::Duration::from_std(jittered).unwrap_or_default(),
            terminal: false,
        }
    }

    fn apply_jitter(&self, delay: Duration) -> Duration {
        if self.jitter <= 0.0 {
            return delay;
        }
        let delay_ms = delay.as_millis() as f64;
        let spread = delay_ms * self.jitter.min(1.0);
        let offset = rand::thread_rng().gen_range(-spread..=spread);
        Duration::from_millis((delay_ms + offset).max(0.0) as u64)
    }
}
