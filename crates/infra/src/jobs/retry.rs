//! Retry policy: backoff math and the retry vs. dead-letter decision.
//!
//! Everything here is a pure function of its inputs so the schedule can be
//! checked with synthetic attempt counts and a fixed `now`.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::types::JobOutcome;

/// Exponential backoff configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Delay after the first failed attempt
    pub base_delay: Duration,
    /// Maximum delay cap
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(300),
        }
    }
}

/// What the store should do with a job after an attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// `mark_succeeded`
    Succeed,
    /// `mark_retry(next_attempt_at)`
    Retry {
        next_attempt_at: DateTime<Utc>,
        delay: Duration,
        error: String,
    },
    /// `mark_dead(error)`
    Dead { error: String },
}

impl RetryPolicy {
    pub fn new(base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            base_delay,
            max_delay,
        }
    }

    /// Delay before the next attempt after `attempt` (1-indexed) failed.
    ///
    /// `base_delay * 2^(attempt - 1)`, capped at `max_delay`. Saturates
    /// instead of overflowing for large attempt counts.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let exponent = attempt - 1;
        let delay = if exponent >= u32::BITS {
            self.max_delay
        } else {
            self.base_delay
                .checked_mul(1u32 << exponent)
                .unwrap_or(self.max_delay)
        };

        delay.min(self.max_delay)
    }

    /// Decide the next transition for a job that just finished attempt
    /// `attempt_count` of `max_attempts`.
    pub fn decide(
        &self,
        attempt_count: u32,
        max_attempts: u32,
        outcome: &JobOutcome,
        now: DateTime<Utc>,
    ) -> RetryDecision {
        let message = match outcome {
            JobOutcome::Success => return RetryDecision::Succeed,
            JobOutcome::Failure { message } => message.clone(),
        };

        if attempt_count >= max_attempts {
            return RetryDecision::Dead { error: message };
        }

        let delay = self.delay_for_attempt(attempt_count);
        let next_attempt_at = chrono::Duration::from_std(delay)
            .ok()
            .and_then(|d| now.checked_add_signed(d))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);

        RetryDecision::Retry {
            next_attempt_at,
            delay,
            error: message,
        }
    }
}
