//! Retry/backoff policy.
//!
//! Pure functions only: nothing here reads the clock or touches storage, so
//! the whole policy can be tested (and property-tested) in isolation.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Exponential backoff: `base * 2^(attempt - 1)`.
///
/// `attempt` is 1-indexed (the attempt that just failed). Attempt 0 yields no
/// delay. Saturates at `Duration::MAX` on overflow.
pub fn backoff_delay(attempt: u32, base: Duration) -> Duration {
    if attempt == 0 || base.is_zero() {
        return Duration::ZERO;
    }

    const NANOS_PER_SEC: u128 = 1_000_000_000;
    1u128
        .checked_shl(attempt - 1)
        .and_then(|factor| base.as_nanos().checked_mul(factor))
        .and_then(|nanos| {
            let secs = u64::try_from(nanos / NANOS_PER_SEC).ok()?;
            Some(Duration::new(secs, (nanos % NANOS_PER_SEC) as u32))
        })
        .unwrap_or(Duration::MAX)
}

/// What happens to a job after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "decision")]
pub enum RetryDecision {
    /// Return to `pending` and become eligible again after `delay`.
    Retry { delay: Duration },
    /// Terminal: move to `dead_letter`.
    DeadLetter,
}

/// Per-job retry policy (built from the job's own retry fields).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of attempts, including the first one.
    pub max_attempts: u32,
    /// Base delay for exponential backoff.
    pub base_delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
        }
    }

    /// Calculate delay for a given attempt number (1-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        backoff_delay(attempt, self.base_delay)
    }

    /// Check if another attempt is allowed after `attempt` attempts.
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }

    /// Decide between retry and dead-letter after attempt number `attempt` failed.
    pub fn decide(&self, attempt: u32, retryable: bool) -> RetryDecision {
        if retryable && self.should_retry(attempt) {
            RetryDecision::Retry {
                delay: self.delay_for_attempt(attempt),
            }
        } else {
            RetryDecision::DeadLetter
        }
    }
}

/// `now + duration`, saturating at the latest representable instant.
pub(crate) fn deadline_after(now: DateTime<Utc>, duration: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(duration)
        .ok()
        .and_then(|d| now.checked_add_signed(d))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}
