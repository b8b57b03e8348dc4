use std::time::Duration;

use chrono::{DateTime, Utc};

/// Quadratic backoff with a hard attempt budget.
///
/// After the `n`-th failed attempt the next one is due
/// `base_delay * n²` later, until `max_attempts` attempts (including the
/// first) have been made.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub base_delay: Duration,
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(5 * 60),
            max_attempts: 4,
        }
    }
}

impl RetryPolicy {
    pub fn new(base_delay: Duration, max_attempts: u32) -> Self {
        Self {
            base_delay,
            max_attempts: max_attempts.max(1),
        }
    }

    /// A single attempt, never retried.
    pub fn no_retries() -> Self {
        Self {
            base_delay: Duration::ZERO,
            max_attempts: 1,
        }
    }

    /// Delay before the attempt following `attempts` failed ones.
    pub fn delay_for(&self, attempts: u32) -> Duration {
        let factor = attempts.saturating_mul(attempts);
        self.base_delay.saturating_mul(factor)
    }

    /// When the next attempt is due, or `None` once the budget is spent.
    pub fn next_retry_at(&self, attempts: u32, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        if attempts >= self.max_attempts {
            return None;
        }
        let at = chrono::Duration::from_std(self.delay_for(attempts))
            .ok()
            .and_then(|delay| now.checked_add_signed(delay))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        Some(at)
    }
}
