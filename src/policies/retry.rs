//! # Retry budget for runtime calls.
//!
//! [`RetryPolicy`] bundles the backoff curve with an attempt cap. A call that is still
//! failing transiently after `max_attempts` is escalated to a permanent error.

use std::time::Duration;

use super::BackoffPolicy;

/// Attempt cap plus backoff for transient runtime errors.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RetryPolicy {
    pub backoff: BackoffPolicy,
    /// Total attempts including the first one (min 1).
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    /// Default backoff, 5 attempts.
    fn default() -> Self {
        Self {
            backoff: BackoffPolicy::default(),
            max_attempts: 5,
        }
    }
}

impl RetryPolicy {
    /// A single attempt, no retries.
    pub fn once() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Attempt cap clamped to at least one.
    pub fn attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }

    /// Delay after failed attempt number `attempt` (1-based), or `None` when the
    /// budget is spent.
    pub fn delay_after(&self, attempt: u32) -> Option<Duration> {
        if attempt >= self.attempts() {
            None
        } else {
            Some(self.backoff.next(attempt.saturating_sub(1)))
        }
    }
}
