//! # Backoff for transient runtime errors.
//!
//! [`BackoffPolicy`] computes how long the caller waits before re-issuing a runtime call
//! (launch, status, stop) that failed with a transient error or hit its deadline.
//!
//! The delay for retry `n` (0-indexed) is `first × factor^n`, clamped to `max`, then
//! jittered. The base is recomputed from `n` each time, so jitter never compounds.
//!
//! # Example
//! ```rust
//! use std::time::Duration;
//! use rulevisor::{BackoffPolicy, JitterPolicy};
//!
//! let backoff = BackoffPolicy {
//!     first: Duration::from_millis(200),
//!     max: Duration::from_secs(2),
//!     factor: 2.0,
//!     jitter: JitterPolicy::None,
//! };
//!
//! assert_eq!(backoff.next(0), Duration::from_millis(200));
//! assert_eq!(backoff.next(2), Duration::from_millis(800));
//! assert_eq!(backoff.next(8), Duration::from_secs(2));
//! ```

use std::time::Duration;

use crate::policies::jitter::JitterPolicy;

/// Exponential retry backoff.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct BackoffPolicy {
    /// Delay before the first retry.
    pub first: Duration,
    /// Cap on any single delay.
    pub max: Duration,
    /// Growth per retry.
    pub factor: f64,
    pub jitter: JitterPolicy,
}

impl Default for BackoffPolicy {
    /// `first = 200ms`, `factor = 2.0`, `max = 10s`, full jitter.
    fn default() -> Self {
        Self {
            first: Duration::from_millis(200),
            max: Duration::from_secs(10),
            factor: 2.0,
            jitter: JitterPolicy::Full,
        }
    }
}

impl BackoffPolicy {
    /// Delay before retry number `attempt` (0-indexed).
    pub fn next(&self, attempt: u32) -> Duration {
        let exp = attempt.min(i32::MAX as u32) as i32;
        let secs = self.first.as_secs_f64() * self.factor.powi(exp);

        let base = if !secs.is_finite() || secs < 0.0 || secs > self.max.as_secs_f64() {
            self.max
        } else {
            Duration::from_secs_f64(secs)
        };
        self.jitter.apply(base)
    }
}
