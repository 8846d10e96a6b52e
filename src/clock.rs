//! # Wall clock anchored on the tokio clock.
//!
//! Persisted timestamps (`started_at`, `restart_at`, lease expiry) are wall-clock
//! [`DateTime<Utc>`], but the orchestrator schedules everything with tokio timers.
//! [`Clock`] keeps the two consistent: it samples the wall clock once and then
//! advances with [`tokio::time::Instant`]. Under a paused tokio runtime the
//! persisted timestamps advance with virtual time, and in production they never
//! jump backwards.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::time::Instant;

/// Monotonic wall clock. Cheap to clone.
#[derive(Clone, Debug)]
pub struct Clock {
    anchor: Arc<Anchor>,
}

#[derive(Debug)]
struct Anchor {
    wall: DateTime<Utc>,
    mono: Instant,
}

impl Clock {
    /// Anchors a new clock at the current wall time.
    pub fn new() -> Self {
        Self::starting_at(Utc::now())
    }

    /// Anchors a new clock at an explicit wall time.
    pub fn starting_at(wall: DateTime<Utc>) -> Self {
        Self {
            anchor: Arc::new(Anchor {
                wall,
                mono: Instant::now(),
            }),
        }
    }

    /// Current time.
    pub fn now(&self) -> DateTime<Utc> {
        let elapsed = Instant::now().saturating_duration_since(self.anchor.mono);
        match chrono::Duration::from_std(elapsed) {
            Ok(delta) => self.anchor.wall + delta,
            Err(_) => self.anchor.wall,
        }
    }

    /// Time remaining until `at`, zero if it already passed.
    pub fn until(&self, at: DateTime<Utc>) -> std::time::Duration {
        (at - self.now()).to_std().unwrap_or_default()
    }
}

impl Default for Clock {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn clock_follows_virtual_time() {
        let clock = Clock::new();
        let t0 = clock.now();
        tokio::time::sleep(Duration::from_secs(90)).await;
        let elapsed = clock.now() - t0;
        assert_eq!(elapsed.num_seconds(), 90);
    }

    #[tokio::test(start_paused = true)]
    async fn until_saturates_at_zero() {
        let clock = Clock::new();
        let past = clock.now() - chrono::Duration::seconds(5);
        assert_eq!(clock.until(past), Duration::ZERO);

        let future = clock.now() + chrono::Duration::seconds(5);
        assert_eq!(clock.until(future), Duration::from_secs(5));
    }
}
