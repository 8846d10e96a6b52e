//! # Jitter for runtime retry delays.
//!
//! Controllers on different nodes hit the same container daemon; when it hiccups they
//! all start retrying at once. [`JitterPolicy`] spreads those retries out.
//!
//! - [`JitterPolicy::None`]: exact delay.
//! - [`JitterPolicy::Full`]: uniform in `[0, delay]`.
//! - [`JitterPolicy::Equal`]: `delay/2 + uniform[0, delay/2]`.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

/// Randomization applied to a computed backoff delay.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JitterPolicy {
    /// Exact delay. Useful in tests.
    None,
    /// Uniform in `[0, delay]`; spreads load the most.
    #[default]
    Full,
    /// Keeps at least half of the delay.
    Equal,
}

impl JitterPolicy {
    /// Applies jitter to `delay`.
    pub fn apply(&self, delay: Duration) -> Duration {
        let ms = delay.as_millis().min(u128::from(u64::MAX)) as u64;
        if ms == 0 {
            return Duration::ZERO;
        }
        match self {
            JitterPolicy::None => delay,
            JitterPolicy::Full => Duration::from_millis(rand::rng().random_range(0..=ms)),
            JitterPolicy::Equal => {
                let half = ms / 2;
                let extra = if half == 0 {
                    0
                } else {
                    rand::rng().random_range(0..=half)
                };
                Duration::from_millis(half + extra)
            }
        }
    }

    /// Parses `none`, `full` or `equal`.
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "none" => Some(JitterPolicy::None),
            "full" => Some(JitterPolicy::Full),
            "equal" => Some(JitterPolicy::Equal),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_jitter_stays_below_delay() {
        for _ in 0..200 {
            assert!(JitterPolicy::Full.apply(Duration::from_millis(750)) <= Duration::from_millis(750));
        }
    }

    #[test]
    fn equal_jitter_keeps_half() {
        for _ in 0..200 {
            let d = JitterPolicy::Equal.apply(Duration::from_millis(800));
            assert!(d >= Duration::from_millis(400));
            assert!(d <= Duration::from_millis(800));
        }
    }

    #[test]
    fn zero_delay_is_zero_for_every_policy() {
        for p in [JitterPolicy::None, JitterPolicy::Full, JitterPolicy::Equal] {
            assert_eq!(p.apply(Duration::ZERO), Duration::ZERO);
        }
    }

    #[test]
    fn parse_accepts_known_names() {
        assert_eq!(JitterPolicy::parse(" Equal "), Some(JitterPolicy::Equal));
        assert_eq!(JitterPolicy::parse("decorrelated"), None);
    }
}
