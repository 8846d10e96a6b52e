//! # Restart policy for activation instances.
//!
//! [`RestartPolicy`] decides whether an instance that reached `completed` or `failed`
//! goes back to `pending`, and after how long.
//!
//! - [`RestartMode::Never`] runs once; an exited instance is never relaunched.
//! - [`RestartMode::OnFailure`] relaunches after a non-zero exit, a missing container or
//!   a liveness timeout (default).
//! - [`RestartMode::OnComplete`] relaunches only after a clean exit.
//! - [`RestartMode::Always`] relaunches after either.
//!
//! ## Budget
//! `max_restarts = Some(n)` allows `n` relaunches per instance: a restart is granted while
//! `restart_count < n`. Once the budget is spent the decision is
//! [`RestartDecision::Exhausted`] and the instance stays terminal until the definition is
//! re-enabled.
//!
//! ```text
//! exit ──► applies_to(exit)? ──no──► Stay
//!                │yes
//!                ▼
//!      restart_count < max? ──no──► Exhausted
//!                │yes
//!                ▼
//!      Restart { delay_on_failure | delay_on_complete }
//! ```

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// When a terminated instance is relaunched.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RestartMode {
    Never,
    #[default]
    OnFailure,
    OnComplete,
    Always,
}

impl RestartMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            RestartMode::Never => "never",
            RestartMode::OnFailure => "on-failure",
            RestartMode::OnComplete => "on-complete",
            RestartMode::Always => "always",
        }
    }
}

/// How an instance's process ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExitKind {
    /// Exit code 0.
    Completed,
    /// Non-zero exit, missing container, start or liveness timeout.
    Failed,
}

/// Outcome of [`RestartPolicy::decide`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RestartDecision {
    /// Go back to `pending` after `delay`.
    Restart { delay: Duration },
    /// The mode does not cover this exit; stay terminal quietly.
    Stay,
    /// The mode covers this exit but the budget is spent.
    Exhausted { restarts: u32 },
}

/// Restart rules attached to a definition. Read-only to the controller.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RestartPolicy {
    pub mode: RestartMode,
    /// Delay before relaunching a failed instance.
    #[serde(with = "secs")]
    pub delay_on_failure: Duration,
    /// Delay before relaunching a completed instance.
    #[serde(with = "secs")]
    pub delay_on_complete: Duration,
    /// Relaunch budget per instance; `None` is unbounded.
    pub max_restarts: Option<u32>,
}

/// Upper bound accepted for restart delays.
pub const MAX_RESTART_DELAY: Duration = Duration::from_secs(7 * 24 * 3600);

impl Default for RestartPolicy {
    /// `on-failure`, 60s after failure, immediately after completion, at most 5 restarts.
    fn default() -> Self {
        Self {
            mode: RestartMode::OnFailure,
            delay_on_failure: Duration::from_secs(60),
            delay_on_complete: Duration::ZERO,
            max_restarts: Some(5),
        }
    }
}

impl RestartPolicy {
    /// Policy that never relaunches.
    pub fn never() -> Self {
        Self {
            mode: RestartMode::Never,
            ..Self::default()
        }
    }

    /// Whether the mode covers this kind of exit at all.
    pub fn applies_to(&self, exit: ExitKind) -> bool {
        match (self.mode, exit) {
            (RestartMode::Never, _) => false,
            (RestartMode::Always, _) => true,
            (RestartMode::OnFailure, ExitKind::Failed) => true,
            (RestartMode::OnComplete, ExitKind::Completed) => true,
            _ => false,
        }
    }

    /// Whether the budget allows one more relaunch.
    pub fn has_budget(&self, restart_count: u32) -> bool {
        self.max_restarts.is_none_or(|max| restart_count < max)
    }

    pub fn delay_for(&self, exit: ExitKind) -> Duration {
        match exit {
            ExitKind::Completed => self.delay_on_complete,
            ExitKind::Failed => self.delay_on_failure,
        }
    }

    /// Decides what happens to an instance that just exited.
    pub fn decide(&self, exit: ExitKind, restart_count: u32) -> RestartDecision {
        if !self.applies_to(exit) {
            return RestartDecision::Stay;
        }
        if !self.has_budget(restart_count) {
            return RestartDecision::Exhausted {
                restarts: restart_count,
            };
        }
        RestartDecision::Restart {
            delay: self.delay_for(exit),
        }
    }

    /// Restart count after a permanent launch error.
    ///
    /// Permanent errors are not relaunched automatically. Under `always` they still
    /// consume one slot of the budget; other modes leave the count alone.
    pub fn charge_permanent_failure(&self, restart_count: u32) -> u32 {
        if self.mode == RestartMode::Always && self.has_budget(restart_count) {
            restart_count + 1
        } else {
            restart_count
        }
    }

    /// Rejects delays that cannot be scheduled.
    pub fn check(&self) -> Result<(), String> {
        for (name, delay) in [
            ("delay_on_failure", self.delay_on_failure),
            ("delay_on_complete", self.delay_on_complete),
        ] {
            if delay > MAX_RESTART_DELAY {
                return Err(format!("{name} {delay:?} exceeds {MAX_RESTART_DELAY:?}"));
            }
        }
        Ok(())
    }
}

mod secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn policy(mode: RestartMode, max: Option<u32>) -> RestartPolicy {
        RestartPolicy {
            mode,
            delay_on_failure: Duration::from_secs(5),
            delay_on_complete: Duration::from_secs(1),
            max_restarts: max,
        }
    }

    #[test]
    fn test_never_stays_on_any_exit() {
        let p = policy(RestartMode::Never, None);
        assert_eq!(p.decide(ExitKind::Failed, 0), RestartDecision::Stay);
        assert_eq!(p.decide(ExitKind::Completed, 0), RestartDecision::Stay);
    }

    #[test]
    fn test_on_failure_ignores_clean_exit() {
        let p = policy(RestartMode::OnFailure, Some(2));
        assert_eq!(p.decide(ExitKind::Completed, 0), RestartDecision::Stay);
        assert_eq!(
            p.decide(ExitKind::Failed, 0),
            RestartDecision::Restart {
                delay: Duration::from_secs(5)
            }
        );
    }

    #[test]
    fn test_on_complete_uses_complete_delay() {
        let p = policy(RestartMode::OnComplete, None);
        assert_eq!(
            p.decide(ExitKind::Completed, 9),
            RestartDecision::Restart {
                delay: Duration::from_secs(1)
            }
        );
        assert_eq!(p.decide(ExitKind::Failed, 0), RestartDecision::Stay);
    }

    #[test]
    fn test_budget_exhausts_at_max() {
        let p = policy(RestartMode::OnFailure, Some(2));
        assert!(matches!(
            p.decide(ExitKind::Failed, 1),
            RestartDecision::Restart { .. }
        ));
        assert_eq!(
            p.decide(ExitKind::Failed, 2),
            RestartDecision::Exhausted { restarts: 2 }
        );
    }

    #[test]
    fn test_zero_budget_never_restarts() {
        let p = policy(RestartMode::Always, Some(0));
        assert_eq!(
            p.decide(ExitKind::Completed, 0),
            RestartDecision::Exhausted { restarts: 0 }
        );
    }

    #[test]
    fn test_permanent_failure_charges_only_always() {
        assert_eq!(
            policy(RestartMode::Always, Some(3)).charge_permanent_failure(1),
            2
        );
        assert_eq!(
            policy(RestartMode::Always, Some(3)).charge_permanent_failure(3),
            3
        );
        assert_eq!(
            policy(RestartMode::OnFailure, Some(3)).charge_permanent_failure(1),
            1
        );
    }

    #[test]
    fn test_check_rejects_huge_delay() {
        let mut p = RestartPolicy::default();
        p.delay_on_failure = MAX_RESTART_DELAY + Duration::from_secs(1);
        assert!(p.check().is_err());
        assert!(RestartPolicy::default().check().is_ok());
    }

    #[test]
    fn test_serde_uses_kebab_mode_and_seconds() {
        let json = r#"{"mode":"on-failure","delay_on_failure":5,"max_restarts":2}"#;
        let p: RestartPolicy = serde_json::from_str(json).unwrap();
        assert_eq!(p.mode, RestartMode::OnFailure);
        assert_eq!(p.delay_on_failure, Duration::from_secs(5));
        assert_eq!(p.delay_on_complete, Duration::ZERO);
        assert_eq!(p.max_restarts, Some(2));
    }

    fn any_mode() -> impl Strategy<Value = RestartMode> {
        prop_oneof![
            Just(RestartMode::Never),
            Just(RestartMode::OnFailure),
            Just(RestartMode::OnComplete),
            Just(RestartMode::Always),
        ]
    }

    proptest! {
        // Drive a chain of exits through the policy the way the controller does and
        // check the count never passes the budget and never goes down.
        #[test]
        fn restart_count_stays_within_budget(
            mode in any_mode(),
            max in proptest::option::of(0u32..6),
            exits in proptest::collection::vec(any::<bool>(), 0..20),
            permanent in proptest::collection::vec(any::<bool>(), 20),
        ) {
            let p = policy(mode, max);
            let mut count = 0u32;
            for (i, clean) in exits.iter().enumerate() {
                let before = count;
                if permanent[i] {
                    count = p.charge_permanent_failure(count);
                } else {
                    let exit = if *clean { ExitKind::Completed } else { ExitKind::Failed };
                    match p.decide(exit, count) {
                        RestartDecision::Restart { .. } => count += 1,
                        RestartDecision::Stay | RestartDecision::Exhausted { .. } => {}
                    }
                }
                prop_assert!(count >= before);
                if let Some(max) = max {
                    prop_assert!(count <= max);
                }
            }
        }

        #[test]
        fn never_mode_never_restarts(count in 0u32..100, clean in any::<bool>()) {
            let p = policy(RestartMode::Never, None);
            let exit = if clean { ExitKind::Completed } else { ExitKind::Failed };
            prop_assert_eq!(p.decide(exit, count), RestartDecision::Stay);
        }
    }
}
