//! # Activation instances and their state machine.
//!
//! ```text
//! pending ──launch ok──► starting ──runtime running──► running
//! pending ──permanent launch error──► failed
//! starting ──timeout / exit──► failed | completed
//! running ──exited(0)──► completed ──policy──► pending
//! running ──exited(≠0) / missing / unresponsive──► failed ──policy──► pending
//! running ──stop requested──► stopping ──runtime stopped──► stopped
//! any live ──definition disabled──► stopping ──► stopped
//! pending / scheduled restart ──definition disabled──► stopped
//! ```
//!
//! `completed`, `failed` and `stopped` are terminal. `completed` and `failed` can go
//! back to `pending` only through the restart policy; `stopped` never moves again.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{ActivationDefinition, DefinitionId, InstanceId};

/// Lifecycle status of an instance.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceStatus {
    Pending,
    Starting,
    Running,
    Stopping,
    Completed,
    Failed,
    Stopped,
}

impl InstanceStatus {
    pub const ALL: [InstanceStatus; 7] = [
        InstanceStatus::Pending,
        InstanceStatus::Starting,
        InstanceStatus::Running,
        InstanceStatus::Stopping,
        InstanceStatus::Completed,
        InstanceStatus::Failed,
        InstanceStatus::Stopped,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            InstanceStatus::Pending => "pending",
            InstanceStatus::Starting => "starting",
            InstanceStatus::Running => "running",
            InstanceStatus::Stopping => "stopping",
            InstanceStatus::Completed => "completed",
            InstanceStatus::Failed => "failed",
            InstanceStatus::Stopped => "stopped",
        }
    }

    /// `completed`, `failed`, `stopped`.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            InstanceStatus::Completed | InstanceStatus::Failed | InstanceStatus::Stopped
        )
    }

    /// Holds (or is about to hold) a container: `starting`, `running`.
    pub fn is_active(&self) -> bool {
        matches!(self, InstanceStatus::Starting | InstanceStatus::Running)
    }

    /// Allowed edges of the state machine.
    pub fn can_transition_to(&self, to: InstanceStatus) -> bool {
        use InstanceStatus::*;
        matches!(
            (self, to),
            (Pending, Starting | Failed | Stopping | Stopped)
                | (Starting, Running | Completed | Failed | Stopping)
                | (Running, Completed | Failed | Stopping)
                | (Stopping, Stopped | Failed)
                | (Completed, Pending | Stopped)
                | (Failed, Pending | Stopped)
        )
    }
}

impl fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One run attempt of a definition.
///
/// Rows are never deleted by the orchestrator. `version` is the compare-and-swap
/// column: the store bumps it on every successful write.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivationInstance {
    pub id: InstanceId,
    pub definition_id: DefinitionId,
    pub status: InstanceStatus,
    /// Worker queue that owns reconciliation of this instance.
    pub queue_name: String,
    /// Runtime-specific opaque container/pod id.
    pub container_handle: Option<String>,
    /// Uniqueness key per definition (`v{version}` or `restart:{old id}`).
    pub launch_key: String,
    /// Instance this one replaced through a restart request.
    pub replaces: Option<InstanceId>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// When the current attempt moved to `starting`; the start timeout counts from here.
    #[serde(default)]
    pub launch_claimed_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub restart_count: u32,
    /// Always set when `status == failed`.
    pub last_failure_reason: Option<String>,
    /// Informational note (e.g. waiting for capacity).
    pub status_message: Option<String>,
    pub definition_version: u64,
    pub fingerprint: String,
    /// When a policy-approved relaunch becomes due.
    pub restart_at: Option<DateTime<Utc>>,
    pub last_heartbeat_at: Option<DateTime<Utc>>,
    /// Number of log lines already delivered to the sink.
    pub log_offset: u64,
    pub version: u64,
}

impl ActivationInstance {
    /// New `pending` row for `definition`, not yet persisted.
    pub fn pending(
        definition: &ActivationDefinition,
        queue_name: impl Into<String>,
        launch_key: impl Into<String>,
        replaces: Option<InstanceId>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: InstanceId::generate(),
            definition_id: definition.id.clone(),
            status: InstanceStatus::Pending,
            queue_name: queue_name.into(),
            container_handle: None,
            launch_key: launch_key.into(),
            replaces,
            created_at: now,
            updated_at: now,
            launch_claimed_at: None,
            started_at: None,
            ended_at: None,
            restart_count: 0,
            last_failure_reason: None,
            status_message: None,
            definition_version: definition.version,
            fingerprint: definition.fingerprint(),
            restart_at: None,
            last_heartbeat_at: None,
            log_offset: 0,
            version: 0,
        }
    }

    /// Deterministic container name for the current attempt.
    ///
    /// A relaunch of the same attempt maps to the same name, so the runtime either
    /// finds the container or reports `AlreadyExists`.
    pub fn container_name(&self) -> String {
        format!("activation-{}-{}", self.id, self.restart_count)
    }

    /// A policy-approved relaunch is scheduled and due.
    pub fn restart_due(&self, now: DateTime<Utc>) -> bool {
        self.restart_at.is_some_and(|at| at <= now)
    }

    /// Last sign of life: heartbeat, else start time.
    pub fn last_seen(&self) -> Option<DateTime<Utc>> {
        match (self.last_heartbeat_at, self.started_at) {
            (Some(hb), Some(start)) => Some(hb.max(start)),
            (hb, start) => hb.or(start),
        }
    }
}

/// Partial update applied by [`StateStore::update_if_version`](crate::store::StateStore::update_if_version).
///
/// `None` leaves a field untouched; `Some(None)` clears an optional field.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct InstancePatch {
    pub status: Option<InstanceStatus>,
    pub container_handle: Option<Option<String>>,
    pub started_at: Option<Option<DateTime<Utc>>>,
    pub ended_at: Option<Option<DateTime<Utc>>>,
    pub restart_count: Option<u32>,
    pub last_failure_reason: Option<Option<String>>,
    pub status_message: Option<Option<String>>,
    pub restart_at: Option<Option<DateTime<Utc>>>,
    pub last_heartbeat_at: Option<DateTime<Utc>>,
    pub log_offset: Option<u64>,
    /// Rewind `log_offset` to 0 before `log_offset` is applied; used when a new container
    /// replaces the old one.
    pub reset_log_offset: bool,
}

impl InstancePatch {
    pub fn status(status: InstanceStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    pub fn with_handle(mut self, handle: impl Into<String>) -> Self {
        self.container_handle = Some(Some(handle.into()));
        self
    }

    pub fn clear_handle(mut self) -> Self {
        self.container_handle = Some(None);
        self
    }

    pub fn started(mut self, at: DateTime<Utc>) -> Self {
        self.started_at = Some(Some(at));
        self
    }

    pub fn ended(mut self, at: DateTime<Utc>) -> Self {
        self.ended_at = Some(Some(at));
        self
    }

    pub fn with_restart_count(mut self, n: u32) -> Self {
        self.restart_count = Some(n);
        self
    }

    pub fn failure(mut self, reason: impl Into<String>) -> Self {
        self.last_failure_reason = Some(Some(reason.into()));
        self
    }

    pub fn clear_failure(mut self) -> Self {
        self.last_failure_reason = Some(None);
        self
    }

    pub fn message(mut self, message: impl Into<String>) -> Self {
        self.status_message = Some(Some(message.into()));
        self
    }

    pub fn clear_message(mut self) -> Self {
        self.status_message = Some(None);
        self
    }

    pub fn restart_at(mut self, at: DateTime<Utc>) -> Self {
        self.restart_at = Some(Some(at));
        self
    }

    pub fn clear_restart_at(mut self) -> Self {
        self.restart_at = Some(None);
        self
    }

    pub fn heartbeat(mut self, at: DateTime<Utc>) -> Self {
        self.last_heartbeat_at = Some(at);
        self
    }

    pub fn log_offset(mut self, offset: u64) -> Self {
        self.log_offset = Some(offset);
        self
    }

    /// Applies the patch in place. `restart_count` and `log_offset` never go down.
    pub fn reset_log_offset(mut self) -> Self {
        self.reset_log_offset = true;
        self
    }

    pub fn apply(&self, inst: &mut ActivationInstance) {
        if let Some(status) = self.status {
            inst.status = status;
        }
        if let Some(handle) = &self.container_handle {
            inst.container_handle = handle.clone();
        }
        if let Some(at) = self.started_at {
            inst.started_at = at;
        }
        if let Some(at) = self.ended_at {
            inst.ended_at = at;
        }
        if let Some(n) = self.restart_count {
            inst.restart_count = inst.restart_count.max(n);
        }
        if let Some(reason) = &self.last_failure_reason {
            inst.last_failure_reason = reason.clone();
        }
        if let Some(message) = &self.status_message {
            inst.status_message = message.clone();
        }
        if let Some(at) = self.restart_at {
            inst.restart_at = at;
        }
        if let Some(at) = self.last_heartbeat_at {
            inst.last_heartbeat_at = Some(at);
        }
        if self.reset_log_offset {
            inst.log_offset = 0;
        }
        if let Some(offset) = self.log_offset {
            inst.log_offset = inst.log_offset.max(offset);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use InstanceStatus::*;

    fn instance() -> ActivationInstance {
        let def = ActivationDefinition::new("d1", "rb.yml", "img:1");
        ActivationInstance::pending(&def, "activation", "v1", None, Utc::now())
    }

    #[test]
    fn stopped_is_a_dead_end() {
        for to in InstanceStatus::ALL {
            assert!(!Stopped.can_transition_to(to), "stopped -> {to}");
        }
    }

    #[test]
    fn only_terminal_exits_return_to_pending() {
        let back: Vec<_> = InstanceStatus::ALL
            .into_iter()
            .filter(|s| s.can_transition_to(Pending))
            .collect();
        assert_eq!(back, vec![Completed, Failed]);
    }

    #[test]
    fn running_cannot_skip_to_stopped() {
        assert!(!Running.can_transition_to(Stopped));
        assert!(Running.can_transition_to(Stopping));
        assert!(Stopping.can_transition_to(Stopped));
    }

    #[test]
    fn container_name_tracks_attempt() {
        let mut inst = instance();
        let first = inst.container_name();
        assert!(first.starts_with("activation-"));
        assert!(first.ends_with("-0"));
        inst.restart_count = 2;
        assert!(inst.container_name().ends_with("-2"));
        assert_eq!(first.trim_end_matches("-0"), inst.container_name().trim_end_matches("-2"));
    }

    #[test]
    fn patch_never_lowers_restart_count() {
        let mut inst = instance();
        inst.restart_count = 3;
        InstancePatch::status(Failed)
            .with_restart_count(1)
            .failure("exit 1")
            .apply(&mut inst);
        assert_eq!(inst.restart_count, 3);
        assert_eq!(inst.status, Failed);
        assert_eq!(inst.last_failure_reason.as_deref(), Some("exit 1"));
    }

    #[test]
    fn patch_can_clear_optional_fields() {
        let mut inst = instance();
        inst.container_handle = Some("abc".into());
        inst.restart_at = Some(Utc::now());
        InstancePatch::default()
            .clear_handle()
            .clear_restart_at()
            .apply(&mut inst);
        assert_eq!(inst.container_handle, None);
        assert_eq!(inst.restart_at, None);
    }

    #[test]
    fn last_seen_prefers_latest_signal() {
        let mut inst = instance();
        assert_eq!(inst.last_seen(), None);
        let t0 = Utc::now();
        inst.started_at = Some(t0);
        assert_eq!(inst.last_seen(), Some(t0));
        let t1 = t0 + chrono::Duration::seconds(30);
        inst.last_heartbeat_at = Some(t1);
        assert_eq!(inst.last_seen(), Some(t1));
    }
}
