//! # Messages carried by the broker.
//!
//! [`ReconcileSignal`] goes to one worker queue; [`ControlSignal`] is broadcast to every
//! replica. [`DefinitionEvent`] is what the definition API hands the orchestrator.

use std::fmt;

use serde::{Deserialize, Serialize};

use super::{DefinitionId, InstanceId};

/// Why a reconcile was requested.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalReason {
    /// Make sure an instance exists for the definition.
    Create,
    /// Make sure nothing runs for the definition.
    Delete,
    /// Replace the given instance with a fresh one.
    Restart,
    /// Re-read state and converge.
    Resync,
}

impl SignalReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            SignalReason::Create => "create",
            SignalReason::Delete => "delete",
            SignalReason::Restart => "restart",
            SignalReason::Resync => "resync",
        }
    }
}

impl fmt::Display for SignalReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Request to reconcile one definition or one of its instances.
///
/// Handlers are idempotent: delivering the same signal twice ends in the same state as
/// delivering it once.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ReconcileSignal {
    pub definition_id: DefinitionId,
    #[serde(default)]
    pub instance_id: Option<InstanceId>,
    pub reason: SignalReason,
    /// Definition version the sender saw (create only).
    #[serde(default)]
    pub definition_version: Option<u64>,
}

impl ReconcileSignal {
    pub fn create(definition_id: DefinitionId, version: u64) -> Self {
        Self {
            definition_id,
            instance_id: None,
            reason: SignalReason::Create,
            definition_version: Some(version),
        }
    }

    pub fn delete(definition_id: DefinitionId) -> Self {
        Self {
            definition_id,
            instance_id: None,
            reason: SignalReason::Delete,
            definition_version: None,
        }
    }

    pub fn restart(definition_id: DefinitionId, instance_id: InstanceId) -> Self {
        Self {
            definition_id,
            instance_id: Some(instance_id),
            reason: SignalReason::Restart,
            definition_version: None,
        }
    }

    pub fn resync(definition_id: DefinitionId, instance_id: InstanceId) -> Self {
        Self {
            definition_id,
            instance_id: Some(instance_id),
            reason: SignalReason::Resync,
            definition_version: None,
        }
    }

    /// Deduplication key: target (instance, else definition) plus reason.
    ///
    /// # Example
    /// ```
    /// use rulevisor::model::{DefinitionId, InstanceId, ReconcileSignal};
    ///
    /// let create = ReconcileSignal::create(DefinitionId::new("d1"), 3);
    /// assert_eq!(create.idempotency_key(), "d1@v3:create");
    ///
    /// let resync = ReconcileSignal::resync(DefinitionId::new("d1"), InstanceId::new("i9"));
    /// assert_eq!(resync.idempotency_key(), "i9:resync");
    /// ```
    pub fn idempotency_key(&self) -> String {
        match (&self.instance_id, self.definition_version) {
            (Some(instance), _) => format!("{instance}:{}", self.reason),
            (None, Some(version)) => format!("{}@v{version}:{}", self.definition_id, self.reason),
            (None, None) => format!("{}:{}", self.definition_id, self.reason),
        }
    }
}

/// Broadcast to every controller replica.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlSignal {
    /// Periodic monitor tick; `tick` is the interval number, identical on every replica.
    MonitorTick { tick: u64 },
}

impl ControlSignal {
    /// Key of the advisory lease that deduplicates this signal across replicas.
    pub fn lease_key(&self) -> String {
        match self {
            ControlSignal::MonitorTick { tick } => format!("monitor-tick:{tick}"),
        }
    }
}

/// Change notification from the definition API.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "definition_id", rename_all = "snake_case")]
pub enum DefinitionEvent {
    Created(DefinitionId),
    Updated(DefinitionId),
    Enabled(DefinitionId),
    Disabled(DefinitionId),
    Deleted(DefinitionId),
}

impl DefinitionEvent {
    pub fn definition_id(&self) -> &DefinitionId {
        match self {
            DefinitionEvent::Created(id)
            | DefinitionEvent::Updated(id)
            | DefinitionEvent::Enabled(id)
            | DefinitionEvent::Disabled(id)
            | DefinitionEvent::Deleted(id) => id,
        }
    }
}
