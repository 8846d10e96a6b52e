//! Data model shared by every component.
//!
//! - [`ActivationDefinition`]: desired configuration, read-only to the orchestrator.
//! - [`ActivationInstance`]: one run attempt; the row the controller and monitor mutate
//!   through compare-and-swap.
//! - [`InstanceStatus`]: lifecycle state machine.
//! - [`ReconcileSignal`], [`ControlSignal`]: broker messages.
//! - [`DefinitionEvent`]: change notifications from the definition API.

mod definition;
mod ids;
mod instance;
mod signal;

pub use definition::{ActivationDefinition, PullPolicy, ResourceLimits};
pub use ids::{DefinitionId, InstanceId};
pub use instance::{ActivationInstance, InstancePatch, InstanceStatus};
pub use signal::{ControlSignal, DefinitionEvent, ReconcileSignal, SignalReason};
