//! # Orchestrator: wiring, background loops and graceful shutdown.
//!
//! - [`OrchestratorBuilder`]: assembles store, broker, runtime, credentials, log sinks
//!   and subscribers into an [`Orchestrator`].
//! - [`Orchestrator`]: runs one controller per configured queue plus the monitor, fans bus
//!   events out to subscribers, and exposes the definition and instance operations used
//!   by the operational surface.
//! - `shutdown`: OS termination signals.

mod alive;
mod builder;
mod orchestrator;
mod shutdown;

pub use builder::OrchestratorBuilder;
pub use orchestrator::{Health, Orchestrator, QueueHealth};
