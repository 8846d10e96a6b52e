//! Orchestration events: types and broadcast bus.
//!
//! ## Contents
//! - [`EventKind`], [`Event`] event classification and payload metadata
//! - [`Bus`] thin wrapper over `tokio::sync::broadcast`
//!
//! ## Quick reference
//! - **Publishers**: `Lifecycle` (status changes, restarts), `Controller` (retries,
//!   rejected definitions), `Monitor` (sweeps, ceiling), `SubscriberSet` workers
//!   (overflow/panic), `Orchestrator` (shutdown).
//! - **Consumers**: the orchestrator's listener, which fans out to `SubscriberSet`.

mod bus;
mod event;

pub use bus::Bus;
pub use event::{Event, EventKind};
