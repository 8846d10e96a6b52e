//! # Lifecycle controller.
//!
//! - [`Lifecycle`]: the per-instance state machine and its side effects (runtime calls,
//!   compare-and-swap writes, instance-log notes, status events).
//! - [`Controller`]: consumer of one worker queue. Routes signals into per-definition
//!   slots (see `admission`) and settles deliveries after reconciling them.

mod admission;
mod core;
mod lifecycle;
mod slot;

pub use self::core::Controller;
pub use lifecycle::{Collaborators, Lifecycle, ReconcileOutcome};
