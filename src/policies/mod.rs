//! Restart and retry policies.
//!
//! Two different questions, two different knobs:
//!
//! - [`RestartPolicy`]: an activation's process **ended**; does the instance go back to
//!   `pending`, and after how long? Application-level, attached to the definition.
//! - [`RetryPolicy`] / [`BackoffPolicy`] / [`JitterPolicy`]: a **runtime call** failed
//!   transiently; how long until the caller tries again, and when does it give up?
//!   Infrastructure-level, part of the node [`Config`](crate::Config).
//!
//! ```text
//! runtime call ──transient──► RetryPolicy ──► backoff.next(n) ──► retry in place
//!                ──permanent──► instance failed (no delay math)
//! process exit ──► RestartPolicy::decide ──► Restart{delay} | Stay | Exhausted
//! ```

mod backoff;
mod jitter;
mod restart;
mod retry;

pub use backoff::BackoffPolicy;
pub use jitter::JitterPolicy;
pub use restart::{ExitKind, MAX_RESTART_DELAY, RestartDecision, RestartMode, RestartPolicy};
pub use retry::RetryPolicy;
