//! # Event subscribers.
//!
//! [`Subscribe`] is the extension point; [`SubscriberSet`] fans bus events out to every
//! registered subscriber without blocking the publisher.
//!
//! ```text
//! Bus ──► orchestrator listener ──► SubscriberSet
//!                                      ├──► LogWriter      (tracing records)
//!                                      ├──► StatusHistory  (per-instance transitions)
//!                                      └──► custom subscribers
//! ```
//!
//! - **Passive subscribers** observe and react (logging, metrics, alerts).
//! - **Stateful subscribers** keep state derived from events (StatusHistory).

mod history;
mod log;
mod set;
mod subscribe;

pub use history::StatusHistory;
pub use log::LogWriter;
pub use set::SubscriberSet;
pub use subscribe::Subscribe;
