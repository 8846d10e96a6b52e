//! # Orchestration events.
//!
//! [`EventKind`] classifies what happened:
//! - **Instance events**: row created, status changed, restart scheduled, policy exhausted
//! - **Runtime events**: launch failures and transient retries
//! - **Monitor events**: sweep summaries and ceiling enforcement
//! - **Subscriber / shutdown events**: the orchestrator's own plumbing
//!
//! [`Event`] carries the metadata: instance and definition ids, status edge, reason,
//! delay and attempt.
//!
//! ## Ordering guarantees
//! Each event has a globally unique sequence number (`seq`) that increases monotonically.
//! For one instance, `StatusChanged` events are published after the write they describe,
//! so their `seq` order matches the order of the store writes.
//!
//! ## Example
//! ```rust
//! use std::time::Duration;
//! use rulevisor::events::{Event, EventKind};
//! use rulevisor::model::InstanceStatus;
//!
//! let ev = Event::new(EventKind::StatusChanged)
//!     .with_instance("01hx")
//!     .with_transition(InstanceStatus::Running, InstanceStatus::Failed)
//!     .with_reason("exit code 1");
//!
//! assert_eq!(ev.to, Some(InstanceStatus::Failed));
//! assert_eq!(ev.reason.as_deref(), Some("exit code 1"));
//! ```

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::model::InstanceStatus;

/// Global sequence counter for event ordering.
static EVENT_SEQ: AtomicU64 = AtomicU64::new(0);

/// Classification of orchestration events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    // === Instance events ===
    /// A new instance row was persisted.
    ///
    /// Sets:
    /// - `instance`, `definition`
    /// - `reason`: launch key
    InstanceCreated,

    /// An instance changed status. Published once per successful transition.
    ///
    /// Sets:
    /// - `instance`, `definition`
    /// - `from`, `to`
    /// - `reason`: failure reason or status message, when present
    StatusChanged,

    /// The restart policy approved a relaunch.
    ///
    /// Sets:
    /// - `instance`, `definition`
    /// - `attempt`: restart count the relaunch will carry
    /// - `delay_ms`: delay before the relaunch
    RestartScheduled,

    /// The restart policy covers the exit but the budget is spent.
    ///
    /// Sets:
    /// - `instance`, `definition`
    /// - `attempt`: restarts consumed
    PolicyExhausted,

    // === Runtime events ===
    /// A launch failed permanently (or kept failing transiently past the cap).
    ///
    /// Sets:
    /// - `instance`, `definition`
    /// - `reason`: runtime error message
    LaunchFailed,

    /// A reconcile failed transiently (runtime, store, broker or a CAS race that did not
    /// settle); the signal goes back to the queue with a delay.
    ///
    /// Sets:
    /// - `instance` (when known), `definition`
    /// - `reason`: runtime error message
    /// - `delay_ms`: redelivery delay
    /// - `attempt`: consecutive retries of this signal
    RuntimeRetry,

    /// A definition failed validation; no instance was created.
    ///
    /// Sets:
    /// - `definition`
    /// - `reason`: validation message
    ConfigurationRejected,

    // === Monitor events ===
    /// The lease holder finished a sweep.
    ///
    /// Sets:
    /// - `attempt`: tick number
    /// - `reason`: summary (`checked=… corrected=…`)
    MonitorSweep,

    /// An instance was stopped because the running ceiling was exceeded.
    ///
    /// Sets:
    /// - `instance`, `definition`
    CeilingEnforced,

    // === Subscriber events ===
    /// Subscriber panicked during event processing.
    ///
    /// Sets:
    /// - `subscriber`: subscriber name
    /// - `reason`: panic info/message
    SubscriberPanicked,

    /// Subscriber dropped an event (queue full or worker closed).
    ///
    /// Sets:
    /// - `subscriber`: subscriber name
    /// - `reason`: reason string (e.g., "full", "closed")
    SubscriberOverflow,

    // === Shutdown events ===
    /// Shutdown requested (OS signal or explicit call).
    ShutdownRequested,

    /// All background loops stopped within the grace period.
    AllStoppedWithin,

    /// Grace period exceeded; some loops did not stop in time.
    ///
    /// Sets:
    /// - `reason`: names of the stuck loops
    GraceExceeded,
}

/// Orchestration event with optional metadata.
///
/// - `seq`: monotonic global sequence for ordering
/// - `at`: wall-clock timestamp (for logs)
/// - other optional fields are set depending on the [`EventKind`]
#[derive(Clone, Debug)]
pub struct Event {
    /// Globally unique, monotonically increasing sequence number.
    pub seq: u64,
    pub at: DateTime<Utc>,
    pub kind: EventKind,

    pub instance: Option<Arc<str>>,
    pub definition: Option<Arc<str>>,
    pub from: Option<InstanceStatus>,
    pub to: Option<InstanceStatus>,
    /// Human-readable reason (errors, overflow details, etc.).
    pub reason: Option<Arc<str>>,
    /// Delay in milliseconds (compact).
    pub delay_ms: Option<u64>,
    pub attempt: Option<u64>,
    /// Name of the subscriber for subscriber events.
    pub subscriber: Option<&'static str>,
}

impl Event {
    /// Creates a new event of the given kind with current timestamp and next sequence number.
    pub fn new(kind: EventKind) -> Self {
        Self {
            seq: EVENT_SEQ.fetch_add(1, AtomicOrdering::Relaxed),
            at: Utc::now(),
            kind,
            instance: None,
            definition: None,
            from: None,
            to: None,
            reason: None,
            delay_ms: None,
            attempt: None,
            subscriber: None,
        }
    }

    #[inline]
    pub fn with_instance(mut self, id: impl AsRef<str>) -> Self {
        self.instance = Some(Arc::from(id.as_ref()));
        self
    }

    #[inline]
    pub fn with_definition(mut self, id: impl AsRef<str>) -> Self {
        self.definition = Some(Arc::from(id.as_ref()));
        self
    }

    #[inline]
    pub fn with_transition(mut self, from: InstanceStatus, to: InstanceStatus) -> Self {
        self.from = Some(from);
        self.to = Some(to);
        self
    }

    #[inline]
    pub fn with_reason(mut self, reason: impl Into<Arc<str>>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    /// Attaches a delay (stored as milliseconds).
    #[inline]
    pub fn with_delay(mut self, d: Duration) -> Self {
        self.delay_ms = Some(d.as_millis().min(u128::from(u64::MAX)) as u64);
        self
    }

    #[inline]
    pub fn with_attempt(mut self, n: u64) -> Self {
        self.attempt = Some(n);
        self
    }

    /// Creates a subscriber overflow event.
    #[inline]
    pub fn subscriber_overflow(subscriber: &'static str, reason: &'static str) -> Self {
        let mut ev = Event::new(EventKind::SubscriberOverflow)
            .with_reason(format!("subscriber={subscriber} reason={reason}"));
        ev.subscriber = Some(subscriber);
        ev
    }

    /// Creates a subscriber panic event.
    #[inline]
    pub fn subscriber_panicked(subscriber: &'static str, info: String) -> Self {
        let mut ev = Event::new(EventKind::SubscriberPanicked).with_reason(info);
        ev.subscriber = Some(subscriber);
        ev
    }

    /// Events about the subscriber machinery itself. Not fanned out again.
    #[inline]
    pub fn is_internal(&self) -> bool {
        matches!(
            self.kind,
            EventKind::SubscriberOverflow | EventKind::SubscriberPanicked
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seq_increases() {
        let a = Event::new(EventKind::ShutdownRequested);
        let b = Event::new(EventKind::ShutdownRequested);
        assert!(b.seq > a.seq);
    }

    #[test]
    fn test_delay_stored_in_millis() {
        let ev = Event::new(EventKind::RestartScheduled).with_delay(Duration::from_secs(60));
        assert_eq!(ev.delay_ms, Some(60_000));
    }

    #[test]
    fn test_subscriber_events_are_internal() {
        assert!(Event::subscriber_overflow("history", "full").is_internal());
        assert!(Event::subscriber_panicked("history", "boom".into()).is_internal());
        assert!(!Event::new(EventKind::StatusChanged).is_internal());
    }
}
