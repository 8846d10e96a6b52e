//! # Event bus for orchestration events.
//!
//! [`Bus`] is a thin wrapper around [`tokio::sync::broadcast`]. The lifecycle engine,
//! controllers, monitor and the orchestrator publish; the orchestrator's listener fans
//! events out to the [`SubscriberSet`](crate::subscribers::SubscriberSet).
//!
//! ```text
//! Lifecycle ──┐
//! Controller ─┼──► Bus ──► listener ──► SubscriberSet ──► LogWriter, StatusHistory, …
//! Monitor ────┘
//! ```
//!
//! ## Rules
//! - `publish()` never blocks.
//! - One shared ring buffer of `capacity` events; slow receivers see `Lagged(n)`.
//! - Events sent while nobody listens are lost. The bus is a notification channel, not
//!   a record; the state store is the record.

use tokio::sync::broadcast;

use super::event::Event;

/// Broadcast channel for orchestration events. Cheap to clone.
#[derive(Clone, Debug)]
pub struct Bus {
    tx: broadcast::Sender<Event>,
}

impl Bus {
    /// Creates a bus; capacity is clamped to at least 1.
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel::<Event>(capacity.max(1));
        Self { tx }
    }

    pub fn publish(&self, ev: Event) {
        let _ = self.tx.send(ev);
    }

    /// Receiver for events sent after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }
}

impl Default for Bus {
    fn default() -> Self {
        Self::new(crate::config::Config::default().bus_capacity)
    }
}
