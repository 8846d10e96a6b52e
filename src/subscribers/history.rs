//! # StatusHistory: per-instance record of observed transitions.
//!
//! Listens to [`EventKind::StatusChanged`] and keeps, per instance, the ordered list of
//! statuses it moved into. Useful for dashboards and for asserting exact lifecycles in
//! tests.
//!
//! ```text
//! on_event(ev):
//!   ├─ StatusChanged with instance + to ⇒ history[instance].push(to)
//!   └─ otherwise: ignore
//! ```

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;

use super::Subscribe;
use crate::events::{Event, EventKind};
use crate::model::InstanceStatus;

/// Ordered status transitions per instance id.
pub struct StatusHistory {
    inner: RwLock<HashMap<String, Vec<InstanceStatus>>>,
    capacity: usize,
}

impl StatusHistory {
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(HashMap::new()),
            capacity: 4096,
        }
    }

    #[must_use]
    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity.max(1);
        self
    }

    /// Statuses `instance` moved into, oldest first.
    #[must_use]
    pub fn transitions(&self, instance: &str) -> Vec<InstanceStatus> {
        self.inner
            .read()
            .map(|g| g.get(instance).cloned().unwrap_or_default())
            .unwrap_or_default()
    }

    /// Instance ids seen so far, sorted.
    #[must_use]
    pub fn instances(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .inner
            .read()
            .map(|g| g.keys().cloned().collect())
            .unwrap_or_default();
        ids.sort_unstable();
        ids
    }
}

impl Default for StatusHistory {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Subscribe for StatusHistory {
    async fn on_event(&self, ev: &Event) {
        if ev.kind != EventKind::StatusChanged {
            return;
        }
        if let (Some(instance), Some(to)) = (ev.instance.as_deref(), ev.to) {
            let mut g = self.inner.write().unwrap_or_else(|p| p.into_inner());
            g.entry(instance.to_string()).or_default().push(to);
        }
    }

    fn name(&self) -> &'static str {
        "status-history"
    }

    fn queue_capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_records_transitions_in_order() {
        let history = StatusHistory::new();
        for (from, to) in [
            (InstanceStatus::Pending, InstanceStatus::Starting),
            (InstanceStatus::Starting, InstanceStatus::Running),
        ] {
            let ev = Event::new(EventKind::StatusChanged)
                .with_instance("i1")
                .with_transition(from, to);
            history.on_event(&ev).await;
        }
        history
            .on_event(&Event::new(EventKind::RestartScheduled).with_instance("i1"))
            .await;

        assert_eq!(
            history.transitions("i1"),
            vec![InstanceStatus::Starting, InstanceStatus::Running]
        );
        assert_eq!(history.instances(), vec!["i1".to_string()]);
        assert!(history.transitions("other").is_empty());
    }
}
