//! # Queue placement.
//!
//! A definition without a queue is pinned to the configured queue carrying the fewest
//! live instances. Ties go to the lexicographically smallest name so every replica picks
//! the same queue from the same counts. The pin is written set-if-absent, so when two
//! replicas race the first write wins and both report the stored queue.

use std::collections::BTreeMap;

use tracing::debug;

use crate::error::StoreError;
use crate::model::ActivationDefinition;
use crate::store::StateStore;

/// Least-loaded queue chooser over a fixed set of queues.
#[derive(Clone, Debug)]
pub struct QueueAssignment {
    queues: Vec<String>,
}

impl QueueAssignment {
    /// Empty `queues` falls back to [`DEFAULT_QUEUE`](crate::config::DEFAULT_QUEUE).
    pub fn new(queues: impl IntoIterator<Item = String>) -> Self {
        let mut queues: Vec<String> = queues.into_iter().collect();
        queues.sort();
        queues.dedup();
        if queues.is_empty() {
            queues.push(crate::config::DEFAULT_QUEUE.to_string());
        }
        Self { queues }
    }

    pub fn queues(&self) -> &[String] {
        &self.queues
    }

    /// Queue with the lowest count; unseen queues count as empty.
    pub fn pick(&self, load: &BTreeMap<String, usize>) -> &str {
        self.queues
            .iter()
            .min_by(|a, b| {
                let la = load.get(*a).copied().unwrap_or(0);
                let lb = load.get(*b).copied().unwrap_or(0);
                la.cmp(&lb).then_with(|| a.cmp(b))
            })
            .map_or(crate::config::DEFAULT_QUEUE, String::as_str)
    }

    /// Queue of `definition`, assigning one if it has none yet.
    pub async fn resolve(
        &self,
        store: &dyn StateStore,
        definition: &ActivationDefinition,
    ) -> Result<String, StoreError> {
        if let Some(queue) = &definition.queue_name {
            return Ok(queue.clone());
        }
        let load = store.count_by_queue().await?;
        let candidate = self.pick(&load).to_string();
        let stored = store.assign_queue(&definition.id, &candidate).await?;
        let queue = stored.queue_name.unwrap_or(candidate);
        debug!(definition = %definition.id, %queue, "queue assigned");
        Ok(queue)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ActivationInstance, InstanceStatus, InstancePatch};
    use crate::store::InMemoryStateStore;

    fn placement() -> QueueAssignment {
        QueueAssignment::new(["q-b".to_string(), "q-a".to_string(), "q-c".to_string()])
    }

    #[test]
    fn pick_prefers_lowest_load_then_name() {
        let p = placement();
        assert_eq!(p.pick(&BTreeMap::new()), "q-a");

        let load = BTreeMap::from([("q-a".to_string(), 2), ("q-b".to_string(), 1)]);
        assert_eq!(p.pick(&load), "q-c");

        let load = BTreeMap::from([
            ("q-a".to_string(), 2),
            ("q-b".to_string(), 1),
            ("q-c".to_string(), 1),
        ]);
        assert_eq!(p.pick(&load), "q-b");
    }

    #[test]
    fn empty_queue_list_uses_default() {
        let p = QueueAssignment::new(Vec::new());
        assert_eq!(p.queues(), [crate::config::DEFAULT_QUEUE]);
    }

    #[tokio::test]
    async fn resolve_pins_least_loaded_queue_once() {
        let store = InMemoryStateStore::default();
        let busy = store
            .put_definition(ActivationDefinition::new("busy", "r.yml", "img").with_queue("q-a"))
            .await
            .unwrap();
        let inst = ActivationInstance::pending(&busy, "q-a", "v1", None, chrono::Utc::now());
        let inst = store.create(inst).await.unwrap();
        store
            .update_if_version(&inst.id, 1, InstancePatch::status(InstanceStatus::Starting))
            .await
            .unwrap();

        let fresh = store
            .put_definition(ActivationDefinition::new("fresh", "r.yml", "img"))
            .await
            .unwrap();
        let p = placement();
        let queue = p.resolve(&store, &fresh).await.unwrap();
        assert_eq!(queue, "q-b");

        let stored = store.get_definition(&fresh.id).await.unwrap();
        assert_eq!(stored.queue_name.as_deref(), Some("q-b"));
        // A stale copy without a queue resolves to the pinned one.
        assert_eq!(p.resolve(&store, &fresh).await.unwrap(), "q-b");
    }
}
