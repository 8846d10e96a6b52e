//! In-memory store.
//!
//! One `RwLock` guards definitions, instances and leases together, so every method is a
//! single atomic step: uniqueness checks in `create` and the ceiling count in
//! `claim_launch` cannot interleave with other writers.

use std::collections::{BTreeMap, HashMap};
use std::sync::{PoisonError, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ulid::Ulid;

use super::{LeaseResult, LeaseStore, RenewalResult, StateStore};
use crate::clock::Clock;
use crate::error::StoreError;
use crate::model::{
    ActivationDefinition, ActivationInstance, DefinitionId, InstanceId, InstancePatch,
    InstanceStatus,
};

#[derive(Debug, Clone)]
struct Lease {
    holder: String,
    token: String,
    expires_at: DateTime<Utc>,
}

#[derive(Debug)]
struct Row {
    seq: u64,
    instance: ActivationInstance,
}

#[derive(Debug, Default)]
struct Inner {
    definitions: BTreeMap<DefinitionId, ActivationDefinition>,
    instances: HashMap<InstanceId, Row>,
    leases: HashMap<String, Lease>,
    next_seq: u64,
}

impl Inner {
    fn active_count(&self) -> usize {
        self.instances
            .values()
            .filter(|r| r.instance.status.is_active())
            .count()
    }
}

fn poison_err<T>(_: PoisonError<T>) -> StoreError {
    StoreError::backend("lock poisoned")
}

fn instance_not_found(id: &InstanceId) -> StoreError {
    StoreError::NotFound {
        entity: "instance",
        id: id.to_string(),
    }
}

fn definition_not_found(id: &DefinitionId) -> StoreError {
    StoreError::NotFound {
        entity: "definition",
        id: id.to_string(),
    }
}

fn expiry(now: DateTime<Utc>, ttl: Duration) -> DateTime<Utc> {
    now + chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::seconds(30))
}

/// Single-process [`StateStore`] + [`LeaseStore`].
#[derive(Debug)]
pub struct InMemoryStateStore {
    inner: RwLock<Inner>,
    clock: Clock,
}

impl Default for InMemoryStateStore {
    fn default() -> Self {
        Self::new(Clock::new())
    }
}

impl InMemoryStateStore {
    pub fn new(clock: Clock) -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
            clock,
        }
    }

    /// Number of instance rows ever created.
    pub fn instance_count(&self) -> usize {
        self.inner
            .read()
            .map(|inner| inner.instances.len())
            .unwrap_or_default()
    }
}

#[async_trait]
impl StateStore for InMemoryStateStore {
    async fn put_definition(
        &self,
        mut definition: ActivationDefinition,
    ) -> Result<ActivationDefinition, StoreError> {
        let mut inner = self.inner.write().map_err(poison_err)?;
        match inner.definitions.get(&definition.id) {
            Some(existing) => {
                definition.version = definition.version.max(existing.version + 1);
                if definition.queue_name.is_none() {
                    definition.queue_name = existing.queue_name.clone();
                }
            }
            None => definition.version = definition.version.max(1),
        }
        inner
            .definitions
            .insert(definition.id.clone(), definition.clone());
        Ok(definition)
    }

    async fn get_definition(&self, id: &DefinitionId) -> Result<ActivationDefinition, StoreError> {
        let inner = self.inner.read().map_err(poison_err)?;
        inner
            .definitions
            .get(id)
            .cloned()
            .ok_or_else(|| definition_not_found(id))
    }

    async fn list_definitions(&self) -> Result<Vec<ActivationDefinition>, StoreError> {
        let inner = self.inner.read().map_err(poison_err)?;
        Ok(inner.definitions.values().cloned().collect())
    }

    async fn remove_definition(
        &self,
        id: &DefinitionId,
    ) -> Result<Option<ActivationDefinition>, StoreError> {
        let mut inner = self.inner.write().map_err(poison_err)?;
        Ok(inner.definitions.remove(id))
    }

    async fn assign_queue(
        &self,
        id: &DefinitionId,
        queue: &str,
    ) -> Result<ActivationDefinition, StoreError> {
        let mut inner = self.inner.write().map_err(poison_err)?;
        let def = inner
            .definitions
            .get_mut(id)
            .ok_or_else(|| definition_not_found(id))?;
        if def.queue_name.is_none() {
            def.queue_name = Some(queue.to_string());
        }
        Ok(def.clone())
    }

    async fn create(
        &self,
        mut instance: ActivationInstance,
    ) -> Result<ActivationInstance, StoreError> {
        let mut inner = self.inner.write().map_err(poison_err)?;
        let clash = inner.instances.values().find(|r| {
            r.instance.definition_id == instance.definition_id
                && (!r.instance.status.is_terminal() || r.instance.launch_key == instance.launch_key)
        });
        if let Some(row) = clash {
            return Err(StoreError::AlreadyExists {
                definition: instance.definition_id.to_string(),
                existing: row.instance.id.to_string(),
            });
        }
        if inner.instances.contains_key(&instance.id) {
            return Err(StoreError::AlreadyExists {
                definition: instance.definition_id.to_string(),
                existing: instance.id.to_string(),
            });
        }

        instance.version = 1;
        instance.updated_at = self.clock.now();
        inner.next_seq += 1;
        let seq = inner.next_seq;
        inner.instances.insert(
            instance.id.clone(),
            Row {
                seq,
                instance: instance.clone(),
            },
        );
        Ok(instance)
    }

    async fn get(&self, id: &InstanceId) -> Result<ActivationInstance, StoreError> {
        let inner = self.inner.read().map_err(poison_err)?;
        inner
            .instances
            .get(id)
            .map(|r| r.instance.clone())
            .ok_or_else(|| instance_not_found(id))
    }

    async fn update_if_version(
        &self,
        id: &InstanceId,
        expected: u64,
        patch: InstancePatch,
    ) -> Result<ActivationInstance, StoreError> {
        let mut inner = self.inner.write().map_err(poison_err)?;
        let row = inner
            .instances
            .get_mut(id)
            .ok_or_else(|| instance_not_found(id))?;
        if row.instance.version != expected {
            return Err(StoreError::Conflict {
                id: id.to_string(),
                expected,
                actual: row.instance.version,
            });
        }
        patch.apply(&mut row.instance);
        row.instance.version += 1;
        row.instance.updated_at = self.clock.now();
        Ok(row.instance.clone())
    }

    async fn claim_launch(
        &self,
        id: &InstanceId,
        expected: u64,
        ceiling: Option<usize>,
    ) -> Result<ActivationInstance, StoreError> {
        let mut inner = self.inner.write().map_err(poison_err)?;
        let active = inner.active_count();
        let row = inner
            .instances
            .get_mut(id)
            .ok_or_else(|| instance_not_found(id))?;
        if row.instance.version != expected || row.instance.status != InstanceStatus::Pending {
            return Err(StoreError::Conflict {
                id: id.to_string(),
                expected,
                actual: row.instance.version,
            });
        }
        if let Some(ceiling) = ceiling.filter(|&c| active >= c) {
            return Err(StoreError::CapacityExhausted { ceiling, active });
        }

        InstancePatch::status(InstanceStatus::Starting)
            .clear_message()
            .clear_restart_at()
            .apply(&mut row.instance);
        let now = self.clock.now();
        row.instance.launch_claimed_at = Some(now);
        row.instance.version += 1;
        row.instance.updated_at = now;
        Ok(row.instance.clone())
    }

    async fn list_by_status(
        &self,
        statuses: &[InstanceStatus],
    ) -> Result<Vec<ActivationInstance>, StoreError> {
        let inner = self.inner.read().map_err(poison_err)?;
        let mut rows: Vec<&Row> = inner
            .instances
            .values()
            .filter(|r| statuses.contains(&r.instance.status))
            .collect();
        rows.sort_by_key(|r| r.seq);
        Ok(rows.into_iter().map(|r| r.instance.clone()).collect())
    }

    async fn list_for_definition(
        &self,
        id: &DefinitionId,
    ) -> Result<Vec<ActivationInstance>, StoreError> {
        let inner = self.inner.read().map_err(poison_err)?;
        let mut rows: Vec<&Row> = inner
            .instances
            .values()
            .filter(|r| &r.instance.definition_id == id)
            .collect();
        rows.sort_by_key(|r| r.seq);
        Ok(rows.into_iter().map(|r| r.instance.clone()).collect())
    }

    async fn count_by_queue(&self) -> Result<BTreeMap<String, usize>, StoreError> {
        let inner = self.inner.read().map_err(poison_err)?;
        let mut counts = BTreeMap::new();
        for row in inner.instances.values() {
            if !row.instance.status.is_terminal() {
                *counts.entry(row.instance.queue_name.clone()).or_insert(0) += 1;
            }
        }
        Ok(counts)
    }
}

#[async_trait]
impl LeaseStore for InMemoryStateStore {
    async fn try_acquire(
        &self,
        key: &str,
        holder: &str,
        ttl: Duration,
    ) -> Result<LeaseResult, StoreError> {
        let now = self.clock.now();
        let mut inner = self.inner.write().map_err(poison_err)?;
        inner.leases.retain(|_, lease| lease.expires_at > now);

        if let Some(lease) = inner.leases.get(key) {
            return Ok(LeaseResult::Held {
                holder: lease.holder.clone(),
            });
        }

        let token = Ulid::new().to_string();
        inner.leases.insert(
            key.to_string(),
            Lease {
                holder: holder.to_string(),
                token: token.clone(),
                expires_at: expiry(now, ttl),
            },
        );
        Ok(LeaseResult::Acquired { token, ttl })
    }

    async fn renew(
        &self,
        key: &str,
        token: &str,
        ttl: Duration,
    ) -> Result<RenewalResult, StoreError> {
        let now = self.clock.now();
        let mut inner = self.inner.write().map_err(poison_err)?;
        let Some(lease) = inner.leases.get_mut(key) else {
            return Ok(RenewalResult::InvalidToken);
        };
        if lease.token != token || lease.expires_at <= now {
            return Ok(RenewalResult::Lost);
        }
        lease.expires_at = expiry(now, ttl);
        Ok(RenewalResult::Renewed { ttl })
    }

    async fn release(&self, key: &str, token: &str) -> Result<bool, StoreError> {
        let mut inner = self.inner.write().map_err(poison_err)?;
        match inner.leases.get(key) {
            Some(lease) if lease.token == token => {
                inner.leases.remove(key);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn holder(&self, key: &str) -> Result<Option<String>, StoreError> {
        let now = self.clock.now();
        let inner = self.inner.read().map_err(poison_err)?;
        Ok(inner
            .leases
            .get(key)
            .filter(|lease| lease.expires_at > now)
            .map(|lease| lease.holder.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn def(id: &str) -> ActivationDefinition {
        ActivationDefinition::new(id, "rules.yml", "runner:1")
    }

    async fn seeded(store: &InMemoryStateStore, id: &str) -> ActivationDefinition {
        store.put_definition(def(id)).await.unwrap()
    }

    fn pending(d: &ActivationDefinition, key: &str) -> ActivationInstance {
        ActivationInstance::pending(d, "activation", key, None, Utc::now())
    }

    #[tokio::test]
    async fn put_definition_bumps_version_and_keeps_queue() {
        let store = InMemoryStateStore::default();
        let first = seeded(&store, "d1").await;
        assert_eq!(first.version, 1);
        store.assign_queue(&first.id, "q-a").await.unwrap();

        let second = store.put_definition(def("d1")).await.unwrap();
        assert_eq!(second.version, 2);
        assert_eq!(second.queue_name.as_deref(), Some("q-a"));
    }

    #[tokio::test]
    async fn assign_queue_is_set_if_absent() {
        let store = InMemoryStateStore::default();
        let d = seeded(&store, "d1").await;
        let won = store.assign_queue(&d.id, "q-a").await.unwrap();
        let lost = store.assign_queue(&d.id, "q-b").await.unwrap();
        assert_eq!(won.queue_name.as_deref(), Some("q-a"));
        assert_eq!(lost.queue_name.as_deref(), Some("q-a"));
    }

    #[tokio::test]
    async fn create_rejects_second_live_instance() {
        let store = InMemoryStateStore::default();
        let d = seeded(&store, "d1").await;
        let a = store.create(pending(&d, "v1")).await.unwrap();
        assert_eq!(a.version, 1);

        match store.create(pending(&d, "v2")).await {
            Err(StoreError::AlreadyExists { existing, .. }) => assert_eq!(existing, a.id.to_string()),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[tokio::test]
    async fn create_rejects_reused_launch_key_after_terminal() {
        let store = InMemoryStateStore::default();
        let d = seeded(&store, "d1").await;
        let a = store.create(pending(&d, "v1")).await.unwrap();
        store
            .update_if_version(&a.id, 1, InstancePatch::status(InstanceStatus::Stopped))
            .await
            .unwrap();

        assert!(store.create(pending(&d, "v1")).await.is_err());
        assert!(store.create(pending(&d, "v2")).await.is_ok());
    }

    #[tokio::test]
    async fn concurrent_creates_produce_one_row() {
        let store = Arc::new(InMemoryStateStore::default());
        let d = seeded(&store, "d1").await;
        let mut joins = Vec::new();
        for _ in 0..8 {
            let store = Arc::clone(&store);
            let inst = pending(&d, "v1");
            joins.push(tokio::spawn(async move { store.create(inst).await }));
        }
        let mut ok = 0;
        for j in joins {
            if j.await.unwrap().is_ok() {
                ok += 1;
            }
        }
        assert_eq!(ok, 1);
        assert_eq!(store.instance_count(), 1);
    }

    #[tokio::test]
    async fn stale_version_conflicts() {
        let store = InMemoryStateStore::default();
        let d = seeded(&store, "d1").await;
        let a = store.create(pending(&d, "v1")).await.unwrap();
        let moved = store
            .update_if_version(&a.id, 1, InstancePatch::default().message("hello"))
            .await
            .unwrap();
        assert_eq!(moved.version, 2);

        match store
            .update_if_version(&a.id, 1, InstancePatch::status(InstanceStatus::Failed))
            .await
        {
            Err(StoreError::Conflict { expected, actual, .. }) => {
                assert_eq!((expected, actual), (1, 2));
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[tokio::test]
    async fn claim_launch_respects_ceiling() {
        let store = InMemoryStateStore::default();
        let d1 = seeded(&store, "d1").await;
        let d2 = seeded(&store, "d2").await;
        let a = store.create(pending(&d1, "v1")).await.unwrap();
        let b = store.create(pending(&d2, "v1")).await.unwrap();

        let started = store.claim_launch(&a.id, 1, Some(1)).await.unwrap();
        assert_eq!(started.status, InstanceStatus::Starting);
        assert_eq!(started.launch_claimed_at, Some(started.updated_at));

        match store.claim_launch(&b.id, 1, Some(1)).await {
            Err(StoreError::CapacityExhausted { ceiling, active }) => {
                assert_eq!((ceiling, active), (1, 1));
            }
            other => panic!("unexpected: {other:?}"),
        }
        assert!(store.claim_launch(&b.id, 1, None).await.is_ok());
    }

    #[tokio::test]
    async fn claim_launch_requires_pending() {
        let store = InMemoryStateStore::default();
        let d = seeded(&store, "d1").await;
        let a = store.create(pending(&d, "v1")).await.unwrap();
        let s = store.claim_launch(&a.id, 1, None).await.unwrap();
        assert!(store.claim_launch(&a.id, s.version, None).await.is_err());
    }

    #[tokio::test]
    async fn count_by_queue_ignores_terminal_rows() {
        let store = InMemoryStateStore::default();
        let d1 = seeded(&store, "d1").await;
        let d2 = seeded(&store, "d2").await;
        store.create(pending(&d1, "v1")).await.unwrap();
        let b = store.create(pending(&d2, "v1")).await.unwrap();
        store
            .update_if_version(&b.id, 1, InstancePatch::status(InstanceStatus::Stopped))
            .await
            .unwrap();

        let counts = store.count_by_queue().await.unwrap();
        assert_eq!(counts.get("activation"), Some(&1));
    }

    #[tokio::test(start_paused = true)]
    async fn lease_is_exclusive_until_expiry() {
        let store = InMemoryStateStore::default();
        let ttl = Duration::from_secs(10);

        let first = store.try_acquire("monitor-tick:1", "node-a", ttl).await.unwrap();
        assert!(first.is_acquired());
        let second = store.try_acquire("monitor-tick:1", "node-b", ttl).await.unwrap();
        assert_eq!(
            second,
            LeaseResult::Held {
                holder: "node-a".into()
            }
        );
        assert!(!store.try_acquire("monitor-tick:1", "node-a", ttl).await.unwrap().is_acquired());

        tokio::time::advance(Duration::from_secs(11)).await;
        assert_eq!(store.holder("monitor-tick:1").await.unwrap(), None);
        assert!(store.try_acquire("monitor-tick:1", "node-b", ttl).await.unwrap().is_acquired());

        let stale = first.token().unwrap();
        assert_eq!(
            store.renew("monitor-tick:1", stale, ttl).await.unwrap(),
            RenewalResult::Lost
        );
    }

    #[tokio::test]
    async fn release_needs_the_owning_token() {
        let store = InMemoryStateStore::default();
        let ttl = Duration::from_secs(10);
        let lease = store.try_acquire("k", "a", ttl).await.unwrap();
        assert!(!store.release("k", "bogus").await.unwrap());
        assert!(store.release("k", lease.token().unwrap()).await.unwrap());
        assert_eq!(store.holder("k").await.unwrap(), None);
        assert_eq!(
            store.renew("k", "bogus", ttl).await.unwrap(),
            RenewalResult::InvalidToken
        );
    }
}
