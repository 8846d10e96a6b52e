//! # Activation state store.
//!
//! Source of truth for definitions and instances. Every instance write is a
//! compare-and-swap on [`ActivationInstance::version`]: a writer that lost the race gets
//! [`StoreError::Conflict`] and must re-read before deciding again.
//!
//! Two writes carry more than a version check:
//! - [`StateStore::create`] enforces at most one non-terminal instance per definition and
//!   one instance per launch key, so concurrent creates for the same definition produce
//!   exactly one row.
//! - [`StateStore::claim_launch`] moves `pending → starting` only while the number of
//!   `starting` + `running` instances is below the ceiling, atomically with the count.
//!
//! [`LeaseStore`] is the advisory lock used to deduplicate broadcast work across
//! replicas. Leases carry a TTL so a crashed holder never blocks others for long.

mod lease;
mod memory;

use std::collections::BTreeMap;

use async_trait::async_trait;

use crate::error::StoreError;
use crate::model::{
    ActivationDefinition, ActivationInstance, DefinitionId, InstanceId, InstancePatch,
    InstanceStatus,
};

pub use lease::{LeaseResult, LeaseStore, RenewalResult};
pub use memory::InMemoryStateStore;

/// Persistence contract for definitions and instances.
#[async_trait]
pub trait StateStore: Send + Sync + 'static {
    /// Inserts or replaces a definition.
    ///
    /// Replacing bumps `version` past the stored one and keeps an already assigned
    /// queue when the new copy has none.
    async fn put_definition(
        &self,
        definition: ActivationDefinition,
    ) -> Result<ActivationDefinition, StoreError>;

    async fn get_definition(&self, id: &DefinitionId) -> Result<ActivationDefinition, StoreError>;

    async fn list_definitions(&self) -> Result<Vec<ActivationDefinition>, StoreError>;

    /// Removes a definition. Its instances stay.
    async fn remove_definition(
        &self,
        id: &DefinitionId,
    ) -> Result<Option<ActivationDefinition>, StoreError>;

    /// Sets the definition's queue if it has none; returns the definition as stored.
    async fn assign_queue(
        &self,
        id: &DefinitionId,
        queue: &str,
    ) -> Result<ActivationDefinition, StoreError>;

    /// Persists a new instance with `version = 1`.
    ///
    /// Fails with [`StoreError::AlreadyExists`] when the definition has a non-terminal
    /// instance or an instance with the same `launch_key`.
    async fn create(&self, instance: ActivationInstance) -> Result<ActivationInstance, StoreError>;

    async fn get(&self, id: &InstanceId) -> Result<ActivationInstance, StoreError>;

    /// Applies `patch` if the stored version equals `expected`; returns the new row.
    async fn update_if_version(
        &self,
        id: &InstanceId,
        expected: u64,
        patch: InstancePatch,
    ) -> Result<ActivationInstance, StoreError>;

    /// Moves a `pending` instance to `starting` if fewer than `ceiling` instances are
    /// `starting` or `running`. `None` means no ceiling. Stamps `launch_claimed_at`.
    async fn claim_launch(
        &self,
        id: &InstanceId,
        expected: u64,
        ceiling: Option<usize>,
    ) -> Result<ActivationInstance, StoreError>;

    async fn list_by_status(
        &self,
        statuses: &[InstanceStatus],
    ) -> Result<Vec<ActivationInstance>, StoreError>;

    /// All instances of a definition, oldest first.
    async fn list_for_definition(
        &self,
        id: &DefinitionId,
    ) -> Result<Vec<ActivationInstance>, StoreError>;

    /// Most recently created instance of a definition.
    async fn latest_for_definition(
        &self,
        id: &DefinitionId,
    ) -> Result<Option<ActivationInstance>, StoreError> {
        Ok(self.list_for_definition(id).await?.pop())
    }

    /// Non-terminal instances per queue name.
    async fn count_by_queue(&self) -> Result<BTreeMap<String, usize>, StoreError>;
}
