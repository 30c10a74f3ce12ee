//! Instance registry.
//!
//! [`InstanceStore`] is the persistence seam; [`InstanceRegistry`] layers
//! ownership checks on top of it.
//!
//! Decommissioned ids leave a tombstone in the store recording their last
//! owner, so a repeated decommission can be answered after a restart.

use crate::error::{CoreError, Result, StoreError};
use crate::instance::{Instance, InstanceId, OwnerId};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Persistence backend for instance records.
///
/// Each call is atomic with respect to the others; no transactions span calls.
#[async_trait]
pub trait InstanceStore: Send + Sync {
    /// Insert a new record. Fails with [`StoreError::Duplicate`] if the id exists.
    async fn insert(&self, instance: Instance) -> std::result::Result<(), StoreError>;

    async fn find_by_id(&self, id: InstanceId)
        -> std::result::Result<Option<Instance>, StoreError>;

    /// All records owned by `owner`, oldest first.
    async fn find_by_owner(&self, owner: &OwnerId)
        -> std::result::Result<Vec<Instance>, StoreError>;

    /// Replace an existing record. Fails with [`StoreError::Missing`] if absent.
    async fn update(&self, instance: Instance) -> std::result::Result<(), StoreError>;

    /// Delete a record. Returns `false` if nothing was deleted.
    async fn delete_by_id(&self, id: InstanceId) -> std::result::Result<bool, StoreError>;

    async fn list_all(&self) -> std::result::Result<Vec<Instance>, StoreError>;

    /// Delete a record and leave a tombstone naming its owner, in one step.
    ///
    /// Returns `false` if no live record was deleted; the tombstone is
    /// written either way.
    async fn retire(&self, instance: &Instance) -> std::result::Result<bool, StoreError>;

    /// Owner recorded by the tombstone for `id`, if any.
    async fn find_retired(&self, id: InstanceId)
        -> std::result::Result<Option<OwnerId>, StoreError>;
}

/// In-memory store. Records do not survive a restart.
#[derive(Default)]
pub struct MemoryStore {
    records: RwLock<HashMap<InstanceId, Instance>>,
    retired: RwLock<HashMap<InstanceId, OwnerId>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

pub(crate) fn sorted(mut records: Vec<Instance>) -> Vec<Instance> {
    records.sort_by(|a, b| {
        a.created_at
            .cmp(&b.created_at)
            .then_with(|| a.id.as_uuid().cmp(&b.id.as_uuid()))
    });
    records
}

#[async_trait]
impl InstanceStore for MemoryStore {
    async fn insert(&self, instance: Instance) -> std::result::Result<(), StoreError> {
        let mut records = self.records.write().await;
        if records.contains_key(&instance.id) {
            return Err(StoreError::Duplicate(instance.id));
        }
        records.insert(instance.id, instance);
        Ok(())
    }

    async fn find_by_id(
        &self,
        id: InstanceId,
    ) -> std::result::Result<Option<Instance>, StoreError> {
        Ok(self.records.read().await.get(&id).cloned())
    }

    async fn find_by_owner(
        &self,
        owner: &OwnerId,
    ) -> std::result::Result<Vec<Instance>, StoreError> {
        let records = self.records.read().await;
        Ok(sorted(
            records
                .values()
                .filter(|i| &i.owner_id == owner)
                .cloned()
                .collect(),
        ))
    }

    async fn update(&self, instance: Instance) -> std::result::Result<(), StoreError> {
        let mut records = self.records.write().await;
        match records.get_mut(&instance.id) {
            Some(slot) => {
                *slot = instance;
                Ok(())
            }
            None => Err(StoreError::Missing(instance.id)),
        }
    }

    async fn delete_by_id(&self, id: InstanceId) -> std::result::Result<bool, StoreError> {
        Ok(self.records.write().await.remove(&id).is_some())
    }

    async fn list_all(&self) -> std::result::Result<Vec<Instance>, StoreError> {
        Ok(sorted(self.records.read().await.values().cloned().collect()))
    }

    async fn retire(&self, instance: &Instance) -> std::result::Result<bool, StoreError> {
        let mut records = self.records.write().await;
        let deleted = records.remove(&instance.id).is_some();
        self.retired
            .write()
            .await
            .insert(instance.id, instance.owner_id.clone());
        Ok(deleted)
    }

    async fn find_retired(
        &self,
        id: InstanceId,
    ) -> std::result::Result<Option<OwnerId>, StoreError> {
        Ok(self.retired.read().await.get(&id).cloned())
    }
}

/// Outcome of looking up an id that may have been decommissioned already.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Lookup {
    /// Live record.
    Found(Instance),
    /// Decommissioned; `owner_id` owned it last.
    Gone { owner_id: OwnerId },
    /// Never known.
    Unknown,
}

/// Authoritative mapping from instance id to owner and container.
pub struct InstanceRegistry {
    store: Arc<dyn InstanceStore>,
}

impl InstanceRegistry {
    pub fn new(store: Arc<dyn InstanceStore>) -> Self {
        Self { store }
    }

    /// Registry backed by a [`MemoryStore`].
    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryStore::new()))
    }

    pub async fn insert(&self, instance: Instance) -> Result<()> {
        self.store.insert(instance).await?;
        Ok(())
    }

    /// Fetch a record regardless of owner.
    pub async fn get(&self, id: InstanceId) -> Result<Instance> {
        self.store
            .find_by_id(id)
            .await?
            .ok_or(CoreError::InstanceNotFound(id))
    }

    /// Fetch a record, failing with [`CoreError::NotOwner`] if `requester`
    /// is not its owner.
    pub async fn find_owned(&self, id: InstanceId, requester: &OwnerId) -> Result<Instance> {
        let instance = self.get(id).await?;
        if !instance.is_owned_by(requester) {
            return Err(CoreError::NotOwner {
                instance: id,
                requester: requester.clone(),
            });
        }
        Ok(instance)
    }

    /// Look up a record, falling back to the tombstone list.
    pub async fn lookup(&self, id: InstanceId) -> Result<Lookup> {
        if let Some(instance) = self.store.find_by_id(id).await? {
            return Ok(Lookup::Found(instance));
        }
        Ok(match self.store.find_retired(id).await? {
            Some(owner_id) => Lookup::Gone { owner_id },
            None => Lookup::Unknown,
        })
    }

    pub async fn list_for(&self, owner: &OwnerId) -> Result<Vec<Instance>> {
        Ok(self.store.find_by_owner(owner).await?)
    }

    pub async fn list_all(&self) -> Result<Vec<Instance>> {
        Ok(self.store.list_all().await?)
    }

    pub async fn update(&self, instance: Instance) -> Result<()> {
        self.store.update(instance).await?;
        Ok(())
    }

    /// Delete a record and remember who owned it.
    pub async fn remove(&self, instance: &Instance) -> Result<bool> {
        Ok(self.store.retire(instance).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instance::InstancePhase;
    use chrono::{Duration, Utc};

    fn instance(owner: &str, name: &str) -> Instance {
        Instance {
            id: InstanceId::new(),
            owner_id: OwnerId::from(owner),
            display_name: name.to_string(),
            image_reference: "alpine:latest".into(),
            runtime_container_id: Some(format!("c-{name}")),
            os_label: Some("alpine".into()),
            phase: InstancePhase::Active,
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_memory_store_crud() {
        let store = MemoryStore::new();
        let mut a = instance("u1", "a");

        store.insert(a.clone()).await.unwrap();
        assert!(matches!(
            store.insert(a.clone()).await,
            Err(StoreError::Duplicate(id)) if id == a.id
        ));

        a.phase = InstancePhase::TeardownPending;
        store.update(a.clone()).await.unwrap();
        assert_eq!(store.find_by_id(a.id).await.unwrap(), Some(a.clone()));

        assert!(store.delete_by_id(a.id).await.unwrap());
        assert!(!store.delete_by_id(a.id).await.unwrap());
        assert!(matches!(
            store.update(a.clone()).await,
            Err(StoreError::Missing(_))
        ));
    }

    #[tokio::test]
    async fn test_find_by_owner_oldest_first() {
        let store = MemoryStore::new();
        let mut older = instance("u1", "older");
        older.created_at = Utc::now() - Duration::minutes(5);
        let newer = instance("u1", "newer");
        let other = instance("u2", "other");

        store.insert(newer.clone()).await.unwrap();
        store.insert(other).await.unwrap();
        store.insert(older.clone()).await.unwrap();

        let names: Vec<_> = store
            .find_by_owner(&OwnerId::from("u1"))
            .await
            .unwrap()
            .into_iter()
            .map(|i| i.display_name)
            .collect();
        assert_eq!(names, vec!["older", "newer"]);
        assert_eq!(store.list_all().await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_find_owned_checks_owner() {
        let registry = InstanceRegistry::in_memory();
        let a = instance("u1", "a");
        registry.insert(a.clone()).await.unwrap();

        let found = registry.find_owned(a.id, &OwnerId::from("u1")).await.unwrap();
        assert_eq!(found, a);

        let err = registry
            .find_owned(a.id, &OwnerId::from("u2"))
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::NotOwner { ref requester, .. } if requester.as_str() == "u2"));

        let err = registry
            .find_owned(InstanceId::new(), &OwnerId::from("u1"))
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::InstanceNotFound(_)));
    }

    #[tokio::test]
    async fn test_remove_leaves_tombstone() {
        let registry = InstanceRegistry::in_memory();
        let a = instance("u1", "a");
        registry.insert(a.clone()).await.unwrap();

        assert!(matches!(registry.lookup(a.id).await.unwrap(), Lookup::Found(_)));
        assert!(registry.remove(&a).await.unwrap());
        assert_eq!(
            registry.lookup(a.id).await.unwrap(),
            Lookup::Gone {
                owner_id: OwnerId::from("u1")
            }
        );
        assert_eq!(
            registry.lookup(InstanceId::new()).await.unwrap(),
            Lookup::Unknown
        );
    }

    #[tokio::test]
    async fn test_tombstones_outlive_many_removals() {
        let registry = InstanceRegistry::in_memory();
        let first = instance("u1", "first");
        registry.insert(first.clone()).await.unwrap();
        registry.remove(&first).await.unwrap();

        for n in 0..5000 {
            let other = instance("u2", &format!("box{n}"));
            registry.insert(other.clone()).await.unwrap();
            registry.remove(&other).await.unwrap();
        }
        assert_eq!(
            registry.lookup(first.id).await.unwrap(),
            Lookup::Gone {
                owner_id: OwnerId::from("u1")
            }
        );
    }
}
