//! Versioned, lifecycle-tracked wrapper around one persisted item.

pub mod record;
pub mod reference;

pub use record::{EntityRecord, PersistenceState};
pub use reference::{EntityReference, ReferenceData};

use crate::batch::{Batch, CommitAction, PendingWrite};
use crate::cache::{CacheShared, CollectionId, EntityCache};
use crate::core::{DbError, Result, StorageError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use uuid::Uuid;

/// Anything that can be stored in an entity.
pub trait Item: Serialize + DeserializeOwned + Send + Sync + 'static {}

impl<T> Item for T where T: Serialize + DeserializeOwned + Send + Sync + 'static {}

#[derive(Debug, Clone, Copy)]
struct EntityMeta {
    version: u64,
    saved: Option<DateTime<Utc>>,
    state: PersistenceState,
}

/// A live, cached instance of one stored item.
///
/// Entities are always handled through `Arc<Entity<T>>`; the owning cache only
/// keeps a weak handle, so an entity is evicted once the last strong holder
/// (application code or a pending batch) lets go.
///
/// All access to the wrapped item goes through [`Entity::access`] (or its
/// blocking twin [`Entity::access_sync`]). Both queue on the same fair lock, so
/// accesses to one entity run one at a time in submission order.
pub struct Entity<T: Item> {
    id: Uuid,
    schema_version: u32,
    created: DateTime<Utc>,
    collection: Arc<CollectionId>,
    cache: Weak<CacheShared<T>>,
    meta: Mutex<EntityMeta>,
    item: tokio::sync::Mutex<T>,
}

impl<T: Item> Entity<T> {
    pub(crate) fn new_in(cache: &Arc<CacheShared<T>>, id: Uuid, item: T) -> Self {
        Self {
            id,
            schema_version: cache.schema_version(),
            created: Utc::now(),
            collection: cache.collection(),
            cache: Arc::downgrade(cache),
            meta: Mutex::new(EntityMeta {
                version: 0,
                saved: None,
                state: PersistenceState::New,
            }),
            item: tokio::sync::Mutex::new(item),
        }
    }

    pub(crate) fn from_record(record: EntityRecord<T>, cache: &Arc<CacheShared<T>>) -> Self {
        Self {
            id: record.id,
            schema_version: cache.schema_version(),
            created: record.created,
            collection: cache.collection(),
            cache: Arc::downgrade(cache),
            meta: Mutex::new(EntityMeta {
                version: record.version,
                saved: record.saved,
                state: record.persistence_state,
            }),
            item: tokio::sync::Mutex::new(record.item),
        }
    }

    fn meta(&self) -> MutexGuard<'_, EntityMeta> {
        self.meta
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn schema_version(&self) -> u32 {
        self.schema_version
    }

    pub fn created(&self) -> DateTime<Utc> {
        self.created
    }

    pub fn saved(&self) -> Option<DateTime<Utc>> {
        self.meta().saved
    }

    pub fn version(&self) -> u64 {
        self.meta().version
    }

    pub fn persistence_state(&self) -> PersistenceState {
        self.meta().state
    }

    /// Name of the collection this entity belongs to.
    pub fn cache_name(&self) -> &str {
        &self.collection.name
    }

    /// The owning cache, while it is alive.
    pub fn cache(&self) -> Option<EntityCache<T>> {
        self.cache.upgrade().map(EntityCache::from_shared)
    }

    /// Serializable pointer to this entity, as stored by [`EntityReference`].
    pub fn reference_data(&self) -> ReferenceData {
        ReferenceData {
            database_id: self.collection.database_id.clone(),
            collection: self.collection.name.clone(),
            id: self.id,
            version: self.version(),
        }
    }

    /// Runs `f` with exclusive access to the item.
    pub async fn access<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        let mut item = self.item.lock().await;
        f(&mut item)
    }

    /// Blocking form of [`Entity::access`]. Must not be called from async code.
    pub fn access_sync<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        let mut item = self.item.blocking_lock();
        f(&mut item)
    }

    pub async fn read<R>(&self, f: impl FnOnce(&T) -> R) -> R {
        let item = self.item.lock().await;
        f(&item)
    }

    pub fn read_sync<R>(&self, f: impl FnOnce(&T) -> R) -> R {
        let item = self.item.blocking_lock();
        f(&item)
    }

    fn ensure_mutable(&self) -> Result<()> {
        let state = self.persistence_state();
        if state.is_terminal() {
            return Err(DbError::ExecutionError(format!(
                "Entity '{}' is {} and can no longer be changed",
                self.id, state
            )));
        }
        Ok(())
    }

    /// Mutates the item and queues the entity in `batch` for the next commit.
    ///
    /// The entity is queued before `mutator` runs, so a mutation is never
    /// applied without being queued. A commit racing with the call waits on
    /// the item lock and writes the mutated item.
    pub async fn update<R>(
        self: &Arc<Self>,
        batch: &Batch,
        mutator: impl FnOnce(&mut T) -> R,
    ) -> Result<R> {
        let mut item = self.item.lock().await;
        self.ensure_mutable()?;
        batch.insert(Arc::clone(self))?;
        Ok(mutator(&mut item))
    }

    /// Blocking form of [`Entity::update`].
    pub fn update_sync<R>(
        self: &Arc<Self>,
        batch: &Batch,
        mutator: impl FnOnce(&mut T) -> R,
    ) -> Result<R> {
        let mut item = self.item.blocking_lock();
        self.ensure_mutable()?;
        batch.insert(Arc::clone(self))?;
        Ok(mutator(&mut item))
    }

    /// Marks the entity for deletion when `batch` commits.
    ///
    /// A `New` entity that was never written is abandoned instead; its commit
    /// does not touch the store.
    pub async fn remove(self: &Arc<Self>, batch: &Batch) -> Result<()> {
        let _item = self.item.lock().await;
        self.mark_removed(batch)
    }

    pub fn remove_sync(self: &Arc<Self>, batch: &Batch) -> Result<()> {
        let _item = self.item.blocking_lock();
        self.mark_removed(batch)
    }

    // The state change and the queueing happen under the batch lock, so a
    // committed batch leaves the state untouched.
    fn mark_removed(self: &Arc<Self>, batch: &Batch) -> Result<()> {
        batch.insert_with(Arc::clone(self), || {
            let mut meta = self.meta();
            meta.state = match meta.state {
                PersistenceState::New => PersistenceState::Abandoned,
                PersistenceState::Persistent | PersistenceState::PendingRemoval => {
                    PersistenceState::PendingRemoval
                }
                terminal => terminal,
            };
        })
    }

    /// Serialized record of the current state.
    pub async fn encode(&self) -> Result<Vec<u8>> {
        let item = self.item.lock().await;
        let meta = *self.meta();
        EntityRecord {
            id: self.id,
            schema_version: self.schema_version,
            created: self.created,
            saved: meta.saved,
            item: &*item,
            persistence_state: meta.state,
            version: meta.version,
        }
        .encode()
    }

    // Record as it will look once the pending write has landed.
    async fn encode_committed(&self, version: u64, saved: DateTime<Utc>) -> Result<Vec<u8>> {
        let item = self.item.lock().await;
        EntityRecord {
            id: self.id,
            schema_version: self.schema_version,
            created: self.created,
            saved: Some(saved),
            item: &*item,
            persistence_state: PersistenceState::Persistent,
            version,
        }
        .encode()
    }

    fn pending_action(&self) -> CommitAction {
        match self.persistence_state() {
            PersistenceState::New => CommitAction::Insert,
            PersistenceState::Persistent => CommitAction::Update,
            PersistenceState::PendingRemoval => CommitAction::Delete,
            PersistenceState::Removed | PersistenceState::Abandoned => CommitAction::None,
        }
    }

    fn apply_committed(&self, action: CommitAction, saved: DateTime<Utc>) {
        let mut meta = self.meta();
        meta.version += 1;
        meta.saved = Some(saved);
        meta.state = match (action, meta.state) {
            (CommitAction::Delete, _) => PersistenceState::Removed,
            // Removal was requested while the insert was in flight; the record
            // now exists, so the queued removal has to delete it.
            (CommitAction::Insert, PersistenceState::Abandoned) => PersistenceState::PendingRemoval,
            (_, PersistenceState::PendingRemoval) => PersistenceState::PendingRemoval,
            _ => PersistenceState::Persistent,
        };
    }
}

#[async_trait]
impl<T: Item> PendingWrite for Entity<T> {
    fn collection(&self) -> String {
        self.collection.qualified()
    }

    fn entity_id(&self) -> Uuid {
        self.id
    }

    async fn persist_once(&self) -> Result<CommitAction> {
        let action = self.pending_action();
        if action == CommitAction::None {
            return Ok(action);
        }

        let cache = self.cache.upgrade().ok_or_else(|| {
            DbError::Storage(StorageError::unrecoverable(format!(
                "Cache '{}' owning entity '{}' no longer exists",
                self.collection.qualified(),
                self.id
            )))
        })?;
        let adapter = cache.adapter();
        let collection = self.collection.name.as_str();
        let saved = Utc::now();

        match action {
            CommitAction::Insert | CommitAction::Update => {
                let data = self.encode_committed(self.version() + 1, saved).await?;
                if action == CommitAction::Insert {
                    adapter.add(collection, self.id, data).await?;
                } else {
                    adapter.update(collection, self.id, data).await?;
                }
            }
            CommitAction::Delete => adapter.remove(collection, self.id).await?,
            CommitAction::None => {}
        }

        self.apply_committed(action, saved);
        Ok(action)
    }
}

impl<T: Item> Drop for Entity<T> {
    fn drop(&mut self) {
        if let Some(cache) = self.cache.upgrade() {
            cache.notify_evicted();
        }
    }
}

impl<T: Item> std::fmt::Debug for Entity<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let meta = *self.meta();
        f.debug_struct("Entity")
            .field("id", &self.id)
            .field("collection", &self.collection.qualified())
            .field("version", &meta.version)
            .field("schema_version", &self.schema_version)
            .field("state", &meta.state)
            .finish()
    }
}
