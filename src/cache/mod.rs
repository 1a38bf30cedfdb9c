//! Deduplicating, self-evicting cache of live entities.
//!
//! Every [`EntityCache`] maps ids to *weak* entity handles: the cache never
//! keeps an entity alive, but while anything else does, every lookup of that
//! id returns the same instance. Store reads are single-flight: concurrent
//! `get`s of an id that is not cached join one in-flight fetch and all observe
//! its result.

mod scan;

use crate::batch::Batch;
use crate::core::{DbError, LogLevel, Logger, Result};
use crate::database::Database;
use crate::entity::{Entity, EntityRecord, Item};
use crate::storage::StorageAdapter;
use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use std::any::Any;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::{Instant, timeout_at};
use uuid::Uuid;

pub(crate) const LOG_SOURCE: &str = "EntityCache";

/// Database identity plus cache name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CollectionId {
    pub database_id: String,
    pub name: String,
}

impl CollectionId {
    /// Process-wide unique name of the collection.
    pub fn qualified(&self) -> String {
        format!("{}/{}", self.database_id, self.name)
    }
}

type FetchResult<T> = Result<Option<Arc<Entity<T>>>>;
type PendingFetch<T> = Shared<BoxFuture<'static, FetchResult<T>>>;
type OnCached<T> = Box<dyn FnOnce(&Arc<Entity<T>>) + Send>;

struct CacheState<T: Item> {
    entries: HashMap<Uuid, Weak<Entity<T>>>,
    pending: HashMap<Uuid, PendingFetch<T>>,
    on_cached: HashMap<Uuid, Vec<OnCached<T>>>,
}

impl<T: Item> CacheState<T> {
    fn live(&self, id: &Uuid) -> Option<Arc<Entity<T>>> {
        self.entries.get(id).and_then(Weak::upgrade)
    }

    fn is_live(&self, id: &Uuid) -> bool {
        self.entries
            .get(id)
            .is_some_and(|entry| entry.strong_count() > 0)
    }
}

/// Outcome of inserting a freshly constructed entity.
struct Inserted<T: Item> {
    entity: Arc<Entity<T>>,
    callbacks: Vec<OnCached<T>>,
    // A live instance already existed; the candidate is handed back so it is
    // dropped outside the state lock.
    discarded: Option<Entity<T>>,
}

pub(crate) struct CacheShared<T: Item> {
    collection: Arc<CollectionId>,
    schema_version: u32,
    database: Database,
    registered: AtomicBool,
    state: Mutex<CacheState<T>>,
    evicted: Notify,
    // Entities dropped since dead entries were last purged.
    evictions: AtomicUsize,
}

impl<T: Item> CacheShared<T> {
    pub(crate) fn collection(&self) -> Arc<CollectionId> {
        Arc::clone(&self.collection)
    }

    pub(crate) fn schema_version(&self) -> u32 {
        self.schema_version
    }

    pub(crate) fn adapter(&self) -> Arc<dyn StorageAdapter> {
        self.database.adapter()
    }

    pub(crate) fn notify_evicted(&self) {
        self.evictions.fetch_add(1, Ordering::SeqCst);
        self.evicted.notify_waiters();
    }

    fn logger(&self) -> &dyn Logger {
        self.database.logger()
    }

    // Never create or drop a strong entity handle while this guard is held
    // unless it is returned to the caller.
    //
    // Dead entries left behind by dropped entities are purged on the first
    // access after the drop.
    fn state(&self) -> MutexGuard<'_, CacheState<T>> {
        let mut state = self
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if self.evictions.swap(0, Ordering::SeqCst) > 0 {
            state.entries.retain(|_, entry| entry.strong_count() > 0);
        }
        state
    }

    fn live(&self, id: &Uuid) -> Option<Arc<Entity<T>>> {
        self.state().live(id)
    }

    fn insert_locked(state: &mut CacheState<T>, candidate: Entity<T>) -> Inserted<T> {
        let id = candidate.id();
        if let Some(existing) = state.live(&id) {
            return Inserted {
                entity: existing,
                callbacks: Vec::new(),
                discarded: Some(candidate),
            };
        }

        let entity = Arc::new(candidate);
        state.entries.insert(id, Arc::downgrade(&entity));
        Inserted {
            entity,
            callbacks: state.on_cached.remove(&id).unwrap_or_default(),
            discarded: None,
        }
    }

    fn finish_insert(inserted: Inserted<T>) -> Arc<Entity<T>> {
        let Inserted {
            entity,
            callbacks,
            discarded,
        } = inserted;
        drop(discarded);
        for callback in callbacks {
            callback(&entity);
        }
        entity
    }

    /// Inserts `candidate` unless a live instance with its id exists, in which
    /// case that instance is returned instead.
    ///
    /// The flag is `true` when `candidate` itself was inserted.
    fn insert_or_existing(&self, candidate: Entity<T>) -> (Arc<Entity<T>>, bool) {
        let inserted = {
            let mut state = self.state();
            Self::insert_locked(&mut state, candidate)
        };
        let won = inserted.discarded.is_none();
        (Self::finish_insert(inserted), won)
    }

    async fn load(self: &Arc<Self>, id: Uuid) -> Result<Option<Entity<T>>> {
        let name = self.collection.name.as_str();
        let data = match self.adapter().get(name, id).await {
            Ok(Some(data)) => data,
            Ok(None) => {
                self.logger().log(
                    LogLevel::Warning,
                    LOG_SOURCE,
                    "get",
                    "unknown id",
                    &[("collection", self.collection.qualified()), ("id", id.to_string())],
                );
                return Ok(None);
            }
            Err(err) => {
                self.logger().log(
                    LogLevel::Emergency,
                    LOG_SOURCE,
                    "get",
                    "backing store read failed",
                    &[
                        ("collection", self.collection.qualified()),
                        ("id", id.to_string()),
                        ("error", err.to_string()),
                    ],
                );
                return Err(err.into());
            }
        };

        match EntityRecord::<T>::decode(&data) {
            Ok(record) => Ok(Some(Entity::from_record(record, self))),
            Err(err) => {
                self.logger().log(
                    LogLevel::Emergency,
                    LOG_SOURCE,
                    "get",
                    "stored record failed to decode",
                    &[
                        ("collection", self.collection.qualified()),
                        ("id", id.to_string()),
                        ("error", err.to_string()),
                    ],
                );
                Err(err)
            }
        }
    }

    async fn fetch(cache: Weak<Self>, id: Uuid) -> FetchResult<T> {
        let Some(cache) = cache.upgrade() else {
            return Err(DbError::ExecutionError(format!(
                "Cache dropped while fetching '{}'",
                id
            )));
        };

        let loaded = cache.load(id).await;
        let inserted = {
            let mut state = cache.state();
            state.pending.remove(&id);
            match loaded {
                Ok(Some(candidate)) => Self::insert_locked(&mut state, candidate),
                Ok(None) => return Ok(None),
                Err(err) => return Err(err),
            }
        };
        Ok(Some(Self::finish_insert(inserted)))
    }
}

impl<T: Item> Drop for CacheShared<T> {
    fn drop(&mut self) {
        if self.registered.load(Ordering::SeqCst) {
            self.database.caches().de_register(&self.collection.name);
            self.database
                .context()
                .caches()
                .de_register(&self.collection.qualified());
        }
    }
}

/// Cache of live entities of one item type, bound to one named collection of
/// a database's backing store.
pub struct EntityCache<T: Item> {
    shared: Arc<CacheShared<T>>,
}

impl<T: Item> Clone for EntityCache<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T: Item> EntityCache<T> {
    /// Creates the cache `name` in `database`, stamped with the database's
    /// schema version.
    ///
    /// The name must be non-empty and unused by any live cache of the same
    /// database. A colliding or empty name is logged at ERROR and yields a
    /// cache with `is_registered() == false`.
    pub fn new(database: &Database, name: impl Into<String>) -> Self {
        Self::with_schema_version(database, name, database.config().schema_version)
    }

    pub fn with_schema_version(
        database: &Database,
        name: impl Into<String>,
        schema_version: u32,
    ) -> Self {
        let collection = Arc::new(CollectionId {
            database_id: database.id().to_string(),
            name: name.into(),
        });
        let shared = Arc::new(CacheShared {
            collection: Arc::clone(&collection),
            schema_version,
            database: database.clone(),
            registered: AtomicBool::new(false),
            state: Mutex::new(CacheState {
                entries: HashMap::new(),
                pending: HashMap::new(),
                on_cached: HashMap::new(),
            }),
            evicted: Notify::new(),
            evictions: AtomicUsize::new(0),
        });

        if collection.name.is_empty() {
            database.logger().log(
                LogLevel::Error,
                LOG_SOURCE,
                "new",
                "cache name must not be empty",
                &[("database", collection.database_id.clone())],
            );
            return Self { shared };
        }

        let erased: Arc<dyn Any + Send + Sync> = shared.clone();
        let mut registered = database
            .caches()
            .register(collection.name.clone(), &erased);
        if registered
            && !database
                .context()
                .caches()
                .register(collection.qualified(), &erased)
        {
            // Both claims or neither.
            database.caches().release(&collection.name, &erased);
            registered = false;
        }
        drop(erased);

        if registered {
            shared.registered.store(true, Ordering::SeqCst);
        } else {
            database.logger().log(
                LogLevel::Error,
                LOG_SOURCE,
                "new",
                "duplicate cache registration",
                &[("collection", collection.qualified())],
            );
        }

        Self { shared }
    }

    pub(crate) fn from_shared(shared: Arc<CacheShared<T>>) -> Self {
        Self { shared }
    }

    pub fn name(&self) -> &str {
        &self.shared.collection.name
    }

    pub fn qualified_name(&self) -> String {
        self.shared.collection.qualified()
    }

    pub fn schema_version(&self) -> u32 {
        self.shared.schema_version
    }

    pub fn is_registered(&self) -> bool {
        self.shared.registered.load(Ordering::SeqCst)
    }

    pub fn database(&self) -> &Database {
        &self.shared.database
    }

    /// Creates a `New` entity with a fresh id, caches it and queues it in `batch`.
    pub fn new_entity(&self, batch: &Batch, item: T) -> Result<Arc<Entity<T>>> {
        self.new_entity_with_id(batch, Uuid::new_v4(), item)
    }

    /// Like [`EntityCache::new_entity`], building the item from the new id.
    pub fn new_entity_with(
        &self,
        batch: &Batch,
        factory: impl FnOnce(Uuid) -> T,
    ) -> Result<Arc<Entity<T>>> {
        let id = Uuid::new_v4();
        self.new_entity_with_id(batch, id, factory(id))
    }

    /// Creates a `New` entity under a caller-chosen id.
    ///
    /// Fails with [`DbError::DuplicateEntity`] when a live instance with that id
    /// is cached.
    pub fn new_entity_with_id(&self, batch: &Batch, id: Uuid, item: T) -> Result<Arc<Entity<T>>> {
        batch.ensure_open()?;
        let candidate = Entity::new_in(&self.shared, id, item);
        let inserted = {
            let mut state = self.shared.state();
            if state.is_live(&id) {
                None
            } else {
                Some(CacheShared::insert_locked(&mut state, candidate))
            }
        };

        let Some(inserted) = inserted else {
            return Err(DbError::DuplicateEntity(id.to_string()));
        };
        let entity = CacheShared::finish_insert(inserted);
        batch.insert(Arc::clone(&entity))?;
        Ok(entity)
    }

    /// Returns the entity with `id`, reading it from the store if it is not cached.
    ///
    /// `Ok(None)` means the store does not know the id. Store and decoding
    /// failures are logged at EMERGENCY and returned to every caller waiting
    /// on the same fetch; nothing is retried here.
    pub async fn get(&self, id: Uuid) -> Result<Option<Arc<Entity<T>>>> {
        let fetch = {
            let mut state = self.shared.state();
            if let Some(entity) = state.live(&id) {
                return Ok(Some(entity));
            }
            match state.pending.get(&id) {
                Some(fetch) => fetch.clone(),
                None => {
                    let fetch = CacheShared::fetch(Arc::downgrade(&self.shared), id)
                        .boxed()
                        .shared();
                    state.pending.insert(id, fetch.clone());
                    // Driven to completion even if every waiter goes away.
                    self.shared.database.runtime().spawn(fetch.clone());
                    fetch
                }
            }
        };
        fetch.await
    }

    /// Blocking form of [`EntityCache::get`]. Must not be called from async code.
    pub fn get_sync(&self, id: Uuid) -> Result<Option<Arc<Entity<T>>>> {
        let cache = self.clone();
        self.shared
            .database
            .runtime()
            .block_on(async move { cache.get(id).await })?
    }

    /// Callback form of [`EntityCache::get`]; returns immediately.
    pub fn get_with<F>(&self, id: Uuid, completion: F)
    where
        F: FnOnce(Result<Option<Arc<Entity<T>>>>) + Send + 'static,
    {
        let cache = self.clone();
        self.shared
            .database
            .runtime()
            .spawn(async move { completion(cache.get(id).await) });
    }

    /// Whether a live instance of `id` is cached. Never blocks on I/O.
    pub fn has_cached(&self, id: Uuid) -> bool {
        self.shared.state().is_live(&id)
    }

    /// Number of live cached entities.
    pub fn cached_count(&self) -> usize {
        let state = self.shared.state();
        state
            .entries
            .values()
            .filter(|entry| entry.strong_count() > 0)
            .count()
    }

    /// Waits until no live instance of `id` is cached or `timeout` elapses.
    ///
    /// Returns `true` if the entity is no longer cached.
    pub async fn wait_while_cached_async(&self, id: Uuid, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            let evicted = self.shared.evicted.notified();
            tokio::pin!(evicted);
            evicted.as_mut().enable();

            if !self.has_cached(id) {
                return true;
            }
            if timeout_at(deadline, evicted).await.is_err() {
                return !self.has_cached(id);
            }
        }
    }

    /// Blocking form of [`EntityCache::wait_while_cached_async`].
    pub fn wait_while_cached(&self, id: Uuid, timeout: Duration) -> bool {
        let cache = self.clone();
        self.shared
            .database
            .runtime()
            .block_on(async move { cache.wait_while_cached_async(id, timeout).await })
            .unwrap_or_else(|_| !self.has_cached(id))
    }

    /// Registers a one-shot callback for the next time an entity with `id` is
    /// inserted into this cache. Callbacks for one id fire in registration order.
    pub fn register_on_entity_cached<F>(&self, id: Uuid, callback: F)
    where
        F: FnOnce(&Arc<Entity<T>>) + Send + 'static,
    {
        self.shared
            .state()
            .on_cached
            .entry(id)
            .or_default()
            .push(Box::new(callback));
    }
}

impl<T: Item> std::fmt::Debug for EntityCache<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntityCache")
            .field("collection", &self.shared.collection.qualified())
            .field("schema_version", &self.shared.schema_version)
            .field("registered", &self.is_registered())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::{DatabaseConfig, PersistContext};
    use crate::storage::InMemoryStorage;

    #[tokio::test]
    async fn test_dropped_entities_leave_no_entries_behind() {
        let db = Database::open(
            Arc::new(InMemoryStorage::isolated()),
            DatabaseConfig::default(),
            &PersistContext::new(),
        )
        .unwrap();
        let cache = db.cache::<i64>("numbers");
        let unknown = Uuid::new_v4();

        for n in 0..1000 {
            let batch = db.new_batch();
            let entity = cache.new_entity(&batch, n).unwrap();
            let id = entity.id();
            drop(entity);
            drop(batch);
            assert!(!cache.has_cached(id));
            if n % 100 == 0 {
                assert!(cache.get(unknown).await.unwrap().is_none());
            }
        }

        assert_eq!(cache.shared.state().entries.len(), 0);
    }

    #[tokio::test]
    async fn test_live_entries_survive_purge() {
        let db = Database::open(
            Arc::new(InMemoryStorage::isolated()),
            DatabaseConfig::default(),
            &PersistContext::new(),
        )
        .unwrap();
        let cache = db.cache::<i64>("numbers");
        let batch = db.new_batch();
        let kept = cache.new_entity(&batch, 1).unwrap();
        let dropped = cache.new_entity(&batch, 2).unwrap();
        drop(batch);
        drop(dropped);

        assert!(cache.has_cached(kept.id()));
        assert_eq!(cache.shared.state().entries.len(), 1);
        assert_eq!(cache.cached_count(), 1);
    }
}
