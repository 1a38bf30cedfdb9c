use super::{Entity, Item};
use crate::core::{DbError, LogLevel, Result};
use crate::database::Database;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::time::{Instant, sleep};
use uuid::Uuid;

const LOG_SOURCE: &str = "EntityReference";

/// Serializable pointer to an entity in some cache.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReferenceData {
    pub database_id: String,
    pub collection: String,
    pub id: Uuid,
    pub version: u64,
}

enum Target<C: Item> {
    Unset,
    Resolved(Arc<Entity<C>>),
    Unresolved(ReferenceData),
}

impl<C: Item> Clone for Target<C> {
    fn clone(&self) -> Self {
        match self {
            Self::Unset => Self::Unset,
            Self::Resolved(entity) => Self::Resolved(Arc::clone(entity)),
            Self::Unresolved(data) => Self::Unresolved(data.clone()),
        }
    }
}

/// Relationship field from a parent item to a child entity.
///
/// Lives inside the parent's item, so changing it with [`EntityReference::set`]
/// happens inside the parent's `update` and is committed with it. Serializes
/// as `null` or [`ReferenceData`]; a deserialized reference starts unresolved
/// and is loaded lazily through the child's cache by [`EntityReference::get`].
pub struct EntityReference<C: Item> {
    target: Mutex<Target<C>>,
}

impl<C: Item> EntityReference<C> {
    pub fn new() -> Self {
        Self::with_target(Target::Unset)
    }

    fn with_target(target: Target<C>) -> Self {
        Self {
            target: Mutex::new(target),
        }
    }

    pub fn to(entity: &Arc<Entity<C>>) -> Self {
        Self::with_target(Target::Resolved(Arc::clone(entity)))
    }

    pub fn from_data(data: ReferenceData) -> Self {
        Self::with_target(Target::Unresolved(data))
    }

    fn target(&self) -> MutexGuard<'_, Target<C>> {
        self.target
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn set(&mut self, entity: Option<&Arc<Entity<C>>>) {
        *self.target() = match entity {
            Some(entity) => Target::Resolved(Arc::clone(entity)),
            None => Target::Unset,
        };
    }

    pub fn set_reference_data(&mut self, data: Option<ReferenceData>) {
        *self.target() = match data {
            Some(data) => Target::Unresolved(data),
            None => Target::Unset,
        };
    }

    pub fn is_set(&self) -> bool {
        !matches!(*self.target(), Target::Unset)
    }

    pub fn is_resolved(&self) -> bool {
        matches!(*self.target(), Target::Resolved(_))
    }

    pub fn id(&self) -> Option<Uuid> {
        match &*self.target() {
            Target::Unset => None,
            Target::Resolved(entity) => Some(entity.id()),
            Target::Unresolved(data) => Some(data.id),
        }
    }

    pub fn reference_data(&self) -> Option<ReferenceData> {
        match &*self.target() {
            Target::Unset => None,
            Target::Resolved(entity) => Some(entity.reference_data()),
            Target::Unresolved(data) => Some(data.clone()),
        }
    }

    /// Returns the referenced entity, loading it through its cache when the
    /// reference is unresolved.
    ///
    /// Recoverable storage failures are retried every
    /// `reference_retry_interval` until `reference_timeout`; an id the store
    /// does not know is reported as [`DbError::UnknownReference`] at once.
    pub async fn get(&self, database: &Database) -> Result<Option<Arc<Entity<C>>>> {
        let target = self.target().clone();
        let data = match target {
            Target::Unset => return Ok(None),
            Target::Resolved(entity) => return Ok(Some(entity)),
            Target::Unresolved(data) => data,
        };

        let entity = resolve(database.clone(), data.clone()).await?;
        self.memoize(&data, &entity);
        Ok(Some(entity))
    }

    /// Blocking form of [`EntityReference::get`]. Must not be called from async code.
    pub fn get_sync(&self, database: &Database) -> Result<Option<Arc<Entity<C>>>> {
        let target = self.target().clone();
        let data = match target {
            Target::Unset => return Ok(None),
            Target::Resolved(entity) => return Ok(Some(entity)),
            Target::Unresolved(data) => data,
        };

        let entity = database
            .runtime()
            .block_on(resolve(database.clone(), data.clone()))??;
        self.memoize(&data, &entity);
        Ok(Some(entity))
    }

    // Only replaces the marker that was resolved; a concurrent `set` wins.
    fn memoize(&self, data: &ReferenceData, entity: &Arc<Entity<C>>) {
        let mut target = self.target();
        if matches!(&*target, Target::Unresolved(current) if current == data) {
            *target = Target::Resolved(Arc::clone(entity));
        }
    }
}

async fn resolve<C: Item>(database: Database, data: ReferenceData) -> Result<Arc<Entity<C>>> {
    if data.database_id != database.id() {
        return Err(DbError::ExecutionError(format!(
            "Reference to '{}' points at database '{}', not '{}'",
            data.id,
            data.database_id,
            database.id()
        )));
    }

    let cache = database.cache_named::<C>(&data.collection).ok_or_else(|| {
        DbError::ExecutionError(format!(
            "No live cache named '{}' in database '{}'",
            data.collection,
            database.id()
        ))
    })?;

    let config = database.config();
    let deadline = Instant::now() + config.reference_timeout;
    let mut attempts = 0usize;
    loop {
        attempts += 1;
        match cache.get(data.id).await {
            Ok(Some(entity)) => return Ok(entity),
            Ok(None) => return Err(DbError::UnknownReference(data.id.to_string())),
            Err(err) if err.is_recoverable() => {
                if Instant::now() + config.reference_retry_interval > deadline {
                    database.logger().log(
                        LogLevel::Error,
                        LOG_SOURCE,
                        "get",
                        "reference resolution timed out",
                        &[
                            ("id", data.id.to_string()),
                            ("collection", data.collection.clone()),
                            ("attempts", attempts.to_string()),
                            ("error", err.to_string()),
                        ],
                    );
                    return Err(DbError::Timeout(format!(
                        "Reference '{}' unresolved after {} attempts: {}",
                        data.id, attempts, err
                    )));
                }
                database.logger().log(
                    LogLevel::Debug,
                    LOG_SOURCE,
                    "get",
                    "reference not yet available, retrying",
                    &[("id", data.id.to_string()), ("attempt", attempts.to_string())],
                );
                sleep(config.reference_retry_interval).await;
            }
            Err(err) => return Err(err),
        }
    }
}

impl<C: Item> Default for EntityReference<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C: Item> Clone for EntityReference<C> {
    fn clone(&self) -> Self {
        Self::with_target(self.target().clone())
    }
}

impl<C: Item> std::fmt::Debug for EntityReference<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let (state, id) = match &*self.target() {
            Target::Unset => ("unset", None),
            Target::Resolved(entity) => ("resolved", Some(entity.id())),
            Target::Unresolved(data) => ("unresolved", Some(data.id)),
        };
        f.debug_struct("EntityReference")
            .field("state", &state)
            .field("id", &id)
            .finish()
    }
}

impl<C: Item> Serialize for EntityReference<C> {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        self.reference_data().serialize(serializer)
    }
}

impl<'de, C: Item> Deserialize<'de> for EntityReference<C> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let target = match Option::<ReferenceData>::deserialize(deserializer)? {
            Some(data) => Target::Unresolved(data),
            None => Target::Unset,
        };
        Ok(Self::with_target(target))
    }
}
