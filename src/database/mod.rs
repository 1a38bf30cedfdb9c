//! Database handle: one backing store plus the configuration, logger and
//! runtime shared by every cache and batch built on it.

pub mod config;
pub mod context;

pub use config::{BatchPolicy, DatabaseConfig};
pub use context::PersistContext;

use crate::batch::Batch;
use crate::cache::{CacheShared, EntityCache};
use crate::core::{DbError, LogLevel, Logger, Result, RuntimeBinding, TracingLogger};
use crate::entity::Item;
use crate::registrar::Registrar;
use crate::storage::StorageAdapter;
use std::any::Any;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

const LOG_SOURCE: &str = "Database";

pub(crate) struct DatabaseShared {
    id: String,
    adapter: Arc<dyn StorageAdapter>,
    config: DatabaseConfig,
    logger: Arc<dyn Logger>,
    context: PersistContext,
    caches: Registrar<String, dyn Any + Send + Sync>,
    runtime: RuntimeBinding,
    registered: AtomicBool,
}

impl Drop for DatabaseShared {
    fn drop(&mut self) {
        if self.registered.load(Ordering::SeqCst) {
            self.context.databases().de_register(&self.id);
        }
    }
}

/// Cheaply cloneable handle to an open database.
#[derive(Clone)]
pub struct Database {
    shared: Arc<DatabaseShared>,
}

impl Database {
    /// Opens a database over `adapter`, logging through `tracing`.
    pub fn open(
        adapter: Arc<dyn StorageAdapter>,
        config: DatabaseConfig,
        context: &PersistContext,
    ) -> Result<Self> {
        Self::open_with_logger(adapter, config, context, Arc::new(TracingLogger))
    }

    /// Opens a database over `adapter`.
    ///
    /// The store id must not be claimed by another live database of
    /// `context`. A second claim is logged at EMERGENCY and yields a handle
    /// with `is_registered() == false`; invalid configuration is an error.
    pub fn open_with_logger(
        adapter: Arc<dyn StorageAdapter>,
        config: DatabaseConfig,
        context: &PersistContext,
        logger: Arc<dyn Logger>,
    ) -> Result<Self> {
        config.validate().map_err(DbError::Config)?;
        let runtime = RuntimeBinding::current_or_owned()?;

        let shared = Arc::new(DatabaseShared {
            id: adapter.store_id().to_string(),
            adapter,
            config,
            logger,
            context: context.clone(),
            caches: Registrar::new(),
            runtime,
            registered: AtomicBool::new(false),
        });

        if context.databases().register(shared.id.clone(), &shared) {
            shared.registered.store(true, Ordering::SeqCst);
        } else {
            shared.logger.log(
                LogLevel::Emergency,
                LOG_SOURCE,
                "open",
                "store is already claimed by a live database",
                &[("store", shared.id.clone())],
            );
        }

        Ok(Self { shared })
    }

    /// Identity of the backing store.
    pub fn id(&self) -> &str {
        &self.shared.id
    }

    pub fn config(&self) -> &DatabaseConfig {
        &self.shared.config
    }

    pub fn logger(&self) -> &dyn Logger {
        self.shared.logger.as_ref()
    }

    pub fn adapter(&self) -> Arc<dyn StorageAdapter> {
        Arc::clone(&self.shared.adapter)
    }

    pub fn runtime(&self) -> &RuntimeBinding {
        &self.shared.runtime
    }

    pub fn is_registered(&self) -> bool {
        self.shared.registered.load(Ordering::SeqCst)
    }

    pub(crate) fn caches(&self) -> &Registrar<String, dyn Any + Send + Sync> {
        &self.shared.caches
    }

    pub(crate) fn context(&self) -> &PersistContext {
        &self.shared.context
    }

    /// Empty batch using the configured retry policy.
    pub fn new_batch(&self) -> Batch {
        self.new_batch_with_policy(BatchPolicy::from(&self.shared.config))
    }

    pub fn new_batch_with_policy(&self, policy: BatchPolicy) -> Batch {
        Batch::new(
            policy,
            Arc::clone(&self.shared.logger),
            self.shared.runtime.clone(),
        )
    }

    /// Creates the cache `name`; see [`EntityCache::new`].
    pub fn cache<T: Item>(&self, name: impl Into<String>) -> EntityCache<T> {
        EntityCache::new(self, name)
    }

    /// Live cache registered under `name`, if it holds items of type `T`.
    pub fn cache_named<T: Item>(&self, name: &str) -> Option<EntityCache<T>> {
        let erased = self.shared.caches.value(&name.to_string())?;
        erased
            .downcast::<CacheShared<T>>()
            .ok()
            .map(EntityCache::from_shared)
    }
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("id", &self.shared.id)
            .field("registered", &self.is_registered())
            .field("config", &self.shared.config)
            .finish()
    }
}
