use super::DatabaseShared;
use crate::registrar::Registrar;
use std::any::Any;
use std::sync::Arc;

#[derive(Default)]
struct Registries {
    databases: Registrar<String, DatabaseShared>,
    caches: Registrar<String, dyn Any + Send + Sync>,
}

/// Process-wide identity registries.
///
/// Holds the claims of every live database (keyed by its store id) and every
/// live cache (keyed by its qualified name). Create one at startup and hand it
/// to each [`Database::open`](super::Database::open); clones share the same
/// registries.
#[derive(Clone, Default)]
pub struct PersistContext {
    registries: Arc<Registries>,
}

impl PersistContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn database_count(&self) -> usize {
        self.registries.databases.count()
    }

    pub fn cache_count(&self) -> usize {
        self.registries.caches.count()
    }

    pub fn is_database_registered(&self, store_id: &str) -> bool {
        self.registries.databases.is_registered(&store_id.to_string())
    }

    /// `qualified_name` is `"<store id>/<cache name>"`.
    pub fn is_cache_registered(&self, qualified_name: &str) -> bool {
        self.registries
            .caches
            .is_registered(&qualified_name.to_string())
    }

    pub(crate) fn databases(&self) -> &Registrar<String, DatabaseShared> {
        &self.registries.databases
    }

    pub(crate) fn caches(&self) -> &Registrar<String, dyn Any + Send + Sync> {
        &self.registries.caches
    }
}

impl std::fmt::Debug for PersistContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PersistContext")
            .field("databases", &self.database_count())
            .field("caches", &self.cache_count())
            .finish()
    }
}
