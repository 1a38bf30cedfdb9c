#![allow(dead_code)]

use chrono::Utc;
use rustentitydb::{
    Database, DatabaseConfig, EntityRecord, InMemoryStorage, MemoryLogger, PersistContext,
    PersistenceState,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    pub my_int: i64,
    pub label: String,
}

impl Sample {
    pub fn new(my_int: i64) -> Self {
        Self {
            my_int,
            label: format!("sample-{}", my_int),
        }
    }
}

pub struct Harness {
    pub storage: Arc<InMemoryStorage>,
    pub logger: Arc<MemoryLogger>,
    pub context: PersistContext,
    pub db: Database,
}

impl Harness {
    pub fn new(config: DatabaseConfig) -> Self {
        Self::over(Arc::new(InMemoryStorage::isolated()), config)
    }

    /// Fresh context and database over an existing store.
    pub fn over(storage: Arc<InMemoryStorage>, config: DatabaseConfig) -> Self {
        let logger = Arc::new(MemoryLogger::new());
        let context = PersistContext::new();
        let db = Database::open_with_logger(storage.clone(), config, &context, logger.clone())
            .unwrap();
        Self {
            storage,
            logger,
            context,
            db,
        }
    }

    pub fn reopen(&self) -> Self {
        Self::over(self.storage.clone(), self.db.config().clone())
    }
}

/// Short retry intervals and timeouts; meant for tests running on a paused clock.
pub fn fast_config() -> DatabaseConfig {
    DatabaseConfig::new()
        .batch_retry_interval(Duration::from_millis(100))
        .batch_timeout(Duration::from_secs(1))
        .reference_retry_interval(Duration::from_millis(100))
        .reference_timeout(Duration::from_secs(1))
}

/// Writes a persistent record straight into the store.
pub fn seed<I: Serialize>(storage: &InMemoryStorage, collection: &str, id: Uuid, item: I) {
    let record = EntityRecord {
        id,
        schema_version: 1,
        created: Utc::now(),
        saved: Some(Utc::now()),
        item,
        persistence_state: PersistenceState::Persistent,
        version: 1,
    };
    storage.put_raw(collection, id, record.encode().unwrap());
}
