// ============================================================================
// RustEntityDB Library
// ============================================================================

//! In-process entity cache and consistency engine.
//!
//! Typed items are wrapped in versioned [`Entity`] handles, deduplicated per
//! id by an [`EntityCache`] that only holds them weakly, and written to a
//! pluggable [`StorageAdapter`] through eventually consistent [`Batch`]
//! commits. [`EntityReference`] fields link entities and resolve lazily
//! through the target's cache.
//!
//! ```ignore
//! let context = PersistContext::new();
//! let storage = Arc::new(InMemoryStorage::isolated());
//! let db = Database::open(storage, DatabaseConfig::default(), &context)?;
//! let cache = db.cache::<Counter>("counters");
//!
//! let batch = db.new_batch();
//! let counter = cache.new_entity(&batch, Counter { value: 10 })?;
//! batch.commit().await?;
//! assert_eq!(counter.version(), 1);
//! ```

pub mod batch;
pub mod cache;
pub mod core;
pub mod database;
pub mod entity;
pub mod registrar;
pub mod storage;

pub use batch::{Batch, BatchReport, CommitAction, EntityCommitOutcome};
pub use cache::{CollectionId, EntityCache};
pub use crate::core::{
    DbError, LogData, LogLevel, LogRecord, Logger, MemoryLogger, Result, RuntimeBinding,
    StorageError, StorageErrorKind, TracingLogger,
};
pub use database::{BatchPolicy, Database, DatabaseConfig, PersistContext};
pub use entity::{Entity, EntityRecord, EntityReference, Item, PersistenceState, ReferenceData};
pub use registrar::Registrar;
pub use storage::{FaultRule, FileStorage, InMemoryStorage, StorageAdapter, StorageOp};
