//! Backing-store adapters.
//!
//! The cache and batch layers talk to storage only through [`StorageAdapter`].
//! Payloads are opaque bytes keyed by collection name and entity id; every
//! failure carries a recoverable/unrecoverable classification.

pub mod file;
pub mod memory;

pub use file::FileStorage;
pub use memory::{FaultRule, InMemoryStorage, StorageOp};

use crate::core::StorageError;
use async_trait::async_trait;
use uuid::Uuid;

pub type StorageResult<T> = std::result::Result<T, StorageError>;

#[async_trait]
pub trait StorageAdapter: Send + Sync {
    /// Identity of the underlying store; at most one live database per id.
    fn store_id(&self) -> &str;

    async fn add(&self, collection: &str, id: Uuid, data: Vec<u8>) -> StorageResult<()>;

    /// `Ok(None)` when the id is unknown to the store.
    async fn get(&self, collection: &str, id: Uuid) -> StorageResult<Option<Vec<u8>>>;

    async fn update(&self, collection: &str, id: Uuid, data: Vec<u8>) -> StorageResult<()>;

    async fn remove(&self, collection: &str, id: Uuid) -> StorageResult<()>;

    async fn scan(&self, collection: &str) -> StorageResult<Vec<Vec<u8>>>;
}
