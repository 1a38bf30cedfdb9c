use super::{StorageAdapter, StorageResult};
use crate::core::{StorageError, StorageErrorKind};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, RwLock};
use std::time::Duration;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StorageOp {
    Add,
    Get,
    Update,
    Remove,
    Scan,
}

impl StorageOp {
    const ALL: [StorageOp; 5] = [Self::Add, Self::Get, Self::Update, Self::Remove, Self::Scan];

    fn slot(self) -> usize {
        match self {
            Self::Add => 0,
            Self::Get => 1,
            Self::Update => 2,
            Self::Remove => 3,
            Self::Scan => 4,
        }
    }
}

/// Injected failure for [`InMemoryStorage`].
///
/// A rule matches a call when its operation and id filters (if set) match.
/// `remaining: None` fails forever; `Some(n)` fails the next `n` matching calls.
#[derive(Debug, Clone)]
pub struct FaultRule {
    pub op: Option<StorageOp>,
    pub id: Option<Uuid>,
    pub kind: StorageErrorKind,
    pub remaining: Option<usize>,
}

impl FaultRule {
    pub fn recoverable(op: StorageOp, times: usize) -> Self {
        Self {
            op: Some(op),
            id: None,
            kind: StorageErrorKind::Recoverable,
            remaining: Some(times),
        }
    }

    pub fn unrecoverable(op: StorageOp) -> Self {
        Self {
            op: Some(op),
            id: None,
            kind: StorageErrorKind::Unrecoverable,
            remaining: None,
        }
    }

    /// Fails every call touching `id`, forever.
    pub fn always_for(id: Uuid, kind: StorageErrorKind) -> Self {
        Self {
            op: None,
            id: Some(id),
            kind,
            remaining: None,
        }
    }

    pub fn for_id(mut self, id: Uuid) -> Self {
        self.id = Some(id);
        self
    }

    fn matches(&self, op: StorageOp, id: Option<Uuid>) -> bool {
        self.op.is_none_or(|expected| expected == op)
            && self.id.is_none_or(|expected| Some(expected) == id)
            && self.remaining != Some(0)
    }
}

/// In-memory adapter used for testing.
///
/// Thread-safe, counts calls per operation and supports fault injection and an
/// artificial latency applied before every call.
#[derive(Debug)]
pub struct InMemoryStorage {
    store_id: String,
    collections: RwLock<HashMap<String, HashMap<Uuid, Vec<u8>>>>,
    faults: Mutex<Vec<FaultRule>>,
    latency: Mutex<Option<Duration>>,
    calls: [AtomicUsize; 5],
}

impl InMemoryStorage {
    pub fn new(store_id: impl Into<String>) -> Self {
        Self {
            store_id: store_id.into(),
            collections: RwLock::new(HashMap::new()),
            faults: Mutex::new(Vec::new()),
            latency: Mutex::new(None),
            calls: Default::default(),
        }
    }

    /// Store with a random id, for isolated tests.
    pub fn isolated() -> Self {
        Self::new(format!("memory-{}", Uuid::new_v4()))
    }

    pub fn inject_fault(&self, rule: FaultRule) {
        if let Ok(mut faults) = self.faults.lock() {
            faults.push(rule);
        }
    }

    pub fn clear_faults(&self) {
        if let Ok(mut faults) = self.faults.lock() {
            faults.clear();
        }
    }

    pub fn set_latency(&self, latency: Option<Duration>) {
        if let Ok(mut current) = self.latency.lock() {
            *current = latency;
        }
    }

    pub fn calls(&self, op: StorageOp) -> usize {
        self.calls[op.slot()].load(Ordering::SeqCst)
    }

    pub fn total_calls(&self) -> usize {
        StorageOp::ALL.iter().map(|op| self.calls(*op)).sum()
    }

    /// Stores raw bytes without going through an entity, e.g. to plant a corrupt record.
    pub fn put_raw(&self, collection: &str, id: Uuid, data: Vec<u8>) {
        if let Ok(mut collections) = self.collections.write() {
            collections
                .entry(collection.to_string())
                .or_default()
                .insert(id, data);
        }
    }

    pub fn raw(&self, collection: &str, id: Uuid) -> Option<Vec<u8>> {
        self.collections
            .read()
            .ok()?
            .get(collection)
            .and_then(|records| records.get(&id).cloned())
    }

    pub fn len(&self, collection: &str) -> usize {
        self.collections
            .read()
            .map(|collections| collections.get(collection).map_or(0, HashMap::len))
            .unwrap_or(0)
    }

    pub fn is_empty(&self, collection: &str) -> bool {
        self.len(collection) == 0
    }

    async fn enter(&self, op: StorageOp, id: Option<Uuid>) -> StorageResult<()> {
        self.calls[op.slot()].fetch_add(1, Ordering::SeqCst);

        let latency = self.latency.lock().ok().and_then(|latency| *latency);
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }

        let mut faults = self
            .faults
            .lock()
            .map_err(|e| StorageError::unrecoverable(e.to_string()))?;
        if let Some(rule) = faults.iter_mut().find(|rule| rule.matches(op, id)) {
            if let Some(remaining) = rule.remaining.as_mut() {
                *remaining -= 1;
            }
            return Err(StorageError {
                kind: rule.kind,
                message: format!("injected {:?} failure", op),
            });
        }
        Ok(())
    }

    fn write_lock(
        &self,
    ) -> StorageResult<std::sync::RwLockWriteGuard<'_, HashMap<String, HashMap<Uuid, Vec<u8>>>>>
    {
        self.collections
            .write()
            .map_err(|e| StorageError::unrecoverable(e.to_string()))
    }
}

#[async_trait]
impl StorageAdapter for InMemoryStorage {
    fn store_id(&self) -> &str {
        &self.store_id
    }

    async fn add(&self, collection: &str, id: Uuid, data: Vec<u8>) -> StorageResult<()> {
        self.enter(StorageOp::Add, Some(id)).await?;
        let mut collections = self.write_lock()?;
        let records = collections.entry(collection.to_string()).or_default();
        if records.contains_key(&id) {
            return Err(StorageError::unrecoverable(format!(
                "'{}' already exists in '{}'",
                id, collection
            )));
        }
        records.insert(id, data);
        Ok(())
    }

    async fn get(&self, collection: &str, id: Uuid) -> StorageResult<Option<Vec<u8>>> {
        self.enter(StorageOp::Get, Some(id)).await?;
        let collections = self
            .collections
            .read()
            .map_err(|e| StorageError::unrecoverable(e.to_string()))?;
        Ok(collections
            .get(collection)
            .and_then(|records| records.get(&id).cloned()))
    }

    async fn update(&self, collection: &str, id: Uuid, data: Vec<u8>) -> StorageResult<()> {
        self.enter(StorageOp::Update, Some(id)).await?;
        let mut collections = self.write_lock()?;
        match collections
            .get_mut(collection)
            .and_then(|records| records.get_mut(&id))
        {
            Some(existing) => {
                *existing = data;
                Ok(())
            }
            None => Err(StorageError::unrecoverable(format!(
                "'{}' not found in '{}'",
                id, collection
            ))),
        }
    }

    async fn remove(&self, collection: &str, id: Uuid) -> StorageResult<()> {
        self.enter(StorageOp::Remove, Some(id)).await?;
        let mut collections = self.write_lock()?;
        if let Some(records) = collections.get_mut(collection) {
            records.remove(&id);
        }
        Ok(())
    }

    async fn scan(&self, collection: &str) -> StorageResult<Vec<Vec<u8>>> {
        self.enter(StorageOp::Scan, None).await?;
        let collections = self
            .collections
            .read()
            .map_err(|e| StorageError::unrecoverable(e.to_string()))?;
        Ok(collections
            .get(collection)
            .map(|records| records.values().cloned().collect())
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_finite_fault_then_success() {
        let storage = InMemoryStorage::isolated();
        let id = Uuid::new_v4();
        storage.inject_fault(FaultRule::recoverable(StorageOp::Add, 2));

        for _ in 0..2 {
            let err = storage.add("c", id, b"x".to_vec()).await.unwrap_err();
            assert!(err.is_recoverable());
        }
        storage.add("c", id, b"x".to_vec()).await.unwrap();
        assert_eq!(storage.calls(StorageOp::Add), 3);
        assert_eq!(storage.raw("c", id), Some(b"x".to_vec()));
    }

    #[tokio::test]
    async fn test_fault_scoped_to_id() {
        let storage = InMemoryStorage::isolated();
        let broken = Uuid::new_v4();
        let fine = Uuid::new_v4();
        storage.inject_fault(FaultRule::always_for(broken, StorageErrorKind::Unrecoverable));

        assert!(storage.get("c", broken).await.is_err());
        assert_eq!(storage.get("c", fine).await.unwrap(), None);

        storage.clear_faults();
        assert_eq!(storage.get("c", broken).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_add_and_update_preconditions() {
        let storage = InMemoryStorage::isolated();
        let id = Uuid::new_v4();

        let err = storage.update("c", id, b"x".to_vec()).await.unwrap_err();
        assert!(!err.is_recoverable());

        storage.add("c", id, b"x".to_vec()).await.unwrap();
        let err = storage.add("c", id, b"y".to_vec()).await.unwrap_err();
        assert!(!err.is_recoverable());

        storage.remove("c", id).await.unwrap();
        storage.remove("c", id).await.unwrap();
        assert!(storage.is_empty("c"));
        assert_eq!(storage.total_calls(), 5);
    }
}
