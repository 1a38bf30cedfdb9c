use super::{StorageAdapter, StorageResult};
use crate::core::StorageError;
use async_trait::async_trait;
use log::warn;
use std::fs;
use std::io::{self, ErrorKind, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use uuid::Uuid;

const RECORD_EXTENSION: &str = "json";

/// Filesystem adapter: one directory per collection, one file per entity.
///
/// Writes go to a temporary file in the collection directory and are renamed
/// into place, so readers never observe a partially written record.
#[derive(Debug, Clone)]
pub struct FileStorage {
    root: PathBuf,
    store_id: String,
}

fn classify(context: &str, err: io::Error) -> StorageError {
    let message = format!("{}: {}", context, err);
    match err.kind() {
        ErrorKind::Interrupted | ErrorKind::WouldBlock | ErrorKind::TimedOut => {
            StorageError::recoverable(message)
        }
        _ => StorageError::unrecoverable(message),
    }
}

impl FileStorage {
    pub fn open<P: AsRef<Path>>(root: P) -> StorageResult<Self> {
        let root = root.as_ref();
        fs::create_dir_all(root).map_err(|e| classify("Failed to create store root", e))?;
        let root = fs::canonicalize(root).map_err(|e| classify("Failed to resolve store root", e))?;
        let store_id = format!("file://{}", root.display());
        Ok(Self { root, store_id })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Names of the collection directories currently present.
    pub fn collections(&self) -> StorageResult<Vec<String>> {
        let mut names = Vec::new();
        let entries =
            fs::read_dir(&self.root).map_err(|e| classify("Failed to list store root", e))?;
        for entry in entries {
            let entry = entry.map_err(|e| classify("Failed to read store root entry", e))?;
            if entry.path().is_dir() {
                names.push(entry.file_name().to_string_lossy().to_string());
            }
        }
        names.sort();
        Ok(names)
    }

    fn collection_dir(&self, collection: &str) -> StorageResult<PathBuf> {
        if collection.is_empty()
            || collection.contains(['/', '\\'])
            || collection == "."
            || collection == ".."
        {
            return Err(StorageError::unrecoverable(format!(
                "Invalid collection name '{}'",
                collection
            )));
        }
        Ok(self.root.join(collection))
    }

    fn record_path(&self, collection: &str, id: Uuid) -> StorageResult<PathBuf> {
        Ok(self
            .collection_dir(collection)?
            .join(format!("{}.{}", id, RECORD_EXTENSION)))
    }

    async fn blocking<T, F>(&self, op: F) -> StorageResult<T>
    where
        F: FnOnce() -> StorageResult<T> + Send + 'static,
        T: Send + 'static,
    {
        tokio::task::spawn_blocking(op)
            .await
            .map_err(|e| StorageError::unrecoverable(format!("Storage task failed: {}", e)))?
    }
}

fn write_atomically(dir: &Path, path: &Path, data: &[u8]) -> StorageResult<()> {
    fs::create_dir_all(dir).map_err(|e| classify("Failed to create collection directory", e))?;
    let mut temp =
        NamedTempFile::new_in(dir).map_err(|e| classify("Failed to create temp file", e))?;
    temp.write_all(data)
        .map_err(|e| classify("Failed to write record", e))?;
    temp.as_file()
        .sync_all()
        .map_err(|e| classify("Failed to sync record", e))?;
    temp.persist(path)
        .map_err(|e| classify("Failed to move record into place", e.error))?;
    Ok(())
}

#[async_trait]
impl StorageAdapter for FileStorage {
    fn store_id(&self) -> &str {
        &self.store_id
    }

    async fn add(&self, collection: &str, id: Uuid, data: Vec<u8>) -> StorageResult<()> {
        let dir = self.collection_dir(collection)?;
        let path = self.record_path(collection, id)?;
        self.blocking(move || {
            if path.exists() {
                return Err(StorageError::unrecoverable(format!(
                    "Record '{}' already exists",
                    path.display()
                )));
            }
            write_atomically(&dir, &path, &data)
        })
        .await
    }

    async fn get(&self, collection: &str, id: Uuid) -> StorageResult<Option<Vec<u8>>> {
        let path = self.record_path(collection, id)?;
        self.blocking(move || match fs::read(&path) {
            Ok(data) => Ok(Some(data)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(classify("Failed to read record", e)),
        })
        .await
    }

    async fn update(&self, collection: &str, id: Uuid, data: Vec<u8>) -> StorageResult<()> {
        let dir = self.collection_dir(collection)?;
        let path = self.record_path(collection, id)?;
        self.blocking(move || {
            if !path.exists() {
                return Err(StorageError::unrecoverable(format!(
                    "Record '{}' does not exist",
                    path.display()
                )));
            }
            write_atomically(&dir, &path, &data)
        })
        .await
    }

    async fn remove(&self, collection: &str, id: Uuid) -> StorageResult<()> {
        let path = self.record_path(collection, id)?;
        self.blocking(move || match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(classify("Failed to remove record", e)),
        })
        .await
    }

    async fn scan(&self, collection: &str) -> StorageResult<Vec<Vec<u8>>> {
        let dir = self.collection_dir(collection)?;
        self.blocking(move || {
            let entries = match fs::read_dir(&dir) {
                Ok(entries) => entries,
                Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
                Err(e) => return Err(classify("Failed to list collection", e)),
            };

            let mut records = Vec::new();
            for entry in entries {
                let path = entry
                    .map_err(|e| classify("Failed to read collection entry", e))?
                    .path();
                let is_record = path
                    .extension()
                    .is_some_and(|extension| extension == RECORD_EXTENSION);
                if !is_record {
                    warn!("Skipping non-record file '{}'", path.display());
                    continue;
                }
                records.push(fs::read(&path).map_err(|e| classify("Failed to read record", e))?);
            }
            Ok(records)
        })
        .await
    }
}
