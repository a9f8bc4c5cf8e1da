// Storage abstraction for durable mesh state

use parking_lot::RwLock;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;

/// Errors from a storage backend
#[derive(Error, Debug, Clone)]
pub enum StorageError {
    #[error("Storage open failed: {0}")]
    Open(String),
    #[error("Storage read failed: {0}")]
    Read(String),
    #[error("Storage write failed: {0}")]
    Write(String),
    #[error("Corrupt value for key {0}")]
    Corrupt(String),
}

/// Key/value persistence used by the sequence authority
pub trait StorageBackend: Send + Sync {
    fn put(&self, key: &[u8], value: &[u8]) -> Result<(), StorageError>;
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StorageError>;
    fn remove(&self, key: &[u8]) -> Result<(), StorageError>;
    fn scan_prefix(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>, StorageError>;
    fn flush(&self) -> Result<(), StorageError>;
}

/// In-memory storage useful for testing and throwaway sessions
#[derive(Clone, Default)]
pub struct MemoryStorage {
    data: Arc<RwLock<HashMap<Vec<u8>, Vec<u8>>>>,
    writes: Arc<RwLock<u64>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of `put` calls served so far
    pub fn write_count(&self) -> u64 {
        *self.writes.read()
    }
}

impl StorageBackend for MemoryStorage {
    fn put(&self, key: &[u8], value: &[u8]) -> Result<(), StorageError> {
        self.data.write().insert(key.to_vec(), value.to_vec());
        *self.writes.write() += 1;
        Ok(())
    }

    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StorageError> {
        Ok(self.data.read().get(key).cloned())
    }

    fn remove(&self, key: &[u8]) -> Result<(), StorageError> {
        self.data.write().remove(key);
        Ok(())
    }

    fn scan_prefix(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>, StorageError> {
        let mut results: Vec<(Vec<u8>, Vec<u8>)> = self
            .data
            .read()
            .iter()
            .filter(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        results.sort();
        Ok(results)
    }

    fn flush(&self) -> Result<(), StorageError> {
        Ok(())
    }
}

/// Durable storage on a sled database
pub struct SledStorage {
    db: sled::Db,
}

impl SledStorage {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let db = sled::open(path).map_err(|e| StorageError::Open(e.to_string()))?;
        Ok(Self { db })
    }
}

impl StorageBackend for SledStorage {
    fn put(&self, key: &[u8], value: &[u8]) -> Result<(), StorageError> {
        self.db
            .insert(key, value)
            .map_err(|e| StorageError::Write(e.to_string()))?;
        Ok(())
    }

    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StorageError> {
        let value = self
            .db
            .get(key)
            .map_err(|e| StorageError::Read(e.to_string()))?;
        Ok(value.map(|ivec| ivec.to_vec()))
    }

    fn remove(&self, key: &[u8]) -> Result<(), StorageError> {
        self.db
            .remove(key)
            .map_err(|e| StorageError::Write(e.to_string()))?;
        Ok(())
    }

    fn scan_prefix(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>, StorageError> {
        let mut results = Vec::new();
        for item in self.db.scan_prefix(prefix) {
            let (k, v) = item.map_err(|e| StorageError::Read(e.to_string()))?;
            results.push((k.to_vec(), v.to_vec()));
        }
        Ok(results)
    }

    fn flush(&self) -> Result<(), StorageError> {
        self.db
            .flush()
            .map_err(|e| StorageError::Write(e.to_string()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_storage_put_get_remove() {
        let storage = MemoryStorage::new();
        storage.put(b"seq/home/7f00", &[0, 0, 1, 0]).unwrap();
        assert_eq!(storage.get(b"seq/home/7f00").unwrap(), Some(vec![0, 0, 1, 0]));
        assert_eq!(storage.write_count(), 1);

        storage.remove(b"seq/home/7f00").unwrap();
        assert!(storage.get(b"seq/home/7f00").unwrap().is_none());
    }

    #[test]
    fn test_memory_storage_scan_prefix_sorted() {
        let storage = MemoryStorage::new();
        storage.put(b"seq/b", b"2").unwrap();
        storage.put(b"seq/a", b"1").unwrap();
        storage.put(b"other", b"x").unwrap();

        let results = storage.scan_prefix(b"seq/").unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].0, b"seq/a".to_vec());
    }

    #[test]
    fn test_sled_storage_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let storage = SledStorage::open(dir.path()).unwrap();
            storage.put(b"k", b"v").unwrap();
            storage.flush().unwrap();
        }
        let storage = SledStorage::open(dir.path()).unwrap();
        assert_eq!(storage.get(b"k").unwrap(), Some(b"v".to_vec()));
    }
}
