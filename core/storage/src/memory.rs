//! In-memory stores for testing.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::provider::{KeyValueStore, QueueStore};
use fieldsync_common::{Error, QueuedRecord, Reference, Result};

fn read_lock<T>(lock: &RwLock<T>) -> Result<RwLockReadGuard<'_, T>> {
    lock.read()
        .map_err(|_| Error::Storage("memory store lock poisoned".to_string()))
}

fn write_lock<T>(lock: &RwLock<T>) -> Result<RwLockWriteGuard<'_, T>> {
    lock.write()
        .map_err(|_| Error::Storage("memory store lock poisoned".to_string()))
}

/// In-memory key/value store.
///
/// All data is lost on drop. The store can be switched offline to simulate
/// an unavailable or corrupted medium.
#[derive(Clone, Default)]
pub struct MemoryStore {
    entries: Arc<RwLock<HashMap<String, Vec<u8>>>>,
    offline: Arc<AtomicBool>,
}

impl MemoryStore {
    /// Create a new empty memory store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent operation fail (or succeed again).
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Overwrite a key with bytes that will not deserialize.
    pub fn corrupt(&self, key: &str) -> Result<()> {
        write_lock(&self.entries)?.insert(key.to_string(), b"\0garbage".to_vec());
        Ok(())
    }

    fn check_online(&self) -> Result<()> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(Error::Storage("memory store offline".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    fn name(&self) -> &str {
        "memory"
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        self.check_online()?;
        Ok(read_lock(&self.entries)?.get(key).cloned())
    }

    async fn put(&self, key: &str, value: &[u8]) -> Result<()> {
        self.check_online()?;
        write_lock(&self.entries)?.insert(key.to_string(), value.to_vec());
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.check_online()?;
        write_lock(&self.entries)?.remove(key);
        Ok(())
    }
}

/// In-memory queue store preserving insertion order.
#[derive(Clone, Default)]
pub struct MemoryQueueStore {
    records: Arc<RwLock<Vec<QueuedRecord>>>,
    capacity: Option<usize>,
}

impl MemoryQueueStore {
    /// Create an unbounded queue store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a queue store that reports `QuotaExceeded` beyond `capacity` records.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            records: Arc::default(),
            capacity: Some(capacity),
        }
    }
}

#[async_trait]
impl QueueStore for MemoryQueueStore {
    fn name(&self) -> &str {
        "memory"
    }

    async fn insert_if_absent(&self, record: &QueuedRecord) -> Result<bool> {
        let mut records = write_lock(&self.records)?;
        if records.iter().any(|r| r.reference == record.reference) {
            return Ok(false);
        }
        if let Some(capacity) = self.capacity {
            if records.len() >= capacity {
                return Err(Error::QuotaExceeded(format!(
                    "memory queue holds {} records",
                    capacity
                )));
            }
        }
        records.push(record.clone());
        Ok(true)
    }

    async fn get(&self, reference: &Reference) -> Result<Option<QueuedRecord>> {
        Ok(read_lock(&self.records)?
            .iter()
            .find(|r| &r.reference == reference)
            .cloned())
    }

    async fn find(&self, reference: &Reference) -> Result<Option<QueuedRecord>> {
        Ok(read_lock(&self.records)?
            .iter()
            .find(|r| r.answers_to(reference))
            .cloned())
    }

    async fn list(&self) -> Result<Vec<QueuedRecord>> {
        let mut records = read_lock(&self.records)?.clone();
        records.sort_by_key(|r| r.created_at);
        Ok(records)
    }

    async fn update(&self, previous: &Reference, record: &QueuedRecord) -> Result<()> {
        let mut records = write_lock(&self.records)?;
        let slot = records
            .iter_mut()
            .find(|r| &r.reference == previous)
            .ok_or_else(|| Error::NotFound(format!("queued record {}", previous)))?;
        *slot = record.clone();
        Ok(())
    }

    async fn remove(&self, reference: &Reference) -> Result<bool> {
        let mut records = write_lock(&self.records)?;
        let before = records.len();
        records.retain(|r| &r.reference != reference);
        Ok(records.len() != before)
    }

    async fn count(&self) -> Result<usize> {
        Ok(read_lock(&self.records)?.len())
    }
}
