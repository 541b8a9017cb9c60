//! Storage backend trait definitions.

use async_trait::async_trait;

use fieldsync_common::{QueuedRecord, Reference, Result};

/// Byte-oriented key/value store holding small records.
///
/// Implementations must make `put` durable before returning and must report
/// unreadable content as an error rather than as an absent key.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Get the store name (e.g., "sqlite", "file", "memory").
    fn name(&self) -> &str;

    /// Read the value stored under `key`.
    ///
    /// # Returns
    /// `None` if the key has never been written or was deleted.
    ///
    /// # Errors
    /// - Store not initialized or corrupted
    /// - I/O errors
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Store `value` under `key`, replacing any previous value.
    ///
    /// # Errors
    /// - I/O errors
    /// - `QuotaExceeded` if the medium is full
    async fn put(&self, key: &str, value: &[u8]) -> Result<()>;

    /// Remove `key`. Removing a missing key is not an error.
    async fn delete(&self, key: &str) -> Result<()>;
}

/// Persistent collection of queued records keyed by reference.
#[async_trait]
pub trait QueueStore: Send + Sync {
    /// Get the store name.
    fn name(&self) -> &str;

    /// Insert a record unless one with the same reference exists.
    ///
    /// # Returns
    /// `true` if the record was inserted.
    ///
    /// # Errors
    /// - `QuotaExceeded` if the store is full
    async fn insert_if_absent(&self, record: &QueuedRecord) -> Result<bool>;

    /// Get a record by its current reference.
    async fn get(&self, reference: &Reference) -> Result<Option<QueuedRecord>>;

    /// Find the record whose current or superseded reference is `reference`.
    async fn find(&self, reference: &Reference) -> Result<Option<QueuedRecord>>;

    /// List all records in capture order.
    async fn list(&self) -> Result<Vec<QueuedRecord>>;

    /// Replace the record stored under `previous`.
    ///
    /// `previous` differs from `record.reference` when the record was
    /// re-keyed under a backend-supplied reference.
    ///
    /// # Errors
    /// - `NotFound` if no record is stored under `previous`
    async fn update(&self, previous: &Reference, record: &QueuedRecord) -> Result<()>;

    /// Remove a record. Returns whether it existed.
    async fn remove(&self, reference: &Reference) -> Result<bool>;

    /// Number of stored records.
    async fn count(&self) -> Result<usize>;
}
