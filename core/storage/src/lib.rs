//! Durable local persistence for FieldSync.
//!
//! This module provides trait-based interfaces for the two kinds of state the
//! device keeps between runs, plus the services built on top of them:
//! - `KeyValueStore` backends (memory, flat JSON file, SQLite) holding the
//!   per-device counter record
//! - `ConfigStore`, which dual-writes that record to a primary and a backup
//!   store and serializes every read-modify-write
//! - `QueueStore` backends (memory, SQLite) holding captured records
//! - `SyncQueue`, the idempotent log of records awaiting acknowledgment
//!
//! # Design Principles
//! - Callers never see which medium served a read
//! - All I/O operations are async
//! - Unified error semantics: backends report `Storage`/`QuotaExceeded`,
//!   services translate total failure into `StorageUnavailable`

pub mod config_store;
pub mod local;
pub mod memory;
pub mod provider;
pub mod queue;
pub mod sqlite;

pub use config_store::{ConfigStore, CONFIG_KEY};
pub use local::FileStore;
pub use memory::{MemoryQueueStore, MemoryStore};
pub use provider::{KeyValueStore, QueueStore};
pub use queue::{QueueConfig, QueueStats, SyncQueue};
pub use sqlite::{SqliteQueueStore, SqliteStore};
