//! Common utilities and types shared across FieldSync modules.
//!
//! This module provides the error taxonomy and the domain types every other
//! crate speaks: device codes, transaction types, references, the per-device
//! counter record and the queued capture record.

pub mod error;
pub mod merge;
pub mod record;
pub mod types;

pub use error::{Error, Result};
pub use merge::{merge, CounterSnapshot};
pub use record::{QueuedRecord, SyncStatus};
pub use types::{DevCode, DeviceConfig, Reference, TransactionType, MAX_COUNTER, REFERENCE_DIGITS};
