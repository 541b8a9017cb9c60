//! FieldSync sync engine
//!
//! This module turns captures into durable, uniquely referenced records and
//! delivers them to the backend:
//! - Reference allocation from device-local counters
//! - Counter reconciliation against backend snapshots (maximum merge)
//! - Drain passes with per-type ordering and supersession on conflict
//! - Retry strategy with exponential backoff
//! - Trigger scheduling with periodic drain and reconcile timers

pub mod allocator;
pub mod backend;
pub mod config;
pub mod engine;
pub mod reconcile;
pub mod retry;
pub mod scheduler;

// Re-export main types
pub use allocator::{Allocation, ReferenceAllocator};
pub use backend::{
    BackendApi, DeviceStatus, HttpBackend, OfflineBackend, SubmitReceipt, Submission,
};
pub use config::SyncConfig;
pub use engine::{Authorization, SyncEvent, SyncOrchestrator};
pub use reconcile::{Reconciler, Reconciliation};
pub use retry::{RetryConfig, RetryExecutor};
pub use scheduler::{
    PassReport, Schedule, SyncRequest, SyncScheduler, SyncSchedulerHandle, SyncTrigger,
};
