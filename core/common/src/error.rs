//! Common error types for FieldSync.

use thiserror::Error;

/// Top-level error type for FieldSync operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Neither the primary nor the backup store could serve the request.
    #[error("Storage unavailable: {0}")]
    StorageUnavailable(String),

    /// No devcode has been assigned to this device yet.
    #[error("Device not configured")]
    DeviceNotConfigured,

    /// The backend could not be reached.
    #[error("Network unavailable: {0}")]
    NetworkUnavailable(String),

    /// The backend already holds this capture under another reference.
    #[error("Backend conflict: already delivered as {existing_reference}")]
    BackendConflict { existing_reference: String },

    /// The backend schema does not match this client.
    #[error("Backend outdated: {0}")]
    BackendOutdated(String),

    /// The local store is full.
    #[error("Quota exceeded: {0}")]
    QuotaExceeded(String),

    /// The backend answered with a non-success status.
    #[error("Backend error ({status}): {message}")]
    Backend { status: u16, message: String },

    /// The backend refused to authorize this device.
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// The per-device counter namespace is used up.
    #[error("Counter exhausted for {0}")]
    CounterExhausted(String),

    /// A single storage medium failed.
    #[error("Storage error: {0}")]
    Storage(String),

    /// I/O operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization or deserialization failed.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Invalid input provided.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Resource not found.
    #[error("Not found: {0}")]
    NotFound(String),

    /// The sync scheduler loop has stopped.
    #[error("Sync scheduler is not running")]
    SchedulerStopped,
}

impl Error {
    /// Whether retrying the same operation later may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::NetworkUnavailable(_) | Error::Backend { .. } | Error::Io(_)
        )
    }

    /// Whether this error must halt further delivery attempts.
    pub fn is_fatal_for_sync(&self) -> bool {
        matches!(self, Error::BackendOutdated(_) | Error::Unauthorized(_))
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

/// Result type alias using the common Error.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(Error::NetworkUnavailable("timeout".into()).is_transient());
        assert!(Error::Backend {
            status: 503,
            message: "busy".into()
        }
        .is_transient());
        assert!(!Error::BackendOutdated("no such column".into()).is_transient());
        assert!(!Error::DeviceNotConfigured.is_transient());
    }

    #[test]
    fn test_fatal_for_sync() {
        assert!(Error::BackendOutdated("schema".into()).is_fatal_for_sync());
        assert!(!Error::QuotaExceeded("full".into()).is_fatal_for_sync());
    }

    #[test]
    fn test_conflict_message_names_existing_reference() {
        let err = Error::BackendConflict {
            existing_reference: "AG0500000099".into(),
        };
        assert!(err.to_string().contains("AG0500000099"));
    }
}
