//! Queued capture records and their sync status.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::{Error, Reference, Result, TransactionType};

/// Delivery status of a queued record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncStatus {
    /// Waiting for delivery.
    Pending,
    /// Acknowledged by the backend.
    Synced,
    /// Last delivery attempt failed; eligible for retry.
    Failed,
}

impl SyncStatus {
    /// Tag used in storage.
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncStatus::Pending => "pending",
            SyncStatus::Synced => "synced",
            SyncStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SyncStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(SyncStatus::Pending),
            "synced" => Ok(SyncStatus::Synced),
            "failed" => Ok(SyncStatus::Failed),
            other => Err(Error::Serialization(format!("unknown sync status: {}", other))),
        }
    }
}

/// One captured transaction awaiting backend acknowledgment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedRecord {
    /// Queue key. Replaced by the backend reference on supersession.
    pub reference: Reference,
    /// Type-scoped upload reference, when one was allocated.
    pub upload_reference: Option<Reference>,
    /// Transaction type.
    #[serde(rename = "type")]
    pub kind: TransactionType,
    /// Opaque capture payload.
    pub payload: serde_json::Value,
    /// Fingerprint of the capturing device.
    pub device_fingerprint: String,
    /// Capture time.
    pub created_at: DateTime<Utc>,
    /// Current delivery status.
    pub status: SyncStatus,
    /// Last delivery error, if any.
    pub last_error: Option<String>,
    /// Number of failed delivery attempts.
    pub failure_count: u32,
    /// Time of the last delivery attempt.
    pub last_attempt: Option<DateTime<Utc>>,
    /// Time the backend acknowledged the record.
    pub synced_at: Option<DateTime<Utc>>,
    /// Backend-side identifier returned on acknowledgment.
    pub backend_id: Option<String>,
    /// Local reference this record carried before the backend superseded it.
    pub superseded_reference: Option<Reference>,
}

impl QueuedRecord {
    /// Create a new pending record captured now.
    pub fn new(
        reference: Reference,
        upload_reference: Option<Reference>,
        kind: TransactionType,
        payload: serde_json::Value,
        device_fingerprint: impl Into<String>,
    ) -> Self {
        Self {
            reference,
            upload_reference,
            kind,
            payload,
            device_fingerprint: device_fingerprint.into(),
            created_at: Utc::now(),
            status: SyncStatus::Pending,
            last_error: None,
            failure_count: 0,
            last_attempt: None,
            synced_at: None,
            backend_id: None,
            superseded_reference: None,
        }
    }

    /// Whether this record answers to `reference`, either as its key or as
    /// the local reference it replaced.
    pub fn answers_to(&self, reference: &Reference) -> bool {
        &self.reference == reference || self.superseded_reference.as_ref() == Some(reference)
    }

    /// Mark as acknowledged. Returns false if it already was.
    pub fn mark_synced(&mut self, backend_id: Option<String>) -> bool {
        if self.status == SyncStatus::Synced {
            return false;
        }
        self.status = SyncStatus::Synced;
        self.synced_at = Some(Utc::now());
        self.last_error = None;
        if backend_id.is_some() {
            self.backend_id = backend_id;
        }
        true
    }

    /// Adopt the backend's canonical reference and mark as acknowledged.
    pub fn mark_superseded(&mut self, canonical: Reference, backend_id: Option<String>) {
        if canonical != self.reference {
            let local = std::mem::replace(&mut self.reference, canonical);
            self.superseded_reference.get_or_insert(local);
        }
        self.mark_synced(backend_id);
    }

    /// Record a failed delivery attempt. Synced records are left untouched.
    pub fn mark_failed(&mut self, error: impl Into<String>) {
        if self.status == SyncStatus::Synced {
            return;
        }
        self.status = SyncStatus::Failed;
        self.failure_count += 1;
        self.last_error = Some(error.into());
        self.last_attempt = Some(Utc::now());
    }

    /// Move a failed record back to pending for another attempt.
    pub fn mark_pending(&mut self) {
        if self.status == SyncStatus::Failed {
            self.status = SyncStatus::Pending;
        }
    }

    /// Whether the record is still unconfirmed.
    pub fn is_unsynced(&self) -> bool {
        self.status != SyncStatus::Synced
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::DevCode;

    fn record(counter: u64) -> QueuedRecord {
        let code = DevCode::new("AG05").unwrap();
        QueuedRecord::new(
            Reference::format(&code, counter).unwrap(),
            None,
            TransactionType::Sale,
            serde_json::json!({"amount": 120}),
            "fp-1",
        )
    }

    #[test]
    fn test_new_record_is_pending() {
        let rec = record(1);
        assert_eq!(rec.status, SyncStatus::Pending);
        assert!(rec.is_unsynced());
        assert_eq!(rec.failure_count, 0);
    }

    #[test]
    fn test_mark_synced_is_idempotent() {
        let mut rec = record(1);
        assert!(rec.mark_synced(Some("b-1".into())));
        let first = rec.synced_at;
        assert!(!rec.mark_synced(Some("b-2".into())));
        assert_eq!(rec.synced_at, first);
        assert_eq!(rec.backend_id.as_deref(), Some("b-1"));
    }

    #[test]
    fn test_failed_then_pending() {
        let mut rec = record(1);
        rec.mark_failed("timeout");
        assert_eq!(rec.status, SyncStatus::Failed);
        assert_eq!(rec.failure_count, 1);
        rec.mark_pending();
        assert_eq!(rec.status, SyncStatus::Pending);
        assert_eq!(rec.last_error.as_deref(), Some("timeout"));
    }

    #[test]
    fn test_failure_never_downgrades_synced() {
        let mut rec = record(1);
        rec.mark_synced(None);
        rec.mark_failed("late error");
        assert_eq!(rec.status, SyncStatus::Synced);
    }

    #[test]
    fn test_supersession_keeps_local_reference() {
        let mut rec = record(3);
        let local = rec.reference.clone();
        let canonical = Reference::from_backend("AG0500000099").unwrap();

        rec.mark_superseded(canonical.clone(), None);

        assert_eq!(rec.status, SyncStatus::Synced);
        assert_eq!(rec.reference, canonical);
        assert_eq!(rec.superseded_reference, Some(local.clone()));
        assert!(rec.answers_to(&local));
        assert!(rec.answers_to(&canonical));
    }

    #[test]
    fn test_record_wire_shape() {
        let rec = record(5);
        let json = serde_json::to_value(&rec).unwrap();
        assert_eq!(json["type"], "sale");
        assert_eq!(json["status"], "pending");
        assert_eq!(json["reference"], "AG0500000005");
    }
}
