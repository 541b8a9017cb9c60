//! Durable log of captured records awaiting backend acknowledgment.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::provider::QueueStore;
use fieldsync_common::{Error, QueuedRecord, Reference, Result, SyncStatus, TransactionType};

/// Queue limits.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Maximum number of records kept locally (synced ones included).
    pub max_records: Option<usize>,
}

/// Record counts by status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    pub pending: usize,
    pub failed: usize,
    pub synced: usize,
}

impl QueueStats {
    /// Records not yet confirmed by the backend.
    pub fn unsynced(&self) -> usize {
        self.pending + self.failed
    }
}

/// Idempotent queue of captured records keyed by reference.
///
/// Status transitions are serialized so overlapping drain passes cannot
/// interleave a read-modify-write on the same record.
pub struct SyncQueue {
    store: Arc<dyn QueueStore>,
    config: QueueConfig,
    guard: Mutex<()>,
}

impl SyncQueue {
    /// Create a queue over a store.
    pub fn new(store: Arc<dyn QueueStore>, config: QueueConfig) -> Self {
        Self {
            store,
            config,
            guard: Mutex::new(()),
        }
    }

    /// Append a record.
    ///
    /// # Returns
    /// `false` if a record with this reference (current or superseded) is
    /// already queued; the queue is left unchanged.
    ///
    /// # Errors
    /// - `QuotaExceeded` if the queue is full of unsynced records
    pub async fn enqueue(&self, record: QueuedRecord) -> Result<bool> {
        let _guard = self.guard.lock().await;

        if self.store.find(&record.reference).await?.is_some() {
            debug!("Record {} already queued", record.reference);
            return Ok(false);
        }

        if let Some(max) = self.config.max_records {
            let count = self.store.count().await?;
            if count >= max {
                let evicted = self.evict_oldest_synced(count + 1 - max).await?;
                if count - evicted >= max {
                    return Err(Error::QuotaExceeded(format!(
                        "queue holds {} unsynced records",
                        count - evicted
                    )));
                }
            }
        }

        let inserted = match self.store.insert_if_absent(&record).await {
            Err(Error::QuotaExceeded(msg)) => {
                warn!("Queue store full ({}); evicting synced records", msg);
                if self.evict_oldest_synced(1).await? == 0 {
                    return Err(Error::QuotaExceeded(msg));
                }
                self.store.insert_if_absent(&record).await?
            }
            other => other?,
        };

        if inserted {
            debug!("Queued {} record {}", record.kind, record.reference);
        }
        Ok(inserted)
    }

    /// Get a record by its current or superseded reference.
    pub async fn get(&self, reference: &Reference) -> Result<Option<QueuedRecord>> {
        self.store.find(reference).await
    }

    /// Pending records in capture order, optionally restricted to one type.
    pub async fn list_pending(&self, kind: Option<TransactionType>) -> Result<Vec<QueuedRecord>> {
        Ok(self
            .store
            .list()
            .await?
            .into_iter()
            .filter(|r| r.status == SyncStatus::Pending)
            .filter(|r| kind.map_or(true, |k| r.kind == k))
            .collect())
    }

    /// All records in capture order.
    pub async fn list_all(&self) -> Result<Vec<QueuedRecord>> {
        self.store.list().await
    }

    /// Mark a record acknowledged.
    ///
    /// # Returns
    /// `false` if the record was already synced (no change).
    ///
    /// # Errors
    /// - `NotFound` if no record answers to `reference`
    pub async fn mark_synced(
        &self,
        reference: &Reference,
        backend_id: Option<String>,
    ) -> Result<bool> {
        let _guard = self.guard.lock().await;

        let mut record = self.require(reference).await?;
        if !record.mark_synced(backend_id) {
            return Ok(false);
        }
        let key = record.reference.clone();
        self.store.update(&key, &record).await?;
        Ok(true)
    }

    /// Mark a record acknowledged under a backend-supplied reference.
    ///
    /// The record is re-keyed under `canonical`; its local reference stays
    /// resolvable through `get` and blocks re-enqueueing.
    pub async fn mark_superseded(
        &self,
        reference: &Reference,
        canonical: Reference,
        backend_id: Option<String>,
    ) -> Result<()> {
        let _guard = self.guard.lock().await;

        let mut record = self.require(reference).await?;
        let previous = record.reference.clone();

        if canonical != previous {
            if let Some(holder) = self.store.get(&canonical).await? {
                warn!(
                    "Backend reference {} already held by {}; keeping {}",
                    canonical,
                    holder
                        .superseded_reference
                        .as_ref()
                        .unwrap_or(&holder.reference),
                    previous
                );
                record.mark_synced(backend_id);
                return self.store.update(&previous, &record).await;
            }
        }

        info!("Record {} superseded by {}", previous, canonical);
        record.mark_superseded(canonical, backend_id);
        self.store.update(&previous, &record).await
    }

    /// Record a failed delivery attempt. Synced records are not downgraded.
    pub async fn mark_failed(&self, reference: &Reference, error: impl Into<String>) -> Result<()> {
        let _guard = self.guard.lock().await;

        let mut record = self.require(reference).await?;
        if record.status == SyncStatus::Synced {
            return Ok(());
        }
        record.mark_failed(error);
        let key = record.reference.clone();
        self.store.update(&key, &record).await
    }

    /// Move failed records for which `eligible` holds back to pending.
    pub async fn requeue_failed<F>(&self, eligible: F) -> Result<usize>
    where
        F: Fn(&QueuedRecord) -> bool + Send,
    {
        let _guard = self.guard.lock().await;

        let mut requeued = 0;
        for mut record in self.store.list().await? {
            if record.status == SyncStatus::Failed && eligible(&record) {
                record.mark_pending();
                let key = record.reference.clone();
                self.store.update(&key, &record).await?;
                requeued += 1;
            }
        }
        if requeued > 0 {
            debug!("Requeued {} failed records", requeued);
        }
        Ok(requeued)
    }

    /// Delete every record not yet confirmed by the backend.
    ///
    /// User-initiated and irreversible. Synced records are kept.
    pub async fn purge_all_pending(&self) -> Result<usize> {
        let _guard = self.guard.lock().await;

        let mut purged = 0;
        for record in self.store.list().await? {
            if record.is_unsynced() && self.store.remove(&record.reference).await? {
                purged += 1;
            }
        }
        warn!("Purged {} unsynced records", purged);
        Ok(purged)
    }

    /// Delete synced records acknowledged before `cutoff`.
    ///
    /// Superseded records are compacted instead: the payload is dropped but
    /// the row stays, so the local reference it replaced can never be
    /// queued again. Returns the number of records deleted.
    pub async fn prune_synced(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let _guard = self.guard.lock().await;

        let mut pruned = 0;
        let mut compacted = 0;
        for mut record in self.store.list().await? {
            let confirmed_before = record
                .synced_at
                .map_or(false, |synced_at| synced_at < cutoff);
            if record.status != SyncStatus::Synced || !confirmed_before {
                continue;
            }
            if record.superseded_reference.is_none() {
                if self.store.remove(&record.reference).await? {
                    pruned += 1;
                }
            } else if !record.payload.is_null() {
                record.payload = Value::Null;
                let key = record.reference.clone();
                self.store.update(&key, &record).await?;
                compacted += 1;
            }
        }
        if pruned > 0 || compacted > 0 {
            info!(
                "Pruned {} synced records, compacted {} superseded",
                pruned, compacted
            );
        }
        Ok(pruned)
    }

    /// Record counts by status.
    pub async fn stats(&self) -> Result<QueueStats> {
        let mut stats = QueueStats::default();
        for record in self.store.list().await? {
            match record.status {
                SyncStatus::Pending => stats.pending += 1,
                SyncStatus::Failed => stats.failed += 1,
                SyncStatus::Synced => stats.synced += 1,
            }
        }
        Ok(stats)
    }

    async fn require(&self, reference: &Reference) -> Result<QueuedRecord> {
        self.store
            .find(reference)
            .await?
            .ok_or_else(|| Error::NotFound(format!("queued record {}", reference)))
    }

    /// Remove up to `count` synced records, oldest capture first. Superseded
    /// records are kept.
    async fn evict_oldest_synced(&self, count: usize) -> Result<usize> {
        let mut evicted = 0;
        for record in self.store.list().await? {
            if evicted >= count {
                break;
            }
            if record.status == SyncStatus::Synced
                && record.superseded_reference.is_none()
                && self.store.remove(&record.reference).await?
            {
                evicted += 1;
            }
        }
        if evicted > 0 {
            info!("Evicted {} synced records to free queue space", evicted);
        }
        Ok(evicted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryQueueStore;
    use crate::sqlite::SqliteQueueStore;
    use fieldsync_common::DevCode;

    fn reference(counter: u64) -> Reference {
        Reference::format(&DevCode::new("AG05").unwrap(), counter).unwrap()
    }

    fn record(counter: u64, kind: TransactionType) -> QueuedRecord {
        QueuedRecord::new(
            reference(counter),
            None,
            kind,
            serde_json::json!({"n": counter}),
            "fp",
        )
    }

    fn queue() -> SyncQueue {
        SyncQueue::new(Arc::new(MemoryQueueStore::new()), QueueConfig::default())
    }

    #[tokio::test]
    async fn test_enqueue_existing_reference_is_noop() {
        let queue = queue();
        assert!(queue.enqueue(record(1, TransactionType::Sale)).await.unwrap());

        let mut retry = record(1, TransactionType::Sale);
        retry.payload = serde_json::json!({"changed": true});
        assert!(!queue.enqueue(retry).await.unwrap());

        let stored = queue.get(&reference(1)).await.unwrap().unwrap();
        assert_eq!(stored.payload, serde_json::json!({"n": 1}));
    }

    #[tokio::test]
    async fn test_list_pending_filters_type_and_status() {
        let queue = queue();
        queue.enqueue(record(1, TransactionType::Collection)).await.unwrap();
        queue.enqueue(record(2, TransactionType::Sale)).await.unwrap();
        queue.enqueue(record(3, TransactionType::Collection)).await.unwrap();
        queue.mark_synced(&reference(3), None).await.unwrap();

        let all = queue.list_pending(None).await.unwrap();
        assert_eq!(all.len(), 2);

        let collections = queue
            .list_pending(Some(TransactionType::Collection))
            .await
            .unwrap();
        assert_eq!(collections.len(), 1);
        assert_eq!(collections[0].reference, reference(1));
    }

    #[tokio::test]
    async fn test_mark_synced_twice_is_noop() {
        let queue = queue();
        queue.enqueue(record(1, TransactionType::Sale)).await.unwrap();
        assert!(queue.mark_synced(&reference(1), Some("77".into())).await.unwrap());
        assert!(!queue.mark_synced(&reference(1), Some("78".into())).await.unwrap());

        let stored = queue.get(&reference(1)).await.unwrap().unwrap();
        assert_eq!(stored.backend_id.as_deref(), Some("77"));
    }

    #[tokio::test]
    async fn test_mark_unknown_reference() {
        let queue = queue();
        let result = queue.mark_synced(&reference(9), None).await;
        assert!(matches!(result, Err(Error::NotFound(_))));
    }

    #[tokio::test]
    async fn test_superseded_reference_blocks_reenqueue() {
        let queue = queue();
        queue.enqueue(record(5, TransactionType::Sale)).await.unwrap();

        let canonical = Reference::from_backend("AG0500000099").unwrap();
        queue
            .mark_superseded(&reference(5), canonical.clone(), None)
            .await
            .unwrap();

        let stored = queue.get(&canonical).await.unwrap().unwrap();
        assert_eq!(stored.status, SyncStatus::Synced);
        assert_eq!(stored.superseded_reference, Some(reference(5)));

        assert!(!queue.enqueue(record(5, TransactionType::Sale)).await.unwrap());
        assert!(queue.list_pending(None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_failed_requeue() {
        let queue = queue();
        queue.enqueue(record(1, TransactionType::Service)).await.unwrap();
        queue.mark_failed(&reference(1), "timeout").await.unwrap();

        assert!(queue.list_pending(None).await.unwrap().is_empty());
        assert_eq!(queue.requeue_failed(|_| false).await.unwrap(), 0);
        assert_eq!(queue.requeue_failed(|r| r.failure_count < 3).await.unwrap(), 1);
        assert_eq!(queue.list_pending(None).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_mark_failed_after_synced_is_ignored() {
        let queue = queue();
        queue.enqueue(record(1, TransactionType::Sale)).await.unwrap();
        queue.mark_synced(&reference(1), None).await.unwrap();
        queue.mark_failed(&reference(1), "late").await.unwrap();

        let stats = queue.stats().await.unwrap();
        assert_eq!(stats.synced, 1);
        assert_eq!(stats.failed, 0);
    }

    #[tokio::test]
    async fn test_purge_keeps_synced_records() {
        let queue = SyncQueue::new(
            Arc::new(SqliteQueueStore::in_memory().unwrap()),
            QueueConfig::default(),
        );
        for n in 1..=8 {
            queue.enqueue(record(n, TransactionType::Sale)).await.unwrap();
        }
        for n in 6..=8 {
            queue.mark_synced(&reference(n), None).await.unwrap();
        }
        queue.mark_failed(&reference(1), "boom").await.unwrap();

        assert_eq!(queue.purge_all_pending().await.unwrap(), 5);

        let remaining = queue.list_all().await.unwrap();
        assert_eq!(remaining.len(), 3);
        assert!(remaining.iter().all(|r| r.status == SyncStatus::Synced));
    }

    #[tokio::test]
    async fn test_prune_synced_respects_cutoff() {
        let queue = queue();
        queue.enqueue(record(1, TransactionType::Sale)).await.unwrap();
        queue.enqueue(record(2, TransactionType::Sale)).await.unwrap();
        queue.mark_synced(&reference(1), None).await.unwrap();

        assert_eq!(
            queue
                .prune_synced(Utc::now() - chrono::Duration::hours(1))
                .await
                .unwrap(),
            0
        );
        assert_eq!(
            queue
                .prune_synced(Utc::now() + chrono::Duration::seconds(1))
                .await
                .unwrap(),
            1
        );
        assert_eq!(queue.stats().await.unwrap().pending, 1);
    }

    #[tokio::test]
    async fn test_superseded_record_outlives_retention() {
        let queue = queue();
        queue.enqueue(record(5, TransactionType::Sale)).await.unwrap();
        queue.enqueue(record(6, TransactionType::Sale)).await.unwrap();
        let canonical = Reference::from_backend("AG0500000099").unwrap();
        queue
            .mark_superseded(&reference(5), canonical.clone(), None)
            .await
            .unwrap();
        queue.mark_synced(&reference(6), None).await.unwrap();

        let later = Utc::now() + chrono::Duration::seconds(1);
        assert_eq!(queue.prune_synced(later).await.unwrap(), 1);
        assert_eq!(queue.prune_synced(later).await.unwrap(), 0);

        let kept = queue.get(&canonical).await.unwrap().unwrap();
        assert!(kept.payload.is_null());
        assert_eq!(kept.superseded_reference, Some(reference(5)));
        assert!(!queue.enqueue(record(5, TransactionType::Sale)).await.unwrap());
    }

    #[tokio::test]
    async fn test_quota_eviction_keeps_superseded_records() {
        let queue = SyncQueue::new(
            Arc::new(MemoryQueueStore::new()),
            QueueConfig {
                max_records: Some(2),
            },
        );
        queue.enqueue(record(1, TransactionType::Sale)).await.unwrap();
        queue.enqueue(record(2, TransactionType::Sale)).await.unwrap();
        queue
            .mark_superseded(&reference(1), Reference::from_backend("AG0500000099").unwrap(), None)
            .await
            .unwrap();
        queue.mark_synced(&reference(2), None).await.unwrap();

        assert!(queue.enqueue(record(3, TransactionType::Sale)).await.unwrap());
        assert!(queue.get(&reference(2)).await.unwrap().is_none());
        assert!(!queue.enqueue(record(1, TransactionType::Sale)).await.unwrap());
    }

    #[tokio::test]
    async fn test_quota_evicts_synced_before_refusing() {
        let queue = SyncQueue::new(
            Arc::new(MemoryQueueStore::new()),
            QueueConfig {
                max_records: Some(2),
            },
        );
        queue.enqueue(record(1, TransactionType::Sale)).await.unwrap();
        queue.enqueue(record(2, TransactionType::Sale)).await.unwrap();
        queue.mark_synced(&reference(1), None).await.unwrap();

        assert!(queue.enqueue(record(3, TransactionType::Sale)).await.unwrap());
        assert!(queue.get(&reference(1)).await.unwrap().is_none());

        let err = queue
            .enqueue(record(4, TransactionType::Sale))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::QuotaExceeded(_)));
        assert_eq!(queue.stats().await.unwrap().pending, 2);
    }

    #[tokio::test]
    async fn test_store_quota_evicts_synced() {
        let queue = SyncQueue::new(
            Arc::new(MemoryQueueStore::with_capacity(1)),
            QueueConfig::default(),
        );
        queue.enqueue(record(1, TransactionType::Sale)).await.unwrap();
        queue.mark_synced(&reference(1), None).await.unwrap();

        assert!(queue.enqueue(record(2, TransactionType::Sale)).await.unwrap());
        assert!(matches!(
            queue.enqueue(record(3, TransactionType::Sale)).await,
            Err(Error::QuotaExceeded(_))
        ));
    }
}
