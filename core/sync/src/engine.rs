//! Sync orchestrator: capture, authorization and queue drain passes.

use chrono::Utc;
use serde_json::Value;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{broadcast, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use fieldsync_common::{
    CounterSnapshot, DevCode, DeviceConfig, Error, QueuedRecord, Reference, Result, SyncStatus,
    TransactionType,
};
use fieldsync_storage::{ConfigStore, SyncQueue};

use crate::allocator::ReferenceAllocator;
use crate::backend::{BackendApi, SubmitReceipt, Submission};
use crate::config::SyncConfig;
use crate::reconcile::{Reconciler, Reconciliation};
use crate::retry::RetryExecutor;
use crate::scheduler::{PassReport, Schedule, SyncScheduler, SyncSchedulerHandle, SyncTrigger};

/// Status changes published by the orchestrator.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    PassCompleted(PassReport),
    /// Delivery is halted until a manual sync succeeds.
    BackendOutdated(String),
    CountersReconciled { last_trn_id: u64 },
    ConnectivityChanged { online: bool },
}

/// Result of a successful authorization check.
#[derive(Debug, Clone, PartialEq)]
pub struct Authorization {
    pub company_name: Option<String>,
    pub config: DeviceConfig,
}

/// How one delivery attempt ended.
enum Delivery {
    Delivered,
    Superseded,
    Failed,
    Offline,
}

/// Coordinates allocation, queueing and delivery for one device.
pub struct SyncOrchestrator<B: BackendApi + ?Sized> {
    backend: Arc<B>,
    config_store: Arc<ConfigStore>,
    queue: Arc<SyncQueue>,
    allocator: ReferenceAllocator,
    reconciler: Reconciler,
    retry_executor: RetryExecutor,
    config: SyncConfig,
    online: AtomicBool,
    /// Set while the backend reports an incompatible schema.
    outdated: RwLock<Option<String>>,
    pass_lock: Mutex<()>,
    events: broadcast::Sender<SyncEvent>,
    scheduler: Option<SyncScheduler>,
}

impl<B: BackendApi + ?Sized + 'static> SyncOrchestrator<B> {
    /// Create an orchestrator. The device starts out assumed online.
    pub fn new(
        backend: Arc<B>,
        config_store: Arc<ConfigStore>,
        queue: Arc<SyncQueue>,
        config: SyncConfig,
    ) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            allocator: ReferenceAllocator::new(config_store.clone()),
            reconciler: Reconciler::new(config_store.clone()),
            retry_executor: RetryExecutor::new(config.retry.clone()),
            backend,
            config_store,
            queue,
            config,
            online: AtomicBool::new(true),
            outdated: RwLock::new(None),
            pass_lock: Mutex::new(()),
            events,
            scheduler: None,
        }
    }

    /// Initialize the scheduler and return the handle that runs its loop.
    pub fn init_scheduler(&mut self) -> SyncSchedulerHandle {
        let schedule = Schedule {
            drain_interval: Some(self.config.drain_interval()),
            reconcile_interval: Some(self.config.reconcile_interval()),
        };
        let (scheduler, handle) = SyncScheduler::new(schedule);
        self.scheduler = Some(scheduler);
        handle
    }

    /// Get the scheduler for submitting triggers.
    pub fn scheduler(&self) -> Option<&SyncScheduler> {
        self.scheduler.as_ref()
    }

    /// Spawn the scheduler loop, routing every trigger to `handle_trigger`.
    pub fn run_scheduler(self: &Arc<Self>, handle: SyncSchedulerHandle) -> JoinHandle<()> {
        let orchestrator = Arc::clone(self);
        tokio::spawn(async move {
            handle
                .run(move |trigger| {
                    let orchestrator = orchestrator.clone();
                    async move { orchestrator.handle_trigger(trigger).await }
                })
                .await;
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }

    pub fn queue(&self) -> &Arc<SyncQueue> {
        &self.queue
    }

    pub fn config_store(&self) -> &Arc<ConfigStore> {
        &self.config_store
    }

    pub fn allocator(&self) -> &ReferenceAllocator {
        &self.allocator
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    /// The outdated-backend message, while delivery is halted.
    pub async fn backend_outdated(&self) -> Option<String> {
        self.outdated.read().await.clone()
    }

    /// Allocate references for a capture and durably queue it.
    ///
    /// Touches only the config store and the queue; delivery happens on the
    /// next drain pass.
    ///
    /// # Errors
    /// - `DeviceNotConfigured` if the device has no devcode and the backend
    ///   cannot be reached
    /// - `StorageUnavailable` / `QuotaExceeded` if the capture could not be
    ///   recorded
    pub async fn capture(&self, kind: TransactionType, payload: Value) -> Result<QueuedRecord> {
        let allocation = self
            .allocator
            .allocate_or_fetch(kind, self.backend.as_ref(), &self.config.device_fingerprint)
            .await?;

        let record = QueuedRecord::new(
            allocation.reference,
            allocation.upload_reference,
            kind,
            payload,
            self.config.device_fingerprint.clone(),
        );
        if !self.queue.enqueue(record.clone()).await? {
            warn!("Reference {} was already queued", record.reference);
        }
        info!("Captured {} {}", kind, record.reference);
        Ok(record)
    }

    /// Confirm authorization with the backend and fold its counters in.
    ///
    /// On first authorization the device config is created from the
    /// backend-assigned devcode.
    ///
    /// # Errors
    /// - `Unauthorized` if the backend does not recognize this device
    /// - `NetworkUnavailable` if the backend cannot be reached
    pub async fn authorize(&self) -> Result<Authorization> {
        let status = match self
            .backend
            .device_status(&self.config.device_fingerprint)
            .await
        {
            Ok(status) => status,
            Err(e) => {
                if matches!(e, Error::NetworkUnavailable(_)) {
                    self.set_online(false);
                }
                return Err(e);
            }
        };
        self.set_online(true);

        if !status.authorized {
            return Err(Error::Unauthorized(format!(
                "device {} is not authorized",
                self.config.device_fingerprint
            )));
        }

        let snapshot = status.counters();
        let outcome = match self.config_store.get().await? {
            Some(local) => {
                if let Some(remote) = status.uniquedevcode.as_deref() {
                    if remote != local.devcode.as_str() {
                        warn!(
                            "Backend reports devcode {} but device holds {}; keeping local",
                            remote, local.devcode
                        );
                    }
                }
                self.reconciler.reconcile(&snapshot).await?
            }
            None => {
                let devcode = status.uniquedevcode.as_deref().ok_or_else(|| {
                    Error::InvalidInput("backend did not assign a devcode".to_string())
                })?;
                info!("Device authorized with devcode {}", devcode);
                self.reconciler
                    .adopt(DevCode::new(devcode)?, &snapshot)
                    .await?
            }
        };
        self.publish_reconciliation(&outcome);

        Ok(Authorization {
            company_name: status.company_name,
            config: outcome.config,
        })
    }

    /// Merge a backend counter snapshot into the local config.
    pub async fn reconcile_with(&self, snapshot: &CounterSnapshot) -> Result<Reconciliation> {
        let outcome = self.reconciler.reconcile(snapshot).await?;
        self.publish_reconciliation(&outcome);
        Ok(outcome)
    }

    /// React to a trigger.
    ///
    /// # Returns
    /// The pass report when the trigger ran a drain pass, `None` otherwise.
    pub async fn handle_trigger(&self, trigger: SyncTrigger) -> Result<Option<PassReport>> {
        match trigger {
            SyncTrigger::ConnectivityLost => {
                self.set_online(false);
                Ok(None)
            }
            SyncTrigger::Reconcile => {
                // The authorization check doubles as the reachability check.
                let was_online = self.is_online();
                match self.authorize().await {
                    Ok(_) if !was_online => {
                        info!("Backend reachable again, resuming delivery");
                        self.automatic_drain(trigger).await
                    }
                    Ok(_) | Err(Error::NetworkUnavailable(_)) => Ok(None),
                    Err(e) => Err(e),
                }
            }
            SyncTrigger::Manual => {
                if let Some(message) = self.outdated.write().await.take() {
                    info!("Manual sync retrying outdated backend ({})", message);
                }
                self.set_online(true);
                self.drain(true).await.map(Some)
            }
            SyncTrigger::ConnectivityRestored => {
                self.set_online(true);
                self.automatic_drain(trigger).await
            }
            SyncTrigger::BecameVisible | SyncTrigger::Periodic => {
                self.automatic_drain(trigger).await
            }
        }
    }

    async fn automatic_drain(&self, trigger: SyncTrigger) -> Result<Option<PassReport>> {
        if self.outdated.read().await.is_some() {
            debug!("{:?} ignored: backend outdated", trigger);
            return Ok(None);
        }
        // Timer-driven passes contact the backend even while marked offline.
        let timer_driven = matches!(trigger, SyncTrigger::Periodic | SyncTrigger::Reconcile);
        if !timer_driven && !self.is_online() {
            debug!("{:?} ignored: offline", trigger);
            return Ok(None);
        }
        self.drain(false).await.map(Some)
    }

    /// Run one delivery pass over the queue.
    ///
    /// Records are attempted in capture order. A failed `collection` record
    /// holds back later records of that type; other types carry on past
    /// failures. The pass stops when the network drops, and aborts with
    /// `BackendOutdated` when the backend schema is incompatible, leaving
    /// the remaining records pending.
    ///
    /// Failed records are retried once their backoff has elapsed, or
    /// immediately when `force_retry` is set.
    pub async fn drain(&self, force_retry: bool) -> Result<PassReport> {
        let _pass = self.pass_lock.lock().await;
        let start = Instant::now();
        let mut report = PassReport::default();

        let now = Utc::now();
        let retry = self.config.retry.clone();
        self.queue
            .requeue_failed(move |record| force_retry || retry.is_due(record, now))
            .await?;

        let mut blocked: HashSet<TransactionType> = HashSet::new();
        for record in self.queue.list_all().await? {
            if record.status == SyncStatus::Failed {
                report.skipped += 1;
                if record.kind.requires_ordering() {
                    blocked.insert(record.kind);
                }
            }
        }

        for record in self.queue.list_pending(None).await? {
            if blocked.contains(&record.kind) {
                report.deferred += 1;
                continue;
            }

            match self.deliver(&record).await? {
                Delivery::Delivered => report.delivered += 1,
                Delivery::Superseded => report.superseded += 1,
                Delivery::Failed => {
                    report.failed += 1;
                    if record.kind.requires_ordering() {
                        blocked.insert(record.kind);
                    }
                }
                Delivery::Offline => {
                    report.failed += 1;
                    break;
                }
            }
        }

        let cutoff = Utc::now() - self.config.synced_retention();
        if let Err(e) = self.queue.prune_synced(cutoff).await {
            warn!("Failed to prune synced records: {}", e);
        }

        report.duration = start.elapsed();
        info!(
            "Sync pass: {} delivered, {} superseded, {} failed, {} deferred in {:?}",
            report.delivered, report.superseded, report.failed, report.deferred, report.duration
        );
        let _ = self.events.send(SyncEvent::PassCompleted(report.clone()));
        Ok(report)
    }

    async fn deliver(&self, record: &QueuedRecord) -> Result<Delivery> {
        let submission = Submission::from(record);
        let result = self
            .retry_executor
            .execute(|| self.backend.submit(&submission))
            .await;

        match result {
            Ok(receipt) => {
                self.set_online(true);
                self.acknowledge(record, receipt).await
            }
            Err(Error::BackendConflict { existing_reference }) => {
                self.set_online(true);
                match Reference::from_backend(existing_reference.as_str()) {
                    Ok(canonical) => {
                        info!(
                            "{} already delivered as {}",
                            record.reference, canonical
                        );
                        self.queue
                            .mark_superseded(&record.reference, canonical, None)
                            .await?;
                        Ok(Delivery::Superseded)
                    }
                    Err(e) => {
                        warn!(
                            "Conflict for {} named unusable reference {:?}: {}",
                            record.reference, existing_reference, e
                        );
                        self.queue.mark_failed(&record.reference, e.to_string()).await?;
                        Ok(Delivery::Failed)
                    }
                }
            }
            Err(Error::BackendOutdated(message)) => {
                error!("Backend outdated, halting delivery: {}", message);
                *self.outdated.write().await = Some(message.clone());
                let _ = self.events.send(SyncEvent::BackendOutdated(message.clone()));
                Err(Error::BackendOutdated(message))
            }
            Err(Error::NetworkUnavailable(message)) => {
                debug!("Backend unreachable while delivering {}", record.reference);
                self.queue.mark_failed(&record.reference, &message).await?;
                self.set_online(false);
                Ok(Delivery::Offline)
            }
            Err(e @ Error::Unauthorized(_)) => {
                error!("Delivery refused for {}: {}", record.reference, e);
                Err(e)
            }
            Err(e) => {
                warn!("Delivery of {} failed: {}", record.reference, e);
                self.queue.mark_failed(&record.reference, e.to_string()).await?;
                Ok(Delivery::Failed)
            }
        }
    }

    async fn acknowledge(&self, record: &QueuedRecord, receipt: SubmitReceipt) -> Result<Delivery> {
        let canonical = receipt
            .reference_no
            .as_deref()
            .filter(|reference| *reference != record.reference.as_str())
            .and_then(|reference| match Reference::from_backend(reference) {
                Ok(reference) => Some(reference),
                Err(e) => {
                    warn!("Ignoring receipt reference {:?}: {}", reference, e);
                    None
                }
            });

        let delivery = match canonical {
            Some(canonical) => {
                self.queue
                    .mark_superseded(&record.reference, canonical, receipt.id)
                    .await?;
                Delivery::Superseded
            }
            None => {
                self.queue.mark_synced(&record.reference, receipt.id).await?;
                debug!("Delivered {}", record.reference);
                Delivery::Delivered
            }
        };

        if let Some(last_trn_id) = receipt.last_trnid {
            match self.reconcile_with(&CounterSnapshot::global(last_trn_id)).await {
                Ok(_) | Err(Error::DeviceNotConfigured) => {}
                Err(e) => warn!("Could not fold receipt counter {}: {}", last_trn_id, e),
            }
        }
        Ok(delivery)
    }

    fn set_online(&self, online: bool) {
        if self.online.swap(online, Ordering::SeqCst) != online {
            info!("Connectivity {}", if online { "restored" } else { "lost" });
            let _ = self.events.send(SyncEvent::ConnectivityChanged { online });
        }
    }

    fn publish_reconciliation(&self, outcome: &Reconciliation) {
        if outcome.raised {
            let _ = self.events.send(SyncEvent::CountersReconciled {
                last_trn_id: outcome.config.last_trn_id,
            });
        }
    }
}
