//! Transaction reference allocation.

use std::sync::Arc;
use tracing::{debug, info};

use fieldsync_common::{Error, Reference, Result, TransactionType, MAX_COUNTER};
use fieldsync_storage::ConfigStore;

use crate::backend::BackendApi;

/// References issued for one capture.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Allocation {
    /// Global reference, unique per device.
    pub reference: Reference,
    /// Type-scoped upload reference, absent when issued by the backend.
    pub upload_reference: Option<Reference>,
}

/// Mints references from the device counters held in a `ConfigStore`.
///
/// Every counter increment happens inside `ConfigStore::update`, so
/// concurrent callers never observe or issue the same value.
#[derive(Clone)]
pub struct ReferenceAllocator {
    store: Arc<ConfigStore>,
}

impl ReferenceAllocator {
    /// Create an allocator over a config store.
    pub fn new(store: Arc<ConfigStore>) -> Self {
        Self { store }
    }

    /// Issue the next global reference.
    ///
    /// # Errors
    /// - `DeviceNotConfigured` if no devcode has been assigned yet
    /// - `CounterExhausted` once the eight-digit namespace is used up
    /// - `StorageUnavailable` if the increment could not be persisted
    pub async fn next_reference(&self) -> Result<Reference> {
        let config = self
            .store
            .update(|config| {
                config.last_trn_id = bump(config.last_trn_id, "global")?;
                Ok(())
            })
            .await?;

        let reference = Reference::format(&config.devcode, config.last_trn_id)?;
        debug!("Allocated reference {}", reference);
        Ok(reference)
    }

    /// Issue the next upload reference scoped to `kind`.
    pub async fn next_upload_reference(&self, kind: TransactionType) -> Result<Reference> {
        let config = self
            .store
            .update(|config| {
                let next = bump(config.type_counter(kind), kind.as_str())?;
                config.type_counters.insert(kind, next);
                Ok(())
            })
            .await?;

        let reference = Reference::format(&config.devcode, config.type_counter(kind))?;
        debug!("Allocated {} upload reference {}", kind, reference);
        Ok(reference)
    }

    /// Issue both references for one capture in a single write.
    pub async fn allocate(&self, kind: TransactionType) -> Result<Allocation> {
        let config = self
            .store
            .update(|config| {
                let global = bump(config.last_trn_id, "global")?;
                let scoped = bump(config.type_counter(kind), kind.as_str())?;
                config.last_trn_id = global;
                config.type_counters.insert(kind, scoped);
                Ok(())
            })
            .await?;

        let allocation = Allocation {
            reference: Reference::format(&config.devcode, config.last_trn_id)?,
            upload_reference: Some(Reference::format(
                &config.devcode,
                config.type_counter(kind),
            )?),
        };
        debug!(
            "Allocated {} {} / {:?}",
            kind, allocation.reference, allocation.upload_reference
        );
        Ok(allocation)
    }

    /// Allocate locally, or ask the backend when the device has no local
    /// counter state yet.
    ///
    /// # Errors
    /// - `DeviceNotConfigured` if the device is unconfigured and the backend
    ///   is unreachable; the capture must be deferred
    pub async fn allocate_or_fetch<B: BackendApi + ?Sized>(
        &self,
        kind: TransactionType,
        backend: &B,
        device_fingerprint: &str,
    ) -> Result<Allocation> {
        match self.allocate(kind).await {
            Err(Error::DeviceNotConfigured) => {
                info!("No local counters; requesting reference from backend");
                match backend.next_reference(device_fingerprint).await {
                    Ok(reference) => Ok(Allocation {
                        reference,
                        upload_reference: None,
                    }),
                    Err(Error::NetworkUnavailable(_)) => Err(Error::DeviceNotConfigured),
                    Err(e) => Err(e),
                }
            }
            other => other,
        }
    }
}

fn bump(current: u64, counter: &str) -> Result<u64> {
    match current.checked_add(1) {
        Some(next) if next <= MAX_COUNTER => Ok(next),
        _ => Err(Error::CounterExhausted(counter.to_string())),
    }
}
