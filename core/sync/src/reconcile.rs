//! Counter reconciliation against backend snapshots.

use std::sync::Arc;
use tracing::{debug, info};

use fieldsync_common::{merge, CounterSnapshot, DevCode, DeviceConfig, Result};
use fieldsync_storage::ConfigStore;

/// Outcome of merging a snapshot into local counters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reconciliation {
    /// Config after the merge.
    pub config: DeviceConfig,
    /// Whether any counter moved forward.
    pub raised: bool,
}

/// Folds backend counter observations into the local config.
///
/// Merging is a component-wise maximum, so applying the same snapshot
/// twice, or two snapshots in either order, yields the same counters.
#[derive(Clone)]
pub struct Reconciler {
    store: Arc<ConfigStore>,
}

impl Reconciler {
    pub fn new(store: Arc<ConfigStore>) -> Self {
        Self { store }
    }

    /// Merge `snapshot` into the stored config.
    ///
    /// Fails with `DeviceNotConfigured` when there is nothing to merge into;
    /// use [`Reconciler::adopt`] for a first authorization.
    pub async fn reconcile(&self, snapshot: &CounterSnapshot) -> Result<Reconciliation> {
        let mut before = None;
        let config = self
            .store
            .update(|config| {
                before = Some(config.clone());
                *config = merge(config, snapshot);
                Ok(())
            })
            .await?;

        let raised = before.as_ref() != Some(&config);
        if raised {
            info!(
                "Counters advanced to global {} ({:?})",
                config.last_trn_id, config.type_counters
            );
        } else {
            debug!("Counters already ahead of backend snapshot");
        }
        Ok(Reconciliation { config, raised })
    }

    /// Install the backend's view for `devcode`, merging with any local
    /// counters already recorded for the same devcode.
    pub async fn adopt(&self, devcode: DevCode, snapshot: &CounterSnapshot) -> Result<Reconciliation> {
        let before = self.store.get().await?;
        let seed = merge(&DeviceConfig::new(devcode), snapshot);
        let config = self.store.put(seed).await?;
        let raised = before.as_ref() != Some(&config);
        Ok(Reconciliation { config, raised })
    }
}
