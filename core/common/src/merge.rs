//! Maximum-based counter merge.
//!
//! `merge` is commutative, associative and idempotent over counter
//! snapshots, so it can be applied on every authorization check without
//! remembering whether the same snapshot was folded in before.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::{DeviceConfig, TransactionType};

/// Counters reported by some source (the backend, or another copy of the
/// local config). Absent entries mean "no information", not zero.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CounterSnapshot {
    pub last_trn_id: Option<u64>,
    #[serde(default)]
    pub type_counters: BTreeMap<TransactionType, u64>,
}

impl CounterSnapshot {
    /// Snapshot holding only a global counter.
    pub fn global(last_trn_id: u64) -> Self {
        Self {
            last_trn_id: Some(last_trn_id),
            type_counters: BTreeMap::new(),
        }
    }

    /// Add a type counter to the snapshot.
    pub fn with_type(mut self, kind: TransactionType, value: u64) -> Self {
        self.type_counters.insert(kind, value);
        self
    }

    /// Whether the snapshot carries no counters at all.
    pub fn is_empty(&self) -> bool {
        self.last_trn_id.is_none() && self.type_counters.is_empty()
    }
}

impl From<&DeviceConfig> for CounterSnapshot {
    fn from(config: &DeviceConfig) -> Self {
        Self {
            last_trn_id: Some(config.last_trn_id),
            type_counters: config.type_counters.clone(),
        }
    }
}

/// Fold a snapshot into a local config, keeping the larger value of every
/// counter independently. The devcode is never touched.
pub fn merge(local: &DeviceConfig, snapshot: &CounterSnapshot) -> DeviceConfig {
    let mut merged = local.clone();
    if let Some(remote) = snapshot.last_trn_id {
        merged.last_trn_id = merged.last_trn_id.max(remote);
    }
    for (kind, remote) in &snapshot.type_counters {
        let slot = merged.type_counters.entry(*kind).or_insert(0);
        *slot = (*slot).max(*remote);
    }
    merged
}
