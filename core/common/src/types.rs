//! Common types used throughout FieldSync.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::{Error, Result};

/// Number of decimal digits a counter occupies inside a reference.
pub const REFERENCE_DIGITS: usize = 8;

/// Largest counter value that still fits the zero-padded field.
pub const MAX_COUNTER: u64 = 99_999_999;

/// Short alphanumeric device prefix assigned by the backend.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct DevCode(String);

impl DevCode {
    /// Create a new DevCode from a string.
    ///
    /// # Errors
    /// - Returns error if the code is empty or contains non-alphanumeric characters
    pub fn new(code: impl Into<String>) -> Result<Self> {
        let code = code.into();
        let code = code.trim();
        if code.is_empty() {
            return Err(Error::InvalidInput("devcode cannot be empty".to_string()));
        }
        if !code.chars().all(|c| c.is_ascii_alphanumeric()) {
            return Err(Error::InvalidInput(format!(
                "devcode must be alphanumeric: {:?}",
                code
            )));
        }
        Ok(Self(code.to_string()))
    }

    /// Get the inner string value.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for DevCode {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        Self::new(value)
    }
}

impl From<DevCode> for String {
    fn from(code: DevCode) -> Self {
        code.0
    }
}

impl fmt::Display for DevCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Kind of captured transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransactionType {
    /// Produce weighed in from a farmer.
    Collection,
    /// Store sale.
    Sale,
    /// Service entry.
    Service,
}

impl TransactionType {
    /// All known transaction types.
    pub const ALL: [TransactionType; 3] = [
        TransactionType::Collection,
        TransactionType::Sale,
        TransactionType::Service,
    ];

    /// Tag used on the wire and in storage.
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionType::Collection => "collection",
            TransactionType::Sale => "sale",
            TransactionType::Service => "service",
        }
    }

    /// Whether records of this type must reach the backend in capture order.
    ///
    /// Collections accumulate per session on the backend; sales and service
    /// entries are independent of each other.
    pub fn requires_ordering(&self) -> bool {
        matches!(self, TransactionType::Collection)
    }
}

impl fmt::Display for TransactionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransactionType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "collection" => Ok(TransactionType::Collection),
            "sale" => Ok(TransactionType::Sale),
            "service" => Ok(TransactionType::Service),
            other => Err(Error::InvalidInput(format!(
                "unknown transaction type: {}",
                other
            ))),
        }
    }
}

/// A devcode followed by a zero-padded counter, e.g. `AG0500000042`.
///
/// Used both for the global transaction reference and for the type-scoped
/// upload reference; the two differ only in which counter feeds them.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Reference(String);

impl Reference {
    /// Format a reference from a devcode and a counter value.
    ///
    /// # Errors
    /// - `CounterExhausted` if the counter does not fit in eight digits
    pub fn format(devcode: &DevCode, counter: u64) -> Result<Self> {
        if counter > MAX_COUNTER {
            return Err(Error::CounterExhausted(devcode.to_string()));
        }
        Ok(Self(format!(
            "{}{:0width$}",
            devcode,
            counter,
            width = REFERENCE_DIGITS
        )))
    }

    /// Wrap a reference handed out by the backend without reformatting it.
    pub fn from_backend(raw: impl Into<String>) -> Result<Self> {
        let raw = raw.into();
        if raw.trim().is_empty() {
            return Err(Error::InvalidInput("reference cannot be empty".to_string()));
        }
        Ok(Self(raw.trim().to_string()))
    }

    /// Counter encoded in the trailing digits, if the reference has the
    /// expected shape.
    pub fn counter(&self) -> Option<u64> {
        let len = self.0.len();
        if len <= REFERENCE_DIGITS {
            return None;
        }
        self.0.get(len - REFERENCE_DIGITS..)?.parse().ok()
    }

    /// Get the inner string value.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Per-device counter record.
///
/// Created on first successful authorization and mutated only through
/// `ConfigStore::update`. Counters never decrease.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Device prefix; immutable once set.
    pub devcode: DevCode,
    /// Last global sequence number issued or merged.
    pub last_trn_id: u64,
    /// Last type-scoped id per transaction type.
    #[serde(default)]
    pub type_counters: BTreeMap<TransactionType, u64>,
}

impl DeviceConfig {
    /// Create a fresh config with all counters at zero.
    pub fn new(devcode: DevCode) -> Self {
        Self {
            devcode,
            last_trn_id: 0,
            type_counters: BTreeMap::new(),
        }
    }

    /// Last used id for a transaction type (zero if never used).
    pub fn type_counter(&self, kind: TransactionType) -> u64 {
        self.type_counters.get(&kind).copied().unwrap_or(0)
    }

    /// Serialize to bytes for storage.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| Error::Serialization(e.to_string()))
    }

    /// Deserialize from bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes).map_err(|e| Error::Serialization(e.to_string()))
    }
}
