//! Orchestrator configuration.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use fieldsync_common::{Error, Result};
use fieldsync_storage::QueueConfig;

use crate::retry::RetryConfig;

/// Configuration for the sync orchestrator and its scheduler.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Identity reported to the backend for this install.
    pub device_fingerprint: String,
    /// Backend base URL; `None` keeps the device fully offline.
    pub backend_url: Option<String>,
    /// Per-request timeout in seconds.
    pub request_timeout_secs: u64,
    /// Seconds between periodic drain passes.
    pub drain_interval_secs: u64,
    /// Seconds between authorization checks while online.
    pub reconcile_interval_secs: u64,
    /// Days a synced record is kept before pruning.
    pub synced_retention_days: u32,
    pub retry: RetryConfig,
    pub queue: QueueConfig,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            device_fingerprint: String::new(),
            backend_url: None,
            request_timeout_secs: 30,
            drain_interval_secs: 3600,
            reconcile_interval_secs: 30,
            synced_retention_days: 7,
            retry: RetryConfig::default(),
            queue: QueueConfig::default(),
        }
    }
}

impl SyncConfig {
    /// Load from a JSON file, falling back to defaults when it does not exist.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = match std::fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(e) => return Err(e.into()),
        };
        let config: Self = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Write as pretty JSON.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.drain_interval_secs == 0 || self.reconcile_interval_secs == 0 {
            return Err(Error::InvalidInput(
                "sync intervals must be at least one second".to_string(),
            ));
        }
        if self.request_timeout_secs == 0 {
            return Err(Error::InvalidInput(
                "request timeout must be at least one second".to_string(),
            ));
        }
        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn drain_interval(&self) -> Duration {
        Duration::from_secs(self.drain_interval_secs)
    }

    pub fn reconcile_interval(&self) -> Duration {
        Duration::from_secs(self.reconcile_interval_secs)
    }

    pub fn synced_retention(&self) -> chrono::Duration {
        chrono::Duration::days(i64::from(self.synced_retention_days))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults() {
        let config = SyncConfig::default();
        assert_eq!(config.drain_interval(), Duration::from_secs(3600));
        assert_eq!(config.reconcile_interval(), Duration::from_secs(30));
        assert_eq!(config.synced_retention(), chrono::Duration::days(7));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_missing_file_yields_defaults() {
        let dir = TempDir::new().unwrap();
        let config = SyncConfig::load(dir.path().join("absent.json")).unwrap();
        assert!(config.backend_url.is_none());
    }

    #[test]
    fn test_partial_file_keeps_other_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("fieldsync.json");
        std::fs::write(
            &path,
            r#"{"device_fingerprint":"abc123","backend_url":"https://api.example.com/"}"#,
        )
        .unwrap();

        let config = SyncConfig::load(&path).unwrap();
        assert_eq!(config.device_fingerprint, "abc123");
        assert_eq!(config.backend_url.as_deref(), Some("https://api.example.com/"));
        assert_eq!(config.drain_interval_secs, 3600);
        assert_eq!(config.retry.max_retries, 3);
    }

    #[test]
    fn test_save_and_reload() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("fieldsync.json");
        let mut config = SyncConfig::default();
        config.queue.max_records = Some(500);
        config.save(&path).unwrap();

        let loaded = SyncConfig::load(&path).unwrap();
        assert_eq!(loaded.queue.max_records, Some(500));
    }

    #[test]
    fn test_zero_interval_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("fieldsync.json");
        std::fs::write(&path, r#"{"drain_interval_secs":0}"#).unwrap();
        assert!(matches!(SyncConfig::load(&path), Err(Error::InvalidInput(_))));
    }
}
