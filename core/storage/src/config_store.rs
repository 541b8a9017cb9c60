//! Dual-written device config record.

use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::provider::KeyValueStore;
use fieldsync_common::{merge, CounterSnapshot, DeviceConfig, Error, Result};

/// Key under which the device config is stored in both media.
pub const CONFIG_KEY: &str = "config";

/// Owner of the single `DeviceConfig` record.
///
/// Every write goes to the primary store first and is then mirrored to the
/// backup. Reads prefer the primary and fall back to the backup; callers
/// never learn which medium answered. All reads and writes are serialized
/// by one async mutex, which makes `update` an atomic read-modify-write.
pub struct ConfigStore {
    primary: Arc<dyn KeyValueStore>,
    backup: Arc<dyn KeyValueStore>,
    guard: Mutex<()>,
}

impl ConfigStore {
    /// Create a config store over a primary and a backup medium.
    pub fn new(primary: Arc<dyn KeyValueStore>, backup: Arc<dyn KeyValueStore>) -> Self {
        Self {
            primary,
            backup,
            guard: Mutex::new(()),
        }
    }

    /// Read the current config.
    ///
    /// # Returns
    /// `None` if the device has never been configured.
    ///
    /// # Errors
    /// - `StorageUnavailable` if neither medium can produce a trustworthy answer
    pub async fn get(&self) -> Result<Option<DeviceConfig>> {
        let _guard = self.guard.lock().await;
        self.read_locked().await
    }

    /// Store a config.
    ///
    /// If a config for the same devcode already exists, the stored value is
    /// the counter-wise maximum of both so that `put` can never move a
    /// counter backwards. Returns the value actually stored.
    ///
    /// # Errors
    /// - `InvalidInput` if the device is bound to a different devcode
    /// - `StorageUnavailable` if neither medium accepted the write
    pub async fn put(&self, config: DeviceConfig) -> Result<DeviceConfig> {
        let _guard = self.guard.lock().await;

        let stored = match self.read_locked().await? {
            Some(existing) if existing.devcode != config.devcode => {
                return Err(Error::InvalidInput(format!(
                    "device is bound to devcode {}; reset before adopting {}",
                    existing.devcode, config.devcode
                )));
            }
            Some(existing) => merge(&config, &CounterSnapshot::from(&existing)),
            None => {
                info!("Initializing device config for {}", config.devcode);
                config
            }
        };

        self.write_locked(&stored).await?;
        Ok(stored)
    }

    /// Atomically read, modify and write the config.
    ///
    /// `apply` runs inside the critical section. Counter decreases made by
    /// `apply` are discarded and the devcode cannot be changed.
    ///
    /// # Errors
    /// - `DeviceNotConfigured` if no config exists
    /// - Any error returned by `apply`; nothing is written in that case
    /// - `StorageUnavailable` if neither medium accepted the write
    pub async fn update<F>(&self, apply: F) -> Result<DeviceConfig>
    where
        F: FnOnce(&mut DeviceConfig) -> Result<()> + Send,
    {
        let _guard = self.guard.lock().await;

        let current = self
            .read_locked()
            .await?
            .ok_or(Error::DeviceNotConfigured)?;

        let mut next = current.clone();
        apply(&mut next)?;

        if next.devcode != current.devcode {
            return Err(Error::InvalidInput("devcode is immutable".to_string()));
        }
        let next = merge(&next, &CounterSnapshot::from(&current));

        if next != current {
            self.write_locked(&next).await?;
        }
        Ok(next)
    }

    /// Remove the config from both media (explicit device reset).
    pub async fn reset(&self) -> Result<()> {
        let _guard = self.guard.lock().await;

        let primary = self.primary.delete(CONFIG_KEY).await;
        let backup = self.backup.delete(CONFIG_KEY).await;
        match (primary, backup) {
            (Err(p), Err(b)) => Err(Error::StorageUnavailable(format!(
                "reset failed on {} ({}) and {} ({})",
                self.primary.name(),
                p,
                self.backup.name(),
                b
            ))),
            (Err(e), Ok(())) | (Ok(()), Err(e)) => {
                warn!("Device reset only partially applied: {}", e);
                Ok(())
            }
            (Ok(()), Ok(())) => {
                info!("Device config reset");
                Ok(())
            }
        }
    }

    async fn read_locked(&self) -> Result<Option<DeviceConfig>> {
        let primary = read_config(self.primary.as_ref()).await;
        let backup = read_config(self.backup.as_ref()).await;

        match (primary, backup) {
            (Ok(Some(p)), Ok(Some(b))) => {
                if p.devcode != b.devcode {
                    warn!(
                        "Backup config belongs to {} but primary to {}; ignoring backup",
                        b.devcode, p.devcode
                    );
                    return Ok(Some(p));
                }
                Ok(Some(merge(&p, &CounterSnapshot::from(&b))))
            }
            (Ok(Some(p)), Ok(None)) => Ok(Some(p)),
            (Ok(Some(p)), Err(e)) => {
                warn!("Backup config unreadable: {}", e);
                Ok(Some(p))
            }
            (primary, Ok(Some(b))) => {
                match primary {
                    Ok(_) => warn!("Primary config empty; recovering from backup"),
                    Err(e) => warn!("Primary config unreadable ({}); recovering from backup", e),
                }
                self.repair_primary(&b).await;
                Ok(Some(b))
            }
            (Ok(None), Ok(None)) => Ok(None),
            // An empty primary only means "unconfigured" when the backup agrees.
            (Ok(None), Err(b)) => Err(Error::StorageUnavailable(format!(
                "primary config empty and backup unreadable ({})",
                b
            ))),
            (Err(p), Ok(None)) => Err(Error::StorageUnavailable(format!(
                "primary config unreadable ({}) and no backup copy",
                p
            ))),
            (Err(p), Err(b)) => Err(Error::StorageUnavailable(format!(
                "primary: {}; backup: {}",
                p, b
            ))),
        }
    }

    async fn repair_primary(&self, config: &DeviceConfig) {
        let bytes = match config.to_bytes() {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!("Cannot encode config for repair: {}", e);
                return;
            }
        };
        match self.primary.put(CONFIG_KEY, &bytes).await {
            Ok(()) => info!("Primary config restored from backup"),
            Err(e) => warn!("Primary config repair failed: {}", e),
        }
    }

    async fn write_locked(&self, config: &DeviceConfig) -> Result<()> {
        let bytes = config.to_bytes()?;

        let primary = self.primary.put(CONFIG_KEY, &bytes).await;
        let backup = self.backup.put(CONFIG_KEY, &bytes).await;

        match (primary, backup) {
            (Ok(()), Ok(())) => {
                debug!(
                    "Config written: {} last_trn_id={}",
                    config.devcode, config.last_trn_id
                );
                Ok(())
            }
            (Ok(()), Err(e)) => {
                warn!("Backup config write failed on {}: {}", self.backup.name(), e);
                Ok(())
            }
            (Err(e), Ok(())) => {
                warn!(
                    "Primary config write failed on {}: {}; backup holds the latest value",
                    self.primary.name(),
                    e
                );
                Ok(())
            }
            (Err(p), Err(b)) => Err(Error::StorageUnavailable(format!(
                "write failed on {} ({}) and {} ({})",
                self.primary.name(),
                p,
                self.backup.name(),
                b
            ))),
        }
    }
}

async fn read_config(store: &dyn KeyValueStore) -> Result<Option<DeviceConfig>> {
    match store.get(CONFIG_KEY).await? {
        Some(bytes) => DeviceConfig::from_bytes(&bytes).map(Some),
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::local::FileStore;
    use crate::memory::MemoryStore;
    use crate::sqlite::SqliteStore;
    use fieldsync_common::{DevCode, TransactionType};
    use tempfile::TempDir;

    fn config(last: u64) -> DeviceConfig {
        let mut c = DeviceConfig::new(DevCode::new("AG05").unwrap());
        c.last_trn_id = last;
        c
    }

    fn memory_store() -> (ConfigStore, MemoryStore, MemoryStore) {
        let primary = MemoryStore::new();
        let backup = MemoryStore::new();
        let store = ConfigStore::new(Arc::new(primary.clone()), Arc::new(backup.clone()));
        (store, primary, backup)
    }

    #[tokio::test]
    async fn test_get_absent() {
        let (store, _, _) = memory_store();
        assert!(store.get().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_put_writes_both_media() {
        let (store, primary, backup) = memory_store();
        store.put(config(41)).await.unwrap();

        assert!(primary.get(CONFIG_KEY).await.unwrap().is_some());
        assert!(backup.get(CONFIG_KEY).await.unwrap().is_some());
        assert_eq!(store.get().await.unwrap().unwrap().last_trn_id, 41);
    }

    #[tokio::test]
    async fn test_corrupted_primary_falls_back_and_repairs() {
        let (store, primary, _backup) = memory_store();
        store.put(config(41)).await.unwrap();
        primary.corrupt(CONFIG_KEY).unwrap();

        let recovered = store.get().await.unwrap().unwrap();
        assert_eq!(recovered.last_trn_id, 41);

        let repaired = DeviceConfig::from_bytes(&primary.get(CONFIG_KEY).await.unwrap().unwrap());
        assert_eq!(repaired.unwrap().last_trn_id, 41);
    }

    #[tokio::test]
    async fn test_missing_primary_continues_from_backup() {
        let (store, primary, _backup) = memory_store();
        store.put(config(41)).await.unwrap();
        primary.delete(CONFIG_KEY).await.unwrap();

        let next = store
            .update(|c| {
                c.last_trn_id += 1;
                Ok(())
            })
            .await
            .unwrap();
        assert_eq!(next.last_trn_id, 42);
    }

    #[tokio::test]
    async fn test_both_unavailable() {
        let (store, primary, backup) = memory_store();
        primary.set_offline(true);
        backup.set_offline(true);

        assert!(matches!(store.get().await, Err(Error::StorageUnavailable(_))));
        assert!(matches!(
            store.put(config(1)).await,
            Err(Error::StorageUnavailable(_))
        ));
    }

    #[tokio::test]
    async fn test_unreadable_primary_without_backup_copy_is_unavailable() {
        let (store, primary, _backup) = memory_store();
        primary.corrupt(CONFIG_KEY).unwrap();
        assert!(matches!(store.get().await, Err(Error::StorageUnavailable(_))));
    }

    #[tokio::test]
    async fn test_empty_primary_with_unreadable_backup_is_unavailable() {
        let (store, _primary, backup) = memory_store();
        backup.put(CONFIG_KEY, &config(44).to_bytes().unwrap()).await.unwrap();
        backup.set_offline(true);

        assert!(matches!(store.get().await, Err(Error::StorageUnavailable(_))));
        // A lagging config must not be written over the unreadable backup copy.
        assert!(matches!(
            store.put(config(43)).await,
            Err(Error::StorageUnavailable(_))
        ));

        backup.set_offline(false);
        assert_eq!(store.get().await.unwrap().unwrap().last_trn_id, 44);
    }

    #[tokio::test]
    async fn test_write_survives_one_medium_down() {
        let (store, _primary, backup) = memory_store();
        store.put(config(1)).await.unwrap();
        backup.set_offline(true);

        let next = store
            .update(|c| {
                c.last_trn_id = 2;
                Ok(())
            })
            .await
            .unwrap();
        assert_eq!(next.last_trn_id, 2);
    }

    #[tokio::test]
    async fn test_divergent_copies_never_regress() {
        let (store, primary, backup) = memory_store();
        primary.put(CONFIG_KEY, &config(10).to_bytes().unwrap()).await.unwrap();
        backup.put(CONFIG_KEY, &config(12).to_bytes().unwrap()).await.unwrap();

        assert_eq!(store.get().await.unwrap().unwrap().last_trn_id, 12);
    }

    #[tokio::test]
    async fn test_put_does_not_regress_counters() {
        let (store, _, _) = memory_store();
        let mut high = config(50);
        high.type_counters.insert(TransactionType::Sale, 9);
        store.put(high).await.unwrap();

        let stored = store.put(config(3)).await.unwrap();
        assert_eq!(stored.last_trn_id, 50);
        assert_eq!(stored.type_counter(TransactionType::Sale), 9);
    }

    #[tokio::test]
    async fn test_put_rejects_other_devcode() {
        let (store, _, _) = memory_store();
        store.put(config(1)).await.unwrap();

        let other = DeviceConfig::new(DevCode::new("ZZ01").unwrap());
        assert!(matches!(store.put(other.clone()).await, Err(Error::InvalidInput(_))));

        store.reset().await.unwrap();
        assert_eq!(store.put(other).await.unwrap().devcode.as_str(), "ZZ01");
    }

    #[tokio::test]
    async fn test_update_requires_config() {
        let (store, _, _) = memory_store();
        let result = store.update(|_| Ok(())).await;
        assert!(matches!(result, Err(Error::DeviceNotConfigured)));
    }

    #[tokio::test]
    async fn test_update_discards_decrease() {
        let (store, _, _) = memory_store();
        store.put(config(20)).await.unwrap();
        let next = store
            .update(|c| {
                c.last_trn_id = 5;
                Ok(())
            })
            .await
            .unwrap();
        assert_eq!(next.last_trn_id, 20);
    }

    #[tokio::test]
    async fn test_failed_apply_writes_nothing() {
        let (store, _, _) = memory_store();
        store.put(config(20)).await.unwrap();
        let result = store
            .update(|c| {
                c.last_trn_id = 21;
                Err(Error::InvalidInput("abort".into()))
            })
            .await;
        assert!(result.is_err());
        assert_eq!(store.get().await.unwrap().unwrap().last_trn_id, 20);
    }

    #[tokio::test]
    async fn test_concurrent_updates_are_serialized() {
        let (store, _, _) = memory_store();
        store.put(config(0)).await.unwrap();
        let store = Arc::new(store);

        let mut tasks = Vec::new();
        for _ in 0..50 {
            let store = store.clone();
            tasks.push(tokio::spawn(async move {
                store
                    .update(|c| {
                        c.last_trn_id += 1;
                        Ok(())
                    })
                    .await
                    .unwrap()
                    .last_trn_id
            }));
        }

        let mut seen = Vec::new();
        for task in tasks {
            seen.push(task.await.unwrap());
        }
        seen.sort_unstable();
        seen.dedup();

        assert_eq!(seen.len(), 50);
        assert_eq!(store.get().await.unwrap().unwrap().last_trn_id, 50);
    }

    #[tokio::test]
    async fn test_sqlite_primary_file_backup() {
        let temp_dir = TempDir::new().unwrap();
        let primary = Arc::new(SqliteStore::open(temp_dir.path().join("fieldsync.db")).unwrap());
        let backup = Arc::new(FileStore::new(temp_dir.path().join("backup")).unwrap());
        let store = ConfigStore::new(primary.clone(), backup);

        store.put(config(7)).await.unwrap();
        primary.delete(CONFIG_KEY).await.unwrap();

        assert_eq!(store.get().await.unwrap().unwrap().last_trn_id, 7);
        assert!(primary.get(CONFIG_KEY).await.unwrap().is_some());
    }
}
