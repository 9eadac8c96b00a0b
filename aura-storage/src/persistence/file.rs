//! JSON file persistence.
//!
//! Each store id maps to `<dir>/<store_id>.store`, a JSON object holding the
//! document under `data` plus `last_updated` (epoch ms) and `version`.
//! Backups live next to it as `<store_id>_backup_<name>.store`.

use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use aura_core::constants::{CACHE_ENTRY_VERSION, KNOWN_STORES};
use aura_core::{EpochMillis, PersistenceError, SharedClock};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{validate_store_id, KeyValuePersistence};

const STORE_EXTENSION: &str = "store";
const BACKUP_MARKER: &str = "_backup_";

/// On-disk layout of a `.store` file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct StoreFile {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    last_updated: Option<EpochMillis>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    version: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    backup_timestamp: Option<EpochMillis>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    original_store: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    restored_from: Option<String>,
}

/// Metadata about one store file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreMetadata {
    pub store_id: String,
    pub last_updated: EpochMillis,
    /// Length of the serialized `data` document in bytes.
    pub size: usize,
    pub version: u32,
}

/// Health of one known store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreStatus {
    pub exists: bool,
    pub has_data: bool,
    pub last_updated: EpochMillis,
    pub healthy: bool,
}

/// Health report across the known stores.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreHealth {
    pub stores: BTreeMap<String, StoreStatus>,
    pub timestamp: EpochMillis,
}

impl StoreHealth {
    pub fn is_healthy(&self) -> bool {
        self.stores.values().all(|s| !s.exists || s.healthy)
    }
}

/// Persistence backed by one JSON file per store id.
#[derive(Debug, Clone)]
pub struct FileKvStore {
    dir: PathBuf,
    clock: SharedClock,
}

impl FileKvStore {
    /// The directory is created lazily on first write.
    pub fn new(dir: impl AsRef<Path>, clock: SharedClock) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
            clock,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn store_path(&self, store_id: &str) -> PathBuf {
        self.dir.join(format!("{store_id}.{STORE_EXTENSION}"))
    }

    fn backup_path(&self, store_id: &str, backup_name: &str) -> PathBuf {
        self.dir
            .join(format!("{store_id}{BACKUP_MARKER}{backup_name}.{STORE_EXTENSION}"))
    }

    async fn read_file(&self, path: &Path, store_id: &str) -> Result<Option<StoreFile>, PersistenceError> {
        let bytes = match tokio::fs::read(path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(io_error(store_id, e)),
        };
        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|e| PersistenceError::Serialization {
                store_id: store_id.to_string(),
                reason: e.to_string(),
            })
    }

    /// Write through a temporary file and rename so readers never see a torn file.
    async fn write_file(&self, path: &Path, store_id: &str, file: &StoreFile) -> Result<(), PersistenceError> {
        let bytes = serde_json::to_vec_pretty(file).map_err(|e| PersistenceError::Serialization {
            store_id: store_id.to_string(),
            reason: e.to_string(),
        })?;
        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| io_error(store_id, e))?;
        let tmp = path.with_extension("tmp");
        tokio::fs::write(&tmp, &bytes)
            .await
            .map_err(|e| io_error(store_id, e))?;
        tokio::fs::rename(&tmp, path)
            .await
            .map_err(|e| io_error(store_id, e))
    }

    pub async fn metadata(&self, store_id: &str) -> Result<StoreMetadata, PersistenceError> {
        validate_store_id(store_id)?;
        let file = self
            .read_file(&self.store_path(store_id), store_id)
            .await?
            .unwrap_or_default();
        Ok(StoreMetadata {
            store_id: store_id.to_string(),
            last_updated: file.last_updated.unwrap_or(0),
            size: file.data.as_ref().map(|d| d.to_string().len()).unwrap_or(0),
            version: file.version.unwrap_or(CACHE_ENTRY_VERSION),
        })
    }

    /// Store ids with a `.store` file in the directory, backups excluded.
    pub async fn list(&self) -> Result<Vec<String>, PersistenceError> {
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(io_error("*", e)),
        };

        let mut ids = Vec::new();
        while let Some(entry) = entries.next_entry().await.map_err(|e| io_error("*", e))? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(STORE_EXTENSION) {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                if !stem.contains(BACKUP_MARKER) {
                    ids.push(stem.to_string());
                }
            }
        }
        ids.sort();
        Ok(ids)
    }

    /// Empty the store file, keeping the file itself.
    pub async fn clear(&self, store_id: &str) -> Result<(), PersistenceError> {
        validate_store_id(store_id)?;
        self.write_file(&self.store_path(store_id), store_id, &StoreFile::default())
            .await
    }

    /// Copy the current document into a named backup.
    pub async fn backup(&self, store_id: &str, backup_name: &str) -> Result<(), PersistenceError> {
        validate_store_id(store_id)?;
        validate_store_id(backup_name)?;
        let current = self
            .read_file(&self.store_path(store_id), store_id)
            .await?
            .unwrap_or_default();
        let backup = StoreFile {
            data: current.data,
            backup_timestamp: Some(self.clock.now_millis()),
            original_store: Some(store_id.to_string()),
            ..Default::default()
        };
        self.write_file(&self.backup_path(store_id, backup_name), store_id, &backup)
            .await?;
        tracing::info!(store_id = %store_id, backup = %backup_name, "Store backed up");
        Ok(())
    }

    /// Replace the current document with a named backup.
    pub async fn restore(&self, store_id: &str, backup_name: &str) -> Result<(), PersistenceError> {
        validate_store_id(store_id)?;
        validate_store_id(backup_name)?;
        let data = self
            .read_file(&self.backup_path(store_id, backup_name), store_id)
            .await?
            .and_then(|b| b.data)
            .ok_or_else(|| PersistenceError::EmptyBackup {
                store_id: store_id.to_string(),
                backup: backup_name.to_string(),
            })?;
        let restored = StoreFile {
            data: Some(data),
            last_updated: Some(self.clock.now_millis()),
            version: Some(CACHE_ENTRY_VERSION),
            restored_from: Some(backup_name.to_string()),
            ..Default::default()
        };
        self.write_file(&self.store_path(store_id), store_id, &restored)
            .await?;
        tracing::info!(store_id = %store_id, backup = %backup_name, "Store restored from backup");
        Ok(())
    }

    /// A store is valid when it holds data and a write timestamp.
    pub async fn validate(&self, store_id: &str) -> Result<bool, PersistenceError> {
        validate_store_id(store_id)?;
        Ok(self
            .read_file(&self.store_path(store_id), store_id)
            .await?
            .map(|f| f.data.is_some() && f.last_updated.is_some())
            .unwrap_or(false))
    }

    /// Check every known store. Unreadable files are reported unhealthy.
    pub async fn health(&self) -> StoreHealth {
        let mut stores = BTreeMap::new();
        for store_id in KNOWN_STORES {
            let status = match self.read_file(&self.store_path(store_id), store_id).await {
                Ok(Some(file)) => StoreStatus {
                    exists: true,
                    has_data: file.data.is_some(),
                    last_updated: file.last_updated.unwrap_or(0),
                    healthy: file.data.is_some(),
                },
                Ok(None) => StoreStatus {
                    exists: false,
                    has_data: false,
                    last_updated: 0,
                    healthy: false,
                },
                Err(e) => {
                    tracing::warn!(store_id = %store_id, error = %e, "Store file unreadable");
                    StoreStatus {
                        exists: true,
                        has_data: false,
                        last_updated: 0,
                        healthy: false,
                    }
                }
            };
            stores.insert(store_id.to_string(), status);
        }
        StoreHealth {
            stores,
            timestamp: self.clock.now_millis(),
        }
    }
}

#[async_trait]
impl KeyValuePersistence for FileKvStore {
    async fn get(&self, store_id: &str) -> Result<Option<Value>, PersistenceError> {
        validate_store_id(store_id)?;
        Ok(self
            .read_file(&self.store_path(store_id), store_id)
            .await?
            .and_then(|f| f.data))
    }

    async fn set(&self, store_id: &str, value: Value) -> Result<(), PersistenceError> {
        validate_store_id(store_id)?;
        let file = StoreFile {
            data: Some(value),
            last_updated: Some(self.clock.now_millis()),
            version: Some(CACHE_ENTRY_VERSION),
            ..Default::default()
        };
        self.write_file(&self.store_path(store_id), store_id, &file)
            .await
    }

    async fn remove(&self, store_id: &str) -> Result<(), PersistenceError> {
        validate_store_id(store_id)?;
        match tokio::fs::remove_file(self.store_path(store_id)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(io_error(store_id, e)),
        }
    }
}

fn io_error(store_id: &str, e: std::io::Error) -> PersistenceError {
    PersistenceError::Io {
        store_id: store_id.to_string(),
        reason: e.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aura_core::ManualClock;
    use serde_json::json;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn store() -> (TempDir, FileKvStore, Arc<ManualClock>) {
        let dir = tempfile::tempdir().unwrap();
        let clock = ManualClock::new(1_700_000_000_000);
        let store = FileKvStore::new(dir.path(), clock.clone());
        (dir, store, clock)
    }

    #[tokio::test]
    async fn test_missing_store_reads_none() {
        let (_dir, store, _) = store();
        assert_eq!(store.get("session").await.unwrap(), None);
        assert!(!store.validate("session").await.unwrap());
    }

    #[tokio::test]
    async fn test_set_writes_envelope() {
        let (dir, store, _) = store();
        store.set("app_config", json!({"theme": "dark"})).await.unwrap();

        let raw = std::fs::read_to_string(dir.path().join("app_config.store")).unwrap();
        let parsed: Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(parsed["data"], json!({"theme": "dark"}));
        assert_eq!(parsed["last_updated"], json!(1_700_000_000_000i64));
        assert_eq!(parsed["version"], json!(1));

        assert_eq!(
            store.get("app_config").await.unwrap(),
            Some(json!({"theme": "dark"}))
        );
        assert!(store.validate("app_config").await.unwrap());
    }

    #[tokio::test]
    async fn test_metadata_and_list() {
        let (_dir, store, _) = store();
        store.set("session", json!({"a": 1})).await.unwrap();
        store.set("api_cache", json!({})).await.unwrap();
        store.backup("session", "nightly").await.unwrap();

        let meta = store.metadata("session").await.unwrap();
        assert_eq!(meta.size, json!({"a": 1}).to_string().len());
        assert_eq!(meta.version, 1);
        assert_eq!(meta.last_updated, 1_700_000_000_000);

        assert_eq!(store.list().await.unwrap(), vec!["api_cache", "session"]);
    }

    #[tokio::test]
    async fn test_backup_and_restore() {
        let (_dir, store, clock) = store();
        store.set("session", json!({"v": 1})).await.unwrap();
        store.backup("session", "b1").await.unwrap();
        store.set("session", json!({"v": 2})).await.unwrap();

        clock.advance(std::time::Duration::from_secs(10));
        store.restore("session", "b1").await.unwrap();
        assert_eq!(store.get("session").await.unwrap(), Some(json!({"v": 1})));
        assert_eq!(
            store.metadata("session").await.unwrap().last_updated,
            1_700_000_010_000
        );
    }

    #[tokio::test]
    async fn test_restore_from_empty_backup_fails() {
        let (_dir, store, _) = store();
        store.backup("session", "empty").await.unwrap();
        assert!(matches!(
            store.restore("session", "empty").await,
            Err(PersistenceError::EmptyBackup { .. })
        ));
        assert!(matches!(
            store.restore("session", "missing").await,
            Err(PersistenceError::EmptyBackup { .. })
        ));
    }

    #[tokio::test]
    async fn test_clear_and_remove() {
        let (dir, store, _) = store();
        store.set("session", json!({"v": 1})).await.unwrap();
        store.clear("session").await.unwrap();
        assert_eq!(store.get("session").await.unwrap(), None);
        assert!(dir.path().join("session.store").exists());

        store.remove("session").await.unwrap();
        store.remove("session").await.unwrap();
        assert!(!dir.path().join("session.store").exists());
    }

    #[tokio::test]
    async fn test_corrupt_file_is_serialization_error() {
        let (dir, store, _) = store();
        std::fs::write(dir.path().join("api_cache.store"), b"{not json").unwrap();
        assert!(matches!(
            store.get("api_cache").await,
            Err(PersistenceError::Serialization { .. })
        ));

        let health = store.health().await;
        assert!(!health.stores["api_cache"].healthy);
        assert!(health.stores["api_cache"].exists);
        assert!(!health.is_healthy());
    }

    #[tokio::test]
    async fn test_health_reports_known_stores() {
        let (_dir, store, _) = store();
        store.set("session", json!({})).await.unwrap();
        let health = store.health().await;
        assert_eq!(health.stores.len(), KNOWN_STORES.len());
        assert!(health.stores["session"].healthy);
        assert!(!health.stores["app_config"].exists);
        assert!(health.is_healthy());
    }
}
