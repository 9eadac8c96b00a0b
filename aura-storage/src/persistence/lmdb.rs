//! LMDB-backed persistence.
//!
//! Uses the heed crate (Rust bindings for LMDB). All store ids share the
//! single unnamed database of one environment; values are the JSON-encoded
//! documents.

use std::path::Path;

use async_trait::async_trait;
use aura_core::PersistenceError;
use heed::types::{Bytes, Str};
use heed::{Database, Env, EnvOpenOptions};
use serde_json::Value;

use super::{validate_store_id, KeyValuePersistence};

/// Error type for LMDB persistence operations.
#[derive(Debug, thiserror::Error)]
pub enum LmdbStoreError {
    /// Failed to open or create the LMDB environment.
    #[error("Failed to open LMDB environment: {0}")]
    EnvOpen(String),

    /// Failed to open the database within the environment.
    #[error("Failed to open database: {0}")]
    DbOpen(String),

    /// Transaction error.
    #[error("Transaction error: {0}")]
    Transaction(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<LmdbStoreError> for PersistenceError {
    fn from(e: LmdbStoreError) -> Self {
        PersistenceError::Backend {
            reason: e.to_string(),
        }
    }
}

/// Persistence in a memory-mapped LMDB environment.
pub struct LmdbKvStore {
    env: Env,
    db: Database<Str, Bytes>,
}

impl std::fmt::Debug for LmdbKvStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LmdbKvStore")
            .field("path", &self.env.path())
            .finish()
    }
}

impl LmdbKvStore {
    /// Open (or create) an environment in `path` with a map of `max_size_mb`.
    pub fn open<P: AsRef<Path>>(path: P, max_size_mb: usize) -> Result<Self, LmdbStoreError> {
        std::fs::create_dir_all(&path)?;

        // SAFETY: the environment is opened once per directory by this process.
        let env = unsafe {
            EnvOpenOptions::new()
                .map_size(max_size_mb * 1024 * 1024)
                .max_dbs(1)
                .open(path.as_ref())
        }
        .map_err(|e| LmdbStoreError::EnvOpen(e.to_string()))?;

        let mut wtxn = env
            .write_txn()
            .map_err(|e| LmdbStoreError::Transaction(e.to_string()))?;
        let db: Database<Str, Bytes> = env
            .create_database(&mut wtxn, None)
            .map_err(|e| LmdbStoreError::DbOpen(e.to_string()))?;
        wtxn.commit()
            .map_err(|e| LmdbStoreError::Transaction(e.to_string()))?;

        Ok(Self { env, db })
    }

    /// Store ids currently holding a document, in key order.
    pub fn store_ids(&self) -> Result<Vec<String>, LmdbStoreError> {
        let rtxn = self
            .env
            .read_txn()
            .map_err(|e| LmdbStoreError::Transaction(e.to_string()))?;
        let iter = self
            .db
            .iter(&rtxn)
            .map_err(|e| LmdbStoreError::Transaction(e.to_string()))?;

        let mut ids = Vec::new();
        for result in iter {
            let (key, _) = result.map_err(|e| LmdbStoreError::Transaction(e.to_string()))?;
            ids.push(key.to_string());
        }
        Ok(ids)
    }
}

#[async_trait]
impl KeyValuePersistence for LmdbKvStore {
    async fn get(&self, store_id: &str) -> Result<Option<Value>, PersistenceError> {
        validate_store_id(store_id)?;
        let rtxn = self
            .env
            .read_txn()
            .map_err(|e| LmdbStoreError::Transaction(e.to_string()))?;

        match self.db.get(&rtxn, store_id) {
            Ok(Some(bytes)) => serde_json::from_slice(bytes).map(Some).map_err(|e| {
                PersistenceError::Serialization {
                    store_id: store_id.to_string(),
                    reason: e.to_string(),
                }
            }),
            Ok(None) => Ok(None),
            Err(e) => Err(LmdbStoreError::Transaction(e.to_string()).into()),
        }
    }

    async fn set(&self, store_id: &str, value: Value) -> Result<(), PersistenceError> {
        validate_store_id(store_id)?;
        let bytes = serde_json::to_vec(&value).map_err(|e| PersistenceError::Serialization {
            store_id: store_id.to_string(),
            reason: e.to_string(),
        })?;

        let mut wtxn = self
            .env
            .write_txn()
            .map_err(|e| LmdbStoreError::Transaction(e.to_string()))?;
        self.db
            .put(&mut wtxn, store_id, &bytes)
            .map_err(|e| LmdbStoreError::Transaction(e.to_string()))?;
        wtxn.commit()
            .map_err(|e| LmdbStoreError::Transaction(e.to_string()))?;
        Ok(())
    }

    async fn remove(&self, store_id: &str) -> Result<(), PersistenceError> {
        validate_store_id(store_id)?;
        let mut wtxn = self
            .env
            .write_txn()
            .map_err(|e| LmdbStoreError::Transaction(e.to_string()))?;
        self.db
            .delete(&mut wtxn, store_id)
            .map_err(|e| LmdbStoreError::Transaction(e.to_string()))?;
        wtxn.commit()
            .map_err(|e| LmdbStoreError::Transaction(e.to_string()))?;
        Ok(())
    }
}
