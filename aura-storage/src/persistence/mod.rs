//! Durable key-value persistence.
//!
//! Every store persists one JSON document under a short store id
//! (`session`, `api_cache`, `app_config`, `offline_queue`). Backends:
//!
//! - [`MemoryKvStore`] for tests and ephemeral runs
//! - [`FileKvStore`] writing `<store_id>.store` JSON files
//! - [`LmdbKvStore`] keeping all stores in a single LMDB environment

mod file;
mod lmdb;
mod memory;

pub use file::{FileKvStore, StoreHealth, StoreMetadata, StoreStatus};
pub use lmdb::{LmdbKvStore, LmdbStoreError};
pub use memory::MemoryKvStore;

use std::sync::Arc;

use async_trait::async_trait;
use aura_core::{PersistenceError, SharedClock, StorageBackend, StorageSettings};
use serde_json::Value;

/// Key-value persistence consumed by the stores.
///
/// Implementations must be safe to call concurrently from multiple tasks.
#[async_trait]
pub trait KeyValuePersistence: Send + Sync {
    /// Load the document stored under `store_id`, if any.
    async fn get(&self, store_id: &str) -> Result<Option<Value>, PersistenceError>;

    /// Replace the document stored under `store_id`.
    async fn set(&self, store_id: &str, value: Value) -> Result<(), PersistenceError>;

    /// Remove the document stored under `store_id`. Missing ids are not an error.
    async fn remove(&self, store_id: &str) -> Result<(), PersistenceError>;
}

/// Shared persistence handle.
pub type SharedPersistence = Arc<dyn KeyValuePersistence>;

/// Store ids become file names and LMDB keys.
pub(crate) fn validate_store_id(store_id: &str) -> Result<(), PersistenceError> {
    let valid = !store_id.is_empty()
        && store_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
    if valid {
        Ok(())
    } else {
        Err(PersistenceError::InvalidStoreId {
            store_id: store_id.to_string(),
        })
    }
}

/// Open the backend selected in configuration.
pub fn open_persistence(
    settings: &StorageSettings,
    clock: SharedClock,
) -> Result<SharedPersistence, PersistenceError> {
    let backend: SharedPersistence = match settings.backend {
        StorageBackend::Memory => Arc::new(MemoryKvStore::new()),
        StorageBackend::File => Arc::new(FileKvStore::new(&settings.data_dir, clock)),
        StorageBackend::Lmdb => Arc::new(
            LmdbKvStore::open(&settings.data_dir, settings.lmdb_map_size_mb)
                .map_err(PersistenceError::from)?,
        ),
    };
    tracing::debug!(backend = ?settings.backend, data_dir = %settings.data_dir.display(), "Opened persistence backend");
    Ok(backend)
}
