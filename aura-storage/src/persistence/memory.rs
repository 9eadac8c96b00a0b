use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use async_trait::async_trait;
use aura_core::PersistenceError;
use serde_json::Value;

use super::{validate_store_id, KeyValuePersistence};

/// In-memory persistence. Contents are lost when dropped.
#[derive(Debug, Default)]
pub struct MemoryKvStore {
    documents: RwLock<HashMap<String, Value>>,
}

impl MemoryKvStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store ids currently holding a document, sorted.
    pub fn store_ids(&self) -> Vec<String> {
        let documents = self.documents.read().unwrap_or_else(PoisonError::into_inner);
        let mut ids: Vec<String> = documents.keys().cloned().collect();
        ids.sort();
        ids
    }
}

#[async_trait]
impl KeyValuePersistence for MemoryKvStore {
    async fn get(&self, store_id: &str) -> Result<Option<Value>, PersistenceError> {
        validate_store_id(store_id)?;
        let documents = self.documents.read().unwrap_or_else(PoisonError::into_inner);
        Ok(documents.get(store_id).cloned())
    }

    async fn set(&self, store_id: &str, value: Value) -> Result<(), PersistenceError> {
        validate_store_id(store_id)?;
        let mut documents = self
            .documents
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        documents.insert(store_id.to_string(), value);
        Ok(())
    }

    async fn remove(&self, store_id: &str) -> Result<(), PersistenceError> {
        validate_store_id(store_id)?;
        let mut documents = self
            .documents
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        documents.remove(store_id);
        Ok(())
    }
}
