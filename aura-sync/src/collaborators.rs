//! Host collaborators and the file-backed token store.

pub use aura_core::collaborators::{
    call_typed, ops, RemoteCall, SecureTokenStore, SharedRemote, SharedTokenStore,
};

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use aura_core::{AuthError, AuthTokens};
use serde_json::{Map, Value};

const ACCESS_TOKEN_KEY: &str = "sb-access-token";
const REFRESH_TOKEN_KEY: &str = "sb-refresh-token";
const TOKEN_FILE: &str = "session.store";

/// Token store backed by a `session.store` JSON file.
///
/// Relies on file-system permissions for protection. Hosts with a keychain
/// should provide their own [`SecureTokenStore`]. Keep it out of the
/// [`FileKvStore`](aura_storage::FileKvStore) data directory, whose session
/// snapshot uses the same file name.
#[derive(Debug, Clone)]
pub struct FileTokenStore {
    path: PathBuf,
}

impl FileTokenStore {
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            path: dir.as_ref().join(TOKEN_FILE),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn read(&self) -> Result<Map<String, Value>, AuthError> {
        let bytes = match tokio::fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Map::new()),
            Err(e) => return Err(token_store_error(e)),
        };
        serde_json::from_slice(&bytes).map_err(token_store_error)
    }

    async fn write(&self, map: Map<String, Value>) -> Result<(), AuthError> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(token_store_error)?;
        }
        let bytes = serde_json::to_vec_pretty(&Value::Object(map)).map_err(token_store_error)?;
        let tmp = self.path.with_extension("tmp");
        tokio::fs::write(&tmp, bytes)
            .await
            .map_err(token_store_error)?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .map_err(token_store_error)
    }
}

fn token_store_error(e: impl std::fmt::Display) -> AuthError {
    AuthError::TokenStore {
        reason: e.to_string(),
    }
}

#[async_trait]
impl SecureTokenStore for FileTokenStore {
    async fn store(&self, tokens: &AuthTokens) -> Result<(), AuthError> {
        let mut map = self.read().await?;
        map.insert(ACCESS_TOKEN_KEY.into(), Value::String(tokens.access_token.clone()));
        map.insert(REFRESH_TOKEN_KEY.into(), Value::String(tokens.refresh_token.clone()));
        self.write(map).await
    }

    async fn get(&self) -> Result<Option<AuthTokens>, AuthError> {
        let map = self.read().await?;
        let access = map.get(ACCESS_TOKEN_KEY).and_then(Value::as_str);
        let refresh = map.get(REFRESH_TOKEN_KEY).and_then(Value::as_str);
        Ok(match (access, refresh) {
            (Some(access), Some(refresh)) => Some(AuthTokens::new(access, refresh)),
            _ => None,
        })
    }

    async fn clear(&self) -> Result<(), AuthError> {
        let mut map = self.read().await?;
        let had_access = map.remove(ACCESS_TOKEN_KEY).is_some();
        let had_refresh = map.remove(REFRESH_TOKEN_KEY).is_some();
        if !had_access && !had_refresh {
            return Ok(());
        }
        self.write(map).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_file_token_store_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileTokenStore::new(dir.path());
        assert_eq!(store.get().await.unwrap(), None);
        assert!(!store.has_tokens().await.unwrap());

        store.store(&AuthTokens::new("access", "refresh")).await.unwrap();
        assert_eq!(
            store.get().await.unwrap(),
            Some(AuthTokens::new("access", "refresh"))
        );

        let raw: Value =
            serde_json::from_slice(&std::fs::read(store.path()).unwrap()).unwrap();
        assert_eq!(raw["sb-access-token"], json!("access"));
        assert_eq!(raw["sb-refresh-token"], json!("refresh"));

        store.clear().await.unwrap();
        assert_eq!(store.get().await.unwrap(), None);
        store.clear().await.unwrap();
    }

    #[tokio::test]
    async fn test_file_token_store_partial_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileTokenStore::new(dir.path());
        std::fs::write(store.path(), br#"{"sb-access-token": "a"}"#).unwrap();
        assert_eq!(store.get().await.unwrap(), None);
    }
}
