//! Identity types for Aura entities

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use uuid::Uuid;

/// Milliseconds since the Unix epoch.
pub type EpochMillis = i64;

/// Identifier of an authenticated user, as issued by the auth backend.
///
/// Backend user ids are opaque strings (UUIDs in practice), so this stays a
/// string newtype rather than a parsed `Uuid`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(String);

impl UserId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for UserId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for UserId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Generate a new UUIDv7 identifier (timestamp-sortable).
pub fn new_entity_id() -> Uuid {
    Uuid::now_v7()
}

/// Stable fingerprint of an operation and its parameters.
///
/// `serde_json::Value` objects serialize with sorted keys, so two parameter
/// objects with the same content produce the same fingerprint regardless of
/// insertion order.
pub fn operation_fingerprint(operation: &str, params: &serde_json::Value) -> String {
    let mut hasher = Sha256::new();
    hasher.update(operation.as_bytes());
    hasher.update([0u8]);
    hasher.update(params.to_string().as_bytes());
    hex::encode(hasher.finalize())
}
