//! Error types for Aura operations

use thiserror::Error;

/// Failures of the remote-call collaborator.
///
/// Transport and remote-side failures are handled identically by the stores;
/// the distinction is kept for logging.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RemoteError {
    #[error("Transport failure calling {operation}: {reason}")]
    Transport { operation: String, reason: String },

    #[error("Remote call {operation} failed: {message}")]
    Remote { operation: String, message: String },

    #[error("Invalid response from {operation}: {reason}")]
    InvalidResponse { operation: String, reason: String },
}

impl RemoteError {
    pub fn transport(operation: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Transport {
            operation: operation.into(),
            reason: reason.into(),
        }
    }

    pub fn remote(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Remote {
            operation: operation.into(),
            message: message.into(),
        }
    }

    pub fn operation(&self) -> &str {
        match self {
            Self::Transport { operation, .. }
            | Self::Remote { operation, .. }
            | Self::InvalidResponse { operation, .. } => operation,
        }
    }
}

/// Cache manager errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CacheError {
    #[error("Failed to serialize cache value for {key}: {reason}")]
    Serialization { key: String, reason: String },

    #[error("Failed to deserialize cache value for {key}: {reason}")]
    Deserialization { key: String, reason: String },

    #[error("Invalid invalidation pattern {pattern}: {reason}")]
    InvalidPattern { pattern: String, reason: String },
}

/// Durable key-value persistence errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PersistenceError {
    #[error("I/O error on store {store_id}: {reason}")]
    Io { store_id: String, reason: String },

    #[error("Serialization error on store {store_id}: {reason}")]
    Serialization { store_id: String, reason: String },

    #[error("Storage backend error: {reason}")]
    Backend { reason: String },

    #[error("Invalid store id {store_id:?}")]
    InvalidStoreId { store_id: String },

    #[error("Store {store_id} has no data to restore from backup {backup}")]
    EmptyBackup { store_id: String, backup: String },
}

/// Authentication and session errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AuthError {
    #[error("Authentication required")]
    NotAuthenticated,

    #[error("Secure token store error: {reason}")]
    TokenStore { reason: String },

    #[error("Token refresh failed: {reason}")]
    RefreshFailed { reason: String },

    #[error("Session restore failed: {reason}")]
    RestoreFailed { reason: String },

    #[error("Session changed while the refresh was in flight")]
    SessionChanged,
}

/// Offline queue errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum QueueError {
    #[error("Operation {operation} dropped after {attempts} failed attempts")]
    Exhausted { operation: String, attempts: u32 },

    #[error("Operation {operation} suppressed: identical request keeps failing")]
    Suppressed { operation: String },
}

/// Configuration errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {reason}")]
    Io { path: String, reason: String },

    #[error("Failed to parse config TOML: {reason}")]
    Parse { reason: String },

    #[error("Invalid config value for {field}: {reason}")]
    InvalidValue { field: &'static str, reason: String },
}

/// Master error type for all Aura errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AuraError {
    #[error("Remote error: {0}")]
    Remote(#[from] RemoteError),

    #[error("Cache error: {0}")]
    Cache(#[from] CacheError),

    #[error("Persistence error: {0}")]
    Persistence(#[from] PersistenceError),

    #[error("Auth error: {0}")]
    Auth(#[from] AuthError),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),
}

impl AuraError {
    /// Whether the failure came from the remote-call collaborator.
    pub fn is_remote(&self) -> bool {
        matches!(self, Self::Remote(_))
    }

    /// Whether the failure ends the current session.
    pub fn is_auth(&self) -> bool {
        matches!(self, Self::Auth(_))
    }
}

/// Result type alias for Aura operations.
pub type AuraResult<T> = Result<T, AuraError>;

// =============================================================================
// TESTS
// =============================================================================
