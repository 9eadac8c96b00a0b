//! Aura Core - Entity Types
//!
//! Data types, error taxonomy, configuration and the cache key namespace
//! shared by every other crate in the workspace. No I/O lives here.

pub mod cache_key;
pub mod clock;
pub mod collaborators;
pub mod config;
pub mod constants;
pub mod entities;
pub mod error;
pub mod identity;

pub use cache_key::{CacheDomain, CacheKey};
pub use collaborators::{
    call_typed, RemoteCall, SecureTokenStore, SharedRemote, SharedTokenStore,
};
pub use clock::{duration_millis, Clock, ManualClock, SharedClock, SystemClock};
pub use config::{
    AuraConfig, CacheSettings, LoggingConfig, QueueSettings, SessionSettings, StorageBackend,
    StorageSettings, SyncSettings, TtlSettings,
};
pub use entities::{
    AuthTokens, AuthenticatedSession, Package, PackagePrice, PackageWithPrices, PaymentMethod,
    PendingChange, Profile, ProfileUpdate, Purchase, Session, SubscriptionInfo, Theme,
    TokenBalance, User, UserSettings,
};
pub use error::{
    AuraError, AuraResult, AuthError, CacheError, ConfigError, PersistenceError, QueueError,
    RemoteError,
};
pub use identity::{new_entity_id, operation_fingerprint, EpochMillis, UserId};
