//! Configuration for the Aura data layer.
//!
//! Loaded from TOML; every section falls back to the defaults in
//! [`crate::constants`] when omitted. Environment variables override single
//! values on top of either.

use crate::constants::*;
use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct AuraConfig {
    pub cache: CacheSettings,
    pub session: SessionSettings,
    pub sync: SyncSettings,
    pub queue: QueueSettings,
    pub ttl: TtlSettings,
    pub storage: StorageSettings,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct CacheSettings {
    pub max_size: usize,
    pub default_ttl_ms: u64,
    pub cleanup_interval_ms: u64,
    pub persist_interval_ms: u64,
    /// Whether the cache snapshot is written to durable storage.
    pub persist: bool,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            max_size: DEFAULT_CACHE_MAX_SIZE,
            default_ttl_ms: DEFAULT_CACHE_TTL_MS,
            cleanup_interval_ms: DEFAULT_CACHE_CLEANUP_INTERVAL_MS,
            persist_interval_ms: DEFAULT_CACHE_PERSIST_INTERVAL_MS,
            persist: true,
        }
    }
}

impl CacheSettings {
    pub fn default_ttl(&self) -> Duration {
        Duration::from_millis(self.default_ttl_ms)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_millis(self.cleanup_interval_ms)
    }

    pub fn persist_interval(&self) -> Duration {
        Duration::from_millis(self.persist_interval_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct SessionSettings {
    pub refresh_margin_ms: u64,
    pub persist_debounce_ms: u64,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            refresh_margin_ms: TOKEN_REFRESH_MARGIN_MS,
            persist_debounce_ms: SESSION_PERSIST_DEBOUNCE_MS,
        }
    }
}

impl SessionSettings {
    pub fn refresh_margin(&self) -> Duration {
        Duration::from_millis(self.refresh_margin_ms)
    }

    pub fn persist_debounce(&self) -> Duration {
        Duration::from_millis(self.persist_debounce_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct SyncSettings {
    pub smart_refresh_interval_ms: u64,
    pub offline_sync_interval_ms: u64,
    pub auth_settle_ms: u64,
    pub settings_debounce_ms: u64,
    /// Fraction of a TTL that must elapse before background refresh runs.
    pub background_refresh_threshold: f64,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            smart_refresh_interval_ms: SMART_REFRESH_INTERVAL_MS,
            offline_sync_interval_ms: OFFLINE_SYNC_INTERVAL_MS,
            auth_settle_ms: AUTH_SETTLE_DELAY_MS,
            settings_debounce_ms: SETTINGS_PERSIST_DEBOUNCE_MS,
            background_refresh_threshold: BACKGROUND_REFRESH_THRESHOLD,
        }
    }
}

impl SyncSettings {
    pub fn smart_refresh_interval(&self) -> Duration {
        Duration::from_millis(self.smart_refresh_interval_ms)
    }

    pub fn offline_sync_interval(&self) -> Duration {
        Duration::from_millis(self.offline_sync_interval_ms)
    }

    pub fn auth_settle(&self) -> Duration {
        Duration::from_millis(self.auth_settle_ms)
    }

    pub fn settings_debounce(&self) -> Duration {
        Duration::from_millis(self.settings_debounce_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct QueueSettings {
    pub max_retries: u32,
    pub suppress_threshold: u32,
    pub persist_debounce_ms: u64,
    pub failure_window_ms: u64,
    pub failure_history_max: usize,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            max_retries: MAX_RETRIES,
            suppress_threshold: QUEUE_SUPPRESS_THRESHOLD,
            persist_debounce_ms: QUEUE_PERSIST_DEBOUNCE_MS,
            failure_window_ms: QUEUE_FAILURE_WINDOW_MS,
            failure_history_max: QUEUE_FAILURE_HISTORY_MAX,
        }
    }
}

impl QueueSettings {
    pub fn persist_debounce(&self) -> Duration {
        Duration::from_millis(self.persist_debounce_ms)
    }

    pub fn failure_window(&self) -> Duration {
        Duration::from_millis(self.failure_window_ms)
    }
}

/// Per-resource cache TTLs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct TtlSettings {
    pub profile_ms: u64,
    pub payment_methods_ms: u64,
    pub subscription_ms: u64,
    pub stripe_customer_ms: u64,
    pub token_balance_ms: u64,
    pub purchases_ms: u64,
    pub packages_ms: u64,
}

impl Default for TtlSettings {
    fn default() -> Self {
        Self {
            profile_ms: PROFILE_TTL_MS,
            payment_methods_ms: PAYMENT_METHODS_TTL_MS,
            subscription_ms: SUBSCRIPTION_TTL_MS,
            stripe_customer_ms: STRIPE_CUSTOMER_TTL_MS,
            token_balance_ms: TOKEN_BALANCE_TTL_MS,
            purchases_ms: PURCHASES_TTL_MS,
            packages_ms: PACKAGES_TTL_MS,
        }
    }
}

impl TtlSettings {
    pub fn profile(&self) -> Duration {
        Duration::from_millis(self.profile_ms)
    }

    pub fn payment_methods(&self) -> Duration {
        Duration::from_millis(self.payment_methods_ms)
    }

    pub fn subscription(&self) -> Duration {
        Duration::from_millis(self.subscription_ms)
    }

    pub fn stripe_customer(&self) -> Duration {
        Duration::from_millis(self.stripe_customer_ms)
    }

    pub fn token_balance(&self) -> Duration {
        Duration::from_millis(self.token_balance_ms)
    }

    pub fn purchases(&self) -> Duration {
        Duration::from_millis(self.purchases_ms)
    }

    pub fn packages(&self) -> Duration {
        Duration::from_millis(self.packages_ms)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageBackend {
    Memory,
    #[default]
    File,
    Lmdb,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct StorageSettings {
    pub backend: StorageBackend,
    pub data_dir: PathBuf,
    pub lmdb_map_size_mb: usize,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            backend: StorageBackend::File,
            data_dir: PathBuf::from("aura-data"),
            lmdb_map_size_mb: 64,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct LoggingConfig {
    /// `tracing-subscriber` env-filter directive, e.g. `info,aura_sync=debug`.
    pub filter: String,
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: "info".to_string(),
            json: false,
        }
    }
}

impl AuraConfig {
    /// Load from a TOML file, apply environment overrides and validate.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let mut config = Self::from_path(path)?;
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    pub fn from_path(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        Self::from_toml(&contents)
    }

    pub fn from_toml(contents: &str) -> Result<Self, ConfigError> {
        toml::from_str(contents).map_err(|e| ConfigError::Parse {
            reason: e.to_string(),
        })
    }

    /// Defaults with environment overrides applied.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env();
        config
    }

    /// Override single values from the environment.
    ///
    /// # Environment Variables
    /// - `AURA_CACHE_MAX_SIZE`
    /// - `AURA_CACHE_DEFAULT_TTL_MS`
    /// - `AURA_CACHE_CLEANUP_INTERVAL_MS`
    /// - `AURA_CACHE_PERSIST_INTERVAL_MS`
    /// - `AURA_SMART_REFRESH_INTERVAL_MS`
    /// - `AURA_OFFLINE_SYNC_INTERVAL_MS`
    /// - `AURA_QUEUE_MAX_RETRIES`
    /// - `AURA_DATA_DIR`
    /// - `AURA_LOG` (env-filter directive)
    /// - `AURA_LOG_JSON` (`true`/`false`)
    pub fn apply_env(&mut self) {
        self.apply_overrides(|name| std::env::var(name).ok());
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let parsed = |name: &str| lookup(name).and_then(|s| s.parse::<u64>().ok());

        if let Some(v) = lookup("AURA_CACHE_MAX_SIZE").and_then(|s| s.parse().ok()) {
            self.cache.max_size = v;
        }
        if let Some(v) = parsed("AURA_CACHE_DEFAULT_TTL_MS") {
            self.cache.default_ttl_ms = v;
        }
        if let Some(v) = parsed("AURA_CACHE_CLEANUP_INTERVAL_MS") {
            self.cache.cleanup_interval_ms = v;
        }
        if let Some(v) = parsed("AURA_CACHE_PERSIST_INTERVAL_MS") {
            self.cache.persist_interval_ms = v;
        }
        if let Some(v) = parsed("AURA_SMART_REFRESH_INTERVAL_MS") {
            self.sync.smart_refresh_interval_ms = v;
        }
        if let Some(v) = parsed("AURA_OFFLINE_SYNC_INTERVAL_MS") {
            self.sync.offline_sync_interval_ms = v;
        }
        if let Some(v) = lookup("AURA_QUEUE_MAX_RETRIES").and_then(|s| s.parse().ok()) {
            self.queue.max_retries = v;
        }
        if let Some(v) = lookup("AURA_DATA_DIR") {
            self.storage.data_dir = PathBuf::from(v);
        }
        if let Some(v) = lookup("AURA_LOG") {
            self.logging.filter = v;
        }
        if let Some(v) = lookup("AURA_LOG_JSON") {
            self.logging.json = v.to_lowercase() == "true";
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.cache.max_size == 0 {
            return Err(ConfigError::InvalidValue {
                field: "cache.max_size",
                reason: "must be > 0".to_string(),
            });
        }
        if self.cache.default_ttl_ms == 0 {
            return Err(ConfigError::InvalidValue {
                field: "cache.default_ttl_ms",
                reason: "must be > 0".to_string(),
            });
        }
        if self.cache.cleanup_interval_ms == 0 {
            return Err(ConfigError::InvalidValue {
                field: "cache.cleanup_interval_ms",
                reason: "must be > 0".to_string(),
            });
        }
        if self.cache.persist_interval_ms == 0 {
            return Err(ConfigError::InvalidValue {
                field: "cache.persist_interval_ms",
                reason: "must be > 0".to_string(),
            });
        }
        if self.sync.smart_refresh_interval_ms == 0 {
            return Err(ConfigError::InvalidValue {
                field: "sync.smart_refresh_interval_ms",
                reason: "must be > 0".to_string(),
            });
        }
        if self.sync.offline_sync_interval_ms == 0 {
            return Err(ConfigError::InvalidValue {
                field: "sync.offline_sync_interval_ms",
                reason: "must be > 0".to_string(),
            });
        }
        if !(0.0..=1.0).contains(&self.sync.background_refresh_threshold) {
            return Err(ConfigError::InvalidValue {
                field: "sync.background_refresh_threshold",
                reason: "must be within 0.0..=1.0".to_string(),
            });
        }
        if self.queue.max_retries == 0 {
            return Err(ConfigError::InvalidValue {
                field: "queue.max_retries",
                reason: "must be > 0".to_string(),
            });
        }
        if self.queue.suppress_threshold < self.queue.max_retries {
            return Err(ConfigError::InvalidValue {
                field: "queue.suppress_threshold",
                reason: "must be >= queue.max_retries".to_string(),
            });
        }
        let ttls = [
            ("ttl.profile_ms", self.ttl.profile_ms),
            ("ttl.payment_methods_ms", self.ttl.payment_methods_ms),
            ("ttl.subscription_ms", self.ttl.subscription_ms),
            ("ttl.stripe_customer_ms", self.ttl.stripe_customer_ms),
            ("ttl.token_balance_ms", self.ttl.token_balance_ms),
            ("ttl.purchases_ms", self.ttl.purchases_ms),
            ("ttl.packages_ms", self.ttl.packages_ms),
        ];
        for (field, value) in ttls {
            if value == 0 {
                return Err(ConfigError::InvalidValue {
                    field,
                    reason: "must be > 0".to_string(),
                });
            }
        }
        if self.storage.backend != StorageBackend::Memory
            && self.storage.data_dir.as_os_str().is_empty()
        {
            return Err(ConfigError::InvalidValue {
                field: "storage.data_dir",
                reason: "must not be empty".to_string(),
            });
        }
        if self.storage.backend == StorageBackend::Lmdb && self.storage.lmdb_map_size_mb == 0 {
            return Err(ConfigError::InvalidValue {
                field: "storage.lmdb_map_size_mb",
                reason: "must be > 0".to_string(),
            });
        }
        if self.logging.filter.trim().is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "logging.filter",
                reason: "must not be empty".to_string(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    #[test]
    fn test_defaults_are_valid() {
        let config = AuraConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.queue.max_retries, 5);
        assert_eq!(config.ttl.stripe_customer(), Duration::from_secs(3600));
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = AuraConfig::from_toml(
            r#"
            [cache]
            max_size = 50

            [storage]
            backend = "lmdb"
            data_dir = "/tmp/aura"
            "#,
        )
        .unwrap();
        assert_eq!(config.cache.max_size, 50);
        assert_eq!(config.cache.cleanup_interval_ms, DEFAULT_CACHE_CLEANUP_INTERVAL_MS);
        assert_eq!(config.storage.backend, StorageBackend::Lmdb);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_unknown_fields_rejected() {
        let err = AuraConfig::from_toml("[cache]\nmax_sise = 5\n").unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }

    #[test]
    fn test_validate_rejects_threshold_below_retries() {
        let mut config = AuraConfig::default();
        config.queue.suppress_threshold = 3;
        let err = config.validate().unwrap_err();
        assert!(matches!(
            err,
            ConfigError::InvalidValue {
                field: "queue.suppress_threshold",
                ..
            }
        ));
    }

    #[test]
    fn test_validate_rejects_zero_ttl() {
        let mut config = AuraConfig::default();
        config.ttl.token_balance_ms = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_overrides() {
        let vars: HashMap<&str, &str> = [
            ("AURA_CACHE_MAX_SIZE", "12"),
            ("AURA_QUEUE_MAX_RETRIES", "3"),
            ("AURA_LOG", "debug"),
            ("AURA_LOG_JSON", "TRUE"),
            ("AURA_CACHE_CLEANUP_INTERVAL_MS", "not-a-number"),
        ]
        .into_iter()
        .collect();

        let mut config = AuraConfig::default();
        config.apply_overrides(|name| vars.get(name).map(|v| v.to_string()));

        assert_eq!(config.cache.max_size, 12);
        assert_eq!(config.queue.max_retries, 3);
        assert_eq!(config.logging.filter, "debug");
        assert!(config.logging.json);
        assert_eq!(config.cache.cleanup_interval_ms, DEFAULT_CACHE_CLEANUP_INTERVAL_MS);
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[sync]\nauth_settle_ms = 10").unwrap();
        let config = AuraConfig::from_path(file.path()).unwrap();
        assert_eq!(config.sync.auth_settle(), Duration::from_millis(10));
    }

    #[test]
    fn test_missing_file_is_io_error() {
        let err = AuraConfig::from_path(Path::new("/definitely/not/here.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }
}
