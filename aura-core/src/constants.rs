//! Default values shared across the workspace.

// ============================================================================
// CACHE
// ============================================================================

pub const DEFAULT_CACHE_MAX_SIZE: usize = 1000;
pub const DEFAULT_CACHE_TTL_MS: u64 = 5 * 60 * 1000;
pub const DEFAULT_CACHE_CLEANUP_INTERVAL_MS: u64 = 60 * 1000;
pub const DEFAULT_CACHE_PERSIST_INTERVAL_MS: u64 = 30 * 1000;

/// Version stamped on every cache entry. Reserved; never compared.
pub const CACHE_ENTRY_VERSION: u32 = 1;

// ============================================================================
// RESOURCE TTLS
// ============================================================================

pub const PROFILE_TTL_MS: u64 = 5 * 60 * 1000;
pub const PAYMENT_METHODS_TTL_MS: u64 = 5 * 60 * 1000;
pub const SUBSCRIPTION_TTL_MS: u64 = 5 * 60 * 1000;
pub const STRIPE_CUSTOMER_TTL_MS: u64 = 60 * 60 * 1000;
pub const TOKEN_BALANCE_TTL_MS: u64 = 2 * 60 * 1000;
pub const PURCHASES_TTL_MS: u64 = 5 * 60 * 1000;
pub const PACKAGES_TTL_MS: u64 = 30 * 60 * 1000;

/// Fraction of a TTL after which background refresh is allowed to run.
pub const BACKGROUND_REFRESH_THRESHOLD: f64 = 0.8;

// ============================================================================
// SESSION
// ============================================================================

/// Refresh tokens this long before they expire.
pub const TOKEN_REFRESH_MARGIN_MS: u64 = 5 * 60 * 1000;
pub const SESSION_PERSIST_DEBOUNCE_MS: u64 = 1000;

// ============================================================================
// SYNC
// ============================================================================

pub const SMART_REFRESH_INTERVAL_MS: u64 = 2 * 60 * 1000;
pub const OFFLINE_SYNC_INTERVAL_MS: u64 = 30 * 1000;
pub const AUTH_SETTLE_DELAY_MS: u64 = 250;
pub const SETTINGS_PERSIST_DEBOUNCE_MS: u64 = 5000;
pub const COORDINATOR_ERROR_LOG_SIZE: usize = 5;

// ============================================================================
// OFFLINE QUEUE
// ============================================================================

pub const MAX_RETRIES: u32 = 5;
/// Retry count at which an identical enqueue is suppressed.
pub const QUEUE_SUPPRESS_THRESHOLD: u32 = 7;
pub const QUEUE_PERSIST_DEBOUNCE_MS: u64 = 2000;
/// How long a request's failure tally counts toward suppression.
pub const QUEUE_FAILURE_WINDOW_MS: u64 = 60 * 60 * 1000;
/// Most distinct requests whose failures are remembered.
pub const QUEUE_FAILURE_HISTORY_MAX: usize = 100;

// ============================================================================
// PERSISTENCE STORE IDS
// ============================================================================

pub const STORE_SESSION: &str = "session";
pub const STORE_API_CACHE: &str = "api_cache";
pub const STORE_APP_CONFIG: &str = "app_config";
pub const STORE_OFFLINE_QUEUE: &str = "offline_queue";

/// Store ids checked by persistence health reports.
pub const KNOWN_STORES: [&str; 4] = [
    STORE_SESSION,
    STORE_API_CACHE,
    STORE_APP_CONFIG,
    STORE_OFFLINE_QUEUE,
];
