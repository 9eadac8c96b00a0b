//! TTL cache shared by the domain stores.
//!
//! Entries live in one process-wide [`CacheManager`] keyed by
//! [`aura_core::CacheKey`] strings (`<domain>:<user_id>`). Each entry carries
//! its own TTL; reads of an expired entry behave as a miss and drop it.
//!
//! # Example
//!
//! ```ignore
//! let cache = CacheManager::new(&config.cache, SystemClock::shared());
//! let key = CacheKey::profile(&user_id);
//!
//! cache.set(&key, &profile, Some(config.ttl.profile()))?;
//! let cached: Option<Profile> = cache.get(&key);
//!
//! // On logout
//! cache.invalidate_user(&user_id);
//! ```

pub mod entry;
pub mod manager;
pub mod pattern;
pub mod stats;

pub use entry::{CacheEntry, EntryInfo};
pub use manager::CacheManager;
pub use pattern::Pattern;
pub use stats::CacheStats;
