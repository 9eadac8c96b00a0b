//! Cache entries and their validity rules.

use aura_core::EpochMillis;
use serde::{Deserialize, Serialize};

/// A single cached value.
///
/// The payload is kept as JSON so the cache can hold heterogeneous values and
/// be written to durable storage as-is. The serialized field names match
/// snapshots written by earlier clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub data: serde_json::Value,
    /// When the entry was written, epoch milliseconds.
    pub timestamp: EpochMillis,
    /// Lifetime in milliseconds.
    pub ttl: u64,
    pub key: String,
    /// Reserved. Stamped on write, never compared.
    pub version: u32,
}

impl CacheEntry {
    /// An entry is valid iff `now - timestamp < ttl`.
    pub fn is_valid(&self, now: EpochMillis) -> bool {
        self.age(now) < self.ttl
    }

    pub fn is_expired(&self, now: EpochMillis) -> bool {
        !self.is_valid(now)
    }

    /// Age in milliseconds; entries stamped in the future count as age 0.
    pub fn age(&self, now: EpochMillis) -> u64 {
        u64::try_from(now.saturating_sub(self.timestamp)).unwrap_or(0)
    }

    pub fn info(&self, now: EpochMillis) -> EntryInfo {
        EntryInfo {
            timestamp: self.timestamp,
            ttl: self.ttl,
            version: self.version,
            age: self.age(now),
            expired: self.is_expired(now),
        }
    }
}

/// Metadata about an entry, without its payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntryInfo {
    pub timestamp: EpochMillis,
    pub ttl: u64,
    pub version: u32,
    pub age: u64,
    pub expired: bool,
}

impl EntryInfo {
    /// Fraction of the TTL already elapsed (0.0 fresh, 1.0 expired).
    pub fn elapsed_fraction(&self) -> f64 {
        if self.ttl == 0 {
            return 1.0;
        }
        (self.age as f64 / self.ttl as f64).min(1.0)
    }

    /// Whether less than `threshold` of the TTL has elapsed.
    pub fn is_fresh_within(&self, threshold: f64) -> bool {
        !self.expired && self.elapsed_fraction() < threshold
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn entry(timestamp: EpochMillis, ttl: u64) -> CacheEntry {
        CacheEntry {
            data: json!({"id": "u1"}),
            timestamp,
            ttl,
            key: "profile:u1".to_string(),
            version: 1,
        }
    }

    #[test]
    fn test_validity_boundary() {
        let e = entry(1_000, 100);
        assert!(e.is_valid(1_000));
        assert!(e.is_valid(1_099));
        assert!(!e.is_valid(1_100));
        assert!(e.is_expired(1_150));
    }

    #[test]
    fn test_future_timestamp_has_zero_age() {
        let e = entry(2_000, 100);
        assert_eq!(e.age(1_000), 0);
        assert!(e.is_valid(1_000));
    }

    #[test]
    fn test_fresh_within_threshold() {
        let e = entry(0, 1_000);
        assert!(e.info(700).is_fresh_within(0.8));
        assert!(!e.info(800).is_fresh_within(0.8));
        assert!(!e.info(1_000).is_fresh_within(0.8));
    }

    #[test]
    fn test_snapshot_field_names() {
        let value = serde_json::to_value(entry(5, 10)).unwrap();
        assert_eq!(
            value,
            json!({
                "data": {"id": "u1"},
                "timestamp": 5,
                "ttl": 10,
                "key": "profile:u1",
                "version": 1
            })
        );
    }
}
