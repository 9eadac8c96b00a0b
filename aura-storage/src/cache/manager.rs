//! The TTL cache shared by every domain store.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use aura_core::constants::{CACHE_ENTRY_VERSION, STORE_API_CACHE};
use aura_core::{CacheError, CacheSettings, SharedClock, UserId};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

use super::entry::{CacheEntry, EntryInfo};
use super::pattern::Pattern;
use super::stats::{CacheCounters, CacheStats};
use crate::persistence::{KeyValuePersistence, SharedPersistence};

type FlightGate = Arc<tokio::sync::Mutex<()>>;

/// Releases a key's flight gate even when the waiting future is dropped.
struct FlightGuard<'a> {
    cache: &'a CacheManager,
    key: &'a str,
    gate: FlightGate,
}

impl Drop for FlightGuard<'_> {
    fn drop(&mut self) {
        let gate = std::mem::take(&mut self.gate);
        self.cache.release_flight_gate(self.key, gate);
    }
}

/// Key/value cache with per-entry TTL and a global size bound.
///
/// Values are stored as JSON and decoded on read, so one manager holds every
/// domain's entries and can be written to persistence as a single document.
///
/// # Invariants
///
/// - `len() <= max_size` after every operation.
/// - An entry is returned only while `now - timestamp < ttl`.
/// - Inserting a new key at capacity evicts exactly one entry: the one with
///   the smallest timestamp (ties broken by key).
#[derive(Debug)]
pub struct CacheManager {
    entries: RwLock<HashMap<String, CacheEntry>>,
    counters: CacheCounters,
    max_size: usize,
    default_ttl: Duration,
    clock: SharedClock,
    revision: watch::Sender<u64>,
    in_flight: Mutex<HashMap<String, FlightGate>>,
}

impl CacheManager {
    pub fn new(settings: &CacheSettings, clock: SharedClock) -> Self {
        Self::with_capacity(settings.max_size, settings.default_ttl(), clock)
    }

    /// A `max_size` of zero is treated as one.
    pub fn with_capacity(max_size: usize, default_ttl: Duration, clock: SharedClock) -> Self {
        let (revision, _) = watch::channel(0);
        Self {
            entries: RwLock::new(HashMap::new()),
            counters: CacheCounters::default(),
            max_size: max_size.max(1),
            default_ttl,
            clock,
            revision,
            in_flight: Mutex::new(HashMap::new()),
        }
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    pub fn default_ttl(&self) -> Duration {
        self.default_ttl
    }

    fn bump_revision(&self) {
        self.revision.send_modify(|rev| *rev = rev.wrapping_add(1));
    }

    /// Read a value. Expired entries are removed and count as misses.
    pub fn get<T: DeserializeOwned>(&self, key: impl AsRef<str>) -> Option<T> {
        let key = key.as_ref();
        let now = self.clock.now_millis();

        let (data, expired) = {
            let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
            match entries.get(key) {
                Some(entry) if entry.is_valid(now) => (Some(entry.data.clone()), false),
                Some(_) => {
                    entries.remove(key);
                    (None, true)
                }
                None => (None, false),
            }
        };

        if expired {
            self.counters.expired(1);
            self.bump_revision();
        }
        let Some(data) = data else {
            self.counters.miss();
            return None;
        };

        match serde_json::from_value(data) {
            Ok(value) => {
                self.counters.hit();
                Some(value)
            }
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "Cached value has unexpected shape");
                self.counters.miss();
                None
            }
        }
    }

    /// Read without touching statistics or removing expired entries.
    fn peek<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let now = self.clock.now_millis();
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        entries
            .get(key)
            .filter(|e| e.is_valid(now))
            .and_then(|e| serde_json::from_value(e.data.clone()).ok())
    }

    /// Insert or replace a value. `ttl` defaults to the manager's default.
    pub fn set<T: Serialize + ?Sized>(
        &self,
        key: impl AsRef<str>,
        value: &T,
        ttl: Option<Duration>,
    ) -> Result<(), CacheError> {
        let key = key.as_ref();
        let data = serde_json::to_value(value).map_err(|e| CacheError::Serialization {
            key: key.to_string(),
            reason: e.to_string(),
        })?;
        let ttl = ttl.unwrap_or(self.default_ttl);
        let entry = CacheEntry {
            data,
            timestamp: self.clock.now_millis(),
            ttl: u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX),
            key: key.to_string(),
            version: CACHE_ENTRY_VERSION,
        };

        {
            let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
            if !entries.contains_key(key) && entries.len() >= self.max_size {
                if let Some(oldest) = oldest_key(&entries) {
                    entries.remove(&oldest);
                    self.counters.evicted();
                    tracing::debug!(evicted = %oldest, "Cache at capacity, evicted oldest entry");
                }
            }
            entries.insert(key.to_string(), entry);
        }
        self.counters.set();
        self.bump_revision();
        Ok(())
    }

    /// Whether the key is present and unexpired. Does not count as an access.
    pub fn has(&self, key: impl AsRef<str>) -> bool {
        let now = self.clock.now_millis();
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        entries
            .get(key.as_ref())
            .is_some_and(|e| e.is_valid(now))
    }

    pub fn delete(&self, key: impl AsRef<str>) -> bool {
        let removed = self
            .entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key.as_ref())
            .is_some();
        if removed {
            self.bump_revision();
        }
        removed
    }

    pub fn clear(&self) {
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        self.bump_revision();
    }

    /// Remove every key matching `pattern`. Returns how many were removed.
    pub fn invalidate_pattern(&self, pattern: &Pattern) -> usize {
        let removed = {
            let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
            let before = entries.len();
            entries.retain(|key, _| !pattern.matches(key));
            before - entries.len()
        };
        if removed > 0 {
            tracing::debug!(removed, pattern = ?pattern, "Invalidated cache entries");
            self.bump_revision();
        }
        removed
    }

    /// Remove every entry belonging to `user_id`.
    pub fn invalidate_user(&self, user_id: &UserId) -> usize {
        self.invalidate_pattern(&Pattern::user_scope(user_id))
    }

    /// Cache-aside read.
    ///
    /// On a miss the loader runs and its value is stored. Concurrent callers
    /// for the same key wait for the first loader instead of starting their
    /// own. Loader errors propagate and nothing is cached.
    pub async fn get_or_set<T, F, Fut, E>(
        &self,
        key: impl AsRef<str>,
        loader: F,
        ttl: Option<Duration>,
    ) -> Result<T, E>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<CacheError>,
    {
        let key = key.as_ref();
        if let Some(value) = self.get::<T>(key) {
            return Ok(value);
        }

        let flight = FlightGuard {
            cache: self,
            key,
            gate: self.flight_gate(key),
        };
        let _held = flight.gate.lock().await;
        if let Some(value) = self.peek::<T>(key) {
            return Ok(value);
        }
        match loader().await {
            Ok(value) => self.set(key, &value, ttl).map(|()| value).map_err(E::from),
            Err(e) => Err(e),
        }
    }

    fn flight_gate(&self, key: &str) -> FlightGate {
        let mut in_flight = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
        in_flight.entry(key.to_string()).or_default().clone()
    }

    fn release_flight_gate(&self, key: &str, gate: FlightGate) {
        let mut in_flight = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
        drop(gate);
        // Only the map still holds the gate: nobody else is waiting.
        if in_flight.get(key).is_some_and(|g| Arc::strong_count(g) == 1) {
            in_flight.remove(key);
        }
    }

    /// Entry metadata, including for entries that already expired.
    pub fn entry_info(&self, key: impl AsRef<str>) -> Option<EntryInfo> {
        let now = self.clock.now_millis();
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        entries.get(key.as_ref()).map(|e| e.info(now))
    }

    /// Unexpired keys, sorted.
    pub fn keys(&self) -> Vec<String> {
        let now = self.clock.now_millis();
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        let mut keys: Vec<String> = entries
            .values()
            .filter(|e| e.is_valid(now))
            .map(|e| e.key.clone())
            .collect();
        keys.sort();
        keys
    }

    /// Number of stored entries, expired ones not yet swept included.
    pub fn len(&self) -> usize {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStats {
        self.counters.snapshot(self.len(), self.max_size)
    }

    pub fn reset_stats(&self) {
        self.counters.reset();
    }

    /// Drop every expired entry. Returns how many were removed.
    pub fn cleanup_expired(&self) -> usize {
        let now = self.clock.now_millis();
        let removed = {
            let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
            let before = entries.len();
            entries.retain(|_, e| e.is_valid(now));
            before - entries.len()
        };
        if removed > 0 {
            self.counters.expired(removed as u64);
            self.bump_revision();
            tracing::debug!(removed, "Swept expired cache entries");
        }
        removed
    }

    /// Serialize the unexpired entries as a JSON object keyed by cache key.
    pub fn snapshot(&self) -> Value {
        let now = self.clock.now_millis();
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        let map: serde_json::Map<String, Value> = entries
            .iter()
            .filter(|(_, e)| e.is_valid(now))
            .filter_map(|(k, e)| serde_json::to_value(e).ok().map(|v| (k.clone(), v)))
            .collect();
        Value::Object(map)
    }

    /// Replace the contents with a snapshot. Expired entries are skipped and
    /// the newest entries are kept when the snapshot exceeds capacity.
    pub fn restore(&self, snapshot: Value) -> Result<usize, CacheError> {
        let restored: HashMap<String, CacheEntry> =
            serde_json::from_value(snapshot).map_err(|e| CacheError::Deserialization {
                key: STORE_API_CACHE.to_string(),
                reason: e.to_string(),
            })?;

        let now = self.clock.now_millis();
        let mut live: Vec<(String, CacheEntry)> = restored
            .into_iter()
            .filter(|(_, e)| e.is_valid(now))
            .collect();
        live.sort_by(|(ka, a), (kb, b)| b.timestamp.cmp(&a.timestamp).then_with(|| ka.cmp(kb)));
        live.truncate(self.max_size);

        let count = live.len();
        {
            let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
            entries.clear();
            entries.extend(live);
        }
        self.bump_revision();
        Ok(count)
    }

    /// Load the persisted cache. Failures are logged and leave the cache empty.
    pub async fn load_from(&self, persistence: &dyn KeyValuePersistence) -> usize {
        match persistence.get(STORE_API_CACHE).await {
            Ok(Some(snapshot)) => match self.restore(snapshot) {
                Ok(count) => {
                    tracing::info!(entries = count, "Loaded persisted cache");
                    count
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Persisted cache is unreadable, starting empty");
                    self.clear();
                    0
                }
            },
            Ok(None) => 0,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to load persisted cache");
                0
            }
        }
    }

    /// Persist the unexpired entries. Failures are logged and swallowed.
    pub async fn save_to(&self, persistence: &dyn KeyValuePersistence) -> bool {
        match persistence.set(STORE_API_CACHE, self.snapshot()).await {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to persist cache");
                false
            }
        }
    }

    /// Revision counter bumped on every mutation.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.revision.subscribe()
    }

    pub fn revision(&self) -> u64 {
        *self.revision.borrow()
    }

    /// Run periodic cleanup and persistence until `shutdown` flips to true.
    ///
    /// A final save is attempted on shutdown when persistence is configured.
    pub fn spawn_maintenance(
        self: &Arc<Self>,
        persistence: Option<SharedPersistence>,
        cleanup_every: Duration,
        persist_every: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let cache = Arc::clone(self);
        tokio::spawn(async move {
            let mut cleanup_interval = interval_at(Instant::now() + cleanup_every, cleanup_every);
            cleanup_interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            let mut persist_interval = interval_at(Instant::now() + persist_every, persist_every);
            persist_interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

            tracing::info!(
                cleanup_interval_ms = cleanup_every.as_millis() as u64,
                persist_interval_ms = persist_every.as_millis() as u64,
                persistent = persistence.is_some(),
                "Cache maintenance started"
            );

            loop {
                tokio::select! {
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                    _ = cleanup_interval.tick() => {
                        cache.cleanup_expired();
                    }
                    _ = persist_interval.tick() => {
                        if let Some(store) = persistence.as_deref() {
                            cache.save_to(store).await;
                        }
                    }
                }
            }

            if let Some(store) = persistence.as_deref() {
                cache.save_to(store).await;
            }
            tracing::info!("Cache maintenance stopped");
        })
    }
}

/// Oldest entry by timestamp, ties broken by key order.
fn oldest_key(entries: &HashMap<String, CacheEntry>) -> Option<String> {
    entries
        .iter()
        .min_by(|(ka, a), (kb, b)| a.timestamp.cmp(&b.timestamp).then_with(|| ka.cmp(kb)))
        .map(|(k, _)| k.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::MemoryKvStore;
    use aura_core::{CacheKey, ManualClock, PersistenceError, Profile};
    use proptest::prelude::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn manager(max_size: usize) -> (CacheManager, Arc<ManualClock>) {
        let clock = ManualClock::new(1_000_000);
        let cache = CacheManager::with_capacity(max_size, Duration::from_secs(300), clock.clone());
        (cache, clock)
    }

    #[test]
    fn test_ttl_expiry() {
        let (cache, clock) = manager(10);
        cache
            .set("profile:u1", &json!({"id": "u1"}), Some(Duration::from_millis(100)))
            .unwrap();

        clock.advance(Duration::from_millis(50));
        assert_eq!(cache.get::<Value>("profile:u1"), Some(json!({"id": "u1"})));

        clock.advance(Duration::from_millis(100));
        assert_eq!(cache.get::<Value>("profile:u1"), None);
        assert_eq!(cache.len(), 0);

        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.expirations, 1);
    }

    #[test]
    fn test_has_does_not_count_stats() {
        let (cache, clock) = manager(10);
        cache.set("k", &1, None).unwrap();
        assert!(cache.has("k"));
        assert!(!cache.has("missing"));
        clock.advance(Duration::from_secs(301));
        assert!(!cache.has("k"));
        assert_eq!(cache.stats().hits + cache.stats().misses, 0);
    }

    #[test]
    fn test_eviction_removes_oldest() {
        let (cache, clock) = manager(3);
        for key in ["a", "b", "c"] {
            cache.set(key, &key, None).unwrap();
            clock.advance(Duration::from_millis(10));
        }
        cache.set("d", &"d", None).unwrap();

        assert_eq!(cache.len(), 3);
        assert!(!cache.has("a"));
        assert!(cache.has("b") && cache.has("c") && cache.has("d"));
        assert_eq!(cache.stats().evictions, 1);
    }

    #[test]
    fn test_replacing_key_at_capacity_does_not_evict() {
        let (cache, clock) = manager(2);
        cache.set("a", &1, None).unwrap();
        clock.advance(Duration::from_millis(1));
        cache.set("b", &2, None).unwrap();
        cache.set("a", &3, None).unwrap();
        assert_eq!(cache.get::<i32>("a"), Some(3));
        assert_eq!(cache.get::<i32>("b"), Some(2));
        assert_eq!(cache.stats().evictions, 0);
    }

    #[test]
    fn test_eviction_tie_broken_by_key() {
        let (cache, _clock) = manager(2);
        cache.set("b", &1, None).unwrap();
        cache.set("a", &1, None).unwrap();
        cache.set("c", &1, None).unwrap();
        assert!(!cache.has("a"));
        assert!(cache.has("b"));
    }

    #[test]
    fn test_invalidate_pattern_idempotent() {
        let (cache, _clock) = manager(10);
        let u1 = UserId::new("u1");
        let u10 = UserId::new("u10");
        cache.set(CacheKey::profile(&u1), &1, None).unwrap();
        cache.set(CacheKey::token_balance(&u1), &1, None).unwrap();
        cache.set(CacheKey::profile(&u10), &1, None).unwrap();
        cache.set(CacheKey::packages_with_prices(), &1, None).unwrap();

        assert_eq!(cache.invalidate_user(&u1), 2);
        let after_first = cache.keys();
        assert_eq!(cache.invalidate_user(&u1), 0);
        assert_eq!(cache.keys(), after_first);
        assert_eq!(after_first, vec!["packages_with_prices", "profile:u10"]);
    }

    #[test]
    fn test_invalidate_regex() {
        let (cache, _clock) = manager(10);
        cache.set("payment_methods:u1", &1, None).unwrap();
        cache.set("subscription:u1", &1, None).unwrap();
        cache.set("profile:u1", &1, None).unwrap();
        let pattern = Pattern::regex("^(payment_methods|subscription):").unwrap();
        assert_eq!(cache.invalidate_pattern(&pattern), 2);
        assert_eq!(cache.keys(), vec!["profile:u1"]);
    }

    #[test]
    fn test_profile_ttl_scenario() {
        let (cache, clock) = manager(10);
        let key = CacheKey::profile(&UserId::new("u1"));
        let profile = Profile::new("u1");
        cache.set(&key, &profile, Some(Duration::from_millis(5_000))).unwrap();

        clock.advance(Duration::from_millis(4_999));
        assert_eq!(cache.get::<Profile>(&key), Some(profile));
        clock.advance(Duration::from_millis(1_001));
        assert_eq!(cache.get::<Profile>(&key), None);
    }

    #[test]
    fn test_shape_mismatch_reads_as_miss() {
        let (cache, _clock) = manager(10);
        cache.set("k", &"text", None).unwrap();
        assert_eq!(cache.get::<Profile>("k"), None);
        assert_eq!(cache.stats().misses, 1);
    }

    #[test]
    fn test_cleanup_expired() {
        let (cache, clock) = manager(10);
        cache.set("short", &1, Some(Duration::from_millis(10))).unwrap();
        cache.set("long", &1, Some(Duration::from_secs(10))).unwrap();
        clock.advance(Duration::from_millis(20));
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.cleanup_expired(), 1);
        assert_eq!(cache.keys(), vec!["long"]);
    }

    #[test]
    fn test_entry_info() {
        let (cache, clock) = manager(10);
        cache.set("k", &1, Some(Duration::from_millis(1_000))).unwrap();
        clock.advance(Duration::from_millis(850));
        let info = cache.entry_info("k").unwrap();
        assert_eq!(info.age, 850);
        assert_eq!(info.version, CACHE_ENTRY_VERSION);
        assert!(!info.is_fresh_within(0.8));
        assert!(cache.entry_info("missing").is_none());
    }

    #[test]
    fn test_revision_bumps_on_mutation() {
        let (cache, _clock) = manager(10);
        let rx = cache.subscribe();
        let start = *rx.borrow();
        cache.set("k", &1, None).unwrap();
        cache.delete("k");
        assert!(!cache.delete("k"));
        assert_eq!(*rx.borrow(), start + 2);
    }

    #[test]
    fn test_snapshot_restore_skips_expired() {
        let (cache, clock) = manager(10);
        cache.set("a", &1, Some(Duration::from_millis(100))).unwrap();
        cache.set("b", &2, Some(Duration::from_secs(60))).unwrap();
        let snapshot = cache.snapshot();

        let restored = CacheManager::with_capacity(10, Duration::from_secs(300), clock.clone());
        clock.advance(Duration::from_millis(200));
        assert_eq!(restored.restore(snapshot).unwrap(), 1);
        assert_eq!(restored.get::<i32>("b"), Some(2));
        assert!(!restored.has("a"));
    }

    #[test]
    fn test_restore_keeps_newest_within_capacity() {
        let (cache, clock) = manager(10);
        for key in ["a", "b", "c"] {
            cache.set(key, &1, None).unwrap();
            clock.advance(Duration::from_millis(5));
        }
        let small = CacheManager::with_capacity(2, Duration::from_secs(300), clock.clone());
        assert_eq!(small.restore(cache.snapshot()).unwrap(), 2);
        assert_eq!(small.keys(), vec!["b", "c"]);
    }

    #[tokio::test]
    async fn test_persistence_roundtrip() {
        let (cache, clock) = manager(10);
        let store = MemoryKvStore::new();
        cache.set("profile:u1", &json!({"id": "u1"}), None).unwrap();
        assert!(cache.save_to(&store).await);

        let fresh = CacheManager::with_capacity(10, Duration::from_secs(300), clock);
        assert_eq!(fresh.load_from(&store).await, 1);
        assert!(fresh.has("profile:u1"));
    }

    #[tokio::test]
    async fn test_unreadable_persisted_cache_starts_empty() {
        let (cache, _clock) = manager(10);
        let store = MemoryKvStore::new();
        store.set(STORE_API_CACHE, json!("garbage")).await.unwrap();
        cache.set("k", &1, None).unwrap();
        assert_eq!(cache.load_from(&store).await, 0);
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn test_get_or_set_caches_loader_result() {
        let (cache, _clock) = manager(10);
        let calls = AtomicUsize::new(0);
        for _ in 0..3 {
            let value: i32 = cache
                .get_or_set(
                    "k",
                    || async {
                        calls.fetch_add(1, Ordering::SeqCst);
                        Ok::<_, CacheError>(42)
                    },
                    None,
                )
                .await
                .unwrap();
            assert_eq!(value, 42);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_get_or_set_error_caches_nothing() {
        let (cache, _clock) = manager(10);
        let result: Result<i32, aura_core::AuraError> = cache
            .get_or_set(
                "k",
                || async {
                    Err(PersistenceError::Backend {
                        reason: "down".into(),
                    }
                    .into())
                },
                None,
            )
            .await;
        assert!(result.is_err());
        assert!(!cache.has("k"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_get_or_set_single_flight() {
        let clock = ManualClock::new(0);
        let cache = Arc::new(CacheManager::with_capacity(10, Duration::from_secs(60), clock));
        let calls = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let cache = cache.clone();
            let calls = calls.clone();
            handles.push(tokio::spawn(async move {
                cache
                    .get_or_set(
                        "shared",
                        || async move {
                            calls.fetch_add(1, Ordering::SeqCst);
                            tokio::time::sleep(Duration::from_millis(50)).await;
                            Ok::<_, CacheError>(7u32)
                        },
                        None,
                    )
                    .await
            }));
        }
        for handle in handles {
            assert_eq!(handle.await.unwrap().unwrap(), 7);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(cache.in_flight.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_abandoned_get_or_set_releases_gate() {
        let clock = ManualClock::new(0);
        let cache = CacheManager::with_capacity(10, Duration::from_secs(60), clock);

        let abandoned = tokio::time::timeout(
            Duration::from_millis(20),
            cache.get_or_set(
                "slow",
                || std::future::pending::<Result<u32, CacheError>>(),
                None,
            ),
        )
        .await;
        assert!(abandoned.is_err());
        assert!(cache.in_flight.lock().unwrap().is_empty());

        let value = cache
            .get_or_set("slow", || async { Ok::<_, CacheError>(3u32) }, None)
            .await
            .unwrap();
        assert_eq!(value, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_maintenance_sweeps_and_saves_on_shutdown() {
        let clock = ManualClock::new(0);
        let cache = Arc::new(CacheManager::with_capacity(10, Duration::from_secs(60), clock.clone()));
        let store = Arc::new(MemoryKvStore::new());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        cache.set("short", &1, Some(Duration::from_millis(500))).unwrap();
        cache.set("long", &2, None).unwrap();
        let handle = cache.spawn_maintenance(
            Some(store.clone() as SharedPersistence),
            Duration::from_secs(1),
            Duration::from_secs(30),
            shutdown_rx,
        );

        clock.advance(Duration::from_secs(1));
        tokio::time::sleep(Duration::from_millis(1_100)).await;
        assert_eq!(cache.keys(), vec!["long"]);
        assert_eq!(cache.len(), 1);

        shutdown_tx.send(true).unwrap();
        handle.await.unwrap();
        let saved = store.get(STORE_API_CACHE).await.unwrap().unwrap();
        assert!(saved.get("long").is_some());
    }

    proptest! {
        #[test]
        fn prop_size_never_exceeds_capacity(
            max_size in 1usize..8,
            ops in prop::collection::vec((0u8..20, 0u64..50), 0..80),
        ) {
            let clock = ManualClock::new(0);
            let cache = CacheManager::with_capacity(max_size, Duration::from_secs(60), clock.clone());
            for (key, step) in ops {
                clock.advance(Duration::from_millis(step));
                cache.set(format!("k{key}"), &key, None).unwrap();
                prop_assert!(cache.len() <= max_size);
            }
        }
    }
}
