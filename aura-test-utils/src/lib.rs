//! Aura Test Utilities
//!
//! Shared test infrastructure for the Aura workspace:
//! - Scripted mocks for the host collaborators
//! - Proptest generators for entity types
//! - Fixtures for common scenarios
//! - Assertions for Aura-specific results

pub use aura_core::{
    AuraConfig, AuraError, AuthError, AuthTokens, AuthenticatedSession, CacheKey, Clock,
    ManualClock, Package, PackagePrice, PackageWithPrices, PaymentMethod, PersistenceError,
    Profile, ProfileUpdate, Purchase, RemoteCall, RemoteError, SecureTokenStore, Session,
    StorageBackend, SubscriptionInfo, TokenBalance, User, UserId,
};
pub use aura_storage::{CacheManager, KeyValuePersistence, MemoryKvStore};

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

// ============================================================================
// MOCK COLLABORATORS
// ============================================================================

type Handler = Arc<dyn Fn(&Value) -> Result<Value, RemoteError> + Send + Sync>;

#[derive(Default)]
struct MockRemoteInner {
    once: HashMap<String, VecDeque<Result<Value, RemoteError>>>,
    sticky: HashMap<String, Result<Value, RemoteError>>,
    handlers: HashMap<String, Handler>,
    delays: HashMap<String, Duration>,
    calls: Vec<(String, Value)>,
    offline: bool,
}

/// Scripted [`RemoteCall`].
///
/// Resolution order per call: offline switch, one-shot responses, handler,
/// sticky response. Unscripted operations fail with a remote error. Every
/// call is recorded, including failed ones.
#[derive(Default)]
pub struct MockRemote {
    inner: Mutex<MockRemoteInner>,
}

impl MockRemote {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MockRemoteInner> {
        self.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Answer every call to `name` with `value`.
    pub fn respond(&self, name: &str, value: Value) {
        self.lock().sticky.insert(name.to_string(), Ok(value));
    }

    /// Answer the next call to `name` with `value`.
    pub fn respond_once(&self, name: &str, value: Value) {
        self.lock()
            .once
            .entry(name.to_string())
            .or_default()
            .push_back(Ok(value));
    }

    /// Fail every call to `name`.
    pub fn fail(&self, name: &str, message: &str) {
        self.lock()
            .sticky
            .insert(name.to_string(), Err(RemoteError::remote(name, message)));
    }

    /// Fail the next call to `name`.
    pub fn fail_once(&self, name: &str, message: &str) {
        self.lock()
            .once
            .entry(name.to_string())
            .or_default()
            .push_back(Err(RemoteError::remote(name, message)));
    }

    /// Compute responses for `name` from the call parameters.
    pub fn respond_with<F>(&self, name: &str, handler: F)
    where
        F: Fn(&Value) -> Result<Value, RemoteError> + Send + Sync + 'static,
    {
        self.lock()
            .handlers
            .insert(name.to_string(), Arc::new(handler));
    }

    /// Delay responses to `name`.
    pub fn delay(&self, name: &str, by: Duration) {
        self.lock().delays.insert(name.to_string(), by);
    }

    /// While offline every call fails with a transport error.
    pub fn set_offline(&self, offline: bool) {
        self.lock().offline = offline;
    }

    pub fn call_count(&self, name: &str) -> usize {
        self.lock().calls.iter().filter(|(n, _)| n == name).count()
    }

    pub fn total_calls(&self) -> usize {
        self.lock().calls.len()
    }

    pub fn calls(&self) -> Vec<(String, Value)> {
        self.lock().calls.clone()
    }

    pub fn last_params(&self, name: &str) -> Option<Value> {
        self.lock()
            .calls
            .iter()
            .rev()
            .find(|(n, _)| n == name)
            .map(|(_, p)| p.clone())
    }

    pub fn reset_calls(&self) {
        self.lock().calls.clear();
    }
}

#[async_trait]
impl RemoteCall for MockRemote {
    async fn call(&self, name: &str, params: Value) -> Result<Value, RemoteError> {
        let delay = {
            let mut inner = self.lock();
            inner.calls.push((name.to_string(), params.clone()));
            inner.delays.get(name).copied()
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut inner = self.lock();
        if inner.offline {
            return Err(RemoteError::transport(name, "network unreachable"));
        }
        if let Some(result) = inner.once.get_mut(name).and_then(VecDeque::pop_front) {
            return result;
        }
        if let Some(handler) = inner.handlers.get(name).cloned() {
            drop(inner);
            return handler(&params);
        }
        inner
            .sticky
            .get(name)
            .cloned()
            .unwrap_or_else(|| Err(RemoteError::remote(name, "no scripted response")))
    }
}

/// In-memory [`SecureTokenStore`] with failure injection.
#[derive(Debug, Default)]
pub struct InMemoryTokenStore {
    tokens: Mutex<Option<AuthTokens>>,
    fail_store: AtomicBool,
    fail_get: AtomicBool,
    fail_clear: AtomicBool,
    clears: AtomicUsize,
}

impl InMemoryTokenStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_tokens(tokens: AuthTokens) -> Self {
        let store = Self::default();
        *store.tokens.lock().unwrap_or_else(std::sync::PoisonError::into_inner) = Some(tokens);
        store
    }

    pub fn current(&self) -> Option<AuthTokens> {
        self.tokens
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }

    pub fn fail_next_store(&self) {
        self.fail_store.store(true, Ordering::SeqCst);
    }

    pub fn fail_next_get(&self) {
        self.fail_get.store(true, Ordering::SeqCst);
    }

    pub fn fail_next_clear(&self) {
        self.fail_clear.store(true, Ordering::SeqCst);
    }

    /// Number of `clear` calls, failed ones included.
    pub fn clear_count(&self) -> usize {
        self.clears.load(Ordering::SeqCst)
    }

    fn injected(flag: &AtomicBool, op: &str) -> Result<(), AuthError> {
        if flag.swap(false, Ordering::SeqCst) {
            Err(AuthError::TokenStore {
                reason: format!("injected {op} failure"),
            })
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl SecureTokenStore for InMemoryTokenStore {
    async fn store(&self, tokens: &AuthTokens) -> Result<(), AuthError> {
        Self::injected(&self.fail_store, "store")?;
        *self.tokens.lock().unwrap_or_else(std::sync::PoisonError::into_inner) = Some(tokens.clone());
        Ok(())
    }

    async fn get(&self) -> Result<Option<AuthTokens>, AuthError> {
        Self::injected(&self.fail_get, "get")?;
        Ok(self.current())
    }

    async fn clear(&self) -> Result<(), AuthError> {
        self.clears.fetch_add(1, Ordering::SeqCst);
        Self::injected(&self.fail_clear, "clear")?;
        *self.tokens.lock().unwrap_or_else(std::sync::PoisonError::into_inner) = None;
        Ok(())
    }
}

/// Persistence that fails every operation.
#[derive(Debug, Default)]
pub struct FailingKvStore;

#[async_trait]
impl KeyValuePersistence for FailingKvStore {
    async fn get(&self, _store_id: &str) -> Result<Option<Value>, PersistenceError> {
        Err(PersistenceError::Backend {
            reason: "disk unavailable".to_string(),
        })
    }

    async fn set(&self, _store_id: &str, _value: Value) -> Result<(), PersistenceError> {
        Err(PersistenceError::Backend {
            reason: "disk unavailable".to_string(),
        })
    }

    async fn remove(&self, _store_id: &str) -> Result<(), PersistenceError> {
        Err(PersistenceError::Backend {
            reason: "disk unavailable".to_string(),
        })
    }
}

// ============================================================================
// PROPTEST GENERATORS
// ============================================================================

pub mod generators {
    //! Proptest strategies for Aura entity types.

    use super::*;
    use aura_core::CacheDomain;
    use proptest::prelude::*;

    pub fn arb_user_id() -> impl Strategy<Value = UserId> {
        "[a-z0-9]{1,12}".prop_map(UserId::new)
    }

    pub fn arb_cache_domain() -> impl Strategy<Value = CacheDomain> {
        prop::sample::select(CacheDomain::ALL.to_vec())
    }

    /// Keys from the real namespace, user-scoped or global.
    pub fn arb_cache_key() -> impl Strategy<Value = CacheKey> {
        (arb_cache_domain(), arb_user_id()).prop_map(|(domain, user_id)| {
            CacheKey::for_user(domain, &user_id).unwrap_or_else(CacheKey::packages_with_prices)
        })
    }

    pub fn arb_profile_update() -> impl Strategy<Value = ProfileUpdate> {
        (
            proptest::option::of("[a-z_]{3,15}"),
            proptest::option::of("[A-Z][a-z]{2,10} [A-Z][a-z]{2,10}"),
            proptest::option::of(any::<bool>()),
        )
            .prop_map(|(username, full_name, onboarding_complete)| ProfileUpdate {
                username,
                full_name,
                avatar_url: None,
                onboarding_complete,
            })
    }

    pub fn arb_profile() -> impl Strategy<Value = Profile> {
        (arb_user_id(), arb_profile_update()).prop_map(|(user_id, update)| {
            let mut profile = Profile::new(user_id.as_str());
            profile.apply(&update);
            profile
        })
    }

    pub fn arb_token_balance() -> impl Strategy<Value = TokenBalance> {
        (0i64..100_000, 0i64..100_000).prop_map(|(remaining, used)| TokenBalance {
            total_tokens: remaining + used,
            tokens_remaining: remaining,
            tokens_used: used,
        })
    }

    /// Small JSON parameter objects, as queued remote writes carry.
    pub fn arb_params() -> impl Strategy<Value = Value> {
        prop::collection::btree_map("[a-z]{1,6}", "[a-z0-9]{0,6}", 0..4).prop_map(|map| {
            Value::Object(
                map.into_iter()
                    .map(|(k, v)| (k, Value::String(v)))
                    .collect(),
            )
        })
    }
}

// ============================================================================
// TEST FIXTURES
// ============================================================================

pub mod fixtures {
    //! Pre-built fixtures for common scenarios.

    use super::*;

    /// Fixed start time for manual clocks (2023-11-14T22:13:20Z).
    pub const T0: i64 = 1_700_000_000_000;

    /// Configuration with in-memory persistence and default timings.
    pub fn test_config() -> AuraConfig {
        let mut config = AuraConfig::default();
        config.storage.backend = StorageBackend::Memory;
        config
    }

    pub fn user(id: &str) -> User {
        User::new(id).with_email(format!("{id}@example.com"))
    }

    /// Session whose access token expires `secs` after the clock's now.
    pub fn session_expiring_in(clock: &dyn Clock, secs: i64) -> Session {
        Session::new(
            "access-token",
            "refresh-token",
            clock.now_millis() / 1000 + secs,
        )
    }

    pub fn authenticated_session(id: &str, clock: &dyn Clock) -> AuthenticatedSession {
        AuthenticatedSession {
            user: user(id),
            session: session_expiring_in(clock, 3_600),
        }
    }

    pub fn profile(id: &str) -> Profile {
        let mut profile = Profile::new(id);
        profile.username = Some(format!("user_{id}"));
        profile.updated_at = Some("2024-01-01T00:00:00Z".to_string());
        profile
    }

    pub fn onboarded_profile(id: &str) -> Profile {
        let mut profile = profile(id);
        profile.onboarding_complete = Some(true);
        profile.stripe_customer_id = Some(format!("cus_{id}"));
        profile
    }

    pub fn payment_method(user_id: &str, id: &str, is_default: bool) -> PaymentMethod {
        PaymentMethod {
            id: id.to_string(),
            user_id: user_id.to_string(),
            stripe_customer_id: format!("cus_{user_id}"),
            stripe_payment_method_id: format!("pm_{id}"),
            card_brand: "visa".to_string(),
            card_last4: "4242".to_string(),
            card_exp_month: 12,
            card_exp_year: 2030,
            is_default,
            is_active: true,
            last_used_at: None,
        }
    }

    pub fn active_subscription(user_id: &str) -> SubscriptionInfo {
        SubscriptionInfo {
            subscription_id: format!("sub_{user_id}"),
            customer_id: format!("cus_{user_id}"),
            status: "active".to_string(),
            current_period_end: 1_900_000_000,
            price_id: "price_monthly".to_string(),
        }
    }

    pub fn token_balance(remaining: i64) -> TokenBalance {
        TokenBalance {
            total_tokens: 1_000,
            tokens_remaining: remaining,
            tokens_used: 1_000 - remaining,
        }
    }

    pub fn purchase(user_id: &str, id: &str) -> Purchase {
        Purchase {
            id: id.to_string(),
            user_id: user_id.to_string(),
            stripe_payment_intent_id: format!("pi_{id}"),
            stripe_price_id: "price_tokens_500".to_string(),
            package_id: Some("pkg_starter".to_string()),
            amount_paid: 999,
            currency: "usd".to_string(),
            tokens_purchased: Some(500),
            status: "succeeded".to_string(),
            completed_at: None,
            created_at: None,
        }
    }

    pub fn package_with_prices() -> PackageWithPrices {
        PackageWithPrices {
            package: Package {
                id: "pkg_starter".to_string(),
                name: "Starter".to_string(),
                description: Some("500 tokens".to_string()),
                stripe_product_id: "prod_starter".to_string(),
                features: None,
                is_active: true,
                sort_order: 1,
            },
            prices: vec![PackagePrice {
                id: "price_row_1".to_string(),
                package_id: "pkg_starter".to_string(),
                stripe_price_id: "price_tokens_500".to_string(),
                amount_cents: 999,
                currency: "usd".to_string(),
                interval_type: "one_time".to_string(),
                interval_count: 1,
                token_amount: 500,
                is_active: true,
            }],
        }
    }

    /// JSON form of a fixture, for scripting [`MockRemote`] responses.
    pub fn json<T: serde::Serialize>(value: &T) -> Value {
        serde_json::to_value(value).unwrap_or(Value::Null)
    }
}

// ============================================================================
// CUSTOM ASSERTIONS
// ============================================================================

pub mod assertions {
    //! Assertions for Aura-specific validation.

    use super::*;

    /// Assert that a result failed with an auth error.
    #[track_caller]
    pub fn assert_auth_error<T: std::fmt::Debug>(result: &Result<T, AuraError>) {
        match result {
            Err(AuraError::Auth(_)) => {}
            other => panic!("Expected Auth error, got: {:?}", other),
        }
    }

    /// Assert that a result failed with a remote error.
    #[track_caller]
    pub fn assert_remote_error<T: std::fmt::Debug>(result: &Result<T, AuraError>) {
        match result {
            Err(AuraError::Remote(_)) => {}
            other => panic!("Expected Remote error, got: {:?}", other),
        }
    }

    /// Assert that the cache respects its size bound.
    #[track_caller]
    pub fn assert_within_capacity(cache: &CacheManager) {
        assert!(
            cache.len() <= cache.max_size(),
            "Cache holds {} entries, capacity is {}",
            cache.len(),
            cache.max_size()
        );
    }

    /// Assert that no cache key belongs to `user_id`.
    #[track_caller]
    pub fn assert_no_user_entries(cache: &CacheManager, user_id: &UserId) {
        let leaked: Vec<String> = cache
            .keys()
            .into_iter()
            .filter(|k| CacheKey::parse(k).is_some_and(|key| key.belongs_to(user_id)))
            .collect();
        assert!(leaked.is_empty(), "Entries left for {}: {:?}", user_id, leaked);
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_mock_remote_resolution_order() {
        let remote = MockRemote::new();
        remote.respond("op", json!("sticky"));
        remote.respond_once("op", json!("first"));

        assert_eq!(remote.call("op", json!({})).await.unwrap(), json!("first"));
        assert_eq!(remote.call("op", json!({})).await.unwrap(), json!("sticky"));
        assert!(remote.call("other", json!({})).await.is_err());
        assert_eq!(remote.call_count("op"), 2);
        assert_eq!(remote.total_calls(), 3);
    }

    #[tokio::test]
    async fn test_mock_remote_offline_and_handlers() {
        let remote = MockRemote::new();
        remote.respond_with("echo", |params| Ok(params.clone()));
        assert_eq!(remote.call("echo", json!(1)).await.unwrap(), json!(1));

        remote.set_offline(true);
        assert!(matches!(
            remote.call("echo", json!(2)).await,
            Err(RemoteError::Transport { .. })
        ));
        assert_eq!(remote.last_params("echo"), Some(json!(2)));
    }

    #[tokio::test]
    async fn test_token_store_failure_injection() {
        let store = InMemoryTokenStore::with_tokens(AuthTokens::new("a", "r"));
        store.fail_next_clear();
        assert!(store.clear().await.is_err());
        assert!(store.current().is_some());
        store.clear().await.unwrap();
        assert!(store.current().is_none());
        assert_eq!(store.clear_count(), 2);
    }

    #[test]
    fn test_fixtures_roundtrip_through_json() {
        let profile = fixtures::onboarded_profile("u1");
        assert!(profile.has_completed_onboarding());
        let value = fixtures::json(&fixtures::package_with_prices());
        let parsed: PackageWithPrices = serde_json::from_value(value).unwrap();
        assert_eq!(parsed, fixtures::package_with_prices());
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(50))]

        #[test]
        fn prop_generated_keys_parse(key in generators::arb_cache_key()) {
            let parsed = CacheKey::parse(key.as_str());
            prop_assert_eq!(parsed, Some(key));
        }

        #[test]
        fn prop_generated_balances_are_consistent(balance in generators::arb_token_balance()) {
            prop_assert_eq!(balance.total_tokens, balance.tokens_remaining + balance.tokens_used);
        }
    }
}
