//! End-to-end behaviour of the wired-up services.

use std::sync::Arc;
use std::time::Duration;

use aura_core::constants::{STORE_APP_CONFIG, STORE_OFFLINE_QUEUE};
use aura_core::{AuraConfig, ProfileUpdate, StorageBackend, Theme, UserId};
use aura_storage::{KeyValuePersistence, MemoryKvStore, SharedPersistence};
use aura_sync::{ops, AppServices, AuthPhase};
use aura_test_utils::assertions::{assert_no_user_entries, assert_remote_error};
use aura_test_utils::fixtures::{self, json as to_json, T0};
use aura_test_utils::{AuthTokens, InMemoryTokenStore, ManualClock, MockRemote};
use proptest::prelude::*;
use serde_json::json;

struct World {
    services: AppServices,
    remote: Arc<MockRemote>,
    tokens: Arc<InMemoryTokenStore>,
    clock: Arc<ManualClock>,
}

fn world_with(
    remote: Arc<MockRemote>,
    tokens: Arc<InMemoryTokenStore>,
    kv: Option<SharedPersistence>,
    clock: Arc<ManualClock>,
) -> World {
    let services = AppServices::new(
        fixtures::test_config(),
        remote.clone(),
        tokens.clone(),
        kv,
        clock.clone(),
    );
    World {
        services,
        remote,
        tokens,
        clock,
    }
}

fn world() -> World {
    world_with(
        Arc::new(MockRemote::new()),
        Arc::new(InMemoryTokenStore::new()),
        None,
        ManualClock::new(T0),
    )
}

fn script_backend(remote: &MockRemote, clock: &ManualClock, user: &str) {
    remote.respond(
        ops::RESTORE_SESSION,
        to_json(&fixtures::authenticated_session(user, clock)),
    );
    remote.respond(ops::GET_USER_PROFILE, to_json(&fixtures::onboarded_profile(user)));
    remote.respond(ops::INITIALIZE_STRIPE_CUSTOMER, json!(format!("cus_{user}")));
    remote.respond(
        ops::GET_STORED_PAYMENT_METHODS,
        to_json(&vec![fixtures::payment_method(user, "pm1", true)]),
    );
    remote.respond(ops::GET_TOKEN_BALANCE, to_json(&fixtures::token_balance(800)));
    remote.respond(ops::GET_USER_PURCHASES, json!([]));
    remote.respond(
        ops::GET_PACKAGES_WITH_PRICES,
        to_json(&vec![fixtures::package_with_prices()]),
    );
}

async fn sign_in(w: &World, user: &str) {
    script_backend(&w.remote, &w.clock, user);
    let auth = fixtures::authenticated_session(user, w.clock.as_ref());
    w.services.auth.sign_in(auth.user, auth.session).await.unwrap();
}

fn rename(full_name: &str) -> ProfileUpdate {
    ProfileUpdate {
        full_name: Some(full_name.to_string()),
        ..Default::default()
    }
}

#[tokio::test]
async fn test_cache_entry_expires_after_its_ttl() {
    let w = world();
    let cache = &w.services.cache;

    cache
        .set(
            "profile:u1",
            &json!({"id": "u1", "username": "alice"}),
            Some(Duration::from_millis(5000)),
        )
        .unwrap();
    assert_eq!(
        cache.get::<serde_json::Value>("profile:u1"),
        Some(json!({"id": "u1", "username": "alice"}))
    );

    w.clock.advance(Duration::from_millis(6000));
    assert_eq!(cache.get::<serde_json::Value>("profile:u1"), None);
    assert!(!cache.has("profile:u1"));
}

#[tokio::test]
async fn test_failing_write_is_replayed_five_times_then_dropped() {
    let w = world();
    sign_in(&w, "u1").await;
    w.remote.fail(ops::UPDATE_USER_PROFILE, "service unavailable");
    let data = &w.services.data;

    for round in 0..3 {
        assert_remote_error(&data.update_user_profile(rename("Alice")).await);
        assert_eq!(data.queue().len(), 1);
        assert_eq!(data.queue().items()[0].retry_count, round);

        let report = data.process_offline_queue().await;
        assert_eq!(report.failed, 1);
        assert_eq!(data.queue().len(), 1);
    }

    data.process_offline_queue().await;
    let last = data.process_offline_queue().await;

    assert_eq!(last.exhausted.len(), 1);
    assert!(data.queue().is_empty());
    // Three direct writes plus exactly five replays.
    assert_eq!(w.remote.call_count(ops::UPDATE_USER_PROFILE), 8);

    data.process_offline_queue().await;
    assert_eq!(w.remote.call_count(ops::UPDATE_USER_PROFILE), 8);
}

#[tokio::test]
async fn test_sign_out_with_reason_clears_tokens_once() {
    let w = world();
    let auth = fixtures::authenticated_session("u1", w.clock.as_ref());
    let session = &w.services.session;

    session.set_authenticated(auth.user, auth.session).await.unwrap();
    session.set_unauthenticated(Some("token expired".to_string())).await;

    assert_eq!(w.tokens.clear_count(), 1);
    let state = session.snapshot();
    assert_eq!(state.error.as_deref(), Some("token expired"));
    assert!(!state.is_authenticated);
    assert!(state.user.is_none());
    assert!(state.session.is_none());
}

#[tokio::test]
async fn test_cached_profile_is_served_when_backend_fails() {
    let w = world();
    sign_in(&w, "u1").await;

    w.clock.advance(Duration::from_secs(10 * 60));
    w.remote.fail(ops::GET_USER_PROFILE, "gateway timeout");

    let profile = w.services.data.load_profile(false).await;
    assert_eq!(profile.map(|p| p.id), Some("u1".to_string()));
    assert!(w.services.data.error().unwrap().contains("gateway timeout"));
}

#[tokio::test]
async fn test_user_invalidation_is_idempotent_and_scoped() {
    let w = world();
    sign_in(&w, "u1").await;
    w.services
        .cache
        .set("profile:u10", &json!({"id": "u10"}), None)
        .unwrap();

    let user = UserId::new("u1");
    assert!(w.services.coordinator.invalidate_user_cache(&user) > 0);
    assert_eq!(w.services.coordinator.invalidate_user_cache(&user), 0);
    assert_no_user_entries(&w.services.cache, &user);
    assert!(w.services.cache.has("profile:u10"));
}

#[tokio::test]
async fn test_switching_users_never_shows_previous_data() {
    let w = world();
    sign_in(&w, "u1").await;
    assert_eq!(w.services.account.balance().unwrap().tokens_remaining, 800);

    w.services.auth.sign_out().await;
    assert!(w.services.account.balance().is_none());
    assert!(w.services.data.current_profile().is_none());

    sign_in(&w, "u2").await;
    assert_eq!(
        w.services.data.current_profile().map(|p| p.id),
        Some("u2".to_string())
    );
    assert_eq!(
        w.services.stripe.customer_id(),
        Some("cus_u2".to_string())
    );
    assert_no_user_entries(&w.services.cache, &UserId::new("u1"));
}

#[tokio::test(start_paused = true)]
async fn test_queued_write_survives_restart() {
    let kv = Arc::new(MemoryKvStore::new());
    let remote = Arc::new(MockRemote::new());
    let tokens = Arc::new(InMemoryTokenStore::with_tokens(AuthTokens::new("a", "r")));
    let clock = ManualClock::new(T0);
    script_backend(&remote, &clock, "u1");

    let first = world_with(
        remote.clone(),
        tokens.clone(),
        Some(kv.clone() as SharedPersistence),
        clock.clone(),
    );
    assert!(first.services.start().await.unwrap());
    assert_eq!(first.services.auth.phase(), AuthPhase::Ready);
    assert!(first.services.coordinator.is_initialized());

    remote.fail(ops::UPDATE_USER_PROFILE, "offline");
    assert!(first
        .services
        .data
        .update_user_profile(rename("Alice Liddell"))
        .await
        .is_err());
    first.services.settings.set_theme(Theme::Dark);
    first.services.shutdown().await;

    assert!(kv.get(STORE_OFFLINE_QUEUE).await.unwrap().is_some());
    assert_eq!(
        kv.get(STORE_APP_CONFIG).await.unwrap().unwrap()["theme"],
        json!("dark")
    );

    let mut saved = fixtures::onboarded_profile("u1");
    saved.full_name = Some("Alice Liddell".to_string());
    remote.respond(ops::UPDATE_USER_PROFILE, to_json(&saved));

    let second = world_with(remote.clone(), tokens, Some(kv as SharedPersistence), clock);
    assert!(second.services.start().await.unwrap());

    assert!(second.services.data.queue().is_empty());
    assert!(second.services.session.pending_changes().is_empty());
    assert_eq!(second.services.settings.settings().theme, Theme::Dark);
    assert_eq!(remote.call_count(ops::UPDATE_USER_PROFILE), 2);
    second.services.shutdown().await;
}

#[tokio::test]
async fn test_open_with_file_backend() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = AuraConfig::default();
    config.storage.backend = StorageBackend::File;
    config.storage.data_dir = dir.path().to_path_buf();

    let services = AppServices::open(
        config,
        Arc::new(MockRemote::new()),
        Arc::new(InMemoryTokenStore::new()),
    )
    .unwrap();
    assert!(!services.start().await.unwrap());
    assert_eq!(services.auth.phase(), AuthPhase::SignedOut);

    services.settings.set_theme(Theme::Light);
    services.shutdown().await;

    assert!(dir.path().join("app_config.store").exists());
}

#[tokio::test]
async fn test_open_rejects_invalid_config() {
    let mut config = fixtures::test_config();
    config.cache.max_size = 0;
    let result = AppServices::open(
        config,
        Arc::new(MockRemote::new()),
        Arc::new(InMemoryTokenStore::new()),
    );
    assert!(matches!(result, Err(aura_core::AuraError::Config(_))));
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn prop_sign_out_always_clears_session(
        signed_in in any::<bool>(),
        fail_clear in any::<bool>(),
        reason in proptest::option::of("[a-z ]{1,20}"),
    ) {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        rt.block_on(async {
            let w = world();
            let session = &w.services.session;
            if signed_in {
                let auth = fixtures::authenticated_session("u1", w.clock.as_ref());
                session.set_authenticated(auth.user, auth.session).await.unwrap();
            }
            if fail_clear {
                w.tokens.fail_next_clear();
            }

            session.set_unauthenticated(reason.clone()).await;

            let state = session.snapshot();
            prop_assert!(!state.is_authenticated);
            prop_assert!(state.user.is_none());
            prop_assert!(state.session.is_none());
            prop_assert_eq!(state.error, reason);
            prop_assert!(!session.has_refresh_scheduled());
            Ok(())
        })?;
    }
}
