//! Cross-store orchestration.
//!
//! The coordinator decides when the domain stores load, refresh and forget
//! their data:
//! - `initialize` loads everything once per signed-in user, customer id first
//! - `smart_refresh` reloads only what fell out of the cache
//! - `force_refresh` reloads everything
//! - signing out purges the user's cache entries and resets every store

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use aura_core::{
    AuraResult, CacheDomain, CacheKey, EpochMillis, SharedClock, UserId,
};
use aura_storage::CacheManager;
use futures_util::future::join_all;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

use crate::account::AccountStore;
use crate::data_store::DataStore;
use crate::session::SessionStore;
use crate::stripe::StripeContextStore;

/// A failure recorded during a sync.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncError {
    pub message: String,
    pub at: EpochMillis,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncStats {
    pub full_syncs: u64,
    pub smart_refreshes: u64,
    pub force_refreshes: u64,
    /// Resources reloaded by smart or forced refreshes.
    pub reloads: u64,
    pub invalidations: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CoordinatorState {
    pub is_initialized: bool,
    /// The user the stores were initialized for.
    pub user_id: Option<UserId>,
    pub last_full_sync: Option<EpochMillis>,
    pub sync_in_progress: bool,
    /// Most recent errors, oldest first.
    pub errors: VecDeque<SyncError>,
    /// Errors recorded since startup. Never reset.
    pub error_count: u64,
    pub stats: SyncStats,
}

pub struct StoreCoordinator {
    state: watch::Sender<CoordinatorState>,
    cache: Arc<CacheManager>,
    session: Arc<SessionStore>,
    data: Arc<DataStore>,
    account: Arc<AccountStore>,
    stripe: Arc<StripeContextStore>,
    clock: SharedClock,
    error_log_size: usize,
    /// Last error seen per store (data, stripe, account), so a sticky error
    /// is recorded once.
    seen_errors: Mutex<[Option<String>; 3]>,
}

impl StoreCoordinator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        error_log_size: usize,
        cache: Arc<CacheManager>,
        session: Arc<SessionStore>,
        data: Arc<DataStore>,
        account: Arc<AccountStore>,
        stripe: Arc<StripeContextStore>,
        clock: SharedClock,
    ) -> Arc<Self> {
        let (state, _) = watch::channel(CoordinatorState::default());
        Arc::new(Self {
            state,
            cache,
            session,
            data,
            account,
            stripe,
            clock,
            error_log_size: error_log_size.max(1),
            seen_errors: Mutex::new(Default::default()),
        })
    }

    pub fn snapshot(&self) -> CoordinatorState {
        self.state.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<CoordinatorState> {
        self.state.subscribe()
    }

    pub fn is_initialized(&self) -> bool {
        self.state.borrow().is_initialized
    }

    /// Every cache key loaded for `user_id`.
    pub fn tracked_keys(user_id: &UserId) -> Vec<CacheKey> {
        let mut keys = vec![CacheKey::profile(user_id)];
        keys.extend(StripeContextStore::tracked_keys(user_id));
        keys.extend(AccountStore::tracked_keys(user_id));
        keys
    }

    /// Load every store for the signed-in user.
    ///
    /// Does nothing when already initialized, when nobody is signed in, or
    /// while another sync runs. Load failures are recorded, not returned.
    pub async fn initialize(&self) -> AuraResult<()> {
        let Some(user_id) = self.session.user_id() else {
            tracing::debug!("No signed-in user, nothing to initialize");
            return Ok(());
        };
        let started = self.state.send_if_modified(|state| {
            if state.is_initialized || state.sync_in_progress {
                return false;
            }
            state.sync_in_progress = true;
            true
        });
        if !started {
            return Ok(());
        }

        tracing::info!(user_id = %user_id, "Initializing stores");
        self.stripe.initialize_customer(false).await;
        tokio::join!(
            self.data.load_profile(false),
            self.stripe.load_payment_methods(false),
            self.stripe.load_subscription(false),
            self.account.load_balance(false),
            self.account.load_purchases(false),
            self.account.load_packages(false),
        );
        self.data.process_offline_queue().await;
        self.collect_store_errors();

        let still_current = self.session.user_id().as_ref() == Some(&user_id);
        let now = self.clock.now_millis();
        self.state.send_modify(|state| {
            state.sync_in_progress = false;
            if still_current {
                state.is_initialized = true;
                state.user_id = Some(user_id.clone());
                state.last_full_sync = Some(now);
                state.stats.full_syncs += 1;
            }
        });
        if still_current {
            tracing::info!(user_id = %user_id, "Stores initialized");
        } else {
            tracing::info!(user_id = %user_id, "User changed during initialization, discarding");
        }
        Ok(())
    }

    async fn reload(&self, domain: CacheDomain, force: bool) {
        match domain {
            CacheDomain::Profile => {
                self.data.load_profile(force).await;
            }
            CacheDomain::StripeCustomer => {
                self.stripe.initialize_customer(force).await;
            }
            CacheDomain::PaymentMethods => {
                self.stripe.load_payment_methods(force).await;
            }
            CacheDomain::Subscription => {
                self.stripe.load_subscription(force).await;
            }
            CacheDomain::TokenBalance => {
                self.account.load_balance(force).await;
            }
            CacheDomain::Purchases => {
                self.account.load_purchases(force).await;
            }
            CacheDomain::PackagesWithPrices => {
                self.account.load_packages(force).await;
            }
        }
    }

    /// Reload the resources whose cache entries are missing or expired.
    ///
    /// Returns how many were reloaded. Fresh data is never fetched.
    pub async fn smart_refresh(&self) -> usize {
        let Some(user_id) = self.state.borrow().user_id.clone() else {
            return 0;
        };
        if !self.is_initialized() {
            return 0;
        }
        let stale: Vec<CacheDomain> = Self::tracked_keys(&user_id)
            .into_iter()
            .filter(|key| !self.cache.has(key))
            .map(|key| key.domain())
            .collect();

        if !stale.is_empty() {
            tracing::debug!(user_id = %user_id, stale = ?stale, "Smart refresh");
            // Payment data depends on the customer id.
            if stale.contains(&CacheDomain::StripeCustomer) {
                self.reload(CacheDomain::StripeCustomer, false).await;
            }
            join_all(
                stale
                    .iter()
                    .filter(|domain| **domain != CacheDomain::StripeCustomer)
                    .map(|domain| self.reload(*domain, false)),
            )
            .await;
            self.collect_store_errors();
        }
        let reloaded = stale.len();
        self.state.send_modify(|state| {
            state.stats.smart_refreshes += 1;
            state.stats.reloads += reloaded as u64;
        });
        reloaded
    }

    /// Reload every resource, ignoring freshness.
    pub async fn force_refresh(&self) -> usize {
        let Some(user_id) = self.session.user_id() else {
            return 0;
        };
        tracing::info!(user_id = %user_id, "Forced refresh");
        self.stripe.initialize_customer(true).await;
        let domains: Vec<CacheDomain> = Self::tracked_keys(&user_id)
            .into_iter()
            .map(|key| key.domain())
            .filter(|domain| *domain != CacheDomain::StripeCustomer)
            .collect();
        join_all(domains.iter().map(|domain| self.reload(*domain, true))).await;
        self.collect_store_errors();

        let reloaded = domains.len() + 1;
        let now = self.clock.now_millis();
        self.state.send_modify(|state| {
            state.stats.force_refreshes += 1;
            state.stats.reloads += reloaded as u64;
            state.last_full_sync = Some(now);
        });
        reloaded
    }

    /// Drop every cache entry of `user_id`.
    pub fn invalidate_user_cache(&self, user_id: &UserId) -> usize {
        let removed = self.cache.invalidate_user(user_id);
        tracing::info!(user_id = %user_id, removed, "User cache invalidated");
        self.state.send_modify(|state| state.stats.invalidations += 1);
        removed
    }

    /// Purge the initialized user's data and return to uninitialized.
    ///
    /// The error counter and stats survive.
    pub fn reset(&self) {
        let user_id = self.state.borrow().user_id.clone();
        if let Some(user_id) = user_id.as_ref() {
            self.invalidate_user_cache(user_id);
        }
        self.data.reset();
        self.account.reset();
        self.stripe.reset();
        *self.seen_errors.lock().unwrap_or_else(PoisonError::into_inner) = Default::default();
        self.state.send_modify(|state| {
            state.is_initialized = false;
            state.user_id = None;
            state.last_full_sync = None;
            state.sync_in_progress = false;
            state.errors.clear();
        });
        tracing::debug!(user_id = ?user_id, "Coordinator reset");
    }

    pub fn record_error(&self, message: impl Into<String>) {
        let error = SyncError {
            message: message.into(),
            at: self.clock.now_millis(),
        };
        tracing::warn!(error = %error.message, "Sync error");
        let cap = self.error_log_size;
        self.state.send_modify(|state| {
            state.errors.push_back(error);
            while state.errors.len() > cap {
                state.errors.pop_front();
            }
            state.error_count += 1;
        });
    }

    /// Record store errors that were not there after the previous pass.
    fn collect_store_errors(&self) {
        let current = [self.data.error(), self.stripe.error(), self.account.error()];
        let fresh: Vec<String> = {
            let mut seen = self.seen_errors.lock().unwrap_or_else(PoisonError::into_inner);
            let fresh = current
                .iter()
                .zip(seen.iter())
                .filter_map(|(now, before)| match now {
                    Some(message) if before.as_ref() != Some(message) => Some(message.clone()),
                    _ => None,
                })
                .collect();
            *seen = current;
            fresh
        };
        for message in fresh {
            self.record_error(message);
        }
    }

    /// React to session changes until `shutdown` flips to true.
    ///
    /// Signing out resets the coordinator. Signing in initializes it once
    /// the session has been stable for `settle`. Switching users does both.
    pub fn spawn_auth_listener(
        self: &Arc<Self>,
        settle: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let coordinator = Arc::clone(self);
        let mut session = self.session.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    changed = session.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        let current = session.borrow_and_update().user_id();
                        coordinator.on_session_change(current, settle).await;
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
            tracing::debug!("Coordinator auth listener stopped");
        })
    }

    async fn on_session_change(&self, current: Option<UserId>, settle: Duration) {
        let initialized_for = self.state.borrow().user_id.clone();
        match (current, initialized_for) {
            (None, Some(_)) => self.reset(),
            (Some(user), Some(previous)) if user != previous => {
                self.reset();
                self.initialize_after(user, settle).await;
            }
            (Some(user), None) => self.initialize_after(user, settle).await,
            _ => {}
        }
    }

    async fn initialize_after(&self, user_id: UserId, settle: Duration) {
        if self.is_initialized() {
            return;
        }
        tokio::time::sleep(settle).await;
        if self.session.user_id().as_ref() != Some(&user_id) {
            return;
        }
        if let Err(e) = self.initialize().await {
            self.record_error(e.to_string());
        }
    }

    /// Run [`smart_refresh`](Self::smart_refresh) on every tick.
    pub fn spawn_periodic_refresh(
        self: &Arc<Self>,
        every: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let coordinator = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + every, every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        coordinator.smart_refresh().await;
                        coordinator.account.refresh_balance_in_background().await;
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
        })
    }
}
