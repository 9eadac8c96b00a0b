//! Token balance, purchase history and the package catalogue.

use std::sync::Arc;

use aura_core::{
    AuraConfig, CacheKey, PackageWithPrices, Purchase, SharedClock, TokenBalance, UserId,
};
use aura_storage::CacheManager;
use serde_json::json;
use tokio::sync::watch;

use crate::collaborators::{call_typed, ops, SharedRemote};
use crate::resource::{CachedResource, ResourceFactory, ResourceState};
use crate::session::SessionStore;

pub struct AccountStore {
    balance: CachedResource<TokenBalance>,
    purchases: CachedResource<Vec<Purchase>>,
    packages: CachedResource<Vec<PackageWithPrices>>,
    session: Arc<SessionStore>,
    remote: SharedRemote,
}

impl AccountStore {
    pub fn new(
        config: &AuraConfig,
        cache: Arc<CacheManager>,
        session: Arc<SessionStore>,
        remote: SharedRemote,
        clock: SharedClock,
    ) -> Self {
        let resource = ResourceFactory::new(
            cache,
            session.clone(),
            clock,
            config.sync.background_refresh_threshold,
        );
        Self {
            balance: resource.build("token_balance", config.ttl.token_balance()),
            purchases: resource.build("purchases", config.ttl.purchases()),
            packages: resource.build("packages_with_prices", config.ttl.packages()),
            session,
            remote,
        }
    }

    pub fn balance(&self) -> Option<TokenBalance> {
        self.balance.value()
    }

    pub fn purchases(&self) -> Vec<Purchase> {
        self.purchases.value().unwrap_or_default()
    }

    pub fn packages(&self) -> Vec<PackageWithPrices> {
        self.packages.value().unwrap_or_default()
    }

    pub fn balance_state(&self) -> ResourceState<TokenBalance> {
        self.balance.snapshot()
    }

    pub fn subscribe_balance(&self) -> watch::Receiver<ResourceState<TokenBalance>> {
        self.balance.subscribe()
    }

    pub fn is_loading(&self) -> bool {
        self.balance.is_loading() || self.purchases.is_loading() || self.packages.is_loading()
    }

    /// First error among the account resources.
    pub fn error(&self) -> Option<String> {
        self.balance
            .error()
            .or_else(|| self.purchases.error())
            .or_else(|| self.packages.error())
    }

    pub async fn load_balance(&self, force: bool) -> Option<TokenBalance> {
        let user_id = self.session.user_id()?;
        let key = CacheKey::token_balance(&user_id);
        self.balance
            .load(&key, force, || fetch_balance(self.remote.clone(), user_id))
            .await
    }

    pub async fn refresh_balance_in_background(&self) -> bool {
        let Some(user_id) = self.session.user_id() else {
            return false;
        };
        let key = CacheKey::token_balance(&user_id);
        self.balance
            .refresh_in_background(&key, || fetch_balance(self.remote.clone(), user_id))
            .await
    }

    pub async fn load_purchases(&self, force: bool) -> Vec<Purchase> {
        let Some(user_id) = self.session.user_id() else {
            return Vec::new();
        };
        let key = CacheKey::purchases(&user_id);
        let remote = self.remote.clone();
        self.purchases
            .load(&key, force, || async move {
                call_typed(
                    remote.as_ref(),
                    ops::GET_USER_PURCHASES,
                    json!({ "user_id": user_id }),
                )
                .await
            })
            .await
            .unwrap_or_default()
    }

    /// The global catalogue. Does not need a signed-in user.
    pub async fn load_packages(&self, force: bool) -> Vec<PackageWithPrices> {
        let remote = self.remote.clone();
        self.packages
            .load(&CacheKey::packages_with_prices(), force, || async move {
                call_typed(remote.as_ref(), ops::GET_PACKAGES_WITH_PRICES, json!({})).await
            })
            .await
            .unwrap_or_default()
    }

    /// Deduct locally consumed tokens ahead of the next balance fetch.
    pub fn record_local_spend(&self, amount: i64) -> Option<TokenBalance> {
        let user_id = self.session.user_id()?;
        let updated = self
            .balance
            .update_local(&CacheKey::token_balance(&user_id), |b| b.spend(amount))?;
        tracing::debug!(user_id = %user_id, amount, remaining = updated.tokens_remaining, "Local spend recorded");
        Some(updated)
    }

    /// Keys this store loads for `user_id`.
    pub fn tracked_keys(user_id: &UserId) -> Vec<CacheKey> {
        vec![
            CacheKey::token_balance(user_id),
            CacheKey::purchases(user_id),
            CacheKey::packages_with_prices(),
        ]
    }

    /// Forget the per-user values. The catalogue is global and stays.
    pub fn reset(&self) {
        self.balance.reset();
        self.purchases.reset();
    }
}

async fn fetch_balance(
    remote: SharedRemote,
    user_id: UserId,
) -> Result<TokenBalance, aura_core::RemoteError> {
    call_typed(
        remote.as_ref(),
        ops::GET_TOKEN_BALANCE,
        json!({ "user_id": user_id }),
    )
    .await
}
