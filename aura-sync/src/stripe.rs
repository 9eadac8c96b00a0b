//! Payment context: customer id, saved cards and subscription.
//!
//! The customer id maps a user to the payment provider and changes far less
//! often than the rest, so it is cached for an hour. Card writes are not
//! queued for replay; they fail straight back to the caller.

use std::sync::Arc;

use aura_core::{
    AuraConfig, AuraError, AuthError, CacheKey, PaymentMethod, RemoteError, SharedClock,
    SubscriptionInfo, UserId,
};
use aura_storage::CacheManager;
use serde_json::json;
use tokio::sync::watch;

use crate::collaborators::{call_typed, ops, SharedRemote};
use crate::data_store::DataStore;
use crate::resource::{CachedResource, ResourceFactory, ResourceState};
use crate::session::SessionStore;

pub struct StripeContextStore {
    customer: CachedResource<String>,
    payment_methods: CachedResource<Vec<PaymentMethod>>,
    subscription: CachedResource<SubscriptionInfo>,
    session: Arc<SessionStore>,
    data: Arc<DataStore>,
    remote: SharedRemote,
}

impl StripeContextStore {
    pub fn new(
        config: &AuraConfig,
        cache: Arc<CacheManager>,
        session: Arc<SessionStore>,
        data: Arc<DataStore>,
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
            customer: resource.build("stripe_customer", config.ttl.stripe_customer()),
            payment_methods: resource.build("payment_methods", config.ttl.payment_methods()),
            subscription: resource.build("subscription", config.ttl.subscription()),
            session,
            data,
            remote,
        }
    }

    pub fn customer_id(&self) -> Option<String> {
        self.customer.value()
    }

    pub fn payment_methods(&self) -> Vec<PaymentMethod> {
        self.payment_methods.value().unwrap_or_default()
    }

    pub fn default_payment_method(&self) -> Option<PaymentMethod> {
        self.payment_methods().into_iter().find(|m| m.is_default)
    }

    pub fn subscription(&self) -> Option<SubscriptionInfo> {
        self.subscription.value()
    }

    pub fn has_active_subscription(&self) -> bool {
        self.subscription().is_some_and(|s| s.is_active())
    }

    pub fn payment_methods_state(&self) -> ResourceState<Vec<PaymentMethod>> {
        self.payment_methods.snapshot()
    }

    pub fn subscribe_payment_methods(&self) -> watch::Receiver<ResourceState<Vec<PaymentMethod>>> {
        self.payment_methods.subscribe()
    }

    pub fn is_loading(&self) -> bool {
        self.customer.is_loading()
            || self.payment_methods.is_loading()
            || self.subscription.is_loading()
    }

    pub fn error(&self) -> Option<String> {
        self.customer
            .error()
            .or_else(|| self.payment_methods.error())
            .or_else(|| self.subscription.error())
    }

    /// Resolve the payment-provider customer for the signed-in user.
    pub async fn initialize_customer(&self, force: bool) -> Option<String> {
        let user_id = self.session.user_id()?;
        let key = CacheKey::stripe_customer(&user_id);
        let remote = self.remote.clone();
        self.customer
            .load(&key, force, || async move {
                call_typed(
                    remote.as_ref(),
                    ops::INITIALIZE_STRIPE_CUSTOMER,
                    json!({ "user_id": user_id }),
                )
                .await
            })
            .await
    }

    pub async fn load_payment_methods(&self, force: bool) -> Vec<PaymentMethod> {
        let Some(user_id) = self.session.user_id() else {
            return Vec::new();
        };
        let key = CacheKey::payment_methods(&user_id);
        let remote = self.remote.clone();
        self.payment_methods
            .load(&key, force, || async move {
                call_typed(
                    remote.as_ref(),
                    ops::GET_STORED_PAYMENT_METHODS,
                    json!({ "user_id": user_id }),
                )
                .await
            })
            .await
            .unwrap_or_default()
    }

    /// Load the subscription named on the user's profile.
    ///
    /// Users without a subscription get `None` and no remote call.
    pub async fn load_subscription(&self, force: bool) -> Option<SubscriptionInfo> {
        let user_id = self.session.user_id()?;
        let Some(subscription_id) = self
            .data
            .load_profile(false)
            .await
            .and_then(|p| p.subscription_id)
        else {
            self.subscription.reset();
            return None;
        };
        let key = CacheKey::subscription(&user_id);
        let remote = self.remote.clone();
        self.subscription
            .load(&key, force, || async move {
                call_typed(
                    remote.as_ref(),
                    ops::GET_SUBSCRIPTION_STATUS,
                    json!({ "subscription_id": subscription_id }),
                )
                .await
            })
            .await
    }

    pub async fn set_default_payment_method(&self, payment_method_id: &str) -> Result<(), AuraError> {
        let user_id = self.session.user_id().ok_or(AuthError::NotAuthenticated)?;
        let customer_id = self.initialize_customer(false).await.ok_or_else(|| {
            RemoteError::remote(ops::SET_DEFAULT_PAYMENT_METHOD, "no payment customer for user")
        })?;

        call_typed::<serde_json::Value>(
            self.remote.as_ref(),
            ops::SET_DEFAULT_PAYMENT_METHOD,
            json!({
                "customer_id": customer_id,
                "payment_method_id": payment_method_id,
                "user_id": user_id,
            }),
        )
        .await?;

        tracing::info!(user_id = %user_id, payment_method_id, "Default payment method changed");
        self.apply_card_change(&user_id, |methods| {
            for method in methods.iter_mut() {
                method.is_default = method.id == payment_method_id;
            }
        });
        Ok(())
    }

    pub async fn remove_payment_method(&self, payment_method_id: &str) -> Result<(), AuraError> {
        let user_id = self.session.user_id().ok_or(AuthError::NotAuthenticated)?;

        call_typed::<serde_json::Value>(
            self.remote.as_ref(),
            ops::DELETE_PAYMENT_METHOD,
            json!({
                "payment_method_id": payment_method_id,
                "user_id": user_id,
            }),
        )
        .await?;

        tracing::info!(user_id = %user_id, payment_method_id, "Payment method removed");
        self.apply_card_change(&user_id, |methods| {
            methods.retain(|m| m.id != payment_method_id);
        });
        Ok(())
    }

    /// Mirror a confirmed card write locally, then drop the cache entry so
    /// the next read fetches the authoritative list.
    fn apply_card_change(&self, user_id: &UserId, f: impl FnOnce(&mut Vec<PaymentMethod>)) {
        let key = CacheKey::payment_methods(user_id);
        self.payment_methods.update_local(&key, f);
        self.payment_methods.invalidate(&key);
    }

    pub fn tracked_keys(user_id: &UserId) -> Vec<CacheKey> {
        vec![
            CacheKey::stripe_customer(user_id),
            CacheKey::payment_methods(user_id),
            CacheKey::subscription(user_id),
        ]
    }

    pub fn reset(&self) {
        self.customer.reset();
        self.payment_methods.reset();
        self.subscription.reset();
    }
}
