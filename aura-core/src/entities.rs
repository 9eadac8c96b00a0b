//! Domain entities exchanged with the remote backend and held in the stores.

use crate::identity::{EpochMillis, UserId};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

// ============================================================================
// AUTHENTICATION
// ============================================================================

/// Authenticated user identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: UserId,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
}

impl User {
    pub fn new(id: impl Into<UserId>) -> Self {
        Self {
            id: id.into(),
            email: None,
            name: None,
        }
    }

    pub fn with_email(mut self, email: impl Into<String>) -> Self {
        self.email = Some(email.into());
        self
    }
}

/// Access/refresh token pair kept in the secure token store.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthTokens {
    pub access_token: String,
    pub refresh_token: String,
}

impl AuthTokens {
    pub fn new(access_token: impl Into<String>, refresh_token: impl Into<String>) -> Self {
        Self {
            access_token: access_token.into(),
            refresh_token: refresh_token.into(),
        }
    }
}

impl fmt::Debug for AuthTokens {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthTokens")
            .field("access_token", &"<redacted>")
            .field("refresh_token", &"<redacted>")
            .finish()
    }
}

/// Auth backend session.
///
/// `expires_at` is in Unix seconds, as the backend issues it.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub access_token: String,
    pub refresh_token: String,
    pub expires_at: i64,
    #[serde(default = "default_token_type")]
    pub token_type: String,
}

fn default_token_type() -> String {
    "bearer".to_string()
}

impl Session {
    pub fn new(
        access_token: impl Into<String>,
        refresh_token: impl Into<String>,
        expires_at: i64,
    ) -> Self {
        Self {
            access_token: access_token.into(),
            refresh_token: refresh_token.into(),
            expires_at,
            token_type: default_token_type(),
        }
    }

    /// Expiry in epoch milliseconds.
    pub fn expires_at_millis(&self) -> EpochMillis {
        self.expires_at.saturating_mul(1000)
    }

    pub fn tokens(&self) -> AuthTokens {
        AuthTokens::new(self.access_token.clone(), self.refresh_token.clone())
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("access_token", &"<redacted>")
            .field("refresh_token", &"<redacted>")
            .field("expires_at", &self.expires_at)
            .field("token_type", &self.token_type)
            .finish()
    }
}

/// Response of the `refresh_session` / `restore_session` remote calls.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthenticatedSession {
    pub user: User,
    pub session: Session,
}

// ============================================================================
// PROFILE
// ============================================================================

/// User profile row.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Profile {
    pub id: String,
    pub updated_at: Option<String>,
    pub username: Option<String>,
    pub full_name: Option<String>,
    pub avatar_url: Option<String>,
    pub onboarding_complete: Option<bool>,
    pub stripe_customer_id: Option<String>,
    pub subscription_id: Option<String>,
    pub subscription_status: Option<String>,
    pub subscription_period_end: Option<i64>,
    pub total_tokens: Option<i64>,
    pub tokens_remaining: Option<i64>,
    pub tokens_used: Option<i64>,
    pub total_purchases: Option<i32>,
    pub total_spent_cents: Option<i64>,
    pub last_purchase_at: Option<String>,
}

impl Profile {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Default::default()
        }
    }

    /// Apply the non-empty fields of an update in place.
    pub fn apply(&mut self, update: &ProfileUpdate) {
        if let Some(username) = &update.username {
            self.username = Some(username.clone());
        }
        if let Some(full_name) = &update.full_name {
            self.full_name = Some(full_name.clone());
        }
        if let Some(avatar_url) = &update.avatar_url {
            self.avatar_url = Some(avatar_url.clone());
        }
        if let Some(onboarding_complete) = update.onboarding_complete {
            self.onboarding_complete = Some(onboarding_complete);
        }
    }

    pub fn has_completed_onboarding(&self) -> bool {
        self.onboarding_complete.unwrap_or(false)
    }
}

/// Writable subset of [`Profile`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProfileUpdate {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub full_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub avatar_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub onboarding_complete: Option<bool>,
}

impl ProfileUpdate {
    pub fn is_empty(&self) -> bool {
        self.username.is_none()
            && self.full_name.is_none()
            && self.avatar_url.is_none()
            && self.onboarding_complete.is_none()
    }
}

/// Optimistic write that has not been confirmed by the backend yet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingChange {
    pub id: Uuid,
    pub entity: String,
    pub fields: serde_json::Value,
    pub created_at: EpochMillis,
}

// ============================================================================
// BILLING
// ============================================================================

/// Saved card attached to the user's Stripe customer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentMethod {
    pub id: String,
    pub user_id: String,
    pub stripe_customer_id: String,
    pub stripe_payment_method_id: String,
    pub card_brand: String,
    pub card_last4: String,
    pub card_exp_month: i32,
    pub card_exp_year: i32,
    pub is_default: bool,
    #[serde(default = "default_true")]
    pub is_active: bool,
    #[serde(default)]
    pub last_used_at: Option<String>,
}

fn default_true() -> bool {
    true
}

/// Subscription status as reported by the payment provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionInfo {
    pub subscription_id: String,
    pub customer_id: String,
    pub status: String,
    pub current_period_end: i64,
    pub price_id: String,
}

impl SubscriptionInfo {
    /// Active and trialing subscriptions grant access.
    pub fn is_active(&self) -> bool {
        matches!(self.status.as_str(), "active" | "trialing")
    }
}

/// Token balance of the account.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenBalance {
    pub total_tokens: i64,
    pub tokens_remaining: i64,
    pub tokens_used: i64,
}

impl TokenBalance {
    /// Record local consumption. Remaining never drops below zero.
    pub fn spend(&mut self, amount: i64) {
        let spent = amount.min(self.tokens_remaining).max(0);
        self.tokens_remaining -= spent;
        self.tokens_used += spent;
    }
}

/// Completed or pending token purchase.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Purchase {
    pub id: String,
    pub user_id: String,
    pub stripe_payment_intent_id: String,
    pub stripe_price_id: String,
    #[serde(default)]
    pub package_id: Option<String>,
    pub amount_paid: i64,
    pub currency: String,
    #[serde(default)]
    pub tokens_purchased: Option<i64>,
    pub status: String,
    #[serde(default)]
    pub completed_at: Option<String>,
    #[serde(default)]
    pub created_at: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Package {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub stripe_product_id: String,
    #[serde(default)]
    pub features: Option<serde_json::Value>,
    pub is_active: bool,
    pub sort_order: i32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackagePrice {
    pub id: String,
    pub package_id: String,
    pub stripe_price_id: String,
    pub amount_cents: i64,
    pub currency: String,
    pub interval_type: String,
    pub interval_count: i32,
    pub token_amount: i64,
    pub is_active: bool,
}

/// Purchasable package with its prices.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PackageWithPrices {
    pub package: Package,
    pub prices: Vec<PackagePrice>,
}

// ============================================================================
// LOCAL SETTINGS
// ============================================================================

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Theme {
    Light,
    Dark,
    #[default]
    System,
}

/// Device-local preferences. Never sent to the backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UserSettings {
    pub theme: Theme,
    pub language: String,
    pub notifications_enabled: bool,
    pub analytics_opt_in: bool,
}

impl Default for UserSettings {
    fn default() -> Self {
        Self {
            theme: Theme::System,
            language: "en".to_string(),
            notifications_enabled: true,
            analytics_opt_in: false,
        }
    }
}
