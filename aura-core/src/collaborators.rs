//! Interfaces to the host process: remote calls and secure token storage.
//!
//! Implementations live with the host (or in `aura-test-utils` for tests);
//! the stores only see these traits.

use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::entities::AuthTokens;
use crate::error::{AuthError, RemoteError};

/// Names of the remote operations the stores invoke.
pub mod ops {
    pub const GET_USER_PROFILE: &str = "get_user_profile";
    pub const UPDATE_USER_PROFILE: &str = "update_user_profile";
    pub const CREATE_USER_PROFILE: &str = "create_user_profile";
    pub const CHECK_USERNAME_AVAILABILITY: &str = "check_username_availability";
    pub const REFRESH_SESSION: &str = "refresh_session";
    pub const RESTORE_SESSION: &str = "restore_session";
    pub const INITIALIZE_STRIPE_CUSTOMER: &str = "initialize_stripe_customer";
    pub const GET_STORED_PAYMENT_METHODS: &str = "get_stored_payment_methods";
    pub const GET_SUBSCRIPTION_STATUS: &str = "get_subscription_status";
    pub const SET_DEFAULT_PAYMENT_METHOD: &str = "set_default_payment_method_integrated";
    pub const DELETE_PAYMENT_METHOD: &str = "delete_payment_method_integrated";
    pub const GET_TOKEN_BALANCE: &str = "get_token_balance";
    pub const GET_USER_PURCHASES: &str = "get_user_purchases";
    pub const GET_PACKAGES_WITH_PRICES: &str = "get_packages_with_prices";
}

/// Invokes a named operation on the backend.
///
/// Any call may fail with a transport or remote error at any time.
#[async_trait]
pub trait RemoteCall: Send + Sync {
    async fn call(&self, name: &str, params: Value) -> Result<Value, RemoteError>;
}

pub type SharedRemote = Arc<dyn RemoteCall>;

/// Call and decode the response.
pub async fn call_typed<T: DeserializeOwned>(
    remote: &dyn RemoteCall,
    name: &str,
    params: Value,
) -> Result<T, RemoteError> {
    let value = remote.call(name, params).await?;
    serde_json::from_value(value).map_err(|e| RemoteError::InvalidResponse {
        operation: name.to_string(),
        reason: e.to_string(),
    })
}

/// OS-protected storage for the access and refresh tokens.
#[async_trait]
pub trait SecureTokenStore: Send + Sync {
    async fn store(&self, tokens: &AuthTokens) -> Result<(), AuthError>;

    /// `Ok(None)` when no tokens are stored.
    async fn get(&self) -> Result<Option<AuthTokens>, AuthError>;

    async fn clear(&self) -> Result<(), AuthError>;

    async fn has_tokens(&self) -> Result<bool, AuthError> {
        Ok(self.get().await?.is_some())
    }
}

pub type SharedTokenStore = Arc<dyn SecureTokenStore>;
