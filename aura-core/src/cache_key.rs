//! Cache key namespace.
//!
//! Keys render as `<domain>:<user_id>` for user-scoped data and as the bare
//! domain for global data. Every user-scoped key ends with `:<user_id>`, which
//! is what per-user invalidation on logout matches against. New cache key
//! producers must go through [`CacheKey`] so that suffix stays intact.
//!
//! The rendered strings are also the keys of persisted cache snapshots, so
//! the domain prefixes below must not change.

use crate::identity::UserId;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Data domain a cache key belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheDomain {
    Profile,
    PaymentMethods,
    Subscription,
    StripeCustomer,
    TokenBalance,
    Purchases,
    PackagesWithPrices,
}

impl CacheDomain {
    pub const ALL: [CacheDomain; 7] = [
        CacheDomain::Profile,
        CacheDomain::PaymentMethods,
        CacheDomain::Subscription,
        CacheDomain::StripeCustomer,
        CacheDomain::TokenBalance,
        CacheDomain::Purchases,
        CacheDomain::PackagesWithPrices,
    ];

    pub fn prefix(self) -> &'static str {
        match self {
            CacheDomain::Profile => "profile",
            CacheDomain::PaymentMethods => "payment_methods",
            CacheDomain::Subscription => "subscription",
            CacheDomain::StripeCustomer => "stripe_customer",
            CacheDomain::TokenBalance => "token_balance",
            CacheDomain::Purchases => "purchases",
            CacheDomain::PackagesWithPrices => "packages_with_prices",
        }
    }

    /// Whether keys of this domain carry a user id.
    pub fn is_user_scoped(self) -> bool {
        !matches!(self, CacheDomain::PackagesWithPrices)
    }

    fn from_prefix(prefix: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|d| d.prefix() == prefix)
    }
}

/// A key into the cache manager.
///
/// The inner data is private: a user-scoped key can only be built with a user
/// id and a global key only for a global domain.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    domain: CacheDomain,
    user_id: Option<UserId>,
    rendered: String,
}

impl CacheKey {
    /// Key for a user-scoped domain.
    ///
    /// Returns `None` for global domains.
    pub fn for_user(domain: CacheDomain, user_id: &UserId) -> Option<Self> {
        if !domain.is_user_scoped() {
            return None;
        }
        Some(Self {
            domain,
            user_id: Some(user_id.clone()),
            rendered: format!("{}:{}", domain.prefix(), user_id),
        })
    }

    pub fn profile(user_id: &UserId) -> Self {
        Self::user_scoped(CacheDomain::Profile, user_id)
    }

    pub fn payment_methods(user_id: &UserId) -> Self {
        Self::user_scoped(CacheDomain::PaymentMethods, user_id)
    }

    pub fn subscription(user_id: &UserId) -> Self {
        Self::user_scoped(CacheDomain::Subscription, user_id)
    }

    pub fn stripe_customer(user_id: &UserId) -> Self {
        Self::user_scoped(CacheDomain::StripeCustomer, user_id)
    }

    pub fn token_balance(user_id: &UserId) -> Self {
        Self::user_scoped(CacheDomain::TokenBalance, user_id)
    }

    pub fn purchases(user_id: &UserId) -> Self {
        Self::user_scoped(CacheDomain::Purchases, user_id)
    }

    /// The global package catalogue key.
    pub fn packages_with_prices() -> Self {
        Self {
            domain: CacheDomain::PackagesWithPrices,
            user_id: None,
            rendered: CacheDomain::PackagesWithPrices.prefix().to_string(),
        }
    }

    fn user_scoped(domain: CacheDomain, user_id: &UserId) -> Self {
        Self {
            domain,
            user_id: Some(user_id.clone()),
            rendered: format!("{}:{}", domain.prefix(), user_id),
        }
    }

    /// Suffix shared by every key of the given user.
    pub fn user_suffix(user_id: &UserId) -> String {
        format!(":{}", user_id)
    }

    /// Parse a rendered key back into its parts.
    ///
    /// Returns `None` for unknown domains, for user-scoped domains without a
    /// user id, and for global domains with one.
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.split_once(':') {
            Some((prefix, user)) => {
                let domain = CacheDomain::from_prefix(prefix)?;
                if user.is_empty() {
                    return None;
                }
                Self::for_user(domain, &UserId::new(user))
            }
            None => {
                let domain = CacheDomain::from_prefix(raw)?;
                if domain.is_user_scoped() {
                    return None;
                }
                Some(Self::packages_with_prices())
            }
        }
    }

    pub fn domain(&self) -> CacheDomain {
        self.domain
    }

    pub fn user_id(&self) -> Option<&UserId> {
        self.user_id.as_ref()
    }

    pub fn as_str(&self) -> &str {
        &self.rendered
    }

    /// Whether this key belongs to the given user.
    pub fn belongs_to(&self, user_id: &UserId) -> bool {
        self.user_id.as_ref() == Some(user_id)
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.rendered)
    }
}

impl AsRef<str> for CacheKey {
    fn as_ref(&self) -> &str {
        &self.rendered
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_rendered_keys_match_persisted_names() {
        let uid = UserId::new("u1");
        assert_eq!(CacheKey::profile(&uid).as_str(), "profile:u1");
        assert_eq!(CacheKey::payment_methods(&uid).as_str(), "payment_methods:u1");
        assert_eq!(CacheKey::subscription(&uid).as_str(), "subscription:u1");
        assert_eq!(CacheKey::stripe_customer(&uid).as_str(), "stripe_customer:u1");
        assert_eq!(CacheKey::token_balance(&uid).as_str(), "token_balance:u1");
        assert_eq!(CacheKey::purchases(&uid).as_str(), "purchases:u1");
        assert_eq!(CacheKey::packages_with_prices().as_str(), "packages_with_prices");
    }

    #[test]
    fn test_user_keys_share_suffix() {
        let uid = UserId::new("abc-123");
        let suffix = CacheKey::user_suffix(&uid);
        for domain in CacheDomain::ALL.into_iter().filter(|d| d.is_user_scoped()) {
            let key = CacheKey::for_user(domain, &uid).unwrap();
            assert!(key.as_str().ends_with(&suffix), "{key} lacks {suffix}");
            assert!(key.belongs_to(&uid));
        }
    }

    #[test]
    fn test_global_domain_rejects_user() {
        let uid = UserId::new("u1");
        assert!(CacheKey::for_user(CacheDomain::PackagesWithPrices, &uid).is_none());
        assert!(CacheKey::packages_with_prices().user_id().is_none());
    }

    #[test]
    fn test_parse() {
        let key = CacheKey::parse("token_balance:u9").unwrap();
        assert_eq!(key.domain(), CacheDomain::TokenBalance);
        assert_eq!(key.user_id(), Some(&UserId::new("u9")));

        assert_eq!(
            CacheKey::parse("packages_with_prices"),
            Some(CacheKey::packages_with_prices())
        );
        assert!(CacheKey::parse("profile").is_none());
        assert!(CacheKey::parse("profile:").is_none());
        assert!(CacheKey::parse("unknown:u1").is_none());
        assert!(CacheKey::parse("packages_with_prices:u1").is_none());
    }

    proptest! {
        #[test]
        fn prop_user_keys_parse_back_and_stay_scoped(
            id in "[a-z0-9-]{1,36}",
            other in "[a-z0-9-]{1,36}",
            domain in proptest::sample::select(CacheDomain::ALL.to_vec()),
        ) {
            let uid = UserId::new(id);
            let Some(key) = CacheKey::for_user(domain, &uid) else {
                prop_assert!(!domain.is_user_scoped());
                return Ok(());
            };
            prop_assert_eq!(CacheKey::parse(key.as_str()), Some(key.clone()));
            prop_assert!(key.belongs_to(&uid));
            prop_assert_eq!(key.belongs_to(&UserId::new(other.clone())), other == uid.as_str());
        }
    }
}
