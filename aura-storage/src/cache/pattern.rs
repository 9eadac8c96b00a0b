//! Key patterns for bulk invalidation.

use aura_core::{CacheError, CacheKey, UserId};
use regex::Regex;

/// Matches cache keys for [`super::CacheManager::invalidate_pattern`].
#[derive(Debug, Clone)]
pub enum Pattern {
    /// Key contains the string.
    Substring(String),
    /// Key ends with the string.
    Suffix(String),
    /// Key matches the regular expression.
    Regex(Regex),
}

impl Pattern {
    pub fn substring(s: impl Into<String>) -> Self {
        Self::Substring(s.into())
    }

    pub fn regex(pattern: &str) -> Result<Self, CacheError> {
        Regex::new(pattern)
            .map(Self::Regex)
            .map_err(|e| CacheError::InvalidPattern {
                pattern: pattern.to_string(),
                reason: e.to_string(),
            })
    }

    /// Every key belonging to `user_id`.
    ///
    /// Anchored on the `:<user_id>` suffix so `u1` does not also purge `u10`.
    pub fn user_scope(user_id: &UserId) -> Self {
        Self::Suffix(CacheKey::user_suffix(user_id))
    }

    pub fn matches(&self, key: &str) -> bool {
        match self {
            Self::Substring(s) => key.contains(s.as_str()),
            Self::Suffix(s) => key.ends_with(s.as_str()),
            Self::Regex(re) => re.is_match(key),
        }
    }
}

impl From<&str> for Pattern {
    fn from(value: &str) -> Self {
        Self::Substring(value.to_string())
    }
}

impl From<String> for Pattern {
    fn from(value: String) -> Self {
        Self::Substring(value)
    }
}

impl From<Regex> for Pattern {
    fn from(value: Regex) -> Self {
        Self::Regex(value)
    }
}
