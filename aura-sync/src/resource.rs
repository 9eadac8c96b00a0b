//! Cache-first loading shared by the domain stores.
//!
//! A [`CachedResource`] owns one observable slot (say, the current profile)
//! backed by one cache key at a time. Reads go to the cache first and fall
//! back to a remote fetch; a failed fetch keeps whatever was shown before.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use aura_core::{CacheKey, EpochMillis, RemoteError, SharedClock};
use aura_storage::CacheManager;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::watch;

use crate::session::SessionStore;

/// Observable state of one resource.
#[derive(Debug, Clone, PartialEq)]
pub struct ResourceState<T> {
    pub value: Option<T>,
    /// Set only while fetching with nothing to show.
    pub loading: bool,
    pub error: Option<String>,
    pub last_updated: Option<EpochMillis>,
}

impl<T> Default for ResourceState<T> {
    fn default() -> Self {
        Self {
            value: None,
            loading: false,
            error: None,
            last_updated: None,
        }
    }
}

pub struct CachedResource<T> {
    label: &'static str,
    cache: Arc<CacheManager>,
    session: Arc<SessionStore>,
    clock: SharedClock,
    ttl: Duration,
    refresh_threshold: f64,
    state: watch::Sender<ResourceState<T>>,
    gate: tokio::sync::Mutex<()>,
}

impl<T> CachedResource<T>
where
    T: Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    pub fn new(
        label: &'static str,
        cache: Arc<CacheManager>,
        session: Arc<SessionStore>,
        clock: SharedClock,
        ttl: Duration,
        refresh_threshold: f64,
    ) -> Self {
        let (state, _) = watch::channel(ResourceState::default());
        Self {
            label,
            cache,
            session,
            clock,
            ttl,
            refresh_threshold,
            state,
            gate: tokio::sync::Mutex::new(()),
        }
    }

    pub fn label(&self) -> &'static str {
        self.label
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn snapshot(&self) -> ResourceState<T> {
        self.state.borrow().clone()
    }

    pub fn value(&self) -> Option<T> {
        self.state.borrow().value.clone()
    }

    pub fn is_loading(&self) -> bool {
        self.state.borrow().loading
    }

    pub fn error(&self) -> Option<String> {
        self.state.borrow().error.clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<ResourceState<T>> {
        self.state.subscribe()
    }

    /// Whether `key` still belongs to the signed-in user.
    fn is_current(&self, key: &CacheKey) -> bool {
        match key.user_id() {
            Some(owner) => self.session.user_id().as_ref() == Some(owner),
            None => true,
        }
    }

    fn cached(&self, key: &CacheKey) -> Option<T> {
        let value = self.cache.get::<T>(key)?;
        let value_for_state = value.clone();
        self.state.send_if_modified(|state| {
            if state.value.is_some() && state.error.is_none() && !state.loading {
                return false;
            }
            state.value = Some(value_for_state);
            state.loading = false;
            state.error = None;
            true
        });
        Some(value)
    }

    /// Cache-first read.
    ///
    /// With `force` the cache is bypassed. Concurrent cold loads of the same
    /// resource share one fetch. On failure the previous value is returned,
    /// or `None` when there was none.
    pub async fn load<F, Fut>(&self, key: &CacheKey, force: bool, fetch: F) -> Option<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, RemoteError>>,
    {
        if !force {
            if let Some(value) = self.cached(key) {
                return Some(value);
            }
        }

        let _flight = self.gate.lock().await;
        if !force {
            if let Some(value) = self.cached(key) {
                return Some(value);
            }
        }

        self.state.send_if_modified(|state| {
            if state.value.is_some() {
                return false;
            }
            state.loading = true;
            true
        });

        let result = fetch().await;

        if !self.is_current(key) {
            tracing::debug!(resource = self.label, key = %key, "Discarding result for a previous user");
            self.state.send_if_modified(|state| std::mem::replace(&mut state.loading, false));
            return None;
        }

        match result {
            Ok(value) => {
                self.store(key, value.clone());
                Some(value)
            }
            Err(e) => {
                tracing::warn!(resource = self.label, key = %key, error = %e, "Load failed, keeping previous value");
                let message = e.to_string();
                self.state.send_modify(|state| {
                    state.loading = false;
                    state.error = Some(message);
                });
                self.value()
            }
        }
    }

    /// Refresh when the entry is missing or past the refresh threshold.
    ///
    /// Returns whether a fetch ran.
    pub async fn refresh_in_background<F, Fut>(&self, key: &CacheKey, fetch: F) -> bool
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, RemoteError>>,
    {
        if self.is_fresh_enough(key) {
            tracing::trace!(resource = self.label, key = %key, "Still fresh, skipping refresh");
            return false;
        }
        self.load(key, true, fetch).await;
        true
    }

    /// Whether less than the refresh threshold of the TTL has elapsed.
    pub fn is_fresh_enough(&self, key: &CacheKey) -> bool {
        self.cache
            .entry_info(key)
            .is_some_and(|info| info.is_fresh_within(self.refresh_threshold))
    }

    /// Write a confirmed value to the cache and the state.
    pub fn store(&self, key: &CacheKey, value: T) {
        if let Err(e) = self.cache.set(key, &value, Some(self.ttl)) {
            tracing::warn!(resource = self.label, key = %key, error = %e, "Failed to cache value");
        }
        let now = self.clock.now_millis();
        self.state.send_replace(ResourceState {
            value: Some(value),
            loading: false,
            error: None,
            last_updated: Some(now),
        });
    }

    /// Adjust the held value in place and write it back to the cache.
    ///
    /// Does nothing when no value is held.
    pub fn update_local(&self, key: &CacheKey, f: impl FnOnce(&mut T)) -> Option<T> {
        let mut value = self.value()?;
        f(&mut value);
        self.store(key, value.clone());
        Some(value)
    }

    pub fn set_error(&self, message: impl Into<String>) {
        let message = message.into();
        self.state.send_modify(|state| state.error = Some(message));
    }

    pub fn invalidate(&self, key: &CacheKey) {
        self.cache.delete(key);
    }

    /// Forget the held value. The cache is left alone.
    pub fn reset(&self) {
        self.state.send_replace(ResourceState::default());
    }
}

/// Builds the resources of one store from shared parts.
#[derive(Clone)]
pub(crate) struct ResourceFactory {
    cache: Arc<CacheManager>,
    session: Arc<SessionStore>,
    clock: SharedClock,
    refresh_threshold: f64,
}

impl ResourceFactory {
    pub fn new(
        cache: Arc<CacheManager>,
        session: Arc<SessionStore>,
        clock: SharedClock,
        refresh_threshold: f64,
    ) -> Self {
        Self {
            cache,
            session,
            clock,
            refresh_threshold,
        }
    }

    pub fn build<T>(&self, label: &'static str, ttl: Duration) -> CachedResource<T>
    where
        T: Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
    {
        CachedResource::new(
            label,
            self.cache.clone(),
            self.session.clone(),
            self.clock.clone(),
            ttl,
            self.refresh_threshold,
        )
    }
}
