//! Authenticated session state and token lifecycle.
//!
//! The store moves between unauthenticated and authenticated. While
//! authenticated it keeps a refresh timer that fires `refresh_margin` before
//! the access token expires. Tokens go to the
//! [`SecureTokenStore`](crate::collaborators::SecureTokenStore); the
//! remaining state is persisted under the `session` store id without them.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;

use aura_core::constants::STORE_SESSION;
use aura_core::{
    duration_millis, new_entity_id, AuthError, AuthTokens, AuthenticatedSession, EpochMillis,
    PendingChange, Session, SessionSettings, SharedClock, User, UserId,
};
use aura_storage::{PersistScheduler, SharedPersistence};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::collaborators::{call_typed, ops, SharedRemote, SharedTokenStore};

const EVENT_CAPACITY: usize = 32;

/// Observable session state.
///
/// `is_authenticated` implies `user` and `session` are both set. The tokens
/// and the backend session never enter the persisted snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionState {
    pub user: Option<User>,
    #[serde(skip)]
    pub session: Option<Session>,
    pub is_authenticated: bool,
    pub token_expires_at: Option<EpochMillis>,
    #[serde(skip)]
    pub tokens: Option<AuthTokens>,
    pub last_activity: EpochMillis,
    pub is_online: bool,
    pub pending_changes: Vec<PendingChange>,
    pub error: Option<String>,
}

impl Default for SessionState {
    fn default() -> Self {
        Self {
            user: None,
            session: None,
            is_authenticated: false,
            token_expires_at: None,
            tokens: None,
            last_activity: 0,
            is_online: true,
            pending_changes: Vec::new(),
            error: None,
        }
    }
}

impl SessionState {
    pub fn user_id(&self) -> Option<UserId> {
        self.user.as_ref().map(|u| u.id.clone())
    }

    pub fn access_token(&self) -> Option<&str> {
        self.tokens.as_ref().map(|t| t.access_token.as_str())
    }

    pub fn refresh_token(&self) -> Option<&str> {
        self.tokens.as_ref().map(|t| t.refresh_token.as_str())
    }
}

/// Session transitions, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    SignedIn { user_id: UserId },
    Refreshed { expires_at: EpochMillis },
    /// Token refresh failed and the session was dropped.
    Expired { reason: String },
    SignedOut { reason: Option<String> },
}

/// Owner of the authenticated session.
pub struct SessionStore {
    state: watch::Sender<SessionState>,
    events: broadcast::Sender<SessionEvent>,
    token_store: SharedTokenStore,
    remote: SharedRemote,
    persistence: Option<SharedPersistence>,
    clock: SharedClock,
    refresh_margin: Duration,
    refresh_task: Mutex<Option<JoinHandle<()>>>,
    /// Bumped on every sign-in and sign-out. A refresh that started under an
    /// older generation must not touch the session.
    generation: AtomicU64,
    persist: PersistScheduler,
    this: Weak<SessionStore>,
}

impl SessionStore {
    pub fn new(
        settings: &SessionSettings,
        token_store: SharedTokenStore,
        remote: SharedRemote,
        persistence: Option<SharedPersistence>,
        clock: SharedClock,
    ) -> Arc<Self> {
        let initial = SessionState {
            last_activity: clock.now_millis(),
            ..Default::default()
        };
        let (state, _) = watch::channel(initial);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Arc::new_cyclic(|this| Self {
            state,
            events,
            token_store,
            remote,
            persistence,
            clock,
            refresh_margin: settings.refresh_margin(),
            refresh_task: Mutex::new(None),
            generation: AtomicU64::new(0),
            persist: PersistScheduler::debounce(settings.persist_debounce()),
            this: this.clone(),
        })
    }

    /// Current state.
    pub fn snapshot(&self) -> SessionState {
        self.state.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    pub fn events(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    pub fn is_authenticated(&self) -> bool {
        self.state.borrow().is_authenticated
    }

    pub fn current_user(&self) -> Option<User> {
        self.state.borrow().user.clone()
    }

    pub fn user_id(&self) -> Option<UserId> {
        self.state.borrow().user_id()
    }

    fn emit(&self, event: SessionEvent) {
        let _ = self.events.send(event);
    }

    /// Enter the authenticated state and arm the refresh timer.
    ///
    /// Tokens are written to the secure store first; if that fails the state
    /// is left unchanged.
    pub async fn set_authenticated(&self, user: User, session: Session) -> Result<(), AuthError> {
        let user_id = user.id.clone();
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        self.apply_session(user, session, generation).await?;
        tracing::info!(user_id = %user_id, "Session authenticated");
        self.emit(SessionEvent::SignedIn { user_id });
        Ok(())
    }

    fn is_current(&self, generation: u64) -> bool {
        self.generation.load(Ordering::SeqCst) == generation
    }

    async fn apply_session(
        &self,
        user: User,
        session: Session,
        generation: u64,
    ) -> Result<(), AuthError> {
        let tokens = session.tokens();
        self.token_store.store(&tokens).await?;
        if !self.is_current(generation) {
            // Signed out while the tokens were being written.
            if let Err(e) = self.token_store.clear().await {
                tracing::warn!(error = %e, "Failed to clear superseded tokens");
            }
            return Err(AuthError::SessionChanged);
        }

        let expires_at = session.expires_at_millis();
        let now = self.clock.now_millis();
        self.state.send_modify(|state| {
            state.user = Some(user);
            state.session = Some(session);
            state.is_authenticated = true;
            state.token_expires_at = Some(expires_at);
            state.tokens = Some(tokens);
            state.last_activity = now;
            state.error = None;
        });
        self.schedule_refresh(expires_at);
        self.schedule_persist();
        Ok(())
    }

    /// Drop the session.
    ///
    /// The refresh timer is cancelled before anything else so it cannot
    /// resurrect the session. Token-store failures are logged, never returned.
    pub async fn set_unauthenticated(&self, error: Option<String>) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        self.cancel_refresh();

        if let Err(e) = self.token_store.clear().await {
            tracing::warn!(error = %e, "Failed to clear secure token store");
        }

        let was_authenticated = self.is_authenticated();
        let is_online = self.state.borrow().is_online;
        self.state.send_replace(SessionState {
            is_online,
            last_activity: self.clock.now_millis(),
            error: error.clone(),
            ..Default::default()
        });
        self.schedule_persist();

        if was_authenticated {
            tracing::info!(reason = ?error, "Session ended");
        }
        self.emit(SessionEvent::SignedOut { reason: error });
    }

    /// Whether the secure token store holds tokens.
    pub async fn has_valid_session(&self) -> Result<bool, AuthError> {
        self.token_store.has_tokens().await
    }

    pub async fn get_stored_tokens(&self) -> Result<Option<AuthTokens>, AuthError> {
        self.token_store.get().await
    }

    /// Exchange the refresh token for a new session.
    ///
    /// On failure the session is dropped and [`SessionEvent::Expired`] is sent.
    /// A result arriving after sign-out or a new sign-in is discarded with
    /// [`AuthError::SessionChanged`].
    pub async fn refresh_now(&self) -> Result<(), AuthError> {
        let generation = self.generation.load(Ordering::SeqCst);
        let refresh_token = match self.state.borrow().refresh_token() {
            Some(token) => token.to_string(),
            None => return Err(AuthError::NotAuthenticated),
        };

        let result = call_typed::<AuthenticatedSession>(
            self.remote.as_ref(),
            ops::REFRESH_SESSION,
            json!({ "refresh_token": refresh_token }),
        )
        .await
        .map_err(|e| AuthError::RefreshFailed {
            reason: e.to_string(),
        });

        if !self.is_current(generation) {
            tracing::debug!("Session changed during refresh, discarding result");
            return Err(AuthError::SessionChanged);
        }

        let result = match result {
            Ok(refreshed) => {
                self.apply_session(refreshed.user, refreshed.session, generation)
                    .await
            }
            Err(e) => Err(e),
        };

        match result {
            Ok(()) => {
                let expires_at = self.state.borrow().token_expires_at.unwrap_or_default();
                tracing::debug!(expires_at, "Session refreshed");
                self.emit(SessionEvent::Refreshed { expires_at });
                Ok(())
            }
            Err(AuthError::SessionChanged) => Err(AuthError::SessionChanged),
            Err(e) => {
                let reason = e.to_string();
                tracing::warn!(error = %reason, "Session refresh failed, signing out");
                self.set_unauthenticated(Some(reason.clone())).await;
                self.emit(SessionEvent::Expired { reason });
                Err(e)
            }
        }
    }

    /// Delay until the refresh should run, or zero when it is already due.
    pub fn refresh_delay(&self, expires_at: EpochMillis) -> Duration {
        let due = expires_at
            .saturating_sub(self.clock.now_millis())
            .saturating_sub(duration_millis(self.refresh_margin));
        Duration::from_millis(u64::try_from(due).unwrap_or(0))
    }

    fn schedule_refresh(&self, expires_at: EpochMillis) {
        let delay = self.refresh_delay(expires_at);
        let this = self.this.clone();

        let mut slot = self
            .refresh_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(previous) = slot.take() {
            previous.abort();
        }
        tracing::debug!(delay_ms = delay.as_millis() as u64, "Token refresh scheduled");
        *slot = Some(tokio::spawn(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            let Some(store) = this.upgrade() else {
                return;
            };
            // Detach so the refresh path can reschedule or cancel without
            // aborting this task mid-flight.
            store.detach_refresh();
            let _ = store.refresh_now().await;
        }));
    }

    fn detach_refresh(&self) {
        self.refresh_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }

    fn cancel_refresh(&self) {
        if let Some(handle) = self
            .refresh_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            handle.abort();
        }
    }

    pub fn has_refresh_scheduled(&self) -> bool {
        self.refresh_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|h| !h.is_finished())
    }

    pub fn touch_activity(&self) {
        let now = self.clock.now_millis();
        self.state.send_modify(|state| state.last_activity = now);
        self.schedule_persist();
    }

    pub fn set_online(&self, online: bool) {
        let changed = self.state.send_if_modified(|state| {
            let changed = state.is_online != online;
            state.is_online = online;
            changed
        });
        if changed {
            tracing::info!(online, "Connectivity changed");
            self.schedule_persist();
        }
    }

    pub fn is_online(&self) -> bool {
        self.state.borrow().is_online
    }

    /// Record an optimistic write that has not been confirmed yet.
    pub fn record_pending_change(&self, entity: impl Into<String>, fields: Value) -> Uuid {
        let change = PendingChange {
            id: new_entity_id(),
            entity: entity.into(),
            fields,
            created_at: self.clock.now_millis(),
        };
        let id = change.id;
        self.state.send_modify(|state| state.pending_changes.push(change));
        self.schedule_persist();
        id
    }

    /// Forget a pending change once the write is confirmed.
    pub fn resolve_pending_change(&self, id: Uuid) -> bool {
        let removed = self.state.send_if_modified(|state| {
            let before = state.pending_changes.len();
            state.pending_changes.retain(|c| c.id != id);
            state.pending_changes.len() != before
        });
        if removed {
            self.schedule_persist();
        }
        removed
    }

    /// Forget every pending change recorded for exactly this write.
    pub fn resolve_matching(&self, entity: &str, fields: &Value) -> usize {
        let mut removed = 0;
        self.state.send_if_modified(|state| {
            let before = state.pending_changes.len();
            state
                .pending_changes
                .retain(|c| c.entity != entity || &c.fields != fields);
            removed = before - state.pending_changes.len();
            removed > 0
        });
        if removed > 0 {
            self.schedule_persist();
        }
        removed
    }

    pub fn pending_changes(&self) -> Vec<PendingChange> {
        self.state.borrow().pending_changes.clone()
    }

    /// Load the persisted snapshot.
    ///
    /// Only pending changes and activity are taken from it; authentication
    /// always comes from the token store.
    pub async fn restore(&self) -> bool {
        let Some(persistence) = self.persistence.as_ref() else {
            return false;
        };
        let value = match persistence.get(STORE_SESSION).await {
            Ok(Some(value)) => value,
            Ok(None) => return false,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to load persisted session");
                return false;
            }
        };
        let persisted: SessionState = match serde_json::from_value(value) {
            Ok(state) => state,
            Err(e) => {
                tracing::warn!(error = %e, "Persisted session is unreadable");
                return false;
            }
        };
        self.state.send_modify(|state| {
            for change in persisted.pending_changes {
                if !state.pending_changes.iter().any(|c| c.id == change.id) {
                    state.pending_changes.push(change);
                }
            }
            state.last_activity = state.last_activity.max(persisted.last_activity);
        });
        true
    }

    fn schedule_persist(&self) {
        let Some(persistence) = self.persistence.clone() else {
            return;
        };
        let rx = self.state.subscribe();
        self.persist.schedule(move || async move {
            save_snapshot(persistence.as_ref(), &rx).await;
        });
    }

    /// Write the snapshot now, bypassing the debounce.
    pub async fn flush(&self) {
        self.persist.cancel();
        if let Some(persistence) = self.persistence.as_ref() {
            save_snapshot(persistence.as_ref(), &self.state.subscribe()).await;
        }
    }
}

async fn save_snapshot(
    persistence: &dyn aura_storage::KeyValuePersistence,
    rx: &watch::Receiver<SessionState>,
) {
    let snapshot = rx.borrow().clone();
    let value = match serde_json::to_value(&snapshot) {
        Ok(value) => value,
        Err(e) => {
            tracing::warn!(error = %e, "Failed to serialize session");
            return;
        }
    };
    if let Err(e) = persistence.set(STORE_SESSION, value).await {
        tracing::warn!(error = %e, "Failed to persist session");
    }
}

impl Drop for SessionStore {
    fn drop(&mut self) {
        self.cancel_refresh();
    }
}
