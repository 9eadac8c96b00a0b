//! Sign-in flow on top of the session store and the coordinator.

use std::sync::Arc;

use aura_core::{AuraResult, AuthError, AuthenticatedSession, Session, User, UserId};
use serde_json::json;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;

use crate::collaborators::{call_typed, ops, SharedRemote};
use crate::coordinator::StoreCoordinator;
use crate::data_store::DataStore;
use crate::session::{SessionEvent, SessionStore};

const EVENT_CAPACITY: usize = 32;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum AuthPhase {
    #[default]
    Idle,
    RestoringSession,
    LoadingProfile,
    InitializingPayments,
    Ready,
    SignedOut,
    Failed(String),
}

impl AuthPhase {
    /// Whether the profile load has finished for the current sign-in.
    fn profile_settled(&self) -> bool {
        matches!(self, Self::InitializingPayments | Self::Ready)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthEvent {
    PhaseChanged(AuthPhase),
    SignedIn { user_id: UserId },
    Ready { user_id: UserId },
    SignedOut { reason: Option<String> },
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AuthState {
    pub phase: AuthPhase,
    pub user_id: Option<UserId>,
    pub error: Option<String>,
}

pub struct AuthOrchestrator {
    state: watch::Sender<AuthState>,
    events: broadcast::Sender<AuthEvent>,
    session: Arc<SessionStore>,
    data: Arc<DataStore>,
    coordinator: Arc<StoreCoordinator>,
    remote: SharedRemote,
}

impl AuthOrchestrator {
    pub fn new(
        session: Arc<SessionStore>,
        data: Arc<DataStore>,
        coordinator: Arc<StoreCoordinator>,
        remote: SharedRemote,
    ) -> Arc<Self> {
        let (state, _) = watch::channel(AuthState::default());
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Arc::new(Self {
            state,
            events,
            session,
            data,
            coordinator,
            remote,
        })
    }

    pub fn state(&self) -> AuthState {
        self.state.borrow().clone()
    }

    pub fn phase(&self) -> AuthPhase {
        self.state.borrow().phase.clone()
    }

    pub fn watch_state(&self) -> watch::Receiver<AuthState> {
        self.state.subscribe()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<AuthEvent> {
        self.events.subscribe()
    }

    pub fn is_authenticated(&self) -> bool {
        self.session.is_authenticated()
    }

    pub fn is_ready(&self) -> bool {
        self.phase() == AuthPhase::Ready && self.is_authenticated()
    }

    /// Signed in, profile loaded, and onboarding not finished.
    ///
    /// A user without any profile row also needs onboarding.
    pub fn needs_onboarding(&self) -> bool {
        self.is_authenticated()
            && self.phase().profile_settled()
            && !self
                .data
                .current_profile()
                .is_some_and(|p| p.has_completed_onboarding())
    }

    pub fn can_access_app(&self) -> bool {
        self.is_ready() && !self.needs_onboarding()
    }

    /// Restore the previous session from the secure token store.
    ///
    /// Returns `Ok(false)` when there is nothing to restore. A rejected
    /// restore ends the session and clears the stored tokens.
    pub async fn start(&self) -> AuraResult<bool> {
        self.set_phase(AuthPhase::RestoringSession, None);

        let tokens = match self.session.get_stored_tokens().await {
            Ok(Some(tokens)) => tokens,
            Ok(None) => {
                tracing::debug!("No stored tokens, starting signed out");
                self.set_phase(AuthPhase::SignedOut, None);
                return Ok(false);
            }
            Err(e) => return Err(self.restore_failed(e.to_string()).await.into()),
        };

        let restored = call_typed::<AuthenticatedSession>(
            self.remote.as_ref(),
            ops::RESTORE_SESSION,
            json!({
                "access_token": tokens.access_token,
                "refresh_token": tokens.refresh_token,
            }),
        )
        .await;

        match restored {
            Ok(restored) => {
                self.sign_in(restored.user, restored.session).await?;
                Ok(true)
            }
            Err(e) => Err(self.restore_failed(e.to_string()).await.into()),
        }
    }

    async fn restore_failed(&self, reason: String) -> AuthError {
        tracing::warn!(error = %reason, "Session restore failed");
        self.session.set_unauthenticated(Some(reason.clone())).await;
        self.set_phase(AuthPhase::SignedOut, Some(reason.clone()));
        self.emit(AuthEvent::SignedOut {
            reason: Some(reason.clone()),
        });
        AuthError::RestoreFailed { reason }
    }

    /// Establish a session and bring the stores up for the user.
    pub async fn sign_in(&self, user: User, session: Session) -> AuraResult<()> {
        let user_id = user.id.clone();
        if let Err(e) = self.session.set_authenticated(user, session).await {
            self.set_phase(AuthPhase::Failed(e.to_string()), Some(e.to_string()));
            return Err(e.into());
        }
        self.state.send_modify(|state| state.user_id = Some(user_id.clone()));
        self.emit(AuthEvent::SignedIn {
            user_id: user_id.clone(),
        });

        self.set_phase(AuthPhase::LoadingProfile, None);
        self.data.load_profile(false).await;
        if !self.still_signed_in_as(&user_id) {
            return Ok(());
        }

        self.set_phase(AuthPhase::InitializingPayments, None);
        if let Err(e) = self.coordinator.initialize().await {
            self.set_phase(AuthPhase::Failed(e.to_string()), Some(e.to_string()));
            return Err(e);
        }
        if !self.still_signed_in_as(&user_id) {
            return Ok(());
        }

        self.set_phase(AuthPhase::Ready, None);
        tracing::info!(user_id = %user_id, "Signed in");
        self.emit(AuthEvent::Ready { user_id });
        Ok(())
    }

    fn still_signed_in_as(&self, user_id: &UserId) -> bool {
        let current = self.session.user_id();
        if current.as_ref() == Some(user_id) {
            return true;
        }
        tracing::debug!(user_id = %user_id, current = ?current, "Sign-in superseded");
        false
    }

    pub async fn sign_out(&self) {
        let user_id = self.session.user_id();
        self.session.set_unauthenticated(None).await;
        self.coordinator.reset();
        self.set_phase(AuthPhase::SignedOut, None);
        self.state.send_modify(|state| state.user_id = None);
        tracing::info!(user_id = ?user_id, "Signed out");
        self.emit(AuthEvent::SignedOut { reason: None });
    }

    /// Turn session expiry into a sign-out until `shutdown` flips to true.
    pub fn spawn_session_listener(
        self: &Arc<Self>,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let orchestrator = Arc::clone(self);
        let mut events = self.session.events();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    event = events.recv() => match event {
                        Ok(SessionEvent::Expired { reason }) => orchestrator.on_expired(reason),
                        Ok(_) => {}
                        Err(RecvError::Lagged(skipped)) => {
                            tracing::warn!(skipped, "Auth listener lagged behind session events");
                        }
                        Err(RecvError::Closed) => break,
                    },
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
        })
    }

    fn on_expired(&self, reason: String) {
        tracing::info!(reason = %reason, "Session expired");
        self.coordinator.reset();
        self.set_phase(AuthPhase::SignedOut, Some(reason.clone()));
        self.state.send_modify(|state| state.user_id = None);
        self.emit(AuthEvent::SignedOut {
            reason: Some(reason),
        });
    }

    fn set_phase(&self, phase: AuthPhase, error: Option<String>) {
        let changed = self.state.send_if_modified(|state| {
            let changed = state.phase != phase || state.error != error;
            state.phase = phase.clone();
            state.error = error;
            changed
        });
        if changed {
            tracing::debug!(phase = ?phase, "Auth phase changed");
            self.emit(AuthEvent::PhaseChanged(phase));
        }
    }

    fn emit(&self, event: AuthEvent) {
        // No receivers is fine.
        let _ = self.events.send(event);
    }
}
