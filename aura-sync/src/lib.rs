//! Aura Sync - Session, Domain Stores and Coordination
//!
//! The client-side services built on `aura-storage`:
//!
//! - [`session::SessionStore`]: authenticated session and token refresh
//! - [`data_store::DataStore`], [`settings::SettingsStore`],
//!   [`account::AccountStore`], [`stripe::StripeContextStore`]: cached
//!   domain data
//! - [`coordinator::StoreCoordinator`]: initialization, refresh and purge
//!   across the stores
//! - [`auth::AuthOrchestrator`]: sign-in flow and app gating
//!
//! [`AppServices`] wires them together for one app session.

pub mod account;
pub mod auth;
pub mod collaborators;
pub mod coordinator;
pub mod data_store;
pub mod resource;
pub mod session;
pub mod settings;
pub mod stripe;
pub mod telemetry;

pub use account::AccountStore;
pub use auth::{AuthEvent, AuthOrchestrator, AuthPhase, AuthState};
pub use collaborators::{
    call_typed, ops, FileTokenStore, RemoteCall, SecureTokenStore, SharedRemote, SharedTokenStore,
};
pub use coordinator::{CoordinatorState, StoreCoordinator, SyncError, SyncStats};
pub use data_store::DataStore;
pub use resource::{CachedResource, ResourceState};
pub use session::{SessionEvent, SessionState, SessionStore};
pub use settings::SettingsStore;
pub use stripe::StripeContextStore;
pub use telemetry::{init_logging, TelemetryError};

use std::sync::{Arc, Mutex, PoisonError};

use aura_core::{AuraConfig, AuraResult, SharedClock, SystemClock};
use aura_storage::{open_persistence, CacheManager, SharedPersistence};
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Every service of one app session, constructed once and shared.
pub struct AppServices {
    pub config: AuraConfig,
    pub clock: SharedClock,
    pub cache: Arc<CacheManager>,
    pub persistence: Option<SharedPersistence>,
    pub session: Arc<SessionStore>,
    pub settings: Arc<SettingsStore>,
    pub data: Arc<DataStore>,
    pub account: Arc<AccountStore>,
    pub stripe: Arc<StripeContextStore>,
    pub coordinator: Arc<StoreCoordinator>,
    pub auth: Arc<AuthOrchestrator>,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl AppServices {
    pub fn new(
        config: AuraConfig,
        remote: SharedRemote,
        token_store: SharedTokenStore,
        persistence: Option<SharedPersistence>,
        clock: SharedClock,
    ) -> Self {
        let cache = Arc::new(CacheManager::new(&config.cache, clock.clone()));
        let session = SessionStore::new(
            &config.session,
            token_store,
            remote.clone(),
            persistence.clone(),
            clock.clone(),
        );
        let settings = Arc::new(SettingsStore::new(
            &config.sync,
            remote.clone(),
            persistence.clone(),
        ));
        let data = DataStore::new(
            &config,
            cache.clone(),
            session.clone(),
            remote.clone(),
            persistence.clone(),
            clock.clone(),
        );
        let account = Arc::new(AccountStore::new(
            &config,
            cache.clone(),
            session.clone(),
            remote.clone(),
            clock.clone(),
        ));
        let stripe = Arc::new(StripeContextStore::new(
            &config,
            cache.clone(),
            session.clone(),
            data.clone(),
            remote.clone(),
            clock.clone(),
        ));
        let coordinator = StoreCoordinator::new(
            aura_core::constants::COORDINATOR_ERROR_LOG_SIZE,
            cache.clone(),
            session.clone(),
            data.clone(),
            account.clone(),
            stripe.clone(),
            clock.clone(),
        );
        let auth = AuthOrchestrator::new(session.clone(), data.clone(), coordinator.clone(), remote);
        let (shutdown, _) = watch::channel(false);

        Self {
            config,
            clock,
            cache,
            persistence,
            session,
            settings,
            data,
            account,
            stripe,
            coordinator,
            auth,
            shutdown,
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Validate `config`, open its storage backend and build the services
    /// on the system clock.
    pub fn open(
        config: AuraConfig,
        remote: SharedRemote,
        token_store: SharedTokenStore,
    ) -> AuraResult<Self> {
        config.validate()?;
        let clock = SystemClock::shared();
        let persistence = open_persistence(&config.storage, clock.clone())?;
        Ok(Self::new(config, remote, token_store, Some(persistence), clock))
    }

    /// Load persisted state, start background work and restore the session.
    ///
    /// Returns whether a previous session was restored. A rejected restore
    /// leaves the app signed out rather than failing startup.
    pub async fn start(&self) -> AuraResult<bool> {
        let cache_persistence = self.cache_persistence();
        if let Some(persistence) = cache_persistence.as_deref() {
            self.cache.load_from(persistence).await;
        }
        self.session.restore().await;
        self.settings.load().await;
        let queued = self.data.restore_queue().await;
        tracing::info!(
            cached = self.cache.len(),
            queued,
            "Persisted state loaded"
        );

        let sync = &self.config.sync;
        let handles = [
            self.cache.spawn_maintenance(
                cache_persistence,
                self.config.cache.cleanup_interval(),
                self.config.cache.persist_interval(),
                self.shutdown.subscribe(),
            ),
            self.data
                .spawn_sync_loop(sync.offline_sync_interval(), self.shutdown.subscribe()),
            self.coordinator
                .spawn_auth_listener(sync.auth_settle(), self.shutdown.subscribe()),
            self.coordinator
                .spawn_periodic_refresh(sync.smart_refresh_interval(), self.shutdown.subscribe()),
            self.auth.spawn_session_listener(self.shutdown.subscribe()),
        ];
        self.tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend(handles);

        match self.auth.start().await {
            Ok(restored) => Ok(restored),
            Err(e) if e.is_auth() => {
                tracing::warn!(error = %e, "Starting signed out");
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    /// Stop background work and write everything pending to storage.
    pub async fn shutdown(&self) {
        self.shutdown.send_replace(true);
        let tasks: Vec<JoinHandle<()>> = self
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        for task in tasks {
            if let Err(e) = task.await {
                tracing::warn!(error = %e, "Background task ended abnormally");
            }
        }
        self.session.flush().await;
        self.settings.flush().await;
        self.data.flush().await;
        tracing::info!("Services shut down");
    }

    fn cache_persistence(&self) -> Option<SharedPersistence> {
        self.persistence
            .clone()
            .filter(|_| self.config.cache.persist)
    }
}
