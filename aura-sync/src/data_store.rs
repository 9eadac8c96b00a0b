//! Profile data and the offline write path.
//!
//! Reads are cache-first through [`CachedResource`]. Writes record a pending
//! change, call the backend, and on failure park the request in the
//! [`OfflineQueue`] before returning the error to the caller. Queued writes
//! belong to the user who made them and only replay while that user is
//! signed in.

use std::sync::Arc;
use std::time::Duration;

use aura_core::{
    AuraConfig, AuraError, AuthError, CacheKey, Profile, ProfileUpdate, RemoteError, SharedClock,
    UserId,
};
use aura_storage::{
    CacheManager, DrainReport, EnqueueOutcome, OfflineQueue, PersistScheduler, SharedPersistence,
};
use serde_json::{json, Value};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

use crate::collaborators::{call_typed, ops, SharedRemote};
use crate::resource::{CachedResource, ResourceState};
use crate::session::SessionStore;

pub struct DataStore {
    profile: CachedResource<Option<Profile>>,
    session: Arc<SessionStore>,
    remote: SharedRemote,
    queue: Arc<OfflineQueue>,
    persistence: Option<SharedPersistence>,
    persist: PersistScheduler,
}

impl DataStore {
    pub fn new(
        config: &AuraConfig,
        cache: Arc<CacheManager>,
        session: Arc<SessionStore>,
        remote: SharedRemote,
        persistence: Option<SharedPersistence>,
        clock: SharedClock,
    ) -> Arc<Self> {
        let profile = CachedResource::new(
            "profile",
            cache,
            session.clone(),
            clock.clone(),
            config.ttl.profile(),
            config.sync.background_refresh_threshold,
        );
        Arc::new(Self {
            profile,
            session,
            remote,
            queue: Arc::new(OfflineQueue::new(&config.queue, clock)),
            persistence,
            persist: PersistScheduler::debounce(config.queue.persist_debounce()),
        })
    }

    /// The loaded profile. `None` also when the user has no profile yet.
    pub fn current_profile(&self) -> Option<Profile> {
        self.profile.value().flatten()
    }

    pub fn profile_state(&self) -> ResourceState<Option<Profile>> {
        self.profile.snapshot()
    }

    pub fn subscribe_profile(&self) -> watch::Receiver<ResourceState<Option<Profile>>> {
        self.profile.subscribe()
    }

    pub fn is_loading(&self) -> bool {
        self.profile.is_loading()
    }

    pub fn error(&self) -> Option<String> {
        self.profile.error()
    }

    pub fn queue(&self) -> &OfflineQueue {
        &self.queue
    }

    pub fn profile_key(&self) -> Option<CacheKey> {
        self.session.user_id().map(|uid| CacheKey::profile(&uid))
    }

    /// Load the signed-in user's profile.
    ///
    /// Returns `None` when signed out, when the user has no profile, and when
    /// the fetch failed with nothing cached.
    pub async fn load_profile(&self, force: bool) -> Option<Profile> {
        let user_id = self.session.user_id()?;
        let key = CacheKey::profile(&user_id);
        let remote = self.remote.clone();
        self.profile
            .load(&key, force, || async move {
                call_typed::<Option<Profile>>(
                    remote.as_ref(),
                    ops::GET_USER_PROFILE,
                    json!({ "user_id": user_id }),
                )
                .await
            })
            .await
            .flatten()
    }

    /// Refresh the profile if it is close to expiring.
    pub async fn refresh_profile_in_background(&self) -> bool {
        let Some(user_id) = self.session.user_id() else {
            return false;
        };
        let key = CacheKey::profile(&user_id);
        let remote = self.remote.clone();
        self.profile
            .refresh_in_background(&key, || async move {
                call_typed::<Option<Profile>>(
                    remote.as_ref(),
                    ops::GET_USER_PROFILE,
                    json!({ "user_id": user_id }),
                )
                .await
            })
            .await
    }

    pub async fn update_user_profile(&self, update: ProfileUpdate) -> Result<Profile, AuraError> {
        self.write_profile(ops::UPDATE_USER_PROFILE, update).await
    }

    /// Create the profile row, typically right after sign-up.
    pub async fn create_user_profile(&self, fields: ProfileUpdate) -> Result<Profile, AuraError> {
        self.write_profile(ops::CREATE_USER_PROFILE, fields).await
    }

    async fn write_profile(
        &self,
        operation: &'static str,
        update: ProfileUpdate,
    ) -> Result<Profile, AuraError> {
        let user_id = self.session.user_id().ok_or(AuthError::NotAuthenticated)?;
        let params = profile_params(&user_id, &update)?;
        let pending = self.session.record_pending_change(operation, params.clone());

        match call_typed::<Profile>(self.remote.as_ref(), operation, params.clone()).await {
            Ok(profile) => {
                if self.session.user_id().as_ref() == Some(&user_id) {
                    self.profile
                        .store(&CacheKey::profile(&user_id), Some(profile.clone()));
                }
                self.session.resolve_pending_change(pending);
                tracing::info!(user_id = %user_id, operation, "Profile saved");
                Ok(profile)
            }
            Err(e) => {
                tracing::warn!(user_id = %user_id, operation, error = %e, "Profile write failed, queueing for retry");
                self.enqueue(&user_id, operation, params);
                self.profile.set_error(e.to_string());
                Err(e.into())
            }
        }
    }

    fn enqueue(&self, user_id: &UserId, operation: &str, params: Value) {
        match self.queue.enqueue_for(Some(user_id.as_str()), operation, params) {
            EnqueueOutcome::Queued(id) => {
                tracing::debug!(%id, operation, "Write queued");
                self.schedule_persist();
            }
            EnqueueOutcome::Coalesced(id) => {
                tracing::debug!(%id, operation, "Identical write already queued");
            }
            EnqueueOutcome::Suppressed => {}
        }
    }

    /// Replay the signed-in user's queued writes once.
    ///
    /// Skipped while offline. Writes of other users stay queued. Pending
    /// changes are resolved for writes that went through or were dropped, and
    /// the profile is reloaded when anything went through.
    pub async fn process_offline_queue(&self) -> DrainReport {
        if self.queue.is_empty() {
            return DrainReport::default();
        }
        if !self.session.is_online() {
            tracing::debug!(queued = self.queue.len(), "Offline, not draining queue");
            return DrainReport {
                skipped: true,
                remaining: self.queue.len(),
                ..Default::default()
            };
        }

        let owner = self.session.user_id();
        let remote = self.remote.clone();
        let session = self.session.clone();
        let report = self
            .queue
            .drain_for(owner.as_ref().map(UserId::as_str), |operation, params| {
                let remote = remote.clone();
                let session = session.clone();
                async move {
                    remote.call(&operation, params.clone()).await?;
                    session.resolve_matching(&operation, &params);
                    Ok::<(), RemoteError>(())
                }
            })
            .await;

        if report.skipped {
            return report;
        }
        for dropped in &report.exhausted {
            self.session.resolve_matching(&dropped.operation, &dropped.params);
        }
        tracing::info!(
            succeeded = report.succeeded,
            failed = report.failed,
            exhausted = report.exhausted.len(),
            held = report.held,
            remaining = report.remaining,
            "Offline queue drained"
        );
        self.schedule_persist();
        if report.succeeded > 0 {
            self.load_profile(true).await;
        }
        report
    }

    /// Drain the queue on every tick until `shutdown` flips to true.
    pub fn spawn_sync_loop(
        self: &Arc<Self>,
        every: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let store = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + every, every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if !store.queue.is_empty() {
                            store.process_offline_queue().await;
                        }
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
            store.flush().await;
            tracing::debug!("Offline sync loop stopped");
        })
    }

    /// Load the persisted queue.
    pub async fn restore_queue(&self) -> usize {
        match self.persistence.as_ref() {
            Some(persistence) => self.queue.load_from(persistence.as_ref()).await,
            None => 0,
        }
    }

    fn schedule_persist(&self) {
        let Some(persistence) = self.persistence.clone() else {
            return;
        };
        let queue = self.queue.clone();
        self.persist.schedule(move || async move {
            queue.save_to(persistence.as_ref()).await;
        });
    }

    /// Write the queue now, bypassing the debounce.
    pub async fn flush(&self) {
        self.persist.cancel();
        if let Some(persistence) = self.persistence.as_ref() {
            self.queue.save_to(persistence.as_ref()).await;
        }
    }

    /// Forget the held profile. Queued writes stay queued for their owner.
    pub fn reset(&self) {
        self.profile.reset();
    }
}

fn profile_params(user_id: &UserId, update: &ProfileUpdate) -> Result<Value, AuraError> {
    let mut params = serde_json::to_value(update).map_err(|e| RemoteError::InvalidResponse {
        operation: "profile_params".to_string(),
        reason: e.to_string(),
    })?;
    if let Value::Object(map) = &mut params {
        map.insert("user_id".to_string(), json!(user_id));
    }
    Ok(params)
}
