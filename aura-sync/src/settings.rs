//! Device-local preferences.
//!
//! Settings never reach the backend; they are persisted under the
//! `app_config` store id with a debounced save.

use aura_core::constants::STORE_APP_CONFIG;
use aura_core::{AuraError, SyncSettings, Theme, UserSettings};
use aura_storage::{KeyValuePersistence, PersistScheduler, SharedPersistence};
use serde_json::json;
use tokio::sync::watch;

use crate::collaborators::{call_typed, ops, SharedRemote};

pub struct SettingsStore {
    state: watch::Sender<UserSettings>,
    remote: SharedRemote,
    persistence: Option<SharedPersistence>,
    persist: PersistScheduler,
}

impl SettingsStore {
    pub fn new(
        sync: &SyncSettings,
        remote: SharedRemote,
        persistence: Option<SharedPersistence>,
    ) -> Self {
        let (state, _) = watch::channel(UserSettings::default());
        Self {
            state,
            remote,
            persistence,
            persist: PersistScheduler::debounce(sync.settings_debounce()),
        }
    }

    pub fn settings(&self) -> UserSettings {
        self.state.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<UserSettings> {
        self.state.subscribe()
    }

    /// Apply `f` and schedule a save when anything changed.
    pub fn update_settings(&self, f: impl FnOnce(&mut UserSettings)) -> UserSettings {
        let changed = self.state.send_if_modified(|settings| {
            let before = settings.clone();
            f(settings);
            *settings != before
        });
        if changed {
            self.schedule_persist();
        }
        self.settings()
    }

    pub fn set_theme(&self, theme: Theme) -> UserSettings {
        self.update_settings(|s| s.theme = theme)
    }

    pub fn reset_to_defaults(&self) -> UserSettings {
        self.update_settings(|s| *s = UserSettings::default())
    }

    /// Load persisted settings. Missing or unreadable data keeps defaults.
    pub async fn load(&self) -> UserSettings {
        let Some(persistence) = self.persistence.as_ref() else {
            return self.settings();
        };
        match persistence.get(STORE_APP_CONFIG).await {
            Ok(Some(value)) => match serde_json::from_value::<UserSettings>(value) {
                Ok(settings) => {
                    self.state.send_replace(settings);
                }
                Err(e) => tracing::warn!(error = %e, "Persisted settings are unreadable, using defaults"),
            },
            Ok(None) => {}
            Err(e) => tracing::warn!(error = %e, "Failed to load settings"),
        }
        self.settings()
    }

    /// Ask the backend whether `username` is free. Never cached.
    pub async fn check_username_availability(&self, username: &str) -> Result<bool, AuraError> {
        let username = username.trim();
        if username.is_empty() {
            return Ok(false);
        }
        let available = call_typed::<bool>(
            self.remote.as_ref(),
            ops::CHECK_USERNAME_AVAILABILITY,
            json!({ "username": username }),
        )
        .await?;
        tracing::debug!(username, available, "Username availability checked");
        Ok(available)
    }

    fn schedule_persist(&self) {
        let Some(persistence) = self.persistence.clone() else {
            return;
        };
        let rx = self.state.subscribe();
        self.persist.schedule(move || async move {
            save_settings(persistence.as_ref(), &rx).await;
        });
    }

    /// Write the settings now, bypassing the debounce.
    pub async fn flush(&self) {
        self.persist.cancel();
        if let Some(persistence) = self.persistence.as_ref() {
            save_settings(persistence.as_ref(), &self.state.subscribe()).await;
        }
    }
}

async fn save_settings(persistence: &dyn KeyValuePersistence, rx: &watch::Receiver<UserSettings>) {
    let settings = rx.borrow().clone();
    let value = match serde_json::to_value(&settings) {
        Ok(value) => value,
        Err(e) => {
            tracing::warn!(error = %e, "Failed to serialize settings");
            return;
        }
    };
    if let Err(e) = persistence.set(STORE_APP_CONFIG, value).await {
        tracing::warn!(error = %e, "Failed to persist settings");
    }
}

impl std::fmt::Debug for SettingsStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SettingsStore")
            .field("settings", &*self.state.borrow())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aura_storage::MemoryKvStore;
    use aura_test_utils::{FailingKvStore, MockRemote};
    use std::sync::Arc;
    use std::time::Duration;

    fn store(kv: Option<SharedPersistence>) -> (SettingsStore, Arc<MockRemote>) {
        let remote = Arc::new(MockRemote::new());
        (
            SettingsStore::new(&SyncSettings::default(), remote.clone(), kv),
            remote,
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_updates_are_saved_after_debounce() {
        let kv = Arc::new(MemoryKvStore::new());
        let (settings, _) = store(Some(kv.clone() as SharedPersistence));

        settings.set_theme(Theme::Dark);
        settings.update_settings(|s| s.language = "de".to_string());
        tokio::time::sleep(Duration::from_secs(4)).await;
        assert_eq!(kv.get(STORE_APP_CONFIG).await.unwrap(), None);

        tokio::time::sleep(Duration::from_secs(2)).await;
        for _ in 0..5 {
            tokio::task::yield_now().await;
        }
        let saved = kv.get(STORE_APP_CONFIG).await.unwrap().unwrap();
        assert_eq!(saved["theme"], json!("dark"));
        assert_eq!(saved["language"], json!("de"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_change_schedules_nothing() {
        let kv = Arc::new(MemoryKvStore::new());
        let (settings, _) = store(Some(kv.clone() as SharedPersistence));
        settings.set_theme(Theme::System);
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(kv.get(STORE_APP_CONFIG).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_load_roundtrip_and_failures() {
        let kv = Arc::new(MemoryKvStore::new());
        let (first, _) = store(Some(kv.clone() as SharedPersistence));
        first.set_theme(Theme::Light);
        first.flush().await;

        let (second, _) = store(Some(kv.clone() as SharedPersistence));
        assert_eq!(second.load().await.theme, Theme::Light);

        kv.set(STORE_APP_CONFIG, json!("garbage")).await.unwrap();
        let (third, _) = store(Some(kv as SharedPersistence));
        assert_eq!(third.load().await, UserSettings::default());

        let (broken, _) = store(Some(Arc::new(FailingKvStore) as SharedPersistence));
        assert_eq!(broken.load().await, UserSettings::default());
        broken.set_theme(Theme::Dark);
        broken.flush().await;
        assert_eq!(broken.settings().theme, Theme::Dark);
    }

    #[tokio::test]
    async fn test_username_check_is_not_cached() {
        let (settings, remote) = store(None);
        remote.respond(ops::CHECK_USERNAME_AVAILABILITY, json!(true));

        assert!(settings.check_username_availability(" alice ").await.unwrap());
        assert!(settings.check_username_availability("alice").await.unwrap());
        assert_eq!(remote.call_count(ops::CHECK_USERNAME_AVAILABILITY), 2);
        assert_eq!(
            remote.last_params(ops::CHECK_USERNAME_AVAILABILITY),
            Some(json!({"username": "alice"}))
        );

        assert!(!settings.check_username_availability("  ").await.unwrap());
        assert_eq!(remote.call_count(ops::CHECK_USERNAME_AVAILABILITY), 2);

        remote.fail(ops::CHECK_USERNAME_AVAILABILITY, "down");
        assert!(settings.check_username_availability("bob").await.is_err());
    }
}
