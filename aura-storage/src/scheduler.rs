//! Debounced and throttled persistence writes.
//!
//! Stores call [`PersistScheduler::schedule`] after every mutation. In
//! debounce mode only the last call within the quiet window produces a save
//! (trailing edge). In throttle mode the first call arms a timer and later
//! calls ride along until it fires. Either way the save closure is evaluated
//! when the timer fires, so it sees the latest state.

use std::future::Future;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::task::JoinHandle;

/// How bursts of `schedule` calls are collapsed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PersistMode {
    /// Restart the timer on every call.
    Debounce,
    /// Keep the first timer; ignore calls while it is armed.
    Throttle,
}

/// Schedules deferred persistence writes.
#[derive(Debug)]
pub struct PersistScheduler {
    delay: Duration,
    mode: PersistMode,
    pending: Mutex<Option<JoinHandle<()>>>,
}

impl PersistScheduler {
    pub fn debounce(delay: Duration) -> Self {
        Self::new(delay, PersistMode::Debounce)
    }

    pub fn throttle(delay: Duration) -> Self {
        Self::new(delay, PersistMode::Throttle)
    }

    pub fn new(delay: Duration, mode: PersistMode) -> Self {
        Self {
            delay,
            mode,
            pending: Mutex::new(None),
        }
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }

    /// Arm the timer. `save` is invoked once the timer fires.
    ///
    /// Only the wait is cancellable: once the timer fires, the save runs to
    /// completion in its own task even if another call arrives meanwhile.
    pub fn schedule<F, Fut>(&self, save: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let handle = match Handle::try_current() {
            Ok(handle) => handle,
            Err(_) => {
                tracing::warn!("No async runtime available, persistence write skipped");
                return;
            }
        };

        let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(existing) = pending.as_ref() {
            if !existing.is_finished() {
                match self.mode {
                    PersistMode::Throttle => return,
                    PersistMode::Debounce => existing.abort(),
                }
            }
        }

        let delay = self.delay;
        let spawner = handle.clone();
        *pending = Some(handle.spawn(async move {
            tokio::time::sleep(delay).await;
            spawner.spawn(save());
        }));
    }

    /// Drop any armed timer without saving.
    pub fn cancel(&self) {
        let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(handle) = pending.take() {
            handle.abort();
        }
    }

    /// Whether a timer is armed and has not fired yet.
    pub fn is_pending(&self) -> bool {
        let pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        pending.as_ref().is_some_and(|h| !h.is_finished())
    }
}

impl Drop for PersistScheduler {
    fn drop(&mut self) {
        self.cancel();
    }
}
