//! Offline queue for remote writes that failed.
//!
//! Failed writes are parked here and replayed by [`OfflineQueue::drain`].
//! Each item gets at most `max_retries` attempts; an item whose failure count
//! reaches that bound is dropped and surfaced as [`QueueEvent::Exhausted`].
//!
//! Items may carry an owner. [`OfflineQueue::drain_for`] only replays items
//! of the given owner (and unowned ones); the rest stay parked untouched.
//!
//! Repeated enqueues of the same `(owner, operation, params)` do not grow the
//! queue. Failures are also tallied per request across exhausted items, and
//! once an identical request has failed `suppress_threshold` times within
//! `failure_window` further enqueues are refused. The tally forgets requests
//! whose last failure is older than the window and keeps at most
//! `failure_history_max` of them.

use std::collections::{HashMap, VecDeque};
use std::fmt::Display;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};

use aura_core::constants::STORE_OFFLINE_QUEUE;
use aura_core::{
    duration_millis, new_entity_id, operation_fingerprint, EpochMillis, QueueError,
    QueueSettings, SharedClock,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::persistence::KeyValuePersistence;

const EVENT_CAPACITY: usize = 64;

/// A parked remote write.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OfflineQueueItem {
    pub id: Uuid,
    /// User the write was made for. `None` replays for anyone.
    #[serde(default)]
    pub owner: Option<String>,
    pub operation: String,
    pub params: Value,
    /// When the item was first queued, epoch milliseconds.
    pub timestamp: EpochMillis,
    /// Failed attempts so far. Only ever increases.
    pub retry_count: u32,
}

impl OfflineQueueItem {
    pub fn fingerprint(&self) -> String {
        operation_fingerprint(&self.operation, &self.params)
    }

    fn runs_for(&self, owner: Option<&str>) -> bool {
        self.owner.is_none() || self.owner.as_deref() == owner
    }
}

/// Result of [`OfflineQueue::enqueue`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    /// A new item was added.
    Queued(Uuid),
    /// An identical request is already pending; nothing was added.
    Coalesced(Uuid),
    /// The identical request has failed too often; nothing was added.
    Suppressed,
}

/// Lifecycle notifications, in the order they happened.
#[derive(Debug, Clone, PartialEq)]
pub enum QueueEvent {
    Enqueued { id: Uuid, operation: String },
    Suppressed { operation: String },
    Succeeded { id: Uuid, operation: String },
    RetryScheduled { id: Uuid, operation: String, retry_count: u32 },
    Exhausted { id: Uuid, operation: String, attempts: u32 },
}

impl QueueEvent {
    /// The error to surface for terminal failures.
    pub fn as_error(&self) -> Option<QueueError> {
        match self {
            Self::Exhausted {
                operation,
                attempts,
                ..
            } => Some(QueueError::Exhausted {
                operation: operation.clone(),
                attempts: *attempts,
            }),
            Self::Suppressed { operation } => Some(QueueError::Suppressed {
                operation: operation.clone(),
            }),
            _ => None,
        }
    }
}

/// Outcome of one drain pass.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DrainReport {
    /// Items the executor was invoked for.
    pub attempted: usize,
    pub succeeded: usize,
    /// Failed attempts plus items dropped without an attempt.
    pub failed: usize,
    /// Items that failed and stay queued.
    pub retried: usize,
    /// Items removed because they ran out of attempts.
    pub exhausted: Vec<OfflineQueueItem>,
    /// Items left alone because they belong to another owner.
    pub held: usize,
    /// Queue length after the pass.
    pub remaining: usize,
    /// Another drain was already running; nothing was done.
    pub skipped: bool,
}

/// Serializable queue contents.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueueSnapshot {
    pub items: Vec<OfflineQueueItem>,
    /// Recent failures per request fingerprint.
    #[serde(default)]
    pub failures: HashMap<String, FailureRecord>,
}

/// Failure tally of one request fingerprint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureRecord {
    pub count: u32,
    pub last_failed_at: EpochMillis,
}

#[derive(Debug, Default)]
struct QueueInner {
    items: VecDeque<OfflineQueueItem>,
    failures: HashMap<String, FailureRecord>,
}

impl QueueInner {
    fn remove(&mut self, id: Uuid) -> Option<OfflineQueueItem> {
        let index = self.items.iter().position(|i| i.id == id)?;
        self.items.remove(index)
    }

    fn record_failure(&mut self, fingerprint: String, now: EpochMillis) {
        let record = self.failures.entry(fingerprint).or_insert(FailureRecord {
            count: 0,
            last_failed_at: now,
        });
        record.count += 1;
        record.last_failed_at = now;
    }

    /// Forget failures older than `window` and trim to the `max` most recent.
    fn prune_failures(&mut self, now: EpochMillis, window: EpochMillis, max: usize) {
        self.failures
            .retain(|_, record| now.saturating_sub(record.last_failed_at) < window);
        if self.failures.len() > max {
            let mut by_age: Vec<(EpochMillis, String)> = self
                .failures
                .iter()
                .map(|(fingerprint, record)| (record.last_failed_at, fingerprint.clone()))
                .collect();
            by_age.sort();
            let excess = self.failures.len() - max;
            for (_, fingerprint) in by_age.into_iter().take(excess) {
                self.failures.remove(&fingerprint);
            }
        }
    }
}

/// Resets the draining flag even when the drain future is dropped.
struct DrainGuard<'a>(&'a AtomicBool);

impl Drop for DrainGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// FIFO queue of failed remote writes.
#[derive(Debug)]
pub struct OfflineQueue {
    inner: Mutex<QueueInner>,
    max_retries: u32,
    suppress_threshold: u32,
    failure_window: EpochMillis,
    failure_history_max: usize,
    clock: SharedClock,
    events: broadcast::Sender<QueueEvent>,
    draining: AtomicBool,
}

impl OfflineQueue {
    pub fn new(settings: &QueueSettings, clock: SharedClock) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: Mutex::new(QueueInner::default()),
            max_retries: settings.max_retries,
            suppress_threshold: settings.suppress_threshold,
            failure_window: duration_millis(settings.failure_window()),
            failure_history_max: settings.failure_history_max,
            clock,
            events,
            draining: AtomicBool::new(false),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, QueueInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, event: QueueEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    fn prune(&self, inner: &mut QueueInner) {
        inner.prune_failures(
            self.clock.now_millis(),
            self.failure_window,
            self.failure_history_max,
        );
    }

    /// Park a failed write that any owner may replay.
    pub fn enqueue(&self, operation: impl Into<String>, params: Value) -> EnqueueOutcome {
        self.enqueue_for(None, operation, params)
    }

    /// Park a failed write made for `owner`.
    pub fn enqueue_for(
        &self,
        owner: Option<&str>,
        operation: impl Into<String>,
        params: Value,
    ) -> EnqueueOutcome {
        let operation = operation.into();
        let fingerprint = operation_fingerprint(&operation, &params);

        let outcome = {
            let mut inner = self.lock();
            self.prune(&mut inner);
            let failures = inner.failures.get(&fingerprint).map_or(0, |r| r.count);
            let pending = inner.items.iter().find(|i| {
                i.owner.as_deref() == owner && i.operation == operation && i.params == params
            });

            if failures.max(pending.map(|i| i.retry_count).unwrap_or(0)) >= self.suppress_threshold {
                EnqueueOutcome::Suppressed
            } else if let Some(item) = pending {
                EnqueueOutcome::Coalesced(item.id)
            } else {
                let id = new_entity_id();
                inner.items.push_back(OfflineQueueItem {
                    id,
                    owner: owner.map(str::to_string),
                    operation: operation.clone(),
                    params,
                    timestamp: self.clock.now_millis(),
                    retry_count: 0,
                });
                EnqueueOutcome::Queued(id)
            }
        };

        match outcome {
            EnqueueOutcome::Queued(id) => {
                tracing::info!(operation = %operation, id = %id, "Queued operation for retry");
                self.emit(QueueEvent::Enqueued { id, operation });
            }
            EnqueueOutcome::Coalesced(id) => {
                tracing::debug!(operation = %operation, id = %id, "Identical operation already queued");
            }
            EnqueueOutcome::Suppressed => {
                tracing::warn!(
                    operation = %operation,
                    fingerprint = %fingerprint,
                    "Operation keeps failing, not queueing it again"
                );
                self.emit(QueueEvent::Suppressed { operation });
            }
        }
        outcome
    }

    /// Replay every queued item once, in insertion order.
    ///
    /// Items enqueued while the pass runs wait for the next pass. A second
    /// concurrent call returns immediately with `skipped` set.
    pub async fn drain<F, Fut, E>(&self, execute: F) -> DrainReport
    where
        F: FnMut(String, Value) -> Fut,
        Fut: Future<Output = Result<(), E>>,
        E: Display,
    {
        self.drain_pass(None, execute).await
    }

    /// Like [`drain`](Self::drain), but items owned by anyone other than
    /// `owner` are held without an attempt. `None` replays unowned items only.
    pub async fn drain_for<F, Fut, E>(&self, owner: Option<&str>, execute: F) -> DrainReport
    where
        F: FnMut(String, Value) -> Fut,
        Fut: Future<Output = Result<(), E>>,
        E: Display,
    {
        self.drain_pass(Some(owner), execute).await
    }

    async fn drain_pass<F, Fut, E>(
        &self,
        owner: Option<Option<&str>>,
        mut execute: F,
    ) -> DrainReport
    where
        F: FnMut(String, Value) -> Fut,
        Fut: Future<Output = Result<(), E>>,
        E: Display,
    {
        if self.draining.swap(true, Ordering::AcqRel) {
            return DrainReport {
                skipped: true,
                remaining: self.len(),
                ..Default::default()
            };
        }
        let _guard = DrainGuard(&self.draining);

        let pass: Vec<OfflineQueueItem> = self.lock().items.iter().cloned().collect();
        let mut report = DrainReport::default();

        for item in pass {
            if owner.is_some_and(|owner| !item.runs_for(owner)) {
                report.held += 1;
                continue;
            }
            if item.retry_count >= self.max_retries {
                let dropped = self.lock().remove(item.id);
                if let Some(dropped) = dropped {
                    self.report_exhausted(&mut report, dropped);
                }
                report.failed += 1;
                continue;
            }

            report.attempted += 1;
            let result = execute(item.operation.clone(), item.params.clone()).await;

            match result {
                Ok(()) => {
                    {
                        let mut inner = self.lock();
                        inner.remove(item.id);
                        inner.failures.remove(&item.fingerprint());
                    }
                    report.succeeded += 1;
                    tracing::info!(operation = %item.operation, id = %item.id, "Queued operation succeeded");
                    self.emit(QueueEvent::Succeeded {
                        id: item.id,
                        operation: item.operation,
                    });
                }
                Err(e) => {
                    report.failed += 1;
                    let exhausted = {
                        let mut inner = self.lock();
                        inner.record_failure(item.fingerprint(), self.clock.now_millis());
                        self.prune(&mut inner);
                        let Some(queued) = inner.items.iter_mut().find(|i| i.id == item.id) else {
                            // Cleared while the attempt was in flight.
                            continue;
                        };
                        queued.retry_count += 1;
                        let retry_count = queued.retry_count;
                        if retry_count >= self.max_retries {
                            inner.remove(item.id)
                        } else {
                            drop(inner);
                            report.retried += 1;
                            tracing::debug!(
                                operation = %item.operation,
                                retry_count,
                                error = %e,
                                "Queued operation failed, will retry"
                            );
                            self.emit(QueueEvent::RetryScheduled {
                                id: item.id,
                                operation: item.operation.clone(),
                                retry_count,
                            });
                            None
                        }
                    };
                    if let Some(dropped) = exhausted {
                        tracing::warn!(error = %e, "Last attempt for queued operation failed");
                        self.report_exhausted(&mut report, dropped);
                    }
                }
            }
        }

        report.remaining = self.len();
        report
    }

    fn report_exhausted(&self, report: &mut DrainReport, item: OfflineQueueItem) {
        tracing::warn!(
            operation = %item.operation,
            id = %item.id,
            attempts = item.retry_count,
            "Dropping queued operation after exhausting retries"
        );
        self.emit(QueueEvent::Exhausted {
            id: item.id,
            operation: item.operation.clone(),
            attempts: item.retry_count,
        });
        report.exhausted.push(item);
    }

    pub fn len(&self) -> usize {
        self.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_draining(&self) -> bool {
        self.draining.load(Ordering::Acquire)
    }

    /// Queued items in insertion order.
    pub fn items(&self) -> Vec<OfflineQueueItem> {
        self.lock().items.iter().cloned().collect()
    }

    /// Drop every item and the failure history.
    pub fn clear(&self) {
        let mut inner = self.lock();
        inner.items.clear();
        inner.failures.clear();
    }

    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.events.subscribe()
    }

    pub fn snapshot(&self) -> QueueSnapshot {
        let inner = self.lock();
        QueueSnapshot {
            items: inner.items.iter().cloned().collect(),
            failures: inner.failures.clone(),
        }
    }

    /// Replace the contents with a snapshot. Returns the item count.
    pub fn restore(&self, snapshot: QueueSnapshot) -> usize {
        let mut inner = self.lock();
        inner.items = snapshot.items.into();
        inner.failures = snapshot.failures;
        self.prune(&mut inner);
        inner.items.len()
    }

    /// Load persisted items. Failures are logged and leave the queue as is.
    pub async fn load_from(&self, persistence: &dyn KeyValuePersistence) -> usize {
        match persistence.get(STORE_OFFLINE_QUEUE).await {
            Ok(Some(value)) => match serde_json::from_value::<QueueSnapshot>(value) {
                Ok(snapshot) => {
                    let count = self.restore(snapshot);
                    tracing::info!(items = count, "Loaded persisted offline queue");
                    count
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Persisted offline queue is unreadable");
                    0
                }
            },
            Ok(None) => 0,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to load offline queue");
                0
            }
        }
    }

    /// Persist the queue. Failures are logged and swallowed.
    pub async fn save_to(&self, persistence: &dyn KeyValuePersistence) -> bool {
        let value = match serde_json::to_value(self.snapshot()) {
            Ok(value) => value,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to serialize offline queue");
                return false;
            }
        };
        match persistence.set(STORE_OFFLINE_QUEUE, value).await {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to persist offline queue");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::MemoryKvStore;
    use aura_core::ManualClock;
    use serde_json::json;
    use std::sync::Arc;

    fn queue() -> OfflineQueue {
        OfflineQueue::new(&QueueSettings::default(), ManualClock::new(0))
    }

    async fn drain_failing(queue: &OfflineQueue) -> DrainReport {
        queue
            .drain(|_, _| async { Err::<(), _>("offline") })
            .await
    }

    #[tokio::test]
    async fn test_enqueue_and_drain_success() {
        let queue = queue();
        let mut events = queue.subscribe();
        let outcome = queue.enqueue("update_user_profile", json!({"username": "a"}));
        assert!(matches!(outcome, EnqueueOutcome::Queued(_)));

        let mut seen = Vec::new();
        let report = queue
            .drain(|op, params| {
                seen.push((op, params));
                async { Ok::<(), String>(()) }
            })
            .await;

        assert_eq!(report.attempted, 1);
        assert_eq!(report.succeeded, 1);
        assert_eq!(report.remaining, 0);
        assert_eq!(seen, vec![("update_user_profile".to_string(), json!({"username": "a"}))]);
        assert!(matches!(events.try_recv(), Ok(QueueEvent::Enqueued { .. })));
        assert!(matches!(events.try_recv(), Ok(QueueEvent::Succeeded { .. })));
    }

    #[tokio::test]
    async fn test_identical_enqueue_coalesces() {
        let queue = queue();
        let first = queue.enqueue("op", json!({"a": 1}));
        let second = queue.enqueue("op", json!({"a": 1}));
        let EnqueueOutcome::Queued(id) = first else {
            panic!("expected Queued, got {first:?}");
        };
        assert_eq!(second, EnqueueOutcome::Coalesced(id));
        assert!(matches!(queue.enqueue("op", json!({"a": 2})), EnqueueOutcome::Queued(_)));
        assert_eq!(queue.len(), 2);
    }

    #[tokio::test]
    async fn test_exactly_max_retries_attempts() {
        let queue = queue();
        let mut events = queue.subscribe();
        queue.enqueue("update_user_profile", json!({"x": 1}));

        let mut attempts = 0;
        let mut exhausted = Vec::new();
        for _ in 0..10 {
            let report = queue
                .drain(|_, _| {
                    attempts += 1;
                    async { Err::<(), _>("offline") }
                })
                .await;
            exhausted.extend(report.exhausted);
        }

        assert_eq!(attempts, 5);
        assert!(queue.is_empty());
        assert_eq!(exhausted.len(), 1);
        assert_eq!(exhausted[0].retry_count, 5);

        let mut saw_exhausted = false;
        while let Ok(event) = events.try_recv() {
            if let QueueEvent::Exhausted { attempts, .. } = &event {
                assert_eq!(*attempts, 5);
                assert!(event.as_error().is_some());
                saw_exhausted = true;
            }
        }
        assert!(saw_exhausted);
    }

    #[tokio::test]
    async fn test_item_over_bound_dropped_without_attempt() {
        let queue = queue();
        queue.restore(QueueSnapshot {
            items: vec![OfflineQueueItem {
                id: Uuid::now_v7(),
                owner: None,
                operation: "op".into(),
                params: json!({}),
                timestamp: 0,
                retry_count: 5,
            }],
            failures: HashMap::new(),
        });

        let mut attempts = 0;
        let report = queue
            .drain(|_, _| {
                attempts += 1;
                async { Ok::<(), String>(()) }
            })
            .await;
        assert_eq!(attempts, 0);
        assert_eq!(report.failed, 1);
        assert_eq!(report.exhausted.len(), 1);
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_repeated_failures_suppress_enqueue() {
        let queue = queue();
        let mut events = queue.subscribe();
        let params = json!({"username": "taken"});

        queue.enqueue("update_user_profile", params.clone());
        for _ in 0..5 {
            drain_failing(&queue).await;
        }
        assert!(queue.is_empty());

        queue.enqueue("update_user_profile", params.clone());
        drain_failing(&queue).await;
        drain_failing(&queue).await;
        assert_eq!(queue.len(), 1);

        assert_eq!(
            queue.enqueue("update_user_profile", params.clone()),
            EnqueueOutcome::Suppressed
        );
        assert_eq!(queue.len(), 1);
        // Different params are unaffected.
        assert!(matches!(
            queue.enqueue("update_user_profile", json!({"username": "free"})),
            EnqueueOutcome::Queued(_)
        ));

        let mut suppressed = false;
        while let Ok(event) = events.try_recv() {
            suppressed |= matches!(event, QueueEvent::Suppressed { .. });
        }
        assert!(suppressed);
    }

    #[tokio::test]
    async fn test_success_resets_failure_history() {
        let queue = queue();
        queue.enqueue("op", json!(1));
        for _ in 0..3 {
            drain_failing(&queue).await;
        }
        queue.drain(|_, _| async { Ok::<(), String>(()) }).await;
        assert!(queue.snapshot().failures.is_empty());
    }

    #[tokio::test]
    async fn test_failure_history_is_bounded() {
        let queue = queue();
        for i in 0..200 {
            queue.enqueue("op", json!({"n": i}));
        }
        for _ in 0..5 {
            drain_failing(&queue).await;
        }

        assert!(queue.is_empty());
        assert_eq!(
            queue.snapshot().failures.len(),
            QueueSettings::default().failure_history_max
        );
    }

    #[tokio::test]
    async fn test_failure_history_ages_out() {
        let clock = ManualClock::new(0);
        let queue = OfflineQueue::new(&QueueSettings::default(), clock.clone());
        let params = json!({"username": "taken"});

        queue.enqueue("update_user_profile", params.clone());
        for _ in 0..5 {
            drain_failing(&queue).await;
        }
        assert_eq!(queue.snapshot().failures.len(), 1);

        clock.advance(QueueSettings::default().failure_window());
        assert!(matches!(
            queue.enqueue("update_user_profile", params.clone()),
            EnqueueOutcome::Queued(_)
        ));
        assert!(queue.snapshot().failures.is_empty());
    }

    #[tokio::test]
    async fn test_drain_for_holds_other_owners() {
        let queue = queue();
        queue.enqueue_for(Some("alice"), "op", json!({"user_id": "alice"}));
        queue.enqueue_for(Some("bob"), "op", json!({"user_id": "bob"}));
        queue.enqueue("op", json!({"shared": true}));

        let mut seen = Vec::new();
        let report = queue
            .drain_for(Some("bob"), |_, params| {
                seen.push(params);
                async { Ok::<(), String>(()) }
            })
            .await;

        assert_eq!(seen, vec![json!({"user_id": "bob"}), json!({"shared": true})]);
        assert_eq!(report.held, 1);
        assert_eq!(report.remaining, 1);
        let left = queue.items();
        assert_eq!(left[0].owner.as_deref(), Some("alice"));
        assert_eq!(left[0].retry_count, 0);
    }

    #[tokio::test]
    async fn test_drain_preserves_order() {
        let queue = queue();
        for i in 0..4 {
            queue.enqueue("op", json!(i));
        }
        let mut order = Vec::new();
        queue
            .drain(|_, params| {
                order.push(params.as_i64().unwrap_or(-1));
                async move {
                    if params == json!(1) {
                        Err("boom")
                    } else {
                        Ok(())
                    }
                }
            })
            .await;
        assert_eq!(order, vec![0, 1, 2, 3]);
        let left = queue.items();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].retry_count, 1);
    }

    #[tokio::test]
    async fn test_concurrent_drain_is_skipped() {
        let queue = Arc::new(queue());
        queue.enqueue("op", json!(1));
        let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();
        let release_rx = Arc::new(tokio::sync::Mutex::new(Some(release_rx)));

        let q = queue.clone();
        let first = tokio::spawn(async move {
            q.drain(move |_, _| {
                let release_rx = release_rx.clone();
                async move {
                    if let Some(rx) = release_rx.lock().await.take() {
                        let _ = rx.await;
                    }
                    Ok::<(), String>(())
                }
            })
            .await
        });

        while !queue.is_draining() {
            tokio::task::yield_now().await;
        }
        let second = queue.drain(|_, _| async { Ok::<(), String>(()) }).await;
        assert!(second.skipped);

        release_tx.send(()).unwrap();
        let report = first.await.unwrap();
        assert_eq!(report.succeeded, 1);
        assert!(!queue.is_draining());
    }

    #[tokio::test]
    async fn test_persistence_roundtrip() {
        let queue = queue();
        let store = MemoryKvStore::new();
        queue.enqueue("op", json!({"a": 1}));
        drain_failing(&queue).await;
        assert!(queue.save_to(&store).await);

        let restored = OfflineQueue::new(&QueueSettings::default(), ManualClock::new(0));
        assert_eq!(restored.load_from(&store).await, 1);
        assert_eq!(restored.items()[0].retry_count, 1);
        assert_eq!(restored.snapshot(), queue.snapshot());
    }
}
