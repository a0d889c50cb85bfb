//! Offline action queue and sync engine.
//!
//! Mutations made while offline are queued in a bounded FIFO that is
//! persisted after every change. A sync pass replays the queue in batches;
//! actions inside a batch run concurrently and the pass waits for the whole
//! batch before starting the next one. At most one pass runs at a time.

mod cache;
mod queue;

pub use self::cache::{CachedEntry, OfflineDataCache};
pub use self::queue::{ActionQueue, OfflineAction};

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

use crate::clock::{Clock, RuntimeClock, UnixTimeMs};
use crate::config::{ConfigError, OfflineConfig};
use crate::connectivity::ConnectivitySource;
use crate::error::{CoreError, ErrorKind, ErrorSeverity};
use crate::event::{EventBus, OfflineEvent, DEFAULT_EVENT_CAPACITY};
use crate::lock;
use crate::storage::{DurableStore, KeyNamespace, StorageKey, StoreError};
use crate::timers::TimerSet;

#[derive(Debug, Error)]
pub enum OfflineError {
    #[error("offline mode is disabled")]
    Disabled,

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl From<OfflineError> for CoreError {
    fn from(e: OfflineError) -> Self {
        match e {
            OfflineError::Disabled => CoreError::new(ErrorKind::InvalidState, e.to_string()),
            OfflineError::Store(store) => store.into(),
            OfflineError::Serialization(_) => CoreError::new(ErrorKind::Serialization, e.to_string()),
            OfflineError::Config(config) => config.into(),
        }
    }
}

/// Performs one queued mutation against the backend.
#[async_trait]
pub trait ActionExecutor: Send + Sync {
    async fn execute(&self, action: &OfflineAction) -> Result<(), CoreError>;
}

#[derive(Debug, Default)]
pub struct SyncMetrics {
    pub sync_passes: AtomicU64,
    pub actions_queued: AtomicU64,
    pub actions_succeeded: AtomicU64,
    pub action_failures: AtomicU64,
    pub actions_dropped: AtomicU64,
    pub actions_evicted: AtomicU64,
    pub persist_errors: AtomicU64,
}

impl SyncMetrics {
    pub fn snapshot(&self) -> SyncMetricsSnapshot {
        SyncMetricsSnapshot {
            sync_passes: self.sync_passes.load(Ordering::Relaxed),
            actions_queued: self.actions_queued.load(Ordering::Relaxed),
            actions_succeeded: self.actions_succeeded.load(Ordering::Relaxed),
            action_failures: self.action_failures.load(Ordering::Relaxed),
            actions_dropped: self.actions_dropped.load(Ordering::Relaxed),
            actions_evicted: self.actions_evicted.load(Ordering::Relaxed),
            persist_errors: self.persist_errors.load(Ordering::Relaxed),
        }
    }

    fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncMetricsSnapshot {
    pub sync_passes: u64,
    pub actions_queued: u64,
    pub actions_succeeded: u64,
    pub action_failures: u64,
    pub actions_dropped: u64,
    pub actions_evicted: u64,
    pub persist_errors: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OfflineState {
    pub is_online: bool,
    pub is_offline_mode_active: bool,
    pub pending_actions: Vec<OfflineAction>,
    pub last_sync_at: Option<UnixTimeMs>,
    pub sync_in_progress: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub successful: usize,
    /// Failed attempts in this pass, including the ones that were dropped.
    pub failed: usize,
    pub dropped: usize,
    pub remaining: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    AlreadySyncing,
    Offline,
    EmptyQueue,
    /// The engine was stopped while the pass was running.
    Stopped,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SyncOutcome {
    Completed(SyncReport),
    Skipped(SkipReason),
    Failed(CoreError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum OfflineTimer {
    SyncInterval,
    ConnectivityPoll,
    ReconnectSync,
}

struct OfflineCore {
    queue: ActionQueue,
    is_online: bool,
    last_sync_at: Option<UnixTimeMs>,
}

struct OfflineInner {
    config: OfflineConfig,
    store: Arc<dyn DurableStore>,
    connectivity: Arc<dyn ConnectivitySource>,
    executor: Arc<dyn ActionExecutor>,
    clock: Arc<dyn Clock>,
    queue_key: StorageKey,
    core: Mutex<OfflineCore>,
    syncing: AtomicBool,
    running: AtomicBool,
    epoch: AtomicU64,
    metrics: SyncMetrics,
    cache: OfflineDataCache,
    timers: TimerSet<OfflineTimer>,
    watcher: Mutex<Option<JoinHandle<()>>>,
    events: EventBus<OfflineEvent>,
}

impl Drop for OfflineInner {
    fn drop(&mut self) {
        if let Some(handle) = lock(&self.watcher).take() {
            handle.abort();
        }
    }
}

/// Releases the single-flight flag when the pass ends, including by panic.
struct SyncGuard {
    inner: Arc<OfflineInner>,
}

impl SyncGuard {
    fn acquire(inner: &Arc<OfflineInner>) -> Option<Self> {
        inner
            .syncing
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .ok()
            .map(|_| Self {
                inner: Arc::clone(inner),
            })
    }
}

impl Drop for SyncGuard {
    fn drop(&mut self) {
        self.inner.syncing.store(false, Ordering::SeqCst);
    }
}

#[derive(Clone)]
pub struct OfflineSync {
    inner: Arc<OfflineInner>,
}

impl OfflineSync {
    pub fn new(
        config: OfflineConfig,
        store: Arc<dyn DurableStore>,
        connectivity: Arc<dyn ConnectivitySource>,
        executor: Arc<dyn ActionExecutor>,
    ) -> Result<Self, OfflineError> {
        Self::with_clock(config, store, connectivity, executor, Arc::new(RuntimeClock::new()))
    }

    /// Build the engine and restore the queue persisted under
    /// `config.queue_scope`. A corrupt persisted queue is discarded.
    pub fn with_clock(
        config: OfflineConfig,
        store: Arc<dyn DurableStore>,
        connectivity: Arc<dyn ConnectivitySource>,
        executor: Arc<dyn ActionExecutor>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, OfflineError> {
        config.validate()?;
        let queue_key = StorageKey::new(KeyNamespace::OfflineQueue, config.queue_scope.as_str())?;
        let queue = load_queue(store.as_ref(), &queue_key, config.max_offline_actions);
        let is_online = connectivity.is_online();

        Ok(Self {
            inner: Arc::new(OfflineInner {
                cache: OfflineDataCache::new(Arc::clone(&store), Arc::clone(&clock)),
                config,
                store,
                connectivity,
                executor,
                clock,
                queue_key,
                core: Mutex::new(OfflineCore {
                    queue,
                    is_online,
                    last_sync_at: None,
                }),
                syncing: AtomicBool::new(false),
                running: AtomicBool::new(false),
                epoch: AtomicU64::new(0),
                metrics: SyncMetrics::default(),
                timers: TimerSet::new("offline"),
                watcher: Mutex::new(None),
                events: EventBus::new(DEFAULT_EVENT_CAPACITY),
            }),
        })
    }

    fn core(&self) -> MutexGuard<'_, OfflineCore> {
        lock(&self.inner.core)
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<OfflineEvent> {
        self.inner.events.subscribe()
    }

    pub fn config(&self) -> &OfflineConfig {
        &self.inner.config
    }

    /// Start connectivity tracking and the periodic sync.
    pub fn start(&self) {
        if self.inner.running.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.epoch.fetch_add(1, Ordering::SeqCst);
        let config = &self.inner.config;

        let mut rx = self.inner.connectivity.subscribe();
        let weak = Arc::downgrade(&self.inner);
        let watcher = tokio::spawn(async move {
            while rx.changed().await.is_ok() {
                let online = *rx.borrow_and_update();
                let Some(inner) = weak.upgrade() else {
                    return;
                };
                OfflineSync { inner }.handle_connectivity(online);
            }
        });
        if let Some(previous) = lock(&self.inner.watcher).replace(watcher) {
            previous.abort();
        }

        let weak = Arc::downgrade(&self.inner);
        self.inner.timers.schedule_repeating(
            OfflineTimer::ConnectivityPoll,
            config.connectivity_poll_interval,
            config.connectivity_poll_interval,
            move || {
                let weak = weak.clone();
                async move {
                    if let Some(inner) = weak.upgrade() {
                        let online = inner.connectivity.is_online();
                        OfflineSync { inner }.handle_connectivity(online);
                    }
                }
            },
        );

        let weak = Arc::downgrade(&self.inner);
        self.inner.timers.schedule_repeating(
            OfflineTimer::SyncInterval,
            config.sync_interval,
            config.sync_interval,
            move || {
                let weak = weak.clone();
                async move {
                    if let Some(inner) = weak.upgrade() {
                        OfflineSync { inner }.perform_sync().await;
                    }
                }
            },
        );

        self.handle_connectivity(self.inner.connectivity.is_online());
        let replay = {
            let core = self.core();
            core.is_online && !core.queue.is_empty()
        };
        if replay {
            self.schedule_sync(Duration::ZERO);
        }
        info!(
            scope = %config.queue_scope,
            pending = self.pending_count(),
            "offline sync started"
        );
    }

    /// Cancel every timer and the connectivity listener. A pass already in
    /// flight finishes its current batch without touching the queue.
    pub fn stop(&self) {
        if !self.inner.running.swap(false, Ordering::SeqCst) {
            return;
        }
        {
            // Passes check the epoch under the same lock before touching the queue.
            let _core = self.core();
            self.inner.epoch.fetch_add(1, Ordering::SeqCst);
        }
        self.inner.timers.cancel_all();
        if let Some(handle) = lock(&self.inner.watcher).take() {
            handle.abort();
        }
        info!("offline sync stopped");
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    fn schedule_sync(&self, delay: Duration) {
        let weak = Arc::downgrade(&self.inner);
        self.inner
            .timers
            .schedule_once(OfflineTimer::ReconnectSync, delay, move || async move {
                if let Some(inner) = weak.upgrade() {
                    OfflineSync { inner }.perform_sync().await;
                }
            });
    }

    /// Single transition handler shared by the push listener and the poll.
    fn handle_connectivity(&self, online: bool) {
        {
            let mut core = self.core();
            if core.is_online == online {
                return;
            }
            core.is_online = online;
        }

        if online {
            info!(pending = self.pending_count(), "connection restored");
            self.inner.events.emit(OfflineEvent::WentOnline);
            if self.is_running() {
                self.schedule_sync(self.inner.config.reconnect_settle_delay);
            }
        } else {
            warn!("connection lost; queuing actions until it returns");
            self.inner.timers.cancel(&OfflineTimer::ReconnectSync);
            self.inner.events.emit(OfflineEvent::WentOffline);
        }
    }

    /// Queue a mutation for later replay. When online and idle, a sync pass
    /// is started in the background.
    #[instrument(skip(self, payload))]
    pub fn queue_action(
        &self,
        action_type: &str,
        payload: serde_json::Value,
        max_retries: Option<u32>,
    ) -> Result<OfflineAction, OfflineError> {
        if !self.inner.config.enable_offline_mode {
            return Err(OfflineError::Disabled);
        }
        let action = OfflineAction::new(
            action_type,
            payload,
            max_retries.unwrap_or(self.inner.config.default_max_retries),
            self.inner.clock.now(),
        );

        let (evicted, online) = {
            let mut core = self.core();
            let evicted = core.queue.push(action.clone());
            persist_queue(&self.inner, &core.queue);
            (evicted, core.is_online)
        };

        if let Some(evicted) = evicted {
            warn!(
                evicted_id = %evicted.id,
                evicted_type = %evicted.action_type,
                capacity = self.inner.config.max_offline_actions,
                "offline queue full; evicted oldest action"
            );
            SyncMetrics::incr(&self.inner.metrics.actions_evicted);
            self.inner.events.emit(OfflineEvent::ActionEvicted(evicted));
        }
        SyncMetrics::incr(&self.inner.metrics.actions_queued);
        debug!(id = %action.id, "action queued");
        self.inner.events.emit(OfflineEvent::ActionQueued(action.clone()));

        if online && !self.inner.syncing.load(Ordering::SeqCst) {
            if let Ok(runtime) = tokio::runtime::Handle::try_current() {
                let this = self.clone();
                runtime.spawn(async move {
                    this.perform_sync().await;
                });
            }
        }
        Ok(action)
    }

    /// Replay the queue once. No-op while offline, when the queue is empty,
    /// or when another pass is already running.
    #[instrument(skip(self))]
    pub async fn perform_sync(&self) -> SyncOutcome {
        {
            let core = self.core();
            if !core.is_online {
                return SyncOutcome::Skipped(SkipReason::Offline);
            }
            if core.queue.is_empty() {
                return SyncOutcome::Skipped(SkipReason::EmptyQueue);
            }
        }
        let Some(guard) = SyncGuard::acquire(&self.inner) else {
            debug!("sync already in progress");
            return SyncOutcome::Skipped(SkipReason::AlreadySyncing);
        };
        SyncMetrics::incr(&self.inner.metrics.sync_passes);

        match tokio::spawn(run_pass(guard)).await {
            Ok(Some(report)) => SyncOutcome::Completed(report),
            Ok(None) => SyncOutcome::Skipped(SkipReason::Stopped),
            Err(e) => {
                let err = CoreError::new(ErrorKind::Internal, format!("sync pass failed: {e}"))
                    .with_severity(ErrorSeverity::Fatal);
                error!(error = %err, "sync orchestration failed");
                self.inner.events.emit(OfflineEvent::SyncFailed(err.clone()));
                SyncOutcome::Failed(err)
            }
        }
    }

    /// Re-read connectivity and sync right away.
    pub async fn force_sync(&self) -> SyncOutcome {
        self.handle_connectivity(self.inner.connectivity.is_online());
        self.inner.timers.cancel(&OfflineTimer::ReconnectSync);
        self.perform_sync().await
    }

    pub fn clear_queue(&self) -> usize {
        let mut core = self.core();
        let cleared = core.queue.clear();
        persist_queue(&self.inner, &core.queue);
        if cleared > 0 {
            info!(cleared, "offline queue cleared");
        }
        cleared
    }

    pub fn pending_count(&self) -> usize {
        self.core().queue.len()
    }

    pub fn pending_actions(&self) -> Vec<OfflineAction> {
        self.core().queue.to_vec()
    }

    pub fn is_online(&self) -> bool {
        self.core().is_online
    }

    pub fn last_sync_at(&self) -> Option<UnixTimeMs> {
        self.core().last_sync_at
    }

    pub fn state(&self) -> OfflineState {
        let core = self.core();
        OfflineState {
            is_online: core.is_online,
            is_offline_mode_active: self.inner.config.enable_offline_mode && !core.is_online,
            pending_actions: core.queue.to_vec(),
            last_sync_at: core.last_sync_at,
            sync_in_progress: self.inner.syncing.load(Ordering::SeqCst),
        }
    }

    pub fn metrics(&self) -> SyncMetricsSnapshot {
        self.inner.metrics.snapshot()
    }

    pub fn cache(&self) -> &OfflineDataCache {
        &self.inner.cache
    }

    /// Purge cached offline data older than `cache_max_age`.
    pub fn cleanup_old_data(&self) -> Result<usize, OfflineError> {
        self.inner.cache.cleanup_older_than(self.inner.config.cache_max_age)
    }
}

fn load_queue(store: &dyn DurableStore, key: &StorageKey, capacity: usize) -> ActionQueue {
    let bytes = match store.get(key) {
        Ok(Some(bytes)) => bytes,
        Ok(None) => return ActionQueue::new(capacity),
        Err(e) => {
            error!(error = %e, "failed to read persisted offline queue");
            return ActionQueue::new(capacity);
        }
    };

    match ActionQueue::decode(&bytes) {
        Ok(actions) => {
            let (queue, evicted) = ActionQueue::restore(actions, capacity);
            if !evicted.is_empty() {
                warn!(evicted = evicted.len(), "persisted queue exceeded capacity; oldest actions dropped");
            }
            info!(pending = queue.len(), "offline queue restored");
            queue
        }
        Err(e) => {
            error!(error = %e, "persisted offline queue is corrupt; discarding it");
            if let Err(e) = store.remove(key) {
                error!(error = %e, "failed to remove corrupt offline queue");
            }
            ActionQueue::new(capacity)
        }
    }
}

/// Write the whole queue. Failures are logged; the in-memory queue stays
/// authoritative until the next successful write.
fn persist_queue(inner: &OfflineInner, queue: &ActionQueue) {
    let result = queue
        .encode()
        .map_err(StoreError::from)
        .and_then(|bytes| inner.store.set(&inner.queue_key, &bytes));
    if let Err(e) = result {
        SyncMetrics::incr(&inner.metrics.persist_errors);
        error!(error = %e, pending = queue.len(), "failed to persist offline queue");
    }
}

fn emit_cancelled(inner: &OfflineInner, report: &SyncReport) {
    info!(
        successful = report.successful,
        failed = report.failed,
        "sync pass abandoned; engine stopped"
    );
    inner.events.emit(OfflineEvent::SyncCancelled {
        successful: report.successful,
        failed: report.failed,
    });
}

/// One pass over the queue. `None` when the engine was stopped mid-pass;
/// the queue is then left exactly as the last finished batch wrote it.
async fn run_pass(guard: SyncGuard) -> Option<SyncReport> {
    let inner = Arc::clone(&guard.inner);
    let (epoch, ids) = {
        let core = lock(&inner.core);
        (inner.epoch.load(Ordering::SeqCst), core.queue.ids())
    };

    info!(pending = ids.len(), "sync started");
    inner.events.emit(OfflineEvent::SyncStarted { pending: ids.len() });

    let mut report = SyncReport::default();
    for chunk in ids.chunks(inner.config.batch_size) {
        if inner.epoch.load(Ordering::SeqCst) != epoch {
            emit_cancelled(&inner, &report);
            return None;
        }
        if !inner.connectivity.is_online() {
            warn!("connection lost during sync; stopping pass");
            break;
        }

        let batch: Vec<OfflineAction> = {
            let core = lock(&inner.core);
            chunk.iter().filter_map(|id| core.queue.get(id).cloned()).collect()
        };
        let handles: Vec<(OfflineAction, JoinHandle<Result<(), CoreError>>)> = batch
            .into_iter()
            .map(|action| {
                let executor = Arc::clone(&inner.executor);
                let attempt = action.clone();
                (action, tokio::spawn(async move { executor.execute(&attempt).await }))
            })
            .collect();

        let mut results = Vec::with_capacity(handles.len());
        for (action, handle) in handles {
            let result = handle.await.unwrap_or_else(|e| {
                Err(CoreError::new(ErrorKind::Internal, format!("action executor panicked: {e}")))
            });
            results.push((action, result));
        }

        let mut dropped = Vec::new();
        {
            let mut core = lock(&inner.core);
            if inner.epoch.load(Ordering::SeqCst) != epoch {
                drop(core);
                emit_cancelled(&inner, &report);
                return None;
            }
            for (action, result) in results {
                match result {
                    Ok(()) => {
                        if core.queue.remove(&action.id).is_some() {
                            report.successful += 1;
                            SyncMetrics::incr(&inner.metrics.actions_succeeded);
                        }
                    }
                    Err(error) => {
                        report.failed += 1;
                        SyncMetrics::incr(&inner.metrics.action_failures);
                        let exhausted = match core.queue.record_failure(&action.id) {
                            Some(updated) => {
                                debug!(
                                    id = %updated.id,
                                    retry_count = updated.retry_count,
                                    max_retries = updated.max_retries,
                                    error = %error,
                                    "action failed; will retry"
                                );
                                updated.is_exhausted()
                            }
                            None => false,
                        };
                        if exhausted {
                            if let Some(removed) = core.queue.remove(&action.id) {
                                dropped.push((removed, error));
                            }
                        }
                    }
                }
            }
            persist_queue(&inner, &core.queue);
        }

        for (action, error) in dropped {
            warn!(
                id = %action.id,
                action_type = %action.action_type,
                retries = action.retry_count,
                error = %error,
                "action dropped after exhausting retries"
            );
            report.dropped += 1;
            SyncMetrics::incr(&inner.metrics.actions_dropped);
            inner.events.emit(OfflineEvent::ActionDropped { action, error });
        }
    }

    {
        let mut core = lock(&inner.core);
        core.last_sync_at = Some(inner.clock.now());
        report.remaining = core.queue.len();
    }
    info!(
        successful = report.successful,
        failed = report.failed,
        remaining = report.remaining,
        "sync completed"
    );
    inner.events.emit(OfflineEvent::SyncCompleted {
        successful: report.successful,
        failed: report.failed,
    });
    drop(guard);
    Some(report)
}
