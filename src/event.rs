//! Typed notification channels exposed to the UI layer.
//!
//! Each component owns one [`EventBus`] carrying its own event enum.
//! Subscribers that fall behind lose the oldest events (`RecvError::Lagged`);
//! emitting with no subscribers is not an error.

use tokio::sync::broadcast;
use tracing::trace;

use crate::error::CoreError;
use crate::health::SystemHealth;
use crate::offline::OfflineAction;
use crate::session::{ExpiryReason, SessionInfo};

pub const DEFAULT_EVENT_CAPACITY: usize = 64;

#[derive(Debug, Clone)]
pub enum HealthEvent {
    Checked(SystemHealth),
    /// Sustained failures reached the alert threshold.
    Alert {
        consecutive_failures: u32,
        snapshot: SystemHealth,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    Started(SessionInfo),
    Stopped,
    Expired(ExpiryReason),
    InactivityWarning { minutes_left: u64 },
    Refreshed(SessionInfo),
    RefreshFailed(CoreError),
    ActivityDetected,
    Validated { is_valid: bool },
}

#[derive(Debug, Clone, PartialEq)]
pub enum OfflineEvent {
    WentOffline,
    WentOnline,
    ActionQueued(OfflineAction),
    ActionEvicted(OfflineAction),
    /// Retries exhausted; the action left the queue without succeeding.
    ActionDropped {
        action: OfflineAction,
        error: CoreError,
    },
    SyncStarted { pending: usize },
    SyncCompleted { successful: usize, failed: usize },
    /// The engine was stopped mid-pass. Counts cover the batches that finished.
    SyncCancelled { successful: usize, failed: usize },
    SyncFailed(CoreError),
}

impl HealthEvent {
    pub fn event_type(&self) -> &'static str {
        match self {
            HealthEvent::Checked(_) => "health_checked",
            HealthEvent::Alert { .. } => "health_alert",
        }
    }
}

impl SessionEvent {
    pub fn event_type(&self) -> &'static str {
        match self {
            SessionEvent::Started(_) => "session_started",
            SessionEvent::Stopped => "session_stopped",
            SessionEvent::Expired(_) => "session_expired",
            SessionEvent::InactivityWarning { .. } => "inactivity_warning",
            SessionEvent::Refreshed(_) => "session_refreshed",
            SessionEvent::RefreshFailed(_) => "session_refresh_failed",
            SessionEvent::ActivityDetected => "activity_detected",
            SessionEvent::Validated { .. } => "session_validated",
        }
    }
}

impl OfflineEvent {
    pub fn event_type(&self) -> &'static str {
        match self {
            OfflineEvent::WentOffline => "went_offline",
            OfflineEvent::WentOnline => "went_online",
            OfflineEvent::ActionQueued(_) => "action_queued",
            OfflineEvent::ActionEvicted(_) => "action_evicted",
            OfflineEvent::ActionDropped { .. } => "action_dropped",
            OfflineEvent::SyncStarted { .. } => "sync_started",
            OfflineEvent::SyncCompleted { .. } => "sync_completed",
            OfflineEvent::SyncCancelled { .. } => "sync_cancelled",
            OfflineEvent::SyncFailed(_) => "sync_failed",
        }
    }
}

pub struct EventBus<T> {
    sender: broadcast::Sender<T>,
}

impl<T: Clone> EventBus<T> {
    pub(crate) fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub(crate) fn emit(&self, event: T) {
        let delivered = self.sender.send(event).unwrap_or(0);
        trace!(delivered, "event emitted");
    }

    pub fn subscribe(&self) -> broadcast::Receiver<T> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}
