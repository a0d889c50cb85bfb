#![forbid(unsafe_code)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::too_many_lines)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::cast_precision_loss)]

//! Client runtime resilience core: health aggregation, session lifecycle
//! management and an offline action queue with a sync engine.
//!
//! Every component is an explicitly constructed, cheaply clonable handle.
//! Each one owns its timers and publishes typed events on a broadcast
//! channel; nothing is global.

pub mod clock;
pub mod config;
pub mod connectivity;
pub mod error;
pub mod event;
pub mod health;
pub mod offline;
pub mod runtime;
pub mod session;
pub mod storage;
mod timers;

use std::sync::{Mutex, MutexGuard, PoisonError};

pub use clock::{Clock, RuntimeClock, SystemClock, UnixTimeMs};
pub use config::{ConfigError, HealthConfig, OfflineConfig, RuntimeConfig, SessionConfig};
pub use connectivity::{ConnectivitySource, ManualConnectivity, ReachabilityMonitor};
pub use error::{CoreError, ErrorKind, ErrorSeverity};
pub use event::{EventBus, HealthEvent, OfflineEvent, SessionEvent};
pub use health::{
    AvailabilityReport, HealthAggregator, HealthProbe, HealthState, HealthStatus, ProbeError,
    ProbeSet, Subsystem, SystemHealth,
};
pub use offline::{
    ActionExecutor, OfflineAction, OfflineDataCache, OfflineError, OfflineState, OfflineSync,
    SkipReason, SyncMetricsSnapshot, SyncOutcome, SyncReport,
};
pub use runtime::{ResilienceRuntime, RuntimeDeps, RuntimeError};
pub use session::{
    AuthError, AuthProvider, AuthSession, AuthUser, ExpiryReason, SessionError, SessionInfo,
    SessionManager, SessionPhase, SessionState,
};
pub use storage::{DurableStore, FileStore, KeyNamespace, MemoryStore, StorageKey, StoreError};
#[cfg(not(target_arch = "wasm32"))]
pub use storage::SqliteStore;

/// Lock a mutex, recovering the data if a previous holder panicked.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
