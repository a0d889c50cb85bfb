//! Session lifecycle: token refresh scheduling, inactivity detection and
//! heartbeat validation.
//!
//! All timers belong to one [`TimerSet`] keyed by concern. Every schedule
//! change happens while the session state lock is held, so a
//! reconfiguration can never interleave with a reschedule from a timer
//! callback. Async work captures the session epoch before its first await
//! and drops its result if the session was stopped or restarted meanwhile.

mod auth;

pub use self::auth::{AuthError, AuthProvider, AuthSession, AuthUser, SessionInfo};

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::clock::{duration_ms, Clock, RuntimeClock, UnixTimeMs};
use crate::config::{ConfigError, SessionConfig};
use crate::error::{CoreError, ErrorKind, ErrorSeverity};
use crate::event::{EventBus, SessionEvent, DEFAULT_EVENT_CAPACITY};
use crate::lock;
use crate::timers::TimerSet;

const MINUTE_MS: u64 = 60_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionPhase {
    Inactive,
    Active,
    Stopped,
    Expired,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExpiryReason {
    Inactivity,
    RefreshRejected,
    SessionMissing,
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("no active session")]
    NotActive,

    /// The session was stopped or restarted while the call was in flight.
    #[error("session changed while the request was in flight")]
    Stale,

    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl SessionError {
    pub fn severity(&self) -> ErrorSeverity {
        match self {
            SessionError::Auth(e) => e.severity(),
            SessionError::NotActive | SessionError::Stale => ErrorSeverity::Transient,
            SessionError::Config(_) => ErrorSeverity::Permanent,
        }
    }
}

impl From<SessionError> for CoreError {
    fn from(e: SessionError) -> Self {
        match e {
            SessionError::Auth(auth) => auth.into(),
            SessionError::Config(config) => config.into(),
            other => CoreError::new(ErrorKind::InvalidState, other.to_string())
                .with_severity(ErrorSeverity::Transient),
        }
    }
}

/// Snapshot of the session state. Never contains tokens.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionState {
    pub phase: SessionPhase,
    pub is_active: bool,
    pub session: Option<SessionInfo>,
    pub last_activity_at: Option<UnixTimeMs>,
    pub has_refresh_token: bool,
    pub warning_shown: bool,
    pub heartbeat_active: bool,
    pub refresh_scheduled: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum SessionTimer {
    Refresh,
    InactivityWarning,
    InactivityLogout,
    Heartbeat,
}

struct SessionCore {
    config: SessionConfig,
    phase: SessionPhase,
    session: Option<AuthSession>,
    last_activity_at: Option<UnixTimeMs>,
    warning_shown: bool,
}

/// Outcome of the last completed refresh, shared with callers that waited on it.
#[derive(Default)]
struct RefreshSlot {
    last: Option<Result<SessionInfo, AuthError>>,
}

struct SessionInner {
    provider: Arc<dyn AuthProvider>,
    clock: Arc<dyn Clock>,
    core: Mutex<SessionCore>,
    epoch: AtomicU64,
    refresh: tokio::sync::Mutex<RefreshSlot>,
    refresh_generation: AtomicU64,
    timers: TimerSet<SessionTimer>,
    events: EventBus<SessionEvent>,
}

#[derive(Clone)]
pub struct SessionManager {
    inner: Arc<SessionInner>,
}

impl SessionManager {
    pub fn new(config: SessionConfig, provider: Arc<dyn AuthProvider>) -> Result<Self, SessionError> {
        Self::with_clock(config, provider, Arc::new(RuntimeClock::new()))
    }

    pub fn with_clock(
        config: SessionConfig,
        provider: Arc<dyn AuthProvider>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, SessionError> {
        config.validate()?;
        Ok(Self {
            inner: Arc::new(SessionInner {
                provider,
                clock,
                core: Mutex::new(SessionCore {
                    config,
                    phase: SessionPhase::Inactive,
                    session: None,
                    last_activity_at: None,
                    warning_shown: false,
                }),
                epoch: AtomicU64::new(0),
                refresh: tokio::sync::Mutex::new(RefreshSlot::default()),
                refresh_generation: AtomicU64::new(0),
                timers: TimerSet::new("session"),
                events: EventBus::new(DEFAULT_EVENT_CAPACITY),
            }),
        })
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<SessionEvent> {
        self.inner.events.subscribe()
    }

    fn core(&self) -> MutexGuard<'_, SessionCore> {
        lock(&self.inner.core)
    }

    fn epoch(&self) -> u64 {
        self.inner.epoch.load(Ordering::SeqCst)
    }

    /// Begin tracking `session`. Any previous session is replaced.
    #[instrument(skip_all, fields(user_id = %session.user_id))]
    pub fn start_session(&self, session: AuthSession) {
        let info = session.info();
        {
            let mut core = self.core();
            self.inner.epoch.fetch_add(1, Ordering::SeqCst);
            self.inner.timers.cancel_all();

            let now = self.inner.clock.now();
            core.phase = SessionPhase::Active;
            core.session = Some(session);
            core.last_activity_at = Some(now);
            core.warning_shown = false;
            self.schedule_all(&core);
        }
        info!(expires_at = %info.expires_at, "session started");
        self.inner.events.emit(SessionEvent::Started(info));
    }

    /// End the session and cancel every timer. In-flight refreshes and
    /// validations are discarded when they complete.
    pub fn stop_session(&self) {
        let was_active = {
            let mut core = self.core();
            self.inner.epoch.fetch_add(1, Ordering::SeqCst);
            self.inner.timers.cancel_all();
            let was_active = core.phase == SessionPhase::Active;
            if was_active {
                core.phase = SessionPhase::Stopped;
            }
            core.session = None;
            core.last_activity_at = None;
            core.warning_shown = false;
            was_active
        };
        if was_active {
            info!("session stopped");
            self.inner.events.emit(SessionEvent::Stopped);
        }
    }

    /// Record user activity. Returns `false` when debounced or inactive.
    pub fn record_activity(&self) -> bool {
        if !self.touch(false) {
            return false;
        }
        self.inner.events.emit(SessionEvent::ActivityDetected);
        true
    }

    fn touch(&self, bypass_debounce: bool) -> bool {
        let mut core = self.core();
        if core.phase != SessionPhase::Active {
            return false;
        }
        let now = self.inner.clock.now();
        if !bypass_debounce {
            if let Some(last) = core.last_activity_at {
                if now.elapsed_since(last) < duration_ms(core.config.activity_debounce) {
                    return false;
                }
            }
        }
        core.last_activity_at = Some(now);
        core.warning_shown = false;
        self.schedule_inactivity(&core);
        true
    }

    /// Exchange the refresh token for a new session.
    ///
    /// At most one exchange runs at a time. Callers arriving while one is in
    /// flight wait for it and share its outcome instead of presenting the
    /// same refresh token twice.
    ///
    /// Transient failures schedule a retry at the next heartbeat or at
    /// expiry, whichever comes first. A rejection expires the session.
    #[instrument(skip(self))]
    pub async fn refresh_session(&self) -> Result<SessionInfo, SessionError> {
        let seen = self.inner.refresh_generation.load(Ordering::SeqCst);
        let mut slot = self.inner.refresh.lock().await;
        if self.inner.refresh_generation.load(Ordering::SeqCst) != seen {
            debug!("joined a refresh that completed while waiting");
            return match slot.last.clone() {
                Some(Ok(info)) => Ok(info),
                Some(Err(e)) => Err(SessionError::Auth(e)),
                None => Err(SessionError::Stale),
            };
        }

        let result = self.exchange_refresh_token().await;
        slot.last = match &result {
            Ok(info) => Some(Ok(info.clone())),
            Err(SessionError::Auth(e)) => Some(Err(e.clone())),
            Err(_) => None,
        };
        self.inner.refresh_generation.fetch_add(1, Ordering::SeqCst);
        result
    }

    async fn exchange_refresh_token(&self) -> Result<SessionInfo, SessionError> {
        let (epoch, refresh_token): (u64, SecretString) = {
            let core = self.core();
            match (&core.phase, &core.session) {
                (SessionPhase::Active, Some(session)) => (self.epoch(), session.refresh_token_copy()),
                _ => return Err(SessionError::NotActive),
            }
        };

        let result = self.inner.provider.refresh_session(&refresh_token).await;

        match result {
            Ok(session) => {
                let info = session.info();
                {
                    let mut core = self.core();
                    if self.epoch() != epoch || core.phase != SessionPhase::Active {
                        debug!("discarding refresh result for a session that is no longer active");
                        return Err(SessionError::Stale);
                    }
                    core.session = Some(session);
                    self.schedule_refresh(&core);
                }
                info!(expires_at = %info.expires_at, "session refreshed");
                self.inner.events.emit(SessionEvent::Refreshed(info.clone()));
                Ok(info)
            }
            Err(e) => {
                {
                    let core = self.core();
                    if self.epoch() != epoch || core.phase != SessionPhase::Active {
                        debug!(error = %e, "discarding refresh failure for a session that is no longer active");
                        return Err(SessionError::Stale);
                    }
                    if e.is_retryable() {
                        self.schedule_refresh_retry(&core);
                    }
                }
                self.inner.events.emit(SessionEvent::RefreshFailed(e.clone().into()));
                if e.is_retryable() {
                    warn!(error = %e, "session refresh failed; will retry");
                } else {
                    warn!(error = %e, "session refresh rejected");
                    self.expire(epoch, ExpiryReason::RefreshRejected);
                }
                Err(SessionError::Auth(e))
            }
        }
    }

    /// Ask the provider whether the session is still valid, refreshing it
    /// right away when it is close to expiry.
    #[instrument(skip(self))]
    pub async fn validate_session(&self) -> bool {
        let epoch = self.epoch();
        if !self.is_active() {
            self.inner.events.emit(SessionEvent::Validated { is_valid: false });
            return false;
        }

        let result = self.inner.provider.get_session().await;
        if self.epoch() != epoch {
            return false;
        }

        match result {
            Ok(Some(remote)) => {
                let needs_refresh = {
                    let mut core = self.core();
                    if self.epoch() != epoch || core.phase != SessionPhase::Active {
                        debug!("discarding validation result for a session that is no longer active");
                        return false;
                    }
                    let threshold = core.config.refresh_threshold;
                    let local_expiry = core.session.as_ref().map(|s| s.expires_at);
                    if local_expiry.map_or(true, |local| remote.expires_at > local) {
                        core.session = Some(remote);
                        self.schedule_refresh(&core);
                    }
                    let expires_at = core.session.as_ref().map_or(UnixTimeMs(0), |s| s.expires_at);
                    expires_at.duration_until(self.inner.clock.now()) < threshold
                };

                self.inner.events.emit(SessionEvent::Validated { is_valid: true });
                if needs_refresh {
                    debug!("session close to expiry; refreshing now");
                    // Failures are reported through events and logs.
                    let _ = self.refresh_session().await;
                }
                true
            }
            Ok(None) => {
                warn!("auth provider reports no session");
                self.inner.events.emit(SessionEvent::Validated { is_valid: false });
                self.expire(epoch, ExpiryReason::SessionMissing);
                false
            }
            Err(e) => {
                warn!(error = %e, "session validation failed");
                self.inner.events.emit(SessionEvent::Validated { is_valid: false });
                false
            }
        }
    }

    /// Replace the configuration, cancelling and rescheduling every timer
    /// under the new values.
    pub fn update_config(&self, config: SessionConfig) -> Result<(), SessionError> {
        config.validate()?;
        let mut core = self.core();
        core.config = config;
        self.inner.timers.cancel_all();
        if core.phase == SessionPhase::Active {
            self.schedule_all(&core);
        }
        debug!("session configuration updated");
        Ok(())
    }

    /// Count as activity regardless of the debounce and refresh immediately.
    pub async fn extend_session(&self) -> Result<SessionInfo, SessionError> {
        if !self.touch(true) {
            return Err(SessionError::NotActive);
        }
        self.inner.events.emit(SessionEvent::ActivityDetected);
        self.refresh_session().await
    }

    pub async fn get_user(&self) -> Result<Option<AuthUser>, SessionError> {
        Ok(self.inner.provider.get_user().await?)
    }

    pub fn config(&self) -> SessionConfig {
        self.core().config.clone()
    }

    pub fn phase(&self) -> SessionPhase {
        self.core().phase
    }

    pub fn is_active(&self) -> bool {
        self.phase() == SessionPhase::Active
    }

    pub fn session_info(&self) -> Option<SessionInfo> {
        self.core().session.as_ref().map(AuthSession::info)
    }

    pub fn access_token(&self) -> Option<SecretString> {
        self.core().session.as_ref().map(AuthSession::access_token_copy)
    }

    /// Remaining token lifetime, zero once expired.
    pub fn time_until_expiry(&self) -> Option<Duration> {
        let now = self.inner.clock.now();
        self.core()
            .session
            .as_ref()
            .map(|s| s.expires_at.duration_until(now))
    }

    pub fn state(&self) -> SessionState {
        let core = self.core();
        SessionState {
            phase: core.phase,
            is_active: core.phase == SessionPhase::Active,
            session: core.session.as_ref().map(AuthSession::info),
            last_activity_at: core.last_activity_at,
            has_refresh_token: core.session.is_some(),
            warning_shown: core.warning_shown,
            heartbeat_active: self.inner.timers.is_scheduled(&SessionTimer::Heartbeat),
            refresh_scheduled: self.inner.timers.is_scheduled(&SessionTimer::Refresh),
        }
    }

    /// Expire the session started at `epoch`. A no-op once it was stopped,
    /// restarted or already expired.
    fn expire(&self, epoch: u64, reason: ExpiryReason) {
        {
            let mut core = self.core();
            if self.epoch() != epoch || core.phase != SessionPhase::Active {
                return;
            }
            self.inner.epoch.fetch_add(1, Ordering::SeqCst);
            self.inner.timers.cancel_all();
            core.phase = SessionPhase::Expired;
            core.session = None;
            core.warning_shown = false;
        }
        info!(?reason, "session expired");
        self.inner.events.emit(SessionEvent::Expired(reason));
    }

    fn on_inactivity_warning(&self, epoch: u64) {
        let minutes_left = {
            let mut core = self.core();
            if self.epoch() != epoch || core.phase != SessionPhase::Active || core.warning_shown {
                return;
            }
            core.warning_shown = true;
            let idle = core
                .last_activity_at
                .map_or(0, |last| self.inner.clock.now().elapsed_since(last));
            let left = duration_ms(core.config.inactivity_timeout).saturating_sub(idle);
            left.div_ceil(MINUTE_MS)
        };
        info!(minutes_left, "inactivity warning");
        self.inner.events.emit(SessionEvent::InactivityWarning { minutes_left });
    }

    fn schedule_all(&self, core: &SessionCore) {
        self.schedule_refresh(core);
        self.schedule_inactivity(core);
        self.schedule_heartbeat(core);
    }

    fn schedule_refresh(&self, core: &SessionCore) {
        let Some(session) = core.session.as_ref() else {
            return;
        };
        let delay = session
            .expires_at
            .duration_until(self.inner.clock.now())
            .saturating_sub(core.config.refresh_threshold);
        self.schedule_refresh_in(delay);
    }

    fn schedule_refresh_retry(&self, core: &SessionCore) {
        let Some(session) = core.session.as_ref() else {
            return;
        };
        let remaining = session.expires_at.duration_until(self.inner.clock.now());
        let heartbeat = core.config.heartbeat_interval;
        let delay = if remaining.is_zero() {
            heartbeat
        } else {
            heartbeat.min(remaining)
        };
        self.schedule_refresh_in(delay);
    }

    fn schedule_refresh_in(&self, delay: Duration) {
        let weak = Arc::downgrade(&self.inner);
        self.inner.timers.schedule_once(SessionTimer::Refresh, delay, move || async move {
            if let Some(inner) = weak.upgrade() {
                // Failures are reported through events and logs.
                let _ = SessionManager { inner }.refresh_session().await;
            }
        });
    }

    /// Schedule warning and logout relative to the last recorded activity.
    fn schedule_inactivity(&self, core: &SessionCore) {
        let idle = core
            .last_activity_at
            .map_or(0, |last| self.inner.clock.now().elapsed_since(last));
        let idle = Duration::from_millis(idle);
        let timeout = core.config.inactivity_timeout;
        let epoch = self.epoch();

        if !core.warning_shown {
            let warn_at = timeout.saturating_sub(core.config.warning_threshold);
            let weak = Arc::downgrade(&self.inner);
            self.inner.timers.schedule_once(
                SessionTimer::InactivityWarning,
                warn_at.saturating_sub(idle),
                move || async move {
                    if let Some(inner) = weak.upgrade() {
                        SessionManager { inner }.on_inactivity_warning(epoch);
                    }
                },
            );
        }

        let weak = Arc::downgrade(&self.inner);
        self.inner.timers.schedule_once(
            SessionTimer::InactivityLogout,
            timeout.saturating_sub(idle),
            move || async move {
                if let Some(inner) = weak.upgrade() {
                    SessionManager { inner }.expire(epoch, ExpiryReason::Inactivity);
                }
            },
        );
    }

    fn schedule_heartbeat(&self, core: &SessionCore) {
        let period = core.config.heartbeat_interval;
        let weak = Arc::downgrade(&self.inner);
        self.inner
            .timers
            .schedule_repeating(SessionTimer::Heartbeat, period, period, move || {
                let weak = weak.clone();
                async move {
                    if let Some(inner) = weak.upgrade() {
                        SessionManager { inner }.validate_session().await;
                    }
                }
            });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use secrecy::ExposeSecret;
    use std::sync::atomic::AtomicU32;
    use tokio::sync::broadcast::Receiver;

    const ORIGIN: UnixTimeMs = UnixTimeMs(1_700_000_000_000);
    const HOUR: Duration = Duration::from_secs(3600);

    struct ScriptedAuthProvider {
        clock: Arc<RuntimeClock>,
        refresh_result: Mutex<Result<Duration, AuthError>>,
        refresh_delay: Duration,
        validate_delay: Duration,
        remote: Mutex<Result<Option<Duration>, AuthError>>,
        refresh_calls: AtomicU32,
        validate_calls: AtomicU32,
    }

    impl ScriptedAuthProvider {
        fn new(clock: Arc<RuntimeClock>) -> Self {
            Self {
                clock,
                refresh_result: Mutex::new(Ok(HOUR)),
                refresh_delay: Duration::ZERO,
                validate_delay: Duration::ZERO,
                remote: Mutex::new(Ok(Some(HOUR))),
                refresh_calls: AtomicU32::new(0),
                validate_calls: AtomicU32::new(0),
            }
        }

        fn session(&self, ttl: Duration) -> AuthSession {
            let n = self.refresh_calls.load(Ordering::SeqCst);
            AuthSession::new("u-1", format!("access-{n}"), format!("refresh-{n}"), self.clock.now().add(ttl))
        }
    }

    #[async_trait]
    impl AuthProvider for ScriptedAuthProvider {
        async fn get_session(&self) -> Result<Option<AuthSession>, AuthError> {
            self.validate_calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.validate_delay).await;
            let remote = lock(&self.remote).clone();
            remote.map(|ttl| ttl.map(|ttl| self.session(ttl)))
        }

        async fn refresh_session(&self, refresh_token: &SecretString) -> Result<AuthSession, AuthError> {
            assert!(refresh_token.expose_secret().starts_with("refresh-"));
            self.refresh_calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.refresh_delay).await;
            let result = lock(&self.refresh_result).clone();
            result.map(|ttl| self.session(ttl))
        }

        async fn get_user(&self) -> Result<Option<AuthUser>, AuthError> {
            Ok(Some(AuthUser {
                id: "u-1".into(),
                email: None,
            }))
        }
    }

    fn setup(config: SessionConfig, provider: ScriptedAuthProvider) -> (SessionManager, Arc<ScriptedAuthProvider>) {
        let provider = Arc::new(provider);
        let manager = SessionManager::with_clock(config, provider.clone(), provider.clock.clone()).unwrap();
        (manager, provider)
    }

    fn clock() -> Arc<RuntimeClock> {
        Arc::new(RuntimeClock::anchored_at(ORIGIN))
    }

    fn session_expiring_in(clock: &RuntimeClock, ttl: Duration) -> AuthSession {
        AuthSession::new("u-1", "access-0", "refresh-0", clock.now().add(ttl))
    }

    fn drain(rx: &mut Receiver<SessionEvent>) -> Vec<SessionEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[tokio::test(start_paused = true)]
    async fn test_activity_debounce_boundary() {
        let clock = clock();
        let (manager, _) = setup(SessionConfig::default(), ScriptedAuthProvider::new(clock.clone()));
        manager.start_session(session_expiring_in(&clock, HOUR));
        let started_at = manager.state().last_activity_at;

        tokio::time::advance(Duration::from_millis(9_999)).await;
        assert!(!manager.record_activity());
        assert_eq!(manager.state().last_activity_at, started_at);

        tokio::time::advance(Duration::from_millis(2)).await;
        assert!(manager.record_activity());
        assert_eq!(
            manager.state().last_activity_at,
            started_at.map(|t| t.add_millis(10_001))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_refresh_fires_immediately_when_threshold_equals_lifetime() {
        let clock = clock();
        let config = SessionConfig {
            refresh_threshold: Duration::from_secs(600),
            ..SessionConfig::default()
        };
        let (manager, provider) = setup(config, ScriptedAuthProvider::new(clock.clone()));
        let mut rx = manager.subscribe();

        manager.start_session(session_expiring_in(&clock, Duration::from_secs(600)));
        tokio::time::sleep(Duration::from_millis(1)).await;

        assert_eq!(provider.refresh_calls.load(Ordering::SeqCst), 1);
        let events = drain(&mut rx);
        assert!(matches!(events.last(), Some(SessionEvent::Refreshed(_))));
        assert_eq!(manager.time_until_expiry(), Some(HOUR - Duration::from_millis(1)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_refresh_rescheduled_relative_to_new_expiry() {
        let clock = clock();
        let config = SessionConfig {
            heartbeat_interval: 10 * HOUR,
            inactivity_timeout: 10 * HOUR,
            ..SessionConfig::default()
        };
        let (manager, provider) = setup(config, ScriptedAuthProvider::new(clock.clone()));
        manager.start_session(session_expiring_in(&clock, Duration::from_secs(20 * 60)));

        tokio::time::sleep(Duration::from_secs(15 * 60 - 1)).await;
        assert_eq!(provider.refresh_calls.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(provider.refresh_calls.load(Ordering::SeqCst), 1);

        // New token lives an hour, so the next refresh is 55 minutes later.
        tokio::time::sleep(Duration::from_secs(54 * 60)).await;
        assert_eq!(provider.refresh_calls.load(Ordering::SeqCst), 1);
        tokio::time::sleep(Duration::from_secs(2 * 60)).await;
        assert_eq!(provider.refresh_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_during_inflight_refresh_does_not_mutate_state() {
        let clock = clock();
        let mut provider = ScriptedAuthProvider::new(clock.clone());
        provider.refresh_delay = Duration::from_secs(5);
        let (manager, _) = setup(SessionConfig::default(), provider);
        let mut rx = manager.subscribe();
        manager.start_session(session_expiring_in(&clock, HOUR));

        let pending = {
            let manager = manager.clone();
            tokio::spawn(async move { manager.refresh_session().await })
        };
        tokio::time::sleep(Duration::from_secs(1)).await;
        manager.stop_session();

        let result = pending.await.unwrap();
        assert!(matches!(result, Err(SessionError::Stale)));
        let state = manager.state();
        assert_eq!(state.phase, SessionPhase::Stopped);
        assert!(state.session.is_none());
        assert!(!state.heartbeat_active);
        assert!(!drain(&mut rx)
            .iter()
            .any(|e| matches!(e, SessionEvent::Refreshed(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_refresh_failure_keeps_session() {
        let clock = clock();
        let provider = ScriptedAuthProvider::new(clock.clone());
        *lock(&provider.refresh_result) = Err(AuthError::Network("offline".into()));
        let (manager, _) = setup(SessionConfig::default(), provider);
        let mut rx = manager.subscribe();
        manager.start_session(session_expiring_in(&clock, HOUR));

        let result = manager.refresh_session().await;
        assert!(matches!(result, Err(SessionError::Auth(AuthError::Network(_)))));
        assert!(manager.is_active());
        assert!(drain(&mut rx)
            .iter()
            .any(|e| matches!(e, SessionEvent::RefreshFailed(err) if err.is_retryable())));
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_refresh_failure_schedules_retry() {
        let clock = clock();
        let config = SessionConfig {
            heartbeat_interval: 10 * HOUR,
            inactivity_timeout: 10 * HOUR,
            ..SessionConfig::default()
        };
        let provider = ScriptedAuthProvider::new(clock.clone());
        *lock(&provider.refresh_result) = Err(AuthError::Network("offline".into()));
        let (manager, provider) = setup(config, provider);
        manager.start_session(session_expiring_in(&clock, Duration::from_secs(600)));

        // Scheduled refresh at 5 minutes fails; the retry waits for expiry,
        // which comes before the heartbeat.
        tokio::time::sleep(Duration::from_secs(301)).await;
        assert_eq!(provider.refresh_calls.load(Ordering::SeqCst), 1);
        assert!(manager.is_active());
        assert!(manager.state().refresh_scheduled);

        *lock(&provider.refresh_result) = Ok(HOUR);
        tokio::time::sleep(Duration::from_secs(300)).await;
        assert_eq!(provider.refresh_calls.load(Ordering::SeqCst), 2);
        assert_eq!(manager.time_until_expiry(), Some(HOUR - Duration::from_secs(1)));
        assert!(manager.state().refresh_scheduled);
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_joins_refresh_already_in_flight() {
        let clock = clock();
        let mut provider = ScriptedAuthProvider::new(clock.clone());
        provider.refresh_delay = Duration::from_secs(60);
        *lock(&provider.remote) = Ok(Some(Duration::from_secs(240)));
        let (manager, provider) = setup(SessionConfig::default(), provider);
        let mut rx = manager.subscribe();
        manager.start_session(session_expiring_in(&clock, Duration::from_secs(570)));

        // Scheduled refresh starts at 270s and answers at 330s. The heartbeat
        // at 300s sees under five minutes left and waits for it.
        tokio::time::sleep(Duration::from_secs(400)).await;

        assert_eq!(provider.refresh_calls.load(Ordering::SeqCst), 1);
        assert!(manager.is_active());
        assert_eq!(manager.time_until_expiry(), Some(HOUR - Duration::from_secs(70)));
        let events = drain(&mut rx);
        assert_eq!(
            events.iter().filter(|e| matches!(e, SessionEvent::Refreshed(_))).count(),
            1
        );
        assert!(events.contains(&SessionEvent::Validated { is_valid: true }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_refresh_calls_share_one_exchange() {
        let clock = clock();
        let mut provider = ScriptedAuthProvider::new(clock.clone());
        provider.refresh_delay = Duration::from_secs(5);
        let (manager, provider) = setup(SessionConfig::default(), provider);
        manager.start_session(session_expiring_in(&clock, HOUR));

        let (first, second) = tokio::join!(manager.refresh_session(), manager.refresh_session());
        assert_eq!(provider.refresh_calls.load(Ordering::SeqCst), 1);
        assert_eq!(first.unwrap(), second.unwrap());

        // A later call is a new exchange.
        manager.refresh_session().await.unwrap();
        assert_eq!(provider.refresh_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_stop_while_validation_waits_for_state_lock() {
        let clock = clock();
        let mut provider = ScriptedAuthProvider::new(clock.clone());
        provider.validate_delay = Duration::from_millis(200);
        let (manager, provider) = setup(SessionConfig::default(), provider);
        manager.start_session(session_expiring_in(&clock, HOUR));

        let pending = {
            let manager = manager.clone();
            tokio::spawn(async move { manager.validate_session().await })
        };
        while provider.validate_calls.load(Ordering::SeqCst) == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        // The provider answers while the state lock is held, so validation
        // passes its first staleness check and then blocks. Stop lands first.
        {
            let mut core = manager.core();
            std::thread::sleep(Duration::from_millis(400));
            manager.inner.epoch.fetch_add(1, Ordering::SeqCst);
            manager.inner.timers.cancel_all();
            core.phase = SessionPhase::Stopped;
            core.session = None;
        }

        assert!(!pending.await.unwrap());
        let state = manager.state();
        assert_eq!(state.phase, SessionPhase::Stopped);
        assert!(state.session.is_none());
        assert!(!state.refresh_scheduled);
        assert!(!state.heartbeat_active);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejected_refresh_expires_session() {
        let clock = clock();
        let provider = ScriptedAuthProvider::new(clock.clone());
        *lock(&provider.refresh_result) = Err(AuthError::Rejected("revoked".into()));
        let (manager, _) = setup(SessionConfig::default(), provider);
        let mut rx = manager.subscribe();
        manager.start_session(session_expiring_in(&clock, HOUR));

        assert!(manager.refresh_session().await.is_err());
        assert_eq!(manager.phase(), SessionPhase::Expired);
        assert_eq!(
            drain(&mut rx).last(),
            Some(&SessionEvent::Expired(ExpiryReason::RefreshRejected))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_inactivity_warns_then_expires() {
        let clock = clock();
        let config = SessionConfig {
            heartbeat_interval: Duration::from_secs(7 * 60),
            ..SessionConfig::default()
        };
        let (manager, provider) = setup(config, ScriptedAuthProvider::new(clock.clone()));
        let mut rx = manager.subscribe();
        manager.start_session(session_expiring_in(&clock, 24 * HOUR));

        tokio::time::sleep(Duration::from_secs(25 * 60 + 1)).await;
        assert!(manager.state().warning_shown);
        assert!(drain(&mut rx).contains(&SessionEvent::InactivityWarning { minutes_left: 5 }));

        tokio::time::sleep(Duration::from_secs(5 * 60)).await;
        assert_eq!(manager.phase(), SessionPhase::Expired);
        assert_eq!(
            drain(&mut rx).last(),
            Some(&SessionEvent::Expired(ExpiryReason::Inactivity))
        );

        // Heartbeats at 7, 14, 21 and 28 minutes, none after expiry.
        assert_eq!(provider.validate_calls.load(Ordering::SeqCst), 4);
        tokio::time::sleep(HOUR).await;
        assert_eq!(provider.validate_calls.load(Ordering::SeqCst), 4);
        assert!(!manager.state().heartbeat_active);
    }

    #[tokio::test(start_paused = true)]
    async fn test_activity_postpones_inactivity_logout() {
        let clock = clock();
        let (manager, _) = setup(SessionConfig::default(), ScriptedAuthProvider::new(clock.clone()));
        manager.start_session(session_expiring_in(&clock, 24 * HOUR));

        tokio::time::sleep(Duration::from_secs(20 * 60)).await;
        assert!(manager.record_activity());
        tokio::time::sleep(Duration::from_secs(20 * 60)).await;
        assert!(manager.is_active());
        assert!(!manager.state().warning_shown);
    }

    #[tokio::test(start_paused = true)]
    async fn test_update_config_reschedules_every_timer() {
        let clock = clock();
        let (manager, _) = setup(SessionConfig::default(), ScriptedAuthProvider::new(clock.clone()));
        let mut rx = manager.subscribe();
        manager.start_session(session_expiring_in(&clock, 24 * HOUR));
        drain(&mut rx);

        manager
            .update_config(SessionConfig {
                inactivity_timeout: Duration::from_secs(120),
                warning_threshold: Duration::from_secs(60),
                ..SessionConfig::default()
            })
            .unwrap();
        assert!(manager.state().heartbeat_active);

        tokio::time::sleep(Duration::from_secs(61)).await;
        assert_eq!(drain(&mut rx), vec![SessionEvent::InactivityWarning { minutes_left: 1 }]);

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(manager.phase(), SessionPhase::Expired);
        assert_eq!(drain(&mut rx), vec![SessionEvent::Expired(ExpiryReason::Inactivity)]);

        let invalid = SessionConfig {
            warning_threshold: Duration::from_secs(3600),
            ..SessionConfig::default()
        };
        assert!(matches!(manager.update_config(invalid), Err(SessionError::Config(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_validate_refreshes_when_close_to_expiry() {
        let clock = clock();
        let provider = ScriptedAuthProvider::new(clock.clone());
        *lock(&provider.refresh_result) = Err(AuthError::Network("flaky".into()));
        *lock(&provider.remote) = Ok(Some(Duration::from_secs(60)));
        let (manager, provider) = setup(SessionConfig::default(), provider);
        manager.start_session(session_expiring_in(&clock, Duration::from_secs(60)));

        // The scheduled refresh fires right away and fails transiently.
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(provider.refresh_calls.load(Ordering::SeqCst), 1);
        assert!(manager.is_active());

        *lock(&provider.refresh_result) = Ok(HOUR);
        assert!(manager.validate_session().await);
        assert_eq!(provider.refresh_calls.load(Ordering::SeqCst), 2);
        assert_eq!(manager.time_until_expiry(), Some(HOUR));
    }

    #[tokio::test(start_paused = true)]
    async fn test_validate_without_remote_session_expires() {
        let clock = clock();
        let provider = ScriptedAuthProvider::new(clock.clone());
        *lock(&provider.remote) = Ok(None);
        let (manager, _) = setup(SessionConfig::default(), provider);
        let mut rx = manager.subscribe();
        manager.start_session(session_expiring_in(&clock, HOUR));

        assert!(!manager.validate_session().await);
        assert_eq!(manager.phase(), SessionPhase::Expired);
        let events = drain(&mut rx);
        assert!(events.contains(&SessionEvent::Validated { is_valid: false }));
        assert!(events.contains(&SessionEvent::Expired(ExpiryReason::SessionMissing)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_validate_transient_error_keeps_session() {
        let clock = clock();
        let provider = ScriptedAuthProvider::new(clock.clone());
        *lock(&provider.remote) = Err(AuthError::Timeout);
        let (manager, _) = setup(SessionConfig::default(), provider);
        manager.start_session(session_expiring_in(&clock, HOUR));

        assert!(!manager.validate_session().await);
        assert!(manager.is_active());
    }

    #[tokio::test(start_paused = true)]
    async fn test_extend_session_bypasses_debounce() {
        let clock = clock();
        let (manager, provider) = setup(SessionConfig::default(), ScriptedAuthProvider::new(clock.clone()));
        manager.start_session(session_expiring_in(&clock, HOUR));

        tokio::time::advance(Duration::from_secs(1)).await;
        let info = manager.extend_session().await.unwrap();
        assert_eq!(provider.refresh_calls.load(Ordering::SeqCst), 1);
        assert_eq!(manager.session_info(), Some(info));
        assert_eq!(
            manager.access_token().map(|t| t.expose_secret().clone()),
            Some("access-1".to_string())
        );
    }

    #[tokio::test]
    async fn test_operations_require_active_session() {
        let clock = clock();
        let (manager, _) = setup(SessionConfig::default(), ScriptedAuthProvider::new(clock));
        assert!(!manager.record_activity());
        assert!(matches!(manager.refresh_session().await, Err(SessionError::NotActive)));
        assert!(!manager.validate_session().await);
        assert_eq!(manager.get_user().await.unwrap().unwrap().id, "u-1");
    }
}
