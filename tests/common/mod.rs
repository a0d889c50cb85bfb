#![allow(dead_code)]

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use resilience_core::{
    ActionExecutor, AuthError, AuthProvider, AuthSession, AuthUser, Clock, CoreError, ErrorKind,
    OfflineAction, RuntimeClock, UnixTimeMs,
};
use secrecy::SecretString;
use tokio::sync::broadcast::Receiver;

pub const ORIGIN: UnixTimeMs = UnixTimeMs(1_700_000_000_000);

pub fn clock() -> Arc<RuntimeClock> {
    Arc::new(RuntimeClock::anchored_at(ORIGIN))
}

/// Everything currently buffered on `rx`.
pub fn drain<T: Clone>(rx: &mut Receiver<T>) -> Vec<T> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

/// Auth provider with one remote session whose lifetime tests control.
pub struct ScriptedAuthProvider {
    clock: Arc<RuntimeClock>,
    remote_expires_at: Mutex<Option<UnixTimeMs>>,
    refresh_ttl: Duration,
    refresh_delay: Mutex<Duration>,
    refresh_error: Mutex<Option<AuthError>>,
    refresh_calls: AtomicU32,
    validate_calls: AtomicU32,
}

impl ScriptedAuthProvider {
    pub fn new(clock: Arc<RuntimeClock>, refresh_ttl: Duration) -> Self {
        Self {
            clock,
            remote_expires_at: Mutex::new(None),
            refresh_ttl,
            refresh_delay: Mutex::new(Duration::ZERO),
            refresh_error: Mutex::new(None),
            refresh_calls: AtomicU32::new(0),
            validate_calls: AtomicU32::new(0),
        }
    }

    pub fn sign_in(&self, ttl: Duration) -> AuthSession {
        let expires_at = self.clock.now().add(ttl);
        *self.remote_expires_at.lock().unwrap() = Some(expires_at);
        Self::session(expires_at)
    }

    pub fn set_refresh_delay(&self, delay: Duration) {
        *self.refresh_delay.lock().unwrap() = delay;
    }

    pub fn fail_refresh_with(&self, error: Option<AuthError>) {
        *self.refresh_error.lock().unwrap() = error;
    }

    pub fn refresh_calls(&self) -> u32 {
        self.refresh_calls.load(Ordering::SeqCst)
    }

    pub fn validate_calls(&self) -> u32 {
        self.validate_calls.load(Ordering::SeqCst)
    }

    fn session(expires_at: UnixTimeMs) -> AuthSession {
        AuthSession::new("user-42", "access-token", "refresh-token", expires_at)
    }
}

#[async_trait]
impl AuthProvider for ScriptedAuthProvider {
    async fn get_session(&self) -> Result<Option<AuthSession>, AuthError> {
        self.validate_calls.fetch_add(1, Ordering::SeqCst);
        let expires_at = *self.remote_expires_at.lock().unwrap();
        Ok(expires_at.map(Self::session))
    }

    async fn refresh_session(&self, _refresh_token: &SecretString) -> Result<AuthSession, AuthError> {
        self.refresh_calls.fetch_add(1, Ordering::SeqCst);
        let delay = *self.refresh_delay.lock().unwrap();
        tokio::time::sleep(delay).await;

        if let Some(error) = self.refresh_error.lock().unwrap().clone() {
            return Err(error);
        }
        let expires_at = self.clock.now().add(self.refresh_ttl);
        *self.remote_expires_at.lock().unwrap() = Some(expires_at);
        Ok(Self::session(expires_at))
    }

    async fn get_user(&self) -> Result<Option<AuthUser>, AuthError> {
        Ok(self.remote_expires_at.lock().unwrap().map(|_| AuthUser {
            id: "user-42".into(),
            email: Some("user@example.com".into()),
        }))
    }
}

/// Executor that records what it ran and fails action types on request.
#[derive(Default)]
pub struct RecordingExecutor {
    calls: AtomicU32,
    failing: Mutex<Vec<String>>,
    executed: Mutex<Vec<OfflineAction>>,
}

impl RecordingExecutor {
    pub fn fail_type(&self, action_type: &str) {
        self.failing.lock().unwrap().push(action_type.to_string());
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn executed(&self) -> Vec<OfflineAction> {
        self.executed.lock().unwrap().clone()
    }
}

#[async_trait]
impl ActionExecutor for RecordingExecutor {
    async fn execute(&self, action: &OfflineAction) -> Result<(), CoreError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.failing.lock().unwrap().contains(&action.action_type) {
            return Err(CoreError::new(ErrorKind::Network, "backend unavailable"));
        }
        self.executed.lock().unwrap().push(action.clone());
        Ok(())
    }
}
