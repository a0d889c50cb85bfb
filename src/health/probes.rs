use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use url::Url;

use super::{HealthProbe, HealthState, HealthStatus, ProbeError};
use crate::connectivity::{self, ConnectivitySource};
use crate::session::{SessionManager, SessionPhase};
use crate::storage::{DurableStore, KeyNamespace, StorageKey};

const STORAGE_SENTINEL_KEY: &str = "probe_sentinel";
const STORAGE_SENTINEL_VALUE: &[u8] = b"ok";

/// Probe that always reports the same state.
#[derive(Debug, Clone, Copy)]
pub struct StaticProbe {
    state: HealthState,
}

impl StaticProbe {
    pub const fn new(state: HealthState) -> Self {
        Self { state }
    }
}

#[async_trait]
impl HealthProbe for StaticProbe {
    async fn check(&self) -> Result<HealthStatus, ProbeError> {
        Ok(match self.state {
            HealthState::Healthy => HealthStatus::healthy(),
            HealthState::Degraded => HealthStatus::degraded("reported degraded"),
            HealthState::Unhealthy => HealthStatus::unhealthy("reported unhealthy"),
        })
    }
}

/// Adapts an async closure into a probe.
#[derive(Clone)]
pub struct FnProbe<F> {
    check: F,
}

impl<F, Fut> FnProbe<F>
where
    F: Fn() -> Fut + Send + Sync,
    Fut: Future<Output = Result<HealthStatus, ProbeError>> + Send,
{
    pub fn new(check: F) -> Self {
        Self { check }
    }
}

#[async_trait]
impl<F, Fut> HealthProbe for FnProbe<F>
where
    F: Fn() -> Fut + Send + Sync,
    Fut: Future<Output = Result<HealthStatus, ProbeError>> + Send,
{
    async fn check(&self) -> Result<HealthStatus, ProbeError> {
        (self.check)().await
    }
}

/// Auth probe backed by the session manager's local view.
///
/// No session is degraded rather than unhealthy: a signed-out user is a
/// normal state, an expired session is not.
pub struct SessionProbe {
    session: SessionManager,
}

impl SessionProbe {
    pub fn new(session: SessionManager) -> Self {
        Self { session }
    }
}

#[async_trait]
impl HealthProbe for SessionProbe {
    async fn check(&self) -> Result<HealthStatus, ProbeError> {
        match self.session.phase() {
            SessionPhase::Expired => Ok(HealthStatus::unhealthy("session expired")),
            SessionPhase::Inactive | SessionPhase::Stopped => {
                Ok(HealthStatus::degraded("no active session"))
            }
            SessionPhase::Active => match self.session.time_until_expiry() {
                Some(left) if left.is_zero() => Ok(HealthStatus::unhealthy("access token expired")),
                Some(left) if left < self.session.config().refresh_threshold => {
                    Ok(HealthStatus::degraded("access token close to expiry"))
                }
                _ => Ok(HealthStatus::healthy()),
            },
        }
    }
}

/// Network probe reading the shared connectivity signal.
pub struct ConnectivityProbe {
    source: Arc<dyn ConnectivitySource>,
}

impl ConnectivityProbe {
    pub fn new(source: Arc<dyn ConnectivitySource>) -> Self {
        Self { source }
    }
}

#[async_trait]
impl HealthProbe for ConnectivityProbe {
    async fn check(&self) -> Result<HealthStatus, ProbeError> {
        if self.source.is_online() {
            Ok(HealthStatus::healthy())
        } else {
            Err(ProbeError::Unreachable("device is offline".to_string()))
        }
    }
}

/// Storage probe: writes, reads back and removes a sentinel entry.
pub struct StorageProbe {
    store: Arc<dyn DurableStore>,
}

impl StorageProbe {
    pub fn new(store: Arc<dyn DurableStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl HealthProbe for StorageProbe {
    async fn check(&self) -> Result<HealthStatus, ProbeError> {
        let key = StorageKey::new(KeyNamespace::Health, STORAGE_SENTINEL_KEY)
            .map_err(|e| ProbeError::Failed(e.to_string()))?;

        self.store
            .set(&key, STORAGE_SENTINEL_VALUE)
            .map_err(|e| ProbeError::Failed(e.to_string()))?;
        let read = self
            .store
            .get(&key)
            .map_err(|e| ProbeError::Failed(e.to_string()))?;
        self.store
            .remove(&key)
            .map_err(|e| ProbeError::Failed(e.to_string()))?;

        if read.as_deref() == Some(STORAGE_SENTINEL_VALUE) {
            Ok(HealthStatus::healthy())
        } else {
            Err(ProbeError::Failed("sentinel read back mismatch".to_string()))
        }
    }
}

/// Data/cache probe: a TCP connect to a backend endpoint.
pub struct TcpProbe {
    target: String,
    connect_timeout: Duration,
}

impl TcpProbe {
    pub fn new(endpoint: &Url, connect_timeout: Duration) -> Result<Self, ProbeError> {
        let host = endpoint
            .host_str()
            .ok_or_else(|| ProbeError::Failed(format!("endpoint has no host: {endpoint}")))?;
        let port = endpoint
            .port_or_known_default()
            .ok_or_else(|| ProbeError::Failed(format!("endpoint has no port: {endpoint}")))?;
        Ok(Self {
            target: format!("{host}:{port}"),
            connect_timeout,
        })
    }
}

#[async_trait]
impl HealthProbe for TcpProbe {
    async fn check(&self) -> Result<HealthStatus, ProbeError> {
        if connectivity::reachable(&self.target, self.connect_timeout).await {
            Ok(HealthStatus::healthy())
        } else {
            Err(ProbeError::Unreachable(self.target.clone()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connectivity::ManualConnectivity;
    use crate::storage::MemoryStore;

    #[tokio::test]
    async fn test_connectivity_probe_follows_signal() {
        let source = Arc::new(ManualConnectivity::new(true));
        let probe = ConnectivityProbe::new(source.clone());
        assert_eq!(probe.check().await.unwrap().status, HealthState::Healthy);

        source.set_online(false);
        assert!(matches!(probe.check().await, Err(ProbeError::Unreachable(_))));
    }

    #[tokio::test]
    async fn test_storage_probe_leaves_no_sentinel() {
        let store = Arc::new(MemoryStore::new());
        let probe = StorageProbe::new(store.clone());

        assert_eq!(probe.check().await.unwrap().status, HealthState::Healthy);
        assert!(store.keys(&KeyNamespace::Health).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_storage_probe_reports_quota_failure() {
        let probe = StorageProbe::new(Arc::new(MemoryStore::with_quota(4)));
        match probe.check().await {
            Err(ProbeError::Failed(msg)) => assert!(msg.contains("quota exceeded")),
            other => panic!("unexpected probe result: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_tcp_probe_against_listener() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = Url::parse(&format!("http://{}/", listener.local_addr().unwrap())).unwrap();
        let probe = TcpProbe::new(&url, Duration::from_secs(1)).unwrap();

        assert_eq!(probe.check().await.unwrap().status, HealthState::Healthy);
    }
}
