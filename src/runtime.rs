//! One health aggregator, session manager and offline sync engine wired
//! together from a single [`RuntimeConfig`].

use std::sync::Arc;

use thiserror::Error;
use tracing::info;

use crate::clock::{Clock, RuntimeClock};
use crate::config::{ConfigError, RuntimeConfig};
use crate::connectivity::ConnectivitySource;
use crate::error::CoreError;
use crate::health::{
    ConnectivityProbe, HealthAggregator, HealthProbe, ProbeSet, SessionProbe, StorageProbe, Subsystem,
};
use crate::offline::{ActionExecutor, OfflineError, OfflineSync};
use crate::session::{AuthProvider, SessionError, SessionManager};
use crate::storage::DurableStore;

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error(transparent)]
    Offline(#[from] OfflineError),
}

impl From<RuntimeError> for CoreError {
    fn from(e: RuntimeError) -> Self {
        match e {
            RuntimeError::Config(e) => e.into(),
            RuntimeError::Session(e) => e.into(),
            RuntimeError::Offline(e) => e.into(),
        }
    }
}

/// External collaborators the runtime is built from.
pub struct RuntimeDeps {
    pub auth_provider: Arc<dyn AuthProvider>,
    pub store: Arc<dyn DurableStore>,
    pub connectivity: Arc<dyn ConnectivitySource>,
    pub executor: Arc<dyn ActionExecutor>,
    /// Probes for the backend data and cache subsystems. Unset ones report healthy.
    pub data_probe: Option<Arc<dyn HealthProbe>>,
    pub cache_probe: Option<Arc<dyn HealthProbe>>,
    pub clock: Option<Arc<dyn Clock>>,
}

impl RuntimeDeps {
    pub fn new(
        auth_provider: Arc<dyn AuthProvider>,
        store: Arc<dyn DurableStore>,
        connectivity: Arc<dyn ConnectivitySource>,
        executor: Arc<dyn ActionExecutor>,
    ) -> Self {
        Self {
            auth_provider,
            store,
            connectivity,
            executor,
            data_probe: None,
            cache_probe: None,
            clock: None,
        }
    }
}

#[derive(Clone)]
pub struct ResilienceRuntime {
    health: HealthAggregator,
    session: SessionManager,
    offline: OfflineSync,
}

impl ResilienceRuntime {
    pub fn new(config: RuntimeConfig, deps: RuntimeDeps) -> Result<Self, RuntimeError> {
        config.validate()?;
        let clock: Arc<dyn Clock> = match deps.clock {
            Some(clock) => clock,
            None => Arc::new(RuntimeClock::new()),
        };

        let session = SessionManager::with_clock(config.session, deps.auth_provider, Arc::clone(&clock))?;
        let offline = OfflineSync::with_clock(
            config.offline,
            Arc::clone(&deps.store),
            Arc::clone(&deps.connectivity),
            deps.executor,
            Arc::clone(&clock),
        )?;

        let mut probes = ProbeSet::new()
            .with(Subsystem::Auth, Arc::new(SessionProbe::new(session.clone())))
            .with(Subsystem::Storage, Arc::new(StorageProbe::new(deps.store)))
            .with(Subsystem::Network, Arc::new(ConnectivityProbe::new(deps.connectivity)));
        if let Some(probe) = deps.data_probe {
            probes.set(Subsystem::Data, probe);
        }
        if let Some(probe) = deps.cache_probe {
            probes.set(Subsystem::Cache, probe);
        }
        let health = HealthAggregator::with_clock(config.health, probes, clock)?;

        Ok(Self {
            health,
            session,
            offline,
        })
    }

    /// Start health monitoring and offline sync. Sessions are started
    /// separately, once credentials exist.
    pub fn start(&self) {
        self.health.start();
        self.offline.start();
        info!("resilience runtime started");
    }

    /// Stop every component and cancel all of their timers.
    pub fn shutdown(&self) {
        self.health.stop();
        self.offline.stop();
        self.session.stop_session();
        info!("resilience runtime shut down");
    }

    pub fn health(&self) -> &HealthAggregator {
        &self.health
    }

    pub fn session(&self) -> &SessionManager {
        &self.session
    }

    pub fn offline(&self) -> &OfflineSync {
        &self.offline
    }
}
