//! Health aggregation.
//!
//! Five subsystem probes run concurrently on every check, each in its own
//! task and under its own timeout. A probe that errors, times out or panics
//! only demotes its own subsystem. The overall status is always derived
//! from the five subsystem statuses, never stored.

mod probes;

pub use self::probes::{
    ConnectivityProbe, FnProbe, SessionProbe, StaticProbe, StorageProbe, TcpProbe,
};

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, error, info, instrument, warn};

use crate::clock::{duration_ms, Clock, RuntimeClock, UnixTimeMs};
use crate::config::{ConfigError, HealthConfig};
use crate::error::{CoreError, ErrorKind};
use crate::event::{EventBus, HealthEvent, DEFAULT_EVENT_CAPACITY};
use crate::lock;
use crate::timers::TimerSet;

pub const MAX_HEALTH_HISTORY: usize = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthState {
    Healthy,
    Degraded,
    Unhealthy,
}

impl HealthState {
    pub const fn as_str(self) -> &'static str {
        match self {
            HealthState::Healthy => "healthy",
            HealthState::Degraded => "degraded",
            HealthState::Unhealthy => "unhealthy",
        }
    }

    /// Healthy and degraded both count as available.
    pub const fn is_available(self) -> bool {
        !matches!(self, HealthState::Unhealthy)
    }
}

/// Result of one probe, produced once and never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthStatus {
    pub status: HealthState,
    pub last_check_time: UnixTimeMs,
    pub response_time_ms: Option<u64>,
    pub error: Option<String>,
}

impl HealthStatus {
    pub fn healthy() -> Self {
        Self::new(HealthState::Healthy, None)
    }

    pub fn degraded(reason: impl Into<String>) -> Self {
        Self::new(HealthState::Degraded, Some(reason.into()))
    }

    pub fn unhealthy(error: impl Into<String>) -> Self {
        Self::new(HealthState::Unhealthy, Some(error.into()))
    }

    fn new(status: HealthState, error: Option<String>) -> Self {
        Self {
            status,
            last_check_time: UnixTimeMs::now(),
            response_time_ms: None,
            error,
        }
    }

    #[must_use]
    pub fn with_response_time(mut self, ms: u64) -> Self {
        self.response_time_ms = Some(ms);
        self
    }

    #[must_use]
    pub fn checked_at(mut self, at: UnixTimeMs) -> Self {
        self.last_check_time = at;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Subsystem {
    Auth,
    Data,
    Cache,
    Storage,
    Network,
}

impl Subsystem {
    pub const ALL: [Subsystem; 5] = [
        Subsystem::Auth,
        Subsystem::Data,
        Subsystem::Cache,
        Subsystem::Storage,
        Subsystem::Network,
    ];

    pub const fn as_str(self) -> &'static str {
        match self {
            Subsystem::Auth => "auth",
            Subsystem::Data => "data",
            Subsystem::Cache => "cache",
            Subsystem::Storage => "storage",
            Subsystem::Network => "network",
        }
    }
}

/// Overall status rule: unhealthy when more than two subsystems are
/// unhealthy; degraded when any is unhealthy or more than two are degraded;
/// healthy otherwise.
pub fn overall_state(states: [HealthState; 5]) -> HealthState {
    let unhealthy = states.iter().filter(|s| **s == HealthState::Unhealthy).count();
    let degraded = states.iter().filter(|s| **s == HealthState::Degraded).count();

    if unhealthy > 2 {
        HealthState::Unhealthy
    } else if unhealthy > 0 || degraded > 2 {
        HealthState::Degraded
    } else {
        HealthState::Healthy
    }
}

/// Point-in-time snapshot of every subsystem.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemHealth {
    pub auth: HealthStatus,
    pub data: HealthStatus,
    pub cache: HealthStatus,
    pub storage: HealthStatus,
    pub network: HealthStatus,
    pub timestamp: UnixTimeMs,
}

impl SystemHealth {
    pub fn get(&self, subsystem: Subsystem) -> &HealthStatus {
        match subsystem {
            Subsystem::Auth => &self.auth,
            Subsystem::Data => &self.data,
            Subsystem::Cache => &self.cache,
            Subsystem::Storage => &self.storage,
            Subsystem::Network => &self.network,
        }
    }

    pub fn states(&self) -> [HealthState; 5] {
        Subsystem::ALL.map(|s| self.get(s).status)
    }

    pub fn overall(&self) -> HealthStatus {
        let status = overall_state(self.states());
        let times: Vec<u64> = Subsystem::ALL
            .iter()
            .filter_map(|s| self.get(*s).response_time_ms)
            .collect();
        let response_time_ms = if times.is_empty() {
            None
        } else {
            Some(times.iter().sum::<u64>() / times.len() as u64)
        };
        let unhealthy: Vec<&str> = Subsystem::ALL
            .iter()
            .filter(|s| self.get(**s).status == HealthState::Unhealthy)
            .map(|s| s.as_str())
            .collect();

        HealthStatus {
            status,
            last_check_time: self.timestamp,
            response_time_ms,
            error: if unhealthy.is_empty() {
                None
            } else {
                Some(format!("unhealthy: {}", unhealthy.join(", ")))
            },
        }
    }

    pub fn any_unhealthy(&self) -> bool {
        self.states().contains(&HealthState::Unhealthy)
    }

    /// Worst-case snapshot reported when the check itself could not run.
    pub fn all_unhealthy(at: UnixTimeMs, error: &str) -> Self {
        let status = HealthStatus::unhealthy(error).checked_at(at);
        Self {
            auth: status.clone(),
            data: status.clone(),
            cache: status.clone(),
            storage: status.clone(),
            network: status,
            timestamp: at,
        }
    }
}

#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("unreachable: {0}")]
    Unreachable(String),

    #[error("check failed: {0}")]
    Failed(String),

    #[error("timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("probe panicked: {0}")]
    Panicked(String),
}

impl From<ProbeError> for CoreError {
    fn from(e: ProbeError) -> Self {
        let kind = match &e {
            ProbeError::Unreachable(_) => ErrorKind::Network,
            ProbeError::Timeout { .. } => ErrorKind::Timeout,
            ProbeError::Failed(_) => ErrorKind::Unknown,
            ProbeError::Panicked(_) => ErrorKind::Internal,
        };
        CoreError::new(kind, e.to_string())
    }
}

/// Side-effect-free reachability/latency check for one subsystem.
#[async_trait]
pub trait HealthProbe: Send + Sync {
    async fn check(&self) -> Result<HealthStatus, ProbeError>;
}

/// One probe per subsystem. Unset subsystems report healthy.
#[derive(Clone)]
pub struct ProbeSet {
    probes: [Arc<dyn HealthProbe>; 5],
}

impl Default for ProbeSet {
    fn default() -> Self {
        Self::new()
    }
}

impl ProbeSet {
    pub fn new() -> Self {
        let healthy: Arc<dyn HealthProbe> = Arc::new(StaticProbe::new(HealthState::Healthy));
        Self {
            probes: [
                Arc::clone(&healthy),
                Arc::clone(&healthy),
                Arc::clone(&healthy),
                Arc::clone(&healthy),
                healthy,
            ],
        }
    }

    #[must_use]
    pub fn with(mut self, subsystem: Subsystem, probe: Arc<dyn HealthProbe>) -> Self {
        self.set(subsystem, probe);
        self
    }

    pub fn set(&mut self, subsystem: Subsystem, probe: Arc<dyn HealthProbe>) {
        self.probes[Self::index(subsystem)] = probe;
    }

    pub fn get(&self, subsystem: Subsystem) -> Arc<dyn HealthProbe> {
        Arc::clone(&self.probes[Self::index(subsystem)])
    }

    const fn index(subsystem: Subsystem) -> usize {
        match subsystem {
            Subsystem::Auth => 0,
            Subsystem::Data => 1,
            Subsystem::Cache => 2,
            Subsystem::Storage => 3,
            Subsystem::Network => 4,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AvailabilityReport {
    pub window_hours: u32,
    pub total_checks: usize,
    pub healthy_checks: usize,
    pub degraded_checks: usize,
    pub unhealthy_checks: usize,
    /// (healthy + degraded) / total, in percent. Zero when the window is empty.
    pub uptime_percent: f64,
    pub average_response_time_ms: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum HealthTimer {
    Check,
}

struct HealthLog {
    history: VecDeque<SystemHealth>,
    consecutive_failures: u32,
}

struct HealthInner {
    config: HealthConfig,
    probes: ProbeSet,
    clock: Arc<dyn Clock>,
    log: Mutex<HealthLog>,
    running: AtomicBool,
    epoch: AtomicU64,
    checks_run: AtomicU64,
    alerts_fired: AtomicU64,
    timers: TimerSet<HealthTimer>,
    events: EventBus<HealthEvent>,
}

/// Periodically probes every subsystem and keeps a bounded history.
#[derive(Clone)]
pub struct HealthAggregator {
    inner: Arc<HealthInner>,
}

impl HealthAggregator {
    pub fn new(config: HealthConfig, probes: ProbeSet) -> Result<Self, ConfigError> {
        Self::with_clock(config, probes, Arc::new(RuntimeClock::new()))
    }

    pub fn with_clock(
        config: HealthConfig,
        probes: ProbeSet,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let capacity = config.history_limit;
        Ok(Self {
            inner: Arc::new(HealthInner {
                config,
                probes,
                clock,
                log: Mutex::new(HealthLog {
                    history: VecDeque::with_capacity(capacity),
                    consecutive_failures: 0,
                }),
                running: AtomicBool::new(false),
                epoch: AtomicU64::new(0),
                checks_run: AtomicU64::new(0),
                alerts_fired: AtomicU64::new(0),
                timers: TimerSet::new("health"),
                events: EventBus::new(DEFAULT_EVENT_CAPACITY),
            }),
        })
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<HealthEvent> {
        self.inner.events.subscribe()
    }

    pub fn config(&self) -> &HealthConfig {
        &self.inner.config
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    /// Start the recurring check; the first check runs immediately.
    pub fn start(&self) {
        if self.inner.running.swap(true, Ordering::SeqCst) {
            return;
        }
        let weak = Arc::downgrade(&self.inner);
        self.inner.timers.schedule_repeating(
            HealthTimer::Check,
            Duration::ZERO,
            self.inner.config.interval,
            move || {
                let weak = weak.clone();
                async move {
                    if let Some(inner) = weak.upgrade() {
                        HealthAggregator { inner }.perform_health_check().await;
                    }
                }
            },
        );
        info!(interval_ms = duration_ms(self.inner.config.interval), "health monitoring started");
    }

    /// Stop the recurring check. A check already in flight is not recorded.
    pub fn stop(&self) {
        if !self.inner.running.swap(false, Ordering::SeqCst) {
            return;
        }
        {
            // Checks compare the epoch under the same lock before recording.
            let _log = lock(&self.inner.log);
            self.inner.epoch.fetch_add(1, Ordering::SeqCst);
        }
        self.inner.timers.cancel_all();
        info!("health monitoring stopped");
    }

    /// Run every probe once, record the snapshot and return it.
    #[instrument(skip(self))]
    pub async fn perform_health_check(&self) -> SystemHealth {
        let epoch = self.inner.epoch.load(Ordering::SeqCst);
        let collect = tokio::spawn(collect_snapshot(
            self.inner.probes.clone(),
            self.inner.config.clone(),
            Arc::clone(&self.inner.clock),
        ));

        let snapshot = match collect.await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                error!(error = %e, "health check orchestration failed");
                SystemHealth::all_unhealthy(
                    self.inner.clock.now(),
                    &format!("health check failed: {e}"),
                )
            }
        };

        self.record(snapshot.clone(), epoch);
        snapshot
    }

    /// Record a snapshot taken during `epoch`. Dropped if monitoring was
    /// stopped since.
    fn record(&self, snapshot: SystemHealth, epoch: u64) {
        let overall = snapshot.overall();

        let alert = {
            let mut log = lock(&self.inner.log);
            if self.inner.epoch.load(Ordering::SeqCst) != epoch {
                debug!("discarding health snapshot taken before monitoring stopped");
                return;
            }
            self.inner.checks_run.fetch_add(1, Ordering::Relaxed);
            let limit = self.inner.config.history_limit;
            while log.history.len() >= limit {
                log.history.pop_front();
            }
            log.history.push_back(snapshot.clone());

            match overall.status {
                HealthState::Healthy => log.consecutive_failures = 0,
                HealthState::Unhealthy => log.consecutive_failures += 1,
                HealthState::Degraded if snapshot.any_unhealthy() => {
                    log.consecutive_failures += 1;
                }
                HealthState::Degraded => {}
            }

            if log.consecutive_failures >= self.inner.config.alert_threshold {
                let count = log.consecutive_failures;
                log.consecutive_failures = 0;
                Some(count)
            } else {
                None
            }
        };

        if overall.status != HealthState::Healthy {
            warn!(
                overall = overall.status.as_str(),
                error = overall.error.as_deref().unwrap_or(""),
                "system health is not healthy"
            );
        }

        self.inner.events.emit(HealthEvent::Checked(snapshot.clone()));

        if let Some(consecutive_failures) = alert {
            self.inner.alerts_fired.fetch_add(1, Ordering::Relaxed);
            warn!(consecutive_failures, "health alert threshold reached");
            self.inner.events.emit(HealthEvent::Alert {
                consecutive_failures,
                snapshot,
            });
        }
    }

    pub fn current(&self) -> Option<SystemHealth> {
        lock(&self.inner.log).history.back().cloned()
    }

    /// Most recent `limit` snapshots, oldest first.
    pub fn history(&self, limit: usize) -> Vec<SystemHealth> {
        let log = lock(&self.inner.log);
        let skip = log.history.len().saturating_sub(limit);
        log.history.iter().skip(skip).cloned().collect()
    }

    pub fn history_len(&self) -> usize {
        lock(&self.inner.log).history.len()
    }

    pub fn consecutive_failures(&self) -> u32 {
        lock(&self.inner.log).consecutive_failures
    }

    pub fn alerts_fired(&self) -> u64 {
        self.inner.alerts_fired.load(Ordering::Relaxed)
    }

    pub fn checks_run(&self) -> u64 {
        self.inner.checks_run.load(Ordering::Relaxed)
    }

    pub fn availability_report(&self, hours: u32) -> AvailabilityReport {
        let window = Duration::from_secs(u64::from(hours) * 3600);
        let since = self.inner.clock.now().sub(window);
        let log = lock(&self.inner.log);

        let mut report = AvailabilityReport {
            window_hours: hours,
            total_checks: 0,
            healthy_checks: 0,
            degraded_checks: 0,
            unhealthy_checks: 0,
            uptime_percent: 0.0,
            average_response_time_ms: 0.0,
        };
        let mut response_total = 0u64;
        let mut response_samples = 0u64;

        for snapshot in log.history.iter().filter(|s| s.timestamp >= since) {
            let overall = snapshot.overall();
            report.total_checks += 1;
            match overall.status {
                HealthState::Healthy => report.healthy_checks += 1,
                HealthState::Degraded => report.degraded_checks += 1,
                HealthState::Unhealthy => report.unhealthy_checks += 1,
            }
            if let Some(ms) = overall.response_time_ms {
                response_total += ms;
                response_samples += 1;
            }
        }

        if report.total_checks > 0 {
            let available = (report.healthy_checks + report.degraded_checks) as f64;
            report.uptime_percent = available / report.total_checks as f64 * 100.0;
        }
        if response_samples > 0 {
            report.average_response_time_ms = response_total as f64 / response_samples as f64;
        }
        report
    }
}

async fn collect_snapshot(probes: ProbeSet, config: HealthConfig, clock: Arc<dyn Clock>) -> SystemHealth {
    let spawn = |subsystem: Subsystem| {
        tokio::spawn(run_probe(
            probes.get(subsystem),
            config.timeout,
            config.degraded_latency,
            Arc::clone(&clock),
        ))
    };

    let (auth, data, cache, storage, network) = tokio::join!(
        spawn(Subsystem::Auth),
        spawn(Subsystem::Data),
        spawn(Subsystem::Cache),
        spawn(Subsystem::Storage),
        spawn(Subsystem::Network),
    );

    let now = clock.now();
    let settle = |result: Result<HealthStatus, tokio::task::JoinError>| {
        result.unwrap_or_else(|e| {
            HealthStatus::unhealthy(ProbeError::Panicked(e.to_string()).to_string()).checked_at(now)
        })
    };

    SystemHealth {
        auth: settle(auth),
        data: settle(data),
        cache: settle(cache),
        storage: settle(storage),
        network: settle(network),
        timestamp: now,
    }
}

async fn run_probe(
    probe: Arc<dyn HealthProbe>,
    timeout: Duration,
    degraded_latency: Duration,
    clock: Arc<dyn Clock>,
) -> HealthStatus {
    let started = tokio::time::Instant::now();
    let result = tokio::time::timeout(timeout, probe.check()).await;
    let elapsed_ms = duration_ms(started.elapsed());
    let now = clock.now();

    match result {
        Ok(Ok(status)) => {
            let response_time = status.response_time_ms.unwrap_or(elapsed_ms);
            let status = if status.status == HealthState::Healthy
                && response_time > duration_ms(degraded_latency)
            {
                HealthStatus::degraded(format!("slow response: {response_time}ms"))
            } else {
                status
            };
            status.with_response_time(response_time).checked_at(now)
        }
        Ok(Err(e)) => HealthStatus::unhealthy(e.to_string())
            .with_response_time(elapsed_ms)
            .checked_at(now),
        Err(_) => HealthStatus::unhealthy(
            ProbeError::Timeout {
                timeout_ms: duration_ms(timeout),
            }
            .to_string(),
        )
        .with_response_time(elapsed_ms)
        .checked_at(now),
    }
}
