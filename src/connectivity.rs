//! Online/offline signal.
//!
//! Consumers read the current value with [`ConnectivitySource::is_online`]
//! (pull) and receive transitions through a `watch` channel (push). Both
//! views are backed by the same cell, so they never disagree.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use url::Url;

pub const DEFAULT_REACHABILITY_TIMEOUT: Duration = Duration::from_secs(3);
pub const DEFAULT_REACHABILITY_INTERVAL: Duration = Duration::from_secs(5);

pub trait ConnectivitySource: Send + Sync {
    fn is_online(&self) -> bool;
    fn subscribe(&self) -> watch::Receiver<bool>;
}

/// Connectivity driven by the host shell's platform events.
#[derive(Debug)]
pub struct ManualConnectivity {
    tx: watch::Sender<bool>,
}

impl ManualConnectivity {
    pub fn new(online: bool) -> Self {
        let (tx, _) = watch::channel(online);
        Self { tx }
    }

    /// Publish a platform online/offline event. Repeated values are ignored.
    pub fn set_online(&self, online: bool) {
        let changed = self.tx.send_if_modified(|current| {
            if *current == online {
                false
            } else {
                *current = online;
                true
            }
        });
        if changed {
            debug!(online, "connectivity changed");
        }
    }
}

impl ConnectivitySource for ManualConnectivity {
    fn is_online(&self) -> bool {
        *self.tx.borrow()
    }

    fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ReachabilityError {
    #[error("endpoint has no host: {0}")]
    MissingHost(String),

    #[error("endpoint has no known port: {0}")]
    MissingPort(String),
}

/// Connectivity derived from periodically opening a TCP connection to an
/// endpoint the app depends on.
pub struct ReachabilityMonitor {
    target: String,
    timeout: Duration,
    interval: Duration,
    tx: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl ReachabilityMonitor {
    pub fn new(endpoint: &Url) -> Result<Self, ReachabilityError> {
        let host = endpoint
            .host_str()
            .ok_or_else(|| ReachabilityError::MissingHost(endpoint.to_string()))?;
        let port = endpoint
            .port_or_known_default()
            .ok_or_else(|| ReachabilityError::MissingPort(endpoint.to_string()))?;
        let (tx, _) = watch::channel(true);

        Ok(Self {
            target: format!("{host}:{port}"),
            timeout: DEFAULT_REACHABILITY_TIMEOUT,
            interval: DEFAULT_REACHABILITY_INTERVAL,
            tx,
            task: Mutex::new(None),
        })
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    /// Single reachability check, without publishing the result.
    pub async fn check(&self) -> bool {
        reachable(&self.target, self.timeout).await
    }

    /// Start polling in the background. Calling twice restarts the poller.
    pub fn start(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        let interval = self.interval.max(Duration::from_millis(1));
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                let Some(monitor) = weak.upgrade() else {
                    return;
                };
                let online = monitor.check().await;
                monitor.publish(online);
            }
        });

        let mut task = crate::lock(&self.task);
        if let Some(previous) = task.replace(handle) {
            previous.abort();
        }
        info!(target = %self.target, "reachability monitor started");
    }

    pub fn stop(&self) {
        if let Some(handle) = crate::lock(&self.task).take() {
            handle.abort();
        }
    }

    fn publish(&self, online: bool) {
        let changed = self.tx.send_if_modified(|current| {
            if *current == online {
                false
            } else {
                *current = online;
                true
            }
        });
        if changed {
            if online {
                info!(target = %self.target, "endpoint reachable");
            } else {
                warn!(target = %self.target, "endpoint unreachable");
            }
        }
    }
}

impl Drop for ReachabilityMonitor {
    fn drop(&mut self) {
        self.stop();
    }
}

impl ConnectivitySource for ReachabilityMonitor {
    fn is_online(&self) -> bool {
        *self.tx.borrow()
    }

    fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}

pub(crate) async fn reachable(target: &str, timeout: Duration) -> bool {
    matches!(
        tokio::time::timeout(timeout, TcpStream::connect(target)).await,
        Ok(Ok(_))
    )
}
