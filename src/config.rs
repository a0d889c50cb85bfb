//! Component configuration.
//!
//! Every section deserializes from JSON with all fields optional; durations
//! are written in milliseconds (`"interval_ms": 30000`).

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::{CoreError, ErrorKind};
use crate::health::MAX_HEALTH_HISTORY;

const MINUTE: Duration = Duration::from_secs(60);
const HOUR: Duration = Duration::from_secs(60 * 60);

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{field} must be greater than zero")]
    Zero { field: &'static str },

    #[error("{field} is out of range: {reason}")]
    OutOfRange { field: &'static str, reason: String },

    #[error("invalid configuration document: {0}")]
    Parse(String),
}

impl From<ConfigError> for CoreError {
    fn from(e: ConfigError) -> Self {
        CoreError::new(ErrorKind::Configuration, e.to_string())
    }
}

impl From<serde_json::Error> for ConfigError {
    fn from(e: serde_json::Error) -> Self {
        ConfigError::Parse(e.to_string())
    }
}

fn non_zero(field: &'static str, value: Duration) -> Result<(), ConfigError> {
    if value.is_zero() {
        Err(ConfigError::Zero { field })
    } else {
        Ok(())
    }
}

mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(crate::clock::duration_ms(*value))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    #[serde(rename = "interval_ms", with = "millis")]
    pub interval: Duration,
    /// Per-probe timeout.
    #[serde(rename = "timeout_ms", with = "millis")]
    pub timeout: Duration,
    pub alert_threshold: u32,
    pub history_limit: usize,
    #[serde(rename = "degraded_latency_ms", with = "millis")]
    pub degraded_latency: Duration,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            timeout: Duration::from_secs(5),
            alert_threshold: 3,
            history_limit: MAX_HEALTH_HISTORY,
            degraded_latency: Duration::from_secs(1),
        }
    }
}

impl HealthConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        non_zero("interval", self.interval)?;
        non_zero("timeout", self.timeout)?;
        if self.alert_threshold == 0 {
            return Err(ConfigError::Zero {
                field: "alert_threshold",
            });
        }
        if self.history_limit == 0 || self.history_limit > MAX_HEALTH_HISTORY {
            return Err(ConfigError::OutOfRange {
                field: "history_limit",
                reason: format!("must be within 1..={MAX_HEALTH_HISTORY}"),
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Refresh this long before the access token expires.
    #[serde(rename = "refresh_threshold_ms", with = "millis")]
    pub refresh_threshold: Duration,
    #[serde(rename = "inactivity_timeout_ms", with = "millis")]
    pub inactivity_timeout: Duration,
    /// Warn this long before the inactivity timeout.
    #[serde(rename = "warning_threshold_ms", with = "millis")]
    pub warning_threshold: Duration,
    #[serde(rename = "heartbeat_interval_ms", with = "millis")]
    pub heartbeat_interval: Duration,
    #[serde(rename = "activity_debounce_ms", with = "millis")]
    pub activity_debounce: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            refresh_threshold: 5 * MINUTE,
            inactivity_timeout: 30 * MINUTE,
            warning_threshold: 5 * MINUTE,
            heartbeat_interval: 5 * MINUTE,
            activity_debounce: Duration::from_secs(10),
        }
    }
}

impl SessionConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        non_zero("inactivity_timeout", self.inactivity_timeout)?;
        non_zero("heartbeat_interval", self.heartbeat_interval)?;
        if self.warning_threshold >= self.inactivity_timeout {
            return Err(ConfigError::OutOfRange {
                field: "warning_threshold",
                reason: "must be shorter than inactivity_timeout".to_string(),
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OfflineConfig {
    pub max_offline_actions: usize,
    #[serde(rename = "sync_interval_ms", with = "millis")]
    pub sync_interval: Duration,
    pub enable_offline_mode: bool,
    pub batch_size: usize,
    pub default_max_retries: u32,
    #[serde(rename = "connectivity_poll_interval_ms", with = "millis")]
    pub connectivity_poll_interval: Duration,
    #[serde(rename = "reconnect_settle_delay_ms", with = "millis")]
    pub reconnect_settle_delay: Duration,
    /// Storage namespace of this queue; give each tab its own.
    pub queue_scope: String,
    #[serde(rename = "cache_max_age_ms", with = "millis")]
    pub cache_max_age: Duration,
}

impl Default for OfflineConfig {
    fn default() -> Self {
        Self {
            max_offline_actions: 100,
            sync_interval: Duration::from_secs(30),
            enable_offline_mode: true,
            batch_size: 5,
            default_max_retries: 3,
            connectivity_poll_interval: Duration::from_secs(5),
            reconnect_settle_delay: Duration::from_secs(1),
            queue_scope: "default".to_string(),
            cache_max_age: 7 * 24 * HOUR,
        }
    }
}

impl OfflineConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_offline_actions == 0 {
            return Err(ConfigError::Zero {
                field: "max_offline_actions",
            });
        }
        if self.batch_size == 0 {
            return Err(ConfigError::Zero { field: "batch_size" });
        }
        if self.default_max_retries == 0 {
            return Err(ConfigError::Zero {
                field: "default_max_retries",
            });
        }
        non_zero("sync_interval", self.sync_interval)?;
        non_zero("connectivity_poll_interval", self.connectivity_poll_interval)?;
        if self.queue_scope.trim().is_empty() {
            return Err(ConfigError::OutOfRange {
                field: "queue_scope",
                reason: "cannot be empty".to_string(),
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub health: HealthConfig,
    pub session: SessionConfig,
    pub offline: OfflineConfig,
}

impl RuntimeConfig {
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.health.validate()?;
        self.session.validate()?;
        self.offline.validate()
    }
}
