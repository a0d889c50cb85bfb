use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// How a failure is recovered from.
///
/// `Transient` failures heal at the next natural schedule point, `Permanent`
/// ones need user action, `Fatal` ones mean the orchestration itself broke
/// and a worst-case result was synthesized in its place.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorSeverity {
    Transient,
    Permanent,
    Fatal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    Network,
    Timeout,
    Authentication,
    Storage,
    QuotaExceeded,
    Serialization,
    Validation,
    Configuration,
    InvalidState,
    Internal,
    Unknown,
}

impl ErrorKind {
    #[must_use]
    pub const fn code(self) -> &'static str {
        match self {
            Self::Network => "NETWORK_ERROR",
            Self::Timeout => "TIMEOUT",
            Self::Authentication => "AUTH_ERROR",
            Self::Storage => "STORAGE_ERROR",
            Self::QuotaExceeded => "QUOTA_EXCEEDED",
            Self::Serialization => "SERIALIZATION_ERROR",
            Self::Validation => "VALIDATION_ERROR",
            Self::Configuration => "CONFIG_ERROR",
            Self::InvalidState => "INVALID_STATE",
            Self::Internal => "INTERNAL_ERROR",
            Self::Unknown => "UNKNOWN_ERROR",
        }
    }

    #[must_use]
    pub const fn default_severity(self) -> ErrorSeverity {
        match self {
            Self::Network | Self::Timeout | Self::Storage => ErrorSeverity::Transient,

            Self::Serialization | Self::InvalidState | Self::Internal => ErrorSeverity::Fatal,

            Self::Authentication
            | Self::QuotaExceeded
            | Self::Validation
            | Self::Configuration
            | Self::Unknown => ErrorSeverity::Permanent,
        }
    }

    #[must_use]
    pub const fn is_retryable(self) -> bool {
        matches!(self, Self::Network | Self::Timeout | Self::Storage)
    }
}

/// Failure report that crosses component boundaries (events, results).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CoreError {
    pub kind: ErrorKind,
    pub severity: ErrorSeverity,
    pub message: String,
    pub context: HashMap<String, String>,
}

impl CoreError {
    #[must_use]
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            severity: kind.default_severity(),
            message: message.into(),
            context: HashMap::new(),
        }
    }

    #[must_use]
    pub fn with_severity(mut self, severity: ErrorSeverity) -> Self {
        self.severity = severity;
        self
    }

    #[must_use]
    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }

    #[must_use]
    pub const fn code(&self) -> &'static str {
        self.kind.code()
    }

    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        self.kind.is_retryable() && matches!(self.severity, ErrorSeverity::Transient)
    }

    #[must_use]
    pub fn user_facing_message(&self) -> String {
        match self.kind {
            ErrorKind::Network => {
                "Unable to connect. Your changes are saved and will sync when you're back online."
                    .into()
            }
            ErrorKind::Timeout => "The request timed out. It will be retried shortly.".into(),
            ErrorKind::Authentication => "Your session has expired. Please sign in again.".into(),
            ErrorKind::Storage | ErrorKind::QuotaExceeded => {
                "Unable to save data locally. Please free up some storage space.".into()
            }
            ErrorKind::Validation | ErrorKind::Configuration => self.message.clone(),
            ErrorKind::Serialization
            | ErrorKind::InvalidState
            | ErrorKind::Internal
            | ErrorKind::Unknown => {
                "An unexpected error occurred. Please reload if this persists.".into()
            }
        }
    }
}

impl std::fmt::Display for CoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}", self.code(), self.message)
    }
}

impl std::error::Error for CoreError {}
