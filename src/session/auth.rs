use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::clock::UnixTimeMs;
use crate::error::{CoreError, ErrorKind, ErrorSeverity};

/// Credentials issued by the auth provider.
///
/// Tokens stay wrapped; anything leaving the session manager (events,
/// snapshots, logs) carries a [`SessionInfo`] instead.
#[derive(Debug)]
pub struct AuthSession {
    pub user_id: String,
    pub access_token: SecretString,
    pub refresh_token: SecretString,
    pub expires_at: UnixTimeMs,
}

impl AuthSession {
    pub fn new(
        user_id: impl Into<String>,
        access_token: impl Into<String>,
        refresh_token: impl Into<String>,
        expires_at: UnixTimeMs,
    ) -> Self {
        Self {
            user_id: user_id.into(),
            access_token: SecretString::new(access_token.into()),
            refresh_token: SecretString::new(refresh_token.into()),
            expires_at,
        }
    }

    pub fn info(&self) -> SessionInfo {
        SessionInfo {
            user_id: self.user_id.clone(),
            expires_at: self.expires_at,
        }
    }

    pub(crate) fn refresh_token_copy(&self) -> SecretString {
        SecretString::new(self.refresh_token.expose_secret().clone())
    }

    pub(crate) fn access_token_copy(&self) -> SecretString {
        SecretString::new(self.access_token.expose_secret().clone())
    }
}

/// Token-free view of a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionInfo {
    pub user_id: String,
    pub expires_at: UnixTimeMs,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthUser {
    pub id: String,
    pub email: Option<String>,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AuthError {
    #[error("network error: {0}")]
    Network(String),

    #[error("auth provider timed out")]
    Timeout,

    /// The provider refused the credentials; retrying will not help.
    #[error("rejected by auth provider: {0}")]
    Rejected(String),

    #[error("auth provider error: {0}")]
    Provider(String),
}

impl AuthError {
    pub fn severity(&self) -> ErrorSeverity {
        match self {
            AuthError::Rejected(_) => ErrorSeverity::Permanent,
            AuthError::Network(_) | AuthError::Timeout | AuthError::Provider(_) => {
                ErrorSeverity::Transient
            }
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.severity() == ErrorSeverity::Transient
    }
}

impl From<AuthError> for CoreError {
    fn from(e: AuthError) -> Self {
        let kind = match &e {
            AuthError::Network(_) => ErrorKind::Network,
            AuthError::Timeout => ErrorKind::Timeout,
            AuthError::Rejected(_) => ErrorKind::Authentication,
            AuthError::Provider(_) => ErrorKind::Unknown,
        };
        let severity = e.severity();
        CoreError::new(kind, e.to_string()).with_severity(severity)
    }
}

#[async_trait]
pub trait AuthProvider: Send + Sync {
    /// Current session as the provider sees it, `None` when signed out.
    async fn get_session(&self) -> Result<Option<AuthSession>, AuthError>;

    async fn refresh_session(&self, refresh_token: &SecretString) -> Result<AuthSession, AuthError>;

    async fn get_user(&self) -> Result<Option<AuthUser>, AuthError>;
}
