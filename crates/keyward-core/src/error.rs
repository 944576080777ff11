//! Error types shared across the vault, token, refresh and session layers.
//!
//! Each layer has its own enum so callers can tell a storage failure apart
//! from a revoked credential. Every variant here resolves toward the
//! logged-out state; none of them is recovered by pretending a session exists.

use thiserror::Error;

use crate::api::ApiError;

/// Failure loading, saving or validating `Config`.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("config is not valid JSON: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("could not find the platform {0} directory")]
    NoPlatformDir(&'static str),

    #[error("invalid config value for '{field}': {reason}")]
    Invalid { field: &'static str, reason: String },
}

/// Failure inside the encrypted vault (storage, crypto or serialization).
#[derive(Debug, Error)]
pub enum VaultError {
    #[error("storage error: {0}")]
    Storage(#[from] std::io::Error),

    #[error("encryption error: {0}")]
    Crypto(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("key store error: {0}")]
    KeyStore(String),

    #[error("stored value for '{key}' is not valid UTF-8")]
    InvalidUtf8 { key: String },

    #[error("vault location unavailable: {0}")]
    Config(#[from] ConfigError),
}

/// Failure writing or reading the access/refresh token pair.
#[derive(Debug, Error)]
pub enum TokenStoreError {
    #[error(transparent)]
    Vault(#[from] VaultError),

    /// The access token was written but the refresh token was not.
    #[error("credential only partially written (rolled back: {rolled_back}): {source}")]
    PartialWrite {
        rolled_back: bool,
        #[source]
        source: VaultError,
    },
}

/// Bare reason of a failed refresh, without the message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshErrorKind {
    Expired,
    Revoked,
    Network,
    Unknown,
}

/// Failure of a token refresh. Cloneable so every waiter of a shared refresh
/// observes the same value.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RefreshError {
    #[error("refresh token expired: {0}")]
    Expired(String),

    #[error("refresh token revoked: {0}")]
    Revoked(String),

    #[error("network error during refresh: {0}")]
    Network(String),

    #[error("refresh failed: {0}")]
    Unknown(String),
}

impl RefreshError {
    pub fn kind(&self) -> RefreshErrorKind {
        match self {
            RefreshError::Expired(_) => RefreshErrorKind::Expired,
            RefreshError::Revoked(_) => RefreshErrorKind::Revoked,
            RefreshError::Network(_) => RefreshErrorKind::Network,
            RefreshError::Unknown(_) => RefreshErrorKind::Unknown,
        }
    }

    /// Expired and revoked refresh tokens can never succeed again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, RefreshError::Expired(_) | RefreshError::Revoked(_))
    }
}

impl From<ApiError> for RefreshError {
    fn from(err: ApiError) -> Self {
        match err {
            ApiError::Network(e) => RefreshError::Network(e.to_string()),
            ApiError::Timeout(secs) => {
                RefreshError::Network(format!("timed out after {}s", secs))
            }
            ApiError::Unauthorized(body) | ApiError::AccessDenied(body) => {
                if body.to_ascii_lowercase().contains("expired") {
                    RefreshError::Expired(body)
                } else {
                    RefreshError::Revoked(body)
                }
            }
            other => RefreshError::Unknown(other.to_string()),
        }
    }
}

/// Failure to create, restore or persist a session.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("session storage failed: {0}")]
    Vault(#[from] VaultError),

    #[error("credential storage failed: {0}")]
    TokenStore(#[from] TokenStoreError),

    #[error("login failed: {0}")]
    Login(#[from] ApiError),

    #[error("http client setup failed: {0}")]
    HttpClient(#[from] reqwest::Error),

    #[error("no active session")]
    NoSession,
}

/// Failure of an authenticated request.
#[derive(Debug, Error)]
pub enum ExecuteError {
    /// The session was ended; the user has to log in again.
    #[error("reauthentication required")]
    ReauthenticationRequired { refresh_error: Option<RefreshError> },

    /// Refresh could not reach the auth server; the session is kept.
    #[error("credential refresh unavailable: {0}")]
    RefreshUnavailable(RefreshError),

    #[error("request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("credential storage failed: {0}")]
    Vault(#[from] VaultError),

    #[error("credential storage failed: {0}")]
    TokenStore(#[from] TokenStoreError),

    #[error("invalid request: {0}")]
    InvalidRequest(String),
}
