use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::auth::Credential;

/// Why a session stopped being usable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
pub enum InvalidReason {
    /// The absolute session ceiling passed.
    Expired,
    /// The session was created on a different installation.
    FingerprintMismatch,
    /// No activity within the inactivity ceiling.
    Inactive,
    /// The server rejected the credential and refresh could not recover it.
    ReauthenticationRequired,
}

impl std::fmt::Display for InvalidReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            InvalidReason::Expired => "session expired",
            InvalidReason::FingerprintMismatch => "device fingerprint mismatch",
            InvalidReason::Inactive => "inactive too long",
            InvalidReason::ReauthenticationRequired => "credential rejected",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
pub enum SessionState {
    NoSession,
    Active,
    /// Timers paused while the host app is in the background.
    Suspended,
    /// Logged out by expiry or inactivity.
    Expired,
    /// Logged out by a fingerprint mismatch or a rejected credential.
    Invalidated,
}

impl SessionState {
    /// Expired and Invalidated only record why the last session ended.
    pub fn is_logged_out(&self) -> bool {
        matches!(
            self,
            SessionState::NoSession | SessionState::Expired | SessionState::Invalidated
        )
    }
}

/// Everything about a session except its credential; persisted as JSON
/// under `session_metadata`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionMetadata {
    pub id: String,
    pub user_id: String,
    pub created_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub device_fingerprint: String,
    pub platform: String,
}

impl SessionMetadata {
    pub fn new(
        user_id: impl Into<String>,
        now: DateTime<Utc>,
        ttl: chrono::Duration,
        device_fingerprint: impl Into<String>,
    ) -> Self {
        Self {
            id: new_session_id(),
            user_id: user_id.into(),
            created_at: now,
            last_activity_at: now,
            expires_at: now.checked_add_signed(ttl).unwrap_or(DateTime::<Utc>::MAX_UTC),
            device_fingerprint: device_fingerprint.into(),
            platform: std::env::consts::OS.to_string(),
        }
    }
}

fn new_session_id() -> String {
    Uuid::new_v4().simple().to_string()
}

/// A live session: metadata plus the credential currently in the token store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub metadata: SessionMetadata,
    pub credential: Credential,
}

impl Session {
    pub fn id(&self) -> &str {
        &self.metadata.id
    }

    pub fn user_id(&self) -> &str {
        &self.metadata.user_id
    }
}
