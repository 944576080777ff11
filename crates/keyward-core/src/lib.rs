//! keyward core: secure session and credential lifecycle for API clients.
//!
//! - `vault`: encrypted key/value storage with a keychain-held data key
//! - `auth`: device fingerprint, token pair persistence, single-flight refresh
//! - `session`: session model, validation, lifecycle and auto-logout events
//! - `api`: auth API client and the authenticated request executor
//! - `client`: `AuthClient`, which wires all of the above from a `Config`

pub mod api;
pub mod auth;
pub mod client;
pub mod clock;
pub mod config;
pub mod error;
pub mod session;
pub mod vault;

pub use api::{ApiError, ApiRequest, AuthApi, AuthenticatedRequestExecutor, HttpAuthApi, User};
pub use auth::{Credential, DeviceIdentity, RefreshCoordinator, TokenStore};
pub use client::AuthClient;
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{Config, KeyStoreKind};
pub use error::{
    ConfigError, ExecuteError, RefreshError, RefreshErrorKind, SessionError, TokenStoreError,
    VaultError,
};
pub use session::{
    InvalidReason, LifecycleSettings, ListenerId, Session, SessionEvent, SessionLifecycle,
    SessionMetadata, SessionState, SessionValidator, Validity,
};
pub use vault::{KeyProtection, SecureVault};
