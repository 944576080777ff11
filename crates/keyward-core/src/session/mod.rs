//! Session management for authenticated API access.
//!
//! This module provides:
//! - `SessionLifecycle`: start, restore, activity tracking, auto-logout
//! - `SessionValidator`: expiry, device binding and inactivity checks
//! - `Listeners` / `SessionEvent`: notifications for sessions ended without a caller asking
//!
//! Sessions have an absolute 24 hour ceiling by default and end after
//! 30 minutes without activity.

pub mod events;
pub mod lifecycle;
pub mod model;
pub mod validator;

pub use events::{ListenerId, Listeners, SessionEvent};
pub use lifecycle::{LifecycleSettings, SessionLifecycle};
pub use model::{InvalidReason, Session, SessionMetadata, SessionState};
pub use validator::{SessionValidator, Validity};
