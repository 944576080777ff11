//! Session creation, restoration, activity tracking and auto-logout.
//!
//! `SessionLifecycle` owns the one mutable session of this installation.
//! Every transition happens under a single async mutex, so "is the session
//! still active?" and the change that follows are atomic with respect to the
//! timers, the request executor and the host app.

use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use super::events::{ListenerId, Listeners, SessionEvent};
use super::model::{InvalidReason, Session, SessionMetadata, SessionState};
use super::validator::{SessionValidator, Validity};
use crate::api::User;
use crate::auth::{Credential, DeviceIdentity, RefreshCoordinator, TokenStore};
use crate::clock::Clock;
use crate::config::Config;
use crate::error::{SessionError, VaultError};
use crate::vault::{SecureVault, ACCESS_TOKEN_KEY, REFRESH_TOKEN_KEY, SESSION_METADATA_KEY};

/// Minimum gap between persisted activity timestamps (seconds).
const ACTIVITY_PERSIST_INTERVAL_SECS: i64 = 15;

/// Keys removed when a session ends. The device fingerprint survives.
const SESSION_KEYS: [&str; 3] = [ACCESS_TOKEN_KEY, REFRESH_TOKEN_KEY, SESSION_METADATA_KEY];

#[derive(Debug, Clone, Copy)]
pub struct LifecycleSettings {
    pub session_ttl: chrono::Duration,
    pub max_inactivity: chrono::Duration,
    pub check_interval: Duration,
}

impl From<&Config> for LifecycleSettings {
    fn from(config: &Config) -> Self {
        Self {
            session_ttl: config.session_ttl(),
            max_inactivity: config.max_inactivity(),
            check_interval: config.validity_check_interval(),
        }
    }
}

#[derive(Clone)]
pub struct SessionLifecycle {
    inner: Arc<LifecycleInner>,
}

struct LifecycleInner {
    vault: Arc<SecureVault>,
    tokens: Arc<TokenStore>,
    identity: Arc<DeviceIdentity>,
    validator: SessionValidator,
    refresher: RefreshCoordinator,
    clock: Arc<dyn Clock>,
    settings: LifecycleSettings,
    listeners: Listeners,
    current: Mutex<Current>,
}

struct Current {
    state: SessionState,
    metadata: Option<SessionMetadata>,
    last_persisted_activity: Option<DateTime<Utc>>,
    timers: Timers,
}

#[derive(Default)]
struct Timers {
    inactivity: Option<JoinHandle<()>>,
    validity: Option<JoinHandle<()>>,
}

impl Timers {
    fn cancel_inactivity(&mut self) {
        if let Some(handle) = self.inactivity.take() {
            handle.abort();
        }
    }

    fn cancel(&mut self) {
        self.cancel_inactivity();
        if let Some(handle) = self.validity.take() {
            handle.abort();
        }
    }
}

impl Drop for Timers {
    fn drop(&mut self) {
        self.cancel();
    }
}

impl SessionLifecycle {
    pub fn new(
        vault: Arc<SecureVault>,
        tokens: Arc<TokenStore>,
        identity: Arc<DeviceIdentity>,
        refresher: RefreshCoordinator,
        clock: Arc<dyn Clock>,
        settings: LifecycleSettings,
    ) -> Self {
        let validator = SessionValidator::new(identity.clone(), clock.clone(), settings.max_inactivity);
        Self {
            inner: Arc::new(LifecycleInner {
                vault,
                tokens,
                identity,
                validator,
                refresher,
                clock,
                settings,
                listeners: Listeners::new(),
                current: Mutex::new(Current {
                    state: SessionState::NoSession,
                    metadata: None,
                    last_persisted_activity: None,
                    timers: Timers::default(),
                }),
            }),
        }
    }

    // ===== Listeners =====

    pub fn on_auto_logout(&self, handler: impl Fn(&SessionEvent) + Send + Sync + 'static) -> ListenerId {
        self.inner.listeners.on_auto_logout(handler)
    }

    pub fn on_session_invalid(
        &self,
        handler: impl Fn(&SessionEvent) + Send + Sync + 'static,
    ) -> ListenerId {
        self.inner.listeners.on_session_invalid(handler)
    }

    pub fn remove_listener(&self, id: ListenerId) -> bool {
        self.inner.listeners.remove(id)
    }

    // ===== Queries =====

    pub async fn state(&self) -> SessionState {
        self.inner.current.lock().await.state
    }

    /// The active (or suspended) session with its current credential.
    pub async fn current_session(&self) -> Result<Option<Session>, SessionError> {
        let current = self.inner.current.lock().await;
        let Some(ref metadata) = current.metadata else {
            return Ok(None);
        };
        Ok(self.inner.tokens.credential()?.map(|credential| Session {
            metadata: metadata.clone(),
            credential,
        }))
    }

    // ===== Transitions =====

    /// Persist a new session for `user` and make it active.
    pub async fn start_session(&self, user: &User, credential: Credential) -> Result<Session, SessionError> {
        let fingerprint = self.inner.identity.fingerprint()?;
        let now = self.inner.clock.now();
        let metadata = SessionMetadata::new(&user.id, now, self.inner.settings.session_ttl, fingerprint);

        let mut current = self.inner.current.lock().await;
        current.timers.cancel();

        let persisted = self
            .inner
            .tokens
            .set_credential(&credential)
            .map_err(SessionError::from)
            .and_then(|_| {
                self.inner
                    .vault
                    .put_json(SESSION_METADATA_KEY, &metadata)
                    .map_err(SessionError::from)
            });

        if let Err(e) = persisted {
            warn!(error = %e, "Failed to persist new session");
            self.inner.purge();
            current.clear(SessionState::NoSession);
            return Err(e);
        }

        current.state = SessionState::Active;
        current.metadata = Some(metadata.clone());
        current.last_persisted_activity = Some(now);
        self.start_timers(&mut current, &metadata);

        info!(session_id = %metadata.id, user_id = %metadata.user_id, "Session started");
        Ok(Session { metadata, credential })
    }

    /// Load and validate the persisted session.
    ///
    /// Invalid sessions are purged and reported as `NoSession`. An expired
    /// access token gets one refresh attempt; failure purges as well.
    /// Storage failures are returned as errors and leave the state logged out.
    pub async fn restore_session(&self) -> Result<SessionState, SessionError> {
        let mut current = self.inner.current.lock().await;
        if matches!(current.state, SessionState::Active | SessionState::Suspended) {
            return Ok(current.state);
        }

        let loaded = self
            .inner
            .vault
            .get_json::<SessionMetadata>(SESSION_METADATA_KEY)
            .map_err(SessionError::from)
            .and_then(|metadata| Ok((metadata, self.inner.tokens.credential()?)));

        let (metadata, credential) = match loaded {
            Ok(loaded) => loaded,
            Err(e) => {
                warn!(error = %e, "Failed to load persisted session");
                current.clear(SessionState::NoSession);
                return Err(e);
            }
        };

        let Some(metadata) = metadata else {
            debug!("No persisted session");
            current.clear(SessionState::NoSession);
            return Ok(SessionState::NoSession);
        };

        let Some(credential) = credential else {
            warn!(session_id = %metadata.id, "Session metadata without credential; purging");
            self.inner.purge();
            current.clear(SessionState::NoSession);
            return Ok(SessionState::NoSession);
        };

        if let Validity::Invalid(reason) = self.inner.validator.validate(&metadata) {
            info!(session_id = %metadata.id, %reason, "Persisted session invalid; purging");
            self.inner.purge();
            current.clear(SessionState::NoSession);
            return Ok(SessionState::NoSession);
        }

        if credential.is_access_token_expired(self.inner.clock.now()) {
            debug!(session_id = %metadata.id, "Access token expired; refreshing before restore");
            if let Err(e) = self.inner.refresher.refresh(&credential.refresh_token).await {
                info!(session_id = %metadata.id, error = %e, "Refresh during restore failed; purging");
                self.inner.purge();
                current.clear(SessionState::NoSession);
                return Ok(SessionState::NoSession);
            }
        }

        current.state = SessionState::Active;
        current.last_persisted_activity = Some(metadata.last_activity_at);
        current.metadata = Some(metadata.clone());
        self.start_timers(&mut current, &metadata);

        info!(session_id = %metadata.id, user_id = %metadata.user_id, "Session restored");
        Ok(SessionState::Active)
    }

    /// Record user activity. Does nothing unless a session is active.
    pub async fn update_activity(&self) {
        let mut current = self.inner.current.lock().await;
        if current.state != SessionState::Active {
            return;
        }
        let now = self.inner.clock.now();
        let Some(ref mut metadata) = current.metadata else {
            return;
        };
        metadata.last_activity_at = now;
        let session_id = metadata.id.clone();

        let due = current
            .last_persisted_activity
            .map(|last| now - last >= chrono::Duration::seconds(ACTIVITY_PERSIST_INTERVAL_SECS))
            .unwrap_or(true);
        if due {
            if let Err(e) = self.inner.persist_metadata(&current) {
                // a stale timestamp on disk only makes the next restore stricter
                warn!(error = %e, "Failed to persist session activity");
            } else {
                current.last_persisted_activity = Some(now);
            }
        }

        current.timers.cancel_inactivity();
        current.timers.inactivity = Some(self.spawn_inactivity_timer(&session_id, now));
    }

    /// End the session at the caller's request. Succeeds when there is none.
    pub async fn end_session(&self) -> Result<(), SessionError> {
        let mut current = self.inner.current.lock().await;
        let had_session = current.metadata.is_some();
        current.clear(SessionState::NoSession);
        self.inner.vault.clear(&SESSION_KEYS)?;
        if had_session {
            info!("Session ended");
        }
        Ok(())
    }

    /// End the live session because the server no longer accepts its
    /// credential.
    ///
    /// Returns whether this call ended a live session; only that call
    /// purges storage and notifies `on_session_invalid`.
    pub async fn force_logout(&self, reason: InvalidReason) -> bool {
        self.end_live_session(None, reason).await
    }

    /// Like `force_logout`, but only if `session_id` is still the live
    /// session. A failure observed for an older session leaves a newer one
    /// alone.
    pub async fn force_logout_session(&self, session_id: &str, reason: InvalidReason) -> bool {
        self.end_live_session(Some(session_id), reason).await
    }

    async fn end_live_session(&self, expected: Option<&str>, reason: InvalidReason) -> bool {
        let ended = {
            let mut current = self.inner.current.lock().await;
            let live = matches!(current.state, SessionState::Active | SessionState::Suspended);
            let live_id = current.metadata.as_ref().map(|m| m.id.as_str());
            let matches = match expected {
                Some(expected) => live_id == Some(expected),
                None => true,
            };
            if !(live && matches) {
                debug!(%reason, "No matching live session to log out");
                return false;
            }
            warn!(%reason, "Forcing logout");
            self.inner.purge();
            current.clear(SessionState::Invalidated);
            true
        };

        if ended {
            self.inner.listeners.emit(SessionEvent::SessionInvalid { reason });
        }
        ended
    }

    /// Run the validity check now; the periodic timer calls this.
    ///
    /// Returns the reason when the check ended the active session.
    pub async fn validate_now(&self) -> Option<InvalidReason> {
        let reason = {
            let mut current = self.inner.current.lock().await;
            if current.state != SessionState::Active {
                return None;
            }
            self.end_if_invalid(&mut current)?
        };

        self.inner.listeners.emit(SessionEvent::SessionInvalid { reason });
        Some(reason)
    }

    /// Decide whether an outgoing request may carry the stored credential.
    ///
    /// Returns the id of the session the credential belongs to, or `None`
    /// when there is no live session and the request goes out anonymously.
    /// A live (or suspended) session that fails validation is ended first
    /// and the reason returned.
    pub async fn authorize_request(&self) -> Result<Option<String>, InvalidReason> {
        let reason = {
            let mut current = self.inner.current.lock().await;
            if !matches!(current.state, SessionState::Active | SessionState::Suspended) {
                return Ok(None);
            }
            match self.end_if_invalid(&mut current) {
                Some(reason) => reason,
                None => return Ok(current.metadata.as_ref().map(|m| m.id.clone())),
            }
        };

        self.inner.listeners.emit(SessionEvent::SessionInvalid { reason });
        Err(reason)
    }

    /// Validate the in-memory session; on failure purge it and move to the
    /// matching logged-out state. The caller emits the event after unlocking.
    fn end_if_invalid(&self, current: &mut Current) -> Option<InvalidReason> {
        let metadata = current.metadata.as_ref()?;
        let reason = self.inner.validator.validate(metadata).reason()?;

        info!(session_id = %metadata.id, %reason, "Session failed validity check");
        self.inner.purge();
        current.clear(state_for(reason));
        Some(reason)
    }

    /// Pause timers while the host app is in the background.
    pub async fn suspend(&self) {
        let mut current = self.inner.current.lock().await;
        if current.state != SessionState::Active {
            return;
        }
        current.timers.cancel();
        current.state = SessionState::Suspended;
        if let Err(e) = self.inner.persist_metadata(&current) {
            warn!(error = %e, "Failed to persist session on suspend");
        }
        debug!("Session suspended");
    }

    /// Re-validate a suspended session and resume its timers.
    pub async fn resume(&self) -> SessionState {
        let (state, reason) = {
            let mut current = self.inner.current.lock().await;
            if current.state != SessionState::Suspended {
                return current.state;
            }
            let Some(metadata) = current.metadata.clone() else {
                current.clear(SessionState::NoSession);
                return SessionState::NoSession;
            };

            match self.inner.validator.validate(&metadata) {
                Validity::Valid => {
                    current.state = SessionState::Active;
                    self.start_timers(&mut current, &metadata);
                    debug!(session_id = %metadata.id, "Session resumed");
                    (SessionState::Active, None)
                }
                Validity::Invalid(reason) => {
                    info!(session_id = %metadata.id, %reason, "Suspended session invalid on resume");
                    self.inner.purge();
                    current.clear(state_for(reason));
                    (current.state, Some(reason))
                }
            }
        };

        if let Some(reason) = reason {
            self.inner.listeners.emit(SessionEvent::SessionInvalid { reason });
        }
        state
    }

    /// Stop all timers without touching persisted state.
    pub async fn shutdown(&self) {
        self.inner.current.lock().await.timers.cancel();
        debug!("Session lifecycle shut down");
    }

    // ===== Timers =====

    fn start_timers(&self, current: &mut Current, metadata: &SessionMetadata) {
        current.timers.cancel();
        current.timers.inactivity =
            Some(self.spawn_inactivity_timer(&metadata.id, metadata.last_activity_at));
        current.timers.validity = Some(self.spawn_validity_timer());
    }

    /// Fire when the inactivity window that started at `last_activity_at`
    /// closes; immediately if it already has.
    fn spawn_inactivity_timer(&self, session_id: &str, last_activity_at: DateTime<Utc>) -> JoinHandle<()> {
        let weak = Arc::downgrade(&self.inner);
        let session_id = session_id.to_string();
        let idle = self.inner.clock.now() - last_activity_at;
        let after = (self.inner.settings.max_inactivity - idle)
            .to_std()
            .unwrap_or(Duration::ZERO);

        tokio::spawn(async move {
            tokio::time::sleep(after).await;
            if let Some(lifecycle) = upgrade(&weak) {
                lifecycle.expire_inactive(&session_id).await;
            }
        })
    }

    fn spawn_validity_timer(&self) -> JoinHandle<()> {
        let weak = Arc::downgrade(&self.inner);
        let period = self.inner.settings.check_interval;

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // the first tick completes immediately
            interval.tick().await;
            loop {
                interval.tick().await;
                let Some(lifecycle) = upgrade(&weak) else {
                    break;
                };
                if lifecycle.validate_now().await.is_some() {
                    break;
                }
            }
        })
    }

    async fn expire_inactive(&self, session_id: &str) {
        {
            let mut current = self.inner.current.lock().await;
            let matches = current.state == SessionState::Active
                && current.metadata.as_ref().map(|m| m.id.as_str()) == Some(session_id);
            if !matches {
                return;
            }
            info!(session_id, "Inactivity timeout; logging out");
            self.inner.purge();
            current.clear(SessionState::Expired);
        }

        self.inner.listeners.emit(SessionEvent::AutoLogout {
            reason: InvalidReason::Inactive,
        });
    }
}

fn upgrade(weak: &Weak<LifecycleInner>) -> Option<SessionLifecycle> {
    weak.upgrade().map(|inner| SessionLifecycle { inner })
}

fn state_for(reason: InvalidReason) -> SessionState {
    match reason {
        InvalidReason::Expired | InvalidReason::Inactive => SessionState::Expired,
        InvalidReason::FingerprintMismatch | InvalidReason::ReauthenticationRequired => {
            SessionState::Invalidated
        }
    }
}

impl Current {
    fn clear(&mut self, state: SessionState) {
        self.timers.cancel();
        self.state = state;
        self.metadata = None;
        self.last_persisted_activity = None;
    }
}

impl LifecycleInner {
    /// Remove every persisted trace of the session. Failures are logged; the
    /// in-memory state is logged out either way.
    fn purge(&self) {
        if let Err(e) = self.vault.clear(&SESSION_KEYS) {
            warn!(error = %e, "Failed to purge session storage");
        }
    }

    fn persist_metadata(&self, current: &Current) -> Result<(), VaultError> {
        match current.metadata {
            Some(ref metadata) => self.vault.put_json(SESSION_METADATA_KEY, metadata),
            None => Ok(()),
        }
    }
}
