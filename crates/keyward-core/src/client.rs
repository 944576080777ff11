//! `AuthClient` wires the vault, token store, refresh coordinator, session
//! lifecycle and request executor together from a `Config`.

use std::sync::Arc;

use reqwest::{Client, Response};
use tracing::{debug, warn};

use crate::api::{ApiRequest, AuthApi, AuthenticatedRequestExecutor, HttpAuthApi, User};
use crate::auth::{Credential, DeviceIdentity, RefreshCoordinator, TokenStore};
use crate::clock::{Clock, SystemClock};
use crate::config::Config;
use crate::error::{ExecuteError, SessionError};
use crate::session::{
    LifecycleSettings, ListenerId, Session, SessionEvent, SessionLifecycle, SessionState,
};
use crate::vault::{KeyProtection, SecureVault};

/// The caller-facing entry point. Clone is cheap; clones share one session.
#[derive(Clone)]
pub struct AuthClient {
    api: Arc<dyn AuthApi>,
    vault: Arc<SecureVault>,
    tokens: Arc<TokenStore>,
    lifecycle: SessionLifecycle,
    executor: AuthenticatedRequestExecutor,
}

impl AuthClient {
    /// Open the on-disk vault and talk to `config.api_base_url` over HTTP.
    pub fn new(config: &Config) -> Result<Self, SessionError> {
        let vault = Arc::new(SecureVault::open(config)?);
        let http = build_http_client(config)?;
        let api = Arc::new(HttpAuthApi::with_client(
            http.clone(),
            &config.api_base_url,
            config.request_timeout(),
        ));
        Ok(Self::assemble(config, vault, api, Arc::new(SystemClock), http))
    }

    /// Build from explicit parts. Used by tests and hosts that bring their
    /// own storage or auth backend.
    pub fn with_parts(
        config: &Config,
        vault: Arc<SecureVault>,
        api: Arc<dyn AuthApi>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, SessionError> {
        let http = build_http_client(config)?;
        Ok(Self::assemble(config, vault, api, clock, http))
    }

    fn assemble(
        config: &Config,
        vault: Arc<SecureVault>,
        api: Arc<dyn AuthApi>,
        clock: Arc<dyn Clock>,
        http: Client,
    ) -> Self {
        let tokens = Arc::new(TokenStore::new(vault.clone()));
        let identity = Arc::new(DeviceIdentity::new(vault.clone()));
        let refresher = RefreshCoordinator::new(api.clone(), tokens.clone(), config.refresh_timeout());
        let lifecycle = SessionLifecycle::new(
            vault.clone(),
            tokens.clone(),
            identity,
            refresher.clone(),
            clock,
            LifecycleSettings::from(config),
        );
        let executor = AuthenticatedRequestExecutor::with_client(
            http,
            &config.api_base_url,
            tokens.clone(),
            refresher,
            lifecycle.clone(),
        );

        Self {
            api,
            vault,
            tokens,
            lifecycle,
            executor,
        }
    }

    /// How well the vault's data key is protected on this machine.
    pub fn key_protection(&self) -> KeyProtection {
        self.vault.protection()
    }

    // ===== Authentication =====

    /// Exchange credentials for tokens and start a session.
    pub async fn login(&self, email: &str, password: &str) -> Result<Session, SessionError> {
        let response = self.api.login(email, password).await?;
        let credential = Credential::new(response.access_token, response.refresh_token);
        self.lifecycle.start_session(&response.user, credential).await
    }

    /// Tell the server the session is over, then clear it locally. The local
    /// session ends even if the server cannot be reached.
    pub async fn logout(&self) -> Result<(), SessionError> {
        match self.tokens.access_token() {
            Ok(Some(token)) => {
                if let Err(e) = self.api.logout(&token).await {
                    warn!(error = %e, "Remote logout failed; clearing local session anyway");
                }
            }
            Ok(None) => debug!("No access token; skipping remote logout"),
            Err(e) => warn!(error = %e, "Could not read access token for remote logout"),
        }
        self.lifecycle.end_session().await
    }

    // ===== Session =====

    pub async fn start_session(&self, user: &User, credential: Credential) -> Result<Session, SessionError> {
        self.lifecycle.start_session(user, credential).await
    }

    pub async fn restore_session(&self) -> Result<SessionState, SessionError> {
        self.lifecycle.restore_session().await
    }

    pub async fn end_session(&self) -> Result<(), SessionError> {
        self.lifecycle.end_session().await
    }

    pub async fn update_activity(&self) {
        self.lifecycle.update_activity().await
    }

    pub async fn suspend(&self) {
        self.lifecycle.suspend().await
    }

    pub async fn resume(&self) -> SessionState {
        self.lifecycle.resume().await
    }

    pub async fn state(&self) -> SessionState {
        self.lifecycle.state().await
    }

    pub async fn current_session(&self) -> Result<Option<Session>, SessionError> {
        self.lifecycle.current_session().await
    }

    pub async fn shutdown(&self) {
        self.lifecycle.shutdown().await
    }

    // ===== Requests =====

    pub async fn execute(&self, request: &ApiRequest) -> Result<Response, ExecuteError> {
        self.executor.execute(request).await
    }

    // ===== Events =====

    pub fn on_auto_logout(&self, handler: impl Fn(&SessionEvent) + Send + Sync + 'static) -> ListenerId {
        self.lifecycle.on_auto_logout(handler)
    }

    pub fn on_session_invalid(
        &self,
        handler: impl Fn(&SessionEvent) + Send + Sync + 'static,
    ) -> ListenerId {
        self.lifecycle.on_session_invalid(handler)
    }

    pub fn remove_listener(&self, id: ListenerId) -> bool {
        self.lifecycle.remove_listener(id)
    }
}

fn build_http_client(config: &Config) -> Result<Client, SessionError> {
    Ok(Client::builder().timeout(config.request_timeout()).build()?)
}
