//! Single-flight access-token refresh.
//!
//! Authorization servers treat a refresh token as single-use. If every request
//! that hit a 401 exchanged it independently, only the first exchange would
//! succeed and the rest would read as revocations. The coordinator keeps at
//! most one exchange in flight and hands its outcome to every caller. A failed
//! outcome is also handed to callers that present the same refresh token
//! shortly after it settled, so a slow 401 does not start a second exchange.

use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use futures::future::{BoxFuture, FutureExt, Shared};
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::tokens::{Credential, TokenStore};
use crate::api::AuthApi;
use crate::error::RefreshError;

type PendingRefresh = Shared<BoxFuture<'static, Result<Credential, RefreshError>>>;

#[derive(Clone)]
pub struct RefreshCoordinator {
    inner: Arc<CoordinatorInner>,
}

struct CoordinatorInner {
    api: Arc<dyn AuthApi>,
    tokens: Arc<TokenStore>,
    timeout: Duration,
    in_flight: Mutex<Option<PendingRefresh>>,
    last_failure: StdMutex<Option<SettledFailure>>,
}

/// The most recent failed exchange, kept for one refresh timeout.
struct SettledFailure {
    refresh_token: String,
    error: RefreshError,
    settled_at: Instant,
}

impl RefreshCoordinator {
    pub fn new(api: Arc<dyn AuthApi>, tokens: Arc<TokenStore>, timeout: Duration) -> Self {
        Self {
            inner: Arc::new(CoordinatorInner {
                api,
                tokens,
                timeout,
                in_flight: Mutex::new(None),
                last_failure: StdMutex::new(None),
            }),
        }
    }

    /// Exchange `current_refresh_token` for a new credential, or join the
    /// exchange already in flight.
    ///
    /// The exchange runs on its own task: dropping this future does not
    /// cancel it for the other waiters.
    pub async fn refresh(&self, current_refresh_token: &str) -> Result<Credential, RefreshError> {
        let pending = {
            let mut in_flight = self.inner.in_flight.lock().await;
            match in_flight.as_ref() {
                Some(pending) => {
                    debug!("Joining in-flight refresh");
                    pending.clone()
                }
                None => {
                    if let Some(stored) = self.already_rotated(current_refresh_token) {
                        debug!("Refresh token already rotated; reusing stored credential");
                        return Ok(stored);
                    }
                    if let Some(error) = self.inner.recent_failure(current_refresh_token) {
                        debug!(reason = ?error.kind(), "Refresh token failed moments ago; reusing outcome");
                        return Err(error);
                    }
                    let pending = Self::issue(self.inner.clone(), current_refresh_token.to_string())
                        .boxed()
                        .shared();
                    *in_flight = Some(pending.clone());
                    pending
                }
            }
        };

        pending.await
    }

    /// Whether a refresh is currently in flight.
    pub async fn is_refreshing(&self) -> bool {
        self.inner.in_flight.lock().await.is_some()
    }

    /// A caller holding an older refresh token arrived after an exchange
    /// completed; the stored pair is already the answer.
    fn already_rotated(&self, presented: &str) -> Option<Credential> {
        match self.inner.tokens.credential() {
            Ok(Some(stored)) if stored.refresh_token != presented => Some(stored),
            _ => None,
        }
    }

    async fn issue(inner: Arc<CoordinatorInner>, refresh_token: String) -> Result<Credential, RefreshError> {
        let task_inner = inner.clone();
        let handle = tokio::spawn(async move {
            let result = task_inner.exchange(&refresh_token).await;
            task_inner.record_outcome(&refresh_token, &result);
            // persisted (on success) before the marker clears and waiters wake
            task_inner.in_flight.lock().await.take();
            result
        });

        match handle.await {
            Ok(result) => result,
            Err(e) => {
                warn!(error = %e, "Refresh task failed");
                inner.in_flight.lock().await.take();
                Err(RefreshError::Unknown(format!("refresh task failed: {}", e)))
            }
        }
    }
}

impl CoordinatorInner {
    fn recent_failure(&self, presented: &str) -> Option<RefreshError> {
        let last = self.last_failure.lock().unwrap_or_else(|e| e.into_inner());
        match *last {
            Some(ref failure)
                if failure.refresh_token == presented && failure.settled_at.elapsed() < self.timeout =>
            {
                Some(failure.error.clone())
            }
            _ => None,
        }
    }

    fn record_outcome(&self, refresh_token: &str, result: &Result<Credential, RefreshError>) {
        let mut last = self.last_failure.lock().unwrap_or_else(|e| e.into_inner());
        *last = match result {
            Ok(_) => None,
            Err(error) => Some(SettledFailure {
                refresh_token: refresh_token.to_string(),
                error: error.clone(),
                settled_at: Instant::now(),
            }),
        };
    }

    async fn exchange(&self, refresh_token: &str) -> Result<Credential, RefreshError> {
        info!("Refreshing access token");

        let response = tokio::time::timeout(self.timeout, self.api.refresh(refresh_token))
            .await
            .map_err(|_| {
                RefreshError::Network(format!("timed out after {}s", self.timeout.as_secs()))
            })?
            .map_err(RefreshError::from);

        let response = match response {
            Ok(response) => response,
            Err(e) => {
                warn!(reason = ?e.kind(), error = %e, "Token refresh failed");
                return Err(e);
            }
        };

        let credential = Credential::new(
            response.access_token,
            response
                .refresh_token
                .unwrap_or_else(|| refresh_token.to_string()),
        );

        self.tokens.set_credential(&credential).map_err(|e| {
            warn!(error = %e, "Failed to persist refreshed credential");
            RefreshError::Unknown(format!("failed to persist refreshed credential: {}", e))
        })?;

        debug!("Access token refreshed");
        Ok(credential)
    }
}
