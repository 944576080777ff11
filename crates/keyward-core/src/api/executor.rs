//! Authenticated request execution with transparent re-authentication.
//!
//! Requests made while a session is live carry its access token as a bearer
//! credential; with no live session they go out anonymously. A 401
//! triggers one refresh through the shared coordinator and one replay of the
//! original request. Requests are kept as plain data (`ApiRequest`) so they
//! can be rebuilt for the replay.

use std::sync::Arc;
use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::{Client, Method, Response, StatusCode};
use serde::Serialize;
use tracing::{debug, instrument, warn};

use crate::auth::{RefreshCoordinator, TokenStore};
use crate::error::{ExecuteError, RefreshErrorKind};
use crate::session::{InvalidReason, SessionLifecycle};

/// A request that can be dispatched more than once.
#[derive(Debug, Clone)]
pub struct ApiRequest {
    method: Method,
    path: String,
    query: Vec<(String, String)>,
    headers: HeaderMap,
    body: Option<serde_json::Value>,
}

impl ApiRequest {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            query: Vec::new(),
            headers: HeaderMap::new(),
            body: None,
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::GET, path)
    }

    pub fn post(path: impl Into<String>) -> Self {
        Self::new(Method::POST, path)
    }

    pub fn put(path: impl Into<String>) -> Self {
        Self::new(Method::PUT, path)
    }

    pub fn delete(path: impl Into<String>) -> Self {
        Self::new(Method::DELETE, path)
    }

    pub fn query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((key.into(), value.into()));
        self
    }

    pub fn header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    pub fn json<B: Serialize>(mut self, body: &B) -> Result<Self, ExecuteError> {
        let value = serde_json::to_value(body)
            .map_err(|e| ExecuteError::InvalidRequest(format!("unserializable body: {}", e)))?;
        self.body = Some(value);
        Ok(self)
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn path(&self) -> &str {
        &self.path
    }
}

/// Dispatches requests on behalf of the active session.
/// Clone is cheap - every field is shared.
#[derive(Clone)]
pub struct AuthenticatedRequestExecutor {
    client: Client,
    base_url: String,
    tokens: Arc<TokenStore>,
    refresher: RefreshCoordinator,
    lifecycle: SessionLifecycle,
}

impl AuthenticatedRequestExecutor {
    pub fn new(
        base_url: impl Into<String>,
        timeout: Duration,
        tokens: Arc<TokenStore>,
        refresher: RefreshCoordinator,
        lifecycle: SessionLifecycle,
    ) -> Result<Self, ExecuteError> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self::with_client(client, base_url, tokens, refresher, lifecycle))
    }

    /// Share an existing connection pool.
    pub fn with_client(
        client: Client,
        base_url: impl Into<String>,
        tokens: Arc<TokenStore>,
        refresher: RefreshCoordinator,
        lifecycle: SessionLifecycle,
    ) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            tokens,
            refresher,
            lifecycle,
        }
    }

    /// Send `request` with the current credential.
    ///
    /// Non-401 responses, successful or not, are returned unchanged. A 401
    /// is answered with at most one refresh and one replay.
    #[instrument(skip(self, request), fields(method = %request.method, path = %request.path))]
    pub async fn execute(&self, request: &ApiRequest) -> Result<Response, ExecuteError> {
        let session_id = match self.lifecycle.authorize_request().await {
            Ok(session_id) => session_id,
            Err(reason) => {
                debug!(%reason, "Session no longer valid; request not sent");
                return Err(ExecuteError::ReauthenticationRequired {
                    refresh_error: None,
                });
            }
        };

        // only a live session's credential is ever attached
        let sent_token = match session_id {
            Some(ref id) => match self.tokens.access_token()? {
                Some(token) => Some(token),
                None => {
                    warn!("Live session has no access token");
                    self.lifecycle
                        .force_logout_session(id, InvalidReason::ReauthenticationRequired)
                        .await;
                    return Err(ExecuteError::ReauthenticationRequired {
                        refresh_error: None,
                    });
                }
            },
            None => None,
        };

        let response = self.dispatch(request, sent_token.as_deref()).await?;
        if response.status() != StatusCode::UNAUTHORIZED {
            return Ok(response);
        }

        let (Some(session_id), Some(sent_token)) = (session_id, sent_token) else {
            // anonymous request; nothing to re-authenticate
            return Ok(response);
        };

        let Some(stored) = self.tokens.credential()? else {
            debug!("Session ended while request was in flight");
            self.lifecycle
                .force_logout_session(&session_id, InvalidReason::ReauthenticationRequired)
                .await;
            return Err(ExecuteError::ReauthenticationRequired {
                refresh_error: None,
            });
        };

        let credential = if stored.access_token != sent_token {
            debug!("Credential rotated while request was in flight; replaying");
            stored
        } else {
            match self.refresher.refresh(&stored.refresh_token).await {
                Ok(credential) => credential,
                Err(e) if e.kind() == RefreshErrorKind::Network => {
                    warn!(error = %e, "Refresh unreachable; keeping session");
                    return Err(ExecuteError::RefreshUnavailable(e));
                }
                Err(e) => {
                    self.lifecycle
                        .force_logout_session(&session_id, InvalidReason::ReauthenticationRequired)
                        .await;
                    return Err(ExecuteError::ReauthenticationRequired {
                        refresh_error: Some(e),
                    });
                }
            }
        };

        let replay = self.dispatch(request, Some(&credential.access_token)).await?;
        if replay.status() == StatusCode::UNAUTHORIZED {
            warn!("Replay rejected with a fresh credential");
            self.lifecycle
                .force_logout_session(&session_id, InvalidReason::ReauthenticationRequired)
                .await;
            return Err(ExecuteError::ReauthenticationRequired {
                refresh_error: None,
            });
        }
        Ok(replay)
    }

    async fn dispatch(&self, request: &ApiRequest, token: Option<&str>) -> Result<Response, ExecuteError> {
        if !request.path.starts_with('/') {
            return Err(ExecuteError::InvalidRequest(format!(
                "path must start with '/': {}",
                request.path
            )));
        }

        let url = format!("{}{}", self.base_url, request.path);
        let mut builder = self
            .client
            .request(request.method.clone(), &url)
            .headers(request.headers.clone());
        if !request.query.is_empty() {
            builder = builder.query(&request.query);
        }
        if let Some(token) = token {
            builder = builder.bearer_auth(token);
        }
        if let Some(ref body) = request.body {
            builder = builder.json(body);
        }

        Ok(builder.send().await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_builder_collects_parts() {
        let request = ApiRequest::post("/coupons/redeem")
            .query("venue", "42")
            .header(
                HeaderName::from_static("x-request-id"),
                HeaderValue::from_static("abc"),
            )
            .json(&serde_json::json!({"code": "SUMMER"}))
            .unwrap();

        assert_eq!(request.method(), Method::POST);
        assert_eq!(request.path(), "/coupons/redeem");
        assert_eq!(request.query, vec![("venue".to_string(), "42".to_string())]);
        assert_eq!(request.headers.get("x-request-id").unwrap(), "abc");
        assert_eq!(request.body.as_ref().unwrap()["code"], "SUMMER");
    }

    #[test]
    fn test_clone_preserves_body_for_replay() {
        let request = ApiRequest::put("/profile")
            .json(&serde_json::json!({"name": "A"}))
            .unwrap();
        let replay = request.clone();
        assert_eq!(replay.body, request.body);
        assert_eq!(replay.method(), Method::PUT);
    }
}
