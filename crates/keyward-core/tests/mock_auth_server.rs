//! End-to-end tests for `AuthClient` against a mock auth server.
//!
//! wiremock stands in for both the auth endpoints and the protected API, so
//! login, refresh and replay run through real HTTP without network access.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use keyward_core::vault::{FileStorage, PassphraseKeyProvider};
use keyward_core::{
    ApiError, ApiRequest, AuthClient, Config, Credential, ExecuteError, HttpAuthApi, ManualClock,
    RefreshErrorKind, SecureVault, SessionError, SessionEvent, SessionState, SystemClock, User,
};
use reqwest::StatusCode;
use serde_json::json;
use wiremock::matchers::{body_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn config_for(server: &MockServer) -> Config {
    Config {
        api_base_url: server.uri(),
        request_timeout_secs: 5,
        refresh_timeout_secs: 5,
        ..Config::default()
    }
}

fn client_for(server: &MockServer) -> AuthClient {
    let config = config_for(server);
    let api = Arc::new(HttpAuthApi::new(server.uri(), Duration::from_secs(5)).unwrap());
    AuthClient::with_parts(
        &config,
        Arc::new(SecureVault::in_memory()),
        api,
        Arc::new(SystemClock),
    )
    .unwrap()
}

fn counter() -> Arc<AtomicUsize> {
    Arc::new(AtomicUsize::new(0))
}

fn counting(counter: &Arc<AtomicUsize>) -> impl Fn(&SessionEvent) + Send + Sync + 'static {
    let counter = counter.clone();
    move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    }
}

async fn mount_protected(server: &MockServer, token: &str, status: u16) {
    Mock::given(method("GET"))
        .and(path("/data"))
        .and(header("authorization", format!("Bearer {}", token).as_str()))
        .respond_with(ResponseTemplate::new(status).set_body_json(json!({"token": token})))
        .mount(server)
        .await;
}

// ============================================================================
// Login / logout
// ============================================================================

#[tokio::test]
async fn test_login_starts_session() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/auth/login"))
        .and(body_json(json!({"email": "ada@example.com", "password": "hunter2"})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "accessToken": "a1",
            "refreshToken": "r1",
            "user": {"id": 42, "email": "ada@example.com"}
        })))
        .expect(1)
        .mount(&server)
        .await;

    let client = client_for(&server);
    let session = client.login("ada@example.com", "hunter2").await.unwrap();

    assert_eq!(session.user_id(), "42");
    assert_eq!(session.credential, Credential::new("a1", "r1"));
    assert_eq!(client.state().await, SessionState::Active);
}

#[tokio::test]
async fn test_login_rejected_leaves_no_session() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/auth/login"))
        .respond_with(ResponseTemplate::new(401).set_body_string("bad credentials"))
        .mount(&server)
        .await;

    let client = client_for(&server);
    let err = client.login("ada@example.com", "wrong").await.unwrap_err();

    assert!(matches!(err, SessionError::Login(ApiError::Unauthorized(_))));
    assert_eq!(client.state().await, SessionState::NoSession);
    assert!(client.current_session().await.unwrap().is_none());
}

#[tokio::test]
async fn test_logout_notifies_server_and_clears_session() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/auth/logout"))
        .and(header("authorization", "Bearer a1"))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&server)
        .await;

    let client = client_for(&server);
    client
        .start_session(&User::new("u1"), Credential::new("a1", "r1"))
        .await
        .unwrap();

    client.logout().await.unwrap();

    assert_eq!(client.state().await, SessionState::NoSession);
    assert!(client.current_session().await.unwrap().is_none());
}

#[tokio::test]
async fn test_logout_clears_locally_when_server_fails() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/auth/logout"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;

    let client = client_for(&server);
    client
        .start_session(&User::new("u1"), Credential::new("a1", "r1"))
        .await
        .unwrap();

    client.logout().await.unwrap();
    assert_eq!(client.state().await, SessionState::NoSession);
}

// ============================================================================
// Authenticated requests
// ============================================================================

#[tokio::test]
async fn test_concurrent_401s_share_one_refresh() {
    let server = MockServer::start().await;

    mount_protected(&server, "stale", 401).await;
    mount_protected(&server, "fresh", 200).await;
    Mock::given(method("POST"))
        .and(path("/auth/refresh"))
        .and(body_json(json!({"refreshToken": "r1"})))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({"accessToken": "fresh", "refreshToken": "r2"}))
                .set_delay(Duration::from_millis(200)),
        )
        .expect(1)
        .mount(&server)
        .await;

    let client = client_for(&server);
    client
        .start_session(&User::new("u1"), Credential::new("stale", "r1"))
        .await
        .unwrap();

    let request = ApiRequest::get("/data");
    let results = join_all((0..8).map(|_| client.execute(&request))).await;

    for result in results {
        assert_eq!(result.unwrap().status(), StatusCode::OK);
    }
    let session = client.current_session().await.unwrap().unwrap();
    assert_eq!(session.credential, Credential::new("fresh", "r2"));
    assert_eq!(client.state().await, SessionState::Active);
}

#[tokio::test]
async fn test_revoked_refresh_ends_session() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/data"))
        .respond_with(ResponseTemplate::new(401))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/auth/refresh"))
        .respond_with(ResponseTemplate::new(401).set_body_json(json!({"error": "invalid_grant"})))
        .expect(1)
        .mount(&server)
        .await;

    let client = client_for(&server);
    let invalid = counter();
    client.on_session_invalid(counting(&invalid));
    client
        .start_session(&User::new("u1"), Credential::new("a1", "r1"))
        .await
        .unwrap();

    let err = client.execute(&ApiRequest::get("/data")).await.unwrap_err();

    match err {
        ExecuteError::ReauthenticationRequired {
            refresh_error: Some(e),
        } => assert_eq!(e.kind(), RefreshErrorKind::Revoked),
        other => panic!("unexpected error: {:?}", other),
    }
    assert_eq!(client.state().await, SessionState::Invalidated);
    assert!(client.current_session().await.unwrap().is_none());
    assert_eq!(invalid.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_unreachable_refresh_keeps_session() {
    let server = MockServer::start().await;
    mount_protected(&server, "a1", 401).await;

    // auth endpoints live on a port nothing listens on
    let config = config_for(&server);
    let api = Arc::new(HttpAuthApi::new("http://127.0.0.1:9", Duration::from_secs(2)).unwrap());
    let client = AuthClient::with_parts(
        &config,
        Arc::new(SecureVault::in_memory()),
        api,
        Arc::new(SystemClock),
    )
    .unwrap();
    client
        .start_session(&User::new("u1"), Credential::new("a1", "r1"))
        .await
        .unwrap();

    let err = client.execute(&ApiRequest::get("/data")).await.unwrap_err();

    match err {
        ExecuteError::RefreshUnavailable(e) => assert_eq!(e.kind(), RefreshErrorKind::Network),
        other => panic!("unexpected error: {:?}", other),
    }
    assert_eq!(client.state().await, SessionState::Active);
    let session = client.current_session().await.unwrap().unwrap();
    assert_eq!(session.credential, Credential::new("a1", "r1"));
}

#[tokio::test]
async fn test_401_after_refresh_ends_session() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/data"))
        .respond_with(ResponseTemplate::new(401))
        .expect(2)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/auth/refresh"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"accessToken": "a2"})))
        .expect(1)
        .mount(&server)
        .await;

    let client = client_for(&server);
    client
        .start_session(&User::new("u1"), Credential::new("a1", "r1"))
        .await
        .unwrap();

    let err = client.execute(&ApiRequest::get("/data")).await.unwrap_err();

    assert!(matches!(
        err,
        ExecuteError::ReauthenticationRequired { refresh_error: None }
    ));
    assert_eq!(client.state().await, SessionState::Invalidated);
}

#[tokio::test]
async fn test_non_auth_failures_pass_through() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/missing"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/broken"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/auth/refresh"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;

    let client = client_for(&server);
    client
        .start_session(&User::new("u1"), Credential::new("a1", "r1"))
        .await
        .unwrap();

    let missing = client.execute(&ApiRequest::get("/missing")).await.unwrap();
    assert_eq!(missing.status(), StatusCode::NOT_FOUND);

    let broken = ApiRequest::post("/broken").json(&json!({"x": 1})).unwrap();
    assert_eq!(
        client.execute(&broken).await.unwrap().status(),
        StatusCode::INTERNAL_SERVER_ERROR
    );
    assert_eq!(client.state().await, SessionState::Active);
}

#[tokio::test]
async fn test_anonymous_401_is_returned() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/data"))
        .respond_with(ResponseTemplate::new(401))
        .mount(&server)
        .await;

    let client = client_for(&server);
    let response = client.execute(&ApiRequest::get("/data")).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_locally_expired_session_is_not_sent() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/data"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;

    let clock = Arc::new(ManualClock::default());
    let config = config_for(&server);
    let api = Arc::new(HttpAuthApi::new(server.uri(), Duration::from_secs(5)).unwrap());
    let client = AuthClient::with_parts(
        &config,
        Arc::new(SecureVault::in_memory()),
        api,
        clock.clone(),
    )
    .unwrap();
    let invalid = counter();
    client.on_session_invalid(counting(&invalid));
    client
        .start_session(&User::new("u1"), Credential::new("a1", "r1"))
        .await
        .unwrap();

    clock.advance(chrono::Duration::hours(25));
    let err = client.execute(&ApiRequest::get("/data")).await.unwrap_err();

    assert!(matches!(
        err,
        ExecuteError::ReauthenticationRequired { refresh_error: None }
    ));
    assert_eq!(client.state().await, SessionState::Expired);
    assert_eq!(invalid.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_concurrent_401s_with_revoked_refresh_end_session_once() {
    let server = MockServer::start().await;

    mount_protected(&server, "a1", 401).await;
    Mock::given(method("POST"))
        .and(path("/auth/refresh"))
        .respond_with(
            ResponseTemplate::new(401)
                .set_body_json(json!({"error": "invalid_grant"}))
                .set_delay(Duration::from_millis(200)),
        )
        .expect(1)
        .mount(&server)
        .await;

    let client = client_for(&server);
    let invalid = counter();
    client.on_session_invalid(counting(&invalid));
    client
        .start_session(&User::new("u1"), Credential::new("a1", "r1"))
        .await
        .unwrap();

    let request = ApiRequest::get("/data");
    let results = join_all((0..8).map(|_| client.execute(&request))).await;

    for result in results {
        assert!(matches!(
            result,
            Err(ExecuteError::ReauthenticationRequired { .. })
        ));
    }
    assert_eq!(client.state().await, SessionState::Invalidated);
    assert!(client.current_session().await.unwrap().is_none());
    assert_eq!(invalid.load(Ordering::SeqCst), 1);
}

fn client_with(server: &MockServer, vault: Arc<SecureVault>, clock: Arc<ManualClock>) -> AuthClient {
    let api = Arc::new(HttpAuthApi::new(server.uri(), Duration::from_secs(5)).unwrap());
    AuthClient::with_parts(&config_for(server), vault, api, clock).unwrap()
}

#[tokio::test]
async fn test_unrestored_session_is_not_attached() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/data"))
        .and(header("authorization", "Bearer a1"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/data"))
        .respond_with(ResponseTemplate::new(401))
        .expect(1)
        .mount(&server)
        .await;

    let vault = Arc::new(SecureVault::in_memory());
    let clock = Arc::new(ManualClock::default());
    let first = client_with(&server, vault.clone(), clock.clone());
    first
        .start_session(&User::new("u1"), Credential::new("a1", "r1"))
        .await
        .unwrap();
    first.shutdown().await;
    drop(first);

    clock.advance(chrono::Duration::hours(25));
    let second = client_with(&server, vault, clock);
    assert_eq!(second.state().await, SessionState::NoSession);

    let response = second.execute(&ApiRequest::get("/data")).await.unwrap();

    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(second.restore_session().await.unwrap(), SessionState::Expired);
}

#[tokio::test]
async fn test_suspended_session_is_checked_before_sending() {
    let server = MockServer::start().await;
    mount_protected(&server, "a1", 200).await;

    let clock = Arc::new(ManualClock::default());
    let client = client_with(&server, Arc::new(SecureVault::in_memory()), clock.clone());
    let invalid = counter();
    client.on_session_invalid(counting(&invalid));
    client
        .start_session(&User::new("u1"), Credential::new("a1", "r1"))
        .await
        .unwrap();
    client.suspend().await;

    // still within its lifetime, so the credential goes out
    let response = client.execute(&ApiRequest::get("/data")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    clock.advance(chrono::Duration::hours(25));
    let err = client.execute(&ApiRequest::get("/data")).await.unwrap_err();

    assert!(matches!(
        err,
        ExecuteError::ReauthenticationRequired { refresh_error: None }
    ));
    assert_eq!(client.state().await, SessionState::Expired);
    assert_eq!(invalid.load(Ordering::SeqCst), 1);
    let received = server.received_requests().await.unwrap();
    assert_eq!(received.len(), 1);
}

// ============================================================================
// Persistence across restarts
// ============================================================================

#[tokio::test]
async fn test_session_survives_restart_with_file_vault() {
    let server = MockServer::start().await;
    mount_protected(&server, "a1", 200).await;

    let dir = tempfile::tempdir().unwrap();
    let open_vault = || {
        Arc::new(SecureVault::new(
            Arc::new(FileStorage::new(dir.path().join("vault")).unwrap()),
            Arc::new(PassphraseKeyProvider::new(dir.path(), "test-passphrase")),
        ))
    };
    let config = config_for(&server);

    let first = AuthClient::with_parts(
        &config,
        open_vault(),
        Arc::new(HttpAuthApi::new(server.uri(), Duration::from_secs(5)).unwrap()),
        Arc::new(SystemClock),
    )
    .unwrap();
    let started = first
        .start_session(&User::new("u1"), Credential::new("a1", "r1"))
        .await
        .unwrap();
    first.shutdown().await;
    drop(first);

    let second = AuthClient::with_parts(
        &config,
        open_vault(),
        Arc::new(HttpAuthApi::new(server.uri(), Duration::from_secs(5)).unwrap()),
        Arc::new(SystemClock),
    )
    .unwrap();
    assert_eq!(second.restore_session().await.unwrap(), SessionState::Active);

    let restored = second.current_session().await.unwrap().unwrap();
    assert_eq!(restored.id(), started.id());
    assert_eq!(
        second.execute(&ApiRequest::get("/data")).await.unwrap().status(),
        StatusCode::OK
    );
}
