//! HTTP gateway integration tests
//!
//! Runs the gateway and the auth session against a wiremock server: bearer
//! auth, envelope unwrapping, error classification, and the
//! 401 → refresh → retry-once protocol.

use ats_client::auth::HttpAuthExchange;
use ats_client::{
    AuthSession, AuthState, CredentialStore, HttpError, HttpGateway, MemoryCredentialStore,
    RequestOptions, SessionEvent, TokenPair,
};
use reqwest::Method;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use wiremock::matchers::{body_json, header, header_exists, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

#[derive(Debug, Deserialize, PartialEq)]
struct Suite {
    id: String,
    name: String,
}

struct Harness {
    server: MockServer,
    store: Arc<MemoryCredentialStore>,
    auth: AuthSession,
    gateway: HttpGateway,
}

/// Gateway with a restored a1/r1 session.
async fn harness() -> Harness {
    let server = MockServer::start().await;
    let api_base = format!("{}/api/v1", server.uri());
    let store = Arc::new(MemoryCredentialStore::with_tokens(TokenPair::new("a1", "r1")));
    let exchange = HttpAuthExchange::new(api_base.clone(), Duration::from_secs(5)).unwrap();
    let auth = AuthSession::new(Arc::new(exchange), store.clone());
    assert!(auth.restore());
    let gateway = HttpGateway::new(api_base, Duration::from_secs(5), auth.clone()).unwrap();
    Harness {
        server,
        store,
        auth,
        gateway,
    }
}

fn envelope(data: Value) -> Value {
    json!({
        "status": "success",
        "message": "ok",
        "data": data,
        "code": 200,
        "timestamp": "2026-01-01T10:00:00Z"
    })
}

fn suite_body() -> Value {
    envelope(json!({"id": "s1", "name": "Smoke"}))
}

async fn mount_refresh(server: &MockServer, access: &str, delay: Duration) {
    Mock::given(method("POST"))
        .and(path("/api/v1/auth/refresh"))
        .and(body_json(json!({"refresh_token": "r1"})))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(envelope(json!({
                    "access_token": access,
                    "refresh_token": "r2",
                    "token_type": "bearer",
                    "expires_in": 1800
                })))
                .set_delay(delay),
        )
        .expect(1)
        .mount(server)
        .await;
}

fn drain(events: &mut broadcast::Receiver<SessionEvent>) -> Vec<SessionEvent> {
    let mut seen = Vec::new();
    while let Ok(event) = events.try_recv() {
        seen.push(event);
    }
    seen
}

// =============================================================================
// Envelopes and error classification
// =============================================================================

#[tokio::test]
async fn test_get_unwraps_data_with_bearer_and_request_id() {
    let h = harness().await;
    Mock::given(method("GET"))
        .and(path("/api/v1/test-suites/s1"))
        .and(header("Authorization", "Bearer a1"))
        .and(header_exists("X-Request-ID"))
        .respond_with(ResponseTemplate::new(200).set_body_json(suite_body()))
        .expect(1)
        .mount(&h.server)
        .await;

    let suite: Suite = h.gateway.get("/test-suites/s1").await.unwrap();
    assert_eq!(
        suite,
        Suite {
            id: "s1".into(),
            name: "Smoke".into()
        }
    );

    let requests = h.server.received_requests().await.unwrap();
    let request_id = requests[0].headers.get("x-request-id").unwrap().to_str().unwrap();
    assert!(request_id.starts_with("req_"), "unexpected request id {}", request_id);
}

#[tokio::test]
async fn test_query_parameters_are_sent() {
    let h = harness().await;
    Mock::given(method("GET"))
        .and(path("/api/v1/test-suites"))
        .and(wiremock::matchers::query_param("page", "2"))
        .respond_with(ResponseTemplate::new(200).set_body_json(envelope(json!([]))))
        .expect(1)
        .mount(&h.server)
        .await;

    let options = RequestOptions::default().with_query("page", "2");
    let suites: Vec<Suite> = h.gateway.get_with("/test-suites", &options).await.unwrap();
    assert!(suites.is_empty());
}

#[tokio::test]
async fn test_error_envelope_is_a_business_error_unless_raw() {
    let h = harness().await;
    Mock::given(method("GET"))
        .and(path("/api/v1/test-suites/missing"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "status": "error",
            "message": "Suite not found",
            "data": null,
            "code": 40401
        })))
        .mount(&h.server)
        .await;

    let err = h
        .gateway
        .get::<Suite>("/test-suites/missing")
        .await
        .unwrap_err();
    assert_eq!(
        err,
        HttpError::Business {
            message: "Suite not found".into(),
            code: 40401
        }
    );

    let envelope = h
        .gateway
        .request(
            Method::GET,
            "/test-suites/missing",
            None,
            &RequestOptions::raw_envelope(),
        )
        .await
        .unwrap();
    assert!(envelope.is_error());
    assert_eq!(envelope.message, "Suite not found");
}

#[tokio::test]
async fn test_status_classification() {
    let h = harness().await;
    Mock::given(method("DELETE"))
        .and(path("/api/v1/test-suites/s1"))
        .respond_with(ResponseTemplate::new(404).set_body_json(json!({"detail": "Not found"})))
        .mount(&h.server)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/v1/test-suites"))
        .respond_with(ResponseTemplate::new(503).set_body_string("maintenance"))
        .mount(&h.server)
        .await;

    let err = h.gateway.delete::<Value>("/test-suites/s1").await.unwrap_err();
    assert!(matches!(err, HttpError::Client { status: 404, .. }), "{:?}", err);
    assert!(!err.is_transient());

    let err = h
        .gateway
        .post::<Value, _>("/test-suites", &json!({"name": "Smoke"}))
        .await
        .unwrap_err();
    assert!(matches!(err, HttpError::Server { status: 503, .. }), "{:?}", err);
    assert!(err.is_transient());

    // Neither is an auth problem.
    assert_eq!(h.auth.state(), AuthState::Authenticated);
}

// =============================================================================
// 401 handling
// =============================================================================

#[tokio::test]
async fn test_unauthorized_refreshes_and_retries_once() {
    let h = harness().await;
    let mut events = h.auth.events();
    Mock::given(method("GET"))
        .and(path("/api/v1/test-suites/s1"))
        .and(header("Authorization", "Bearer a1"))
        .respond_with(ResponseTemplate::new(401))
        .expect(1)
        .mount(&h.server)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/v1/test-suites/s1"))
        .and(header("Authorization", "Bearer a2"))
        .respond_with(ResponseTemplate::new(200).set_body_json(suite_body()))
        .expect(1)
        .mount(&h.server)
        .await;
    mount_refresh(&h.server, "a2", Duration::ZERO).await;

    let suite: Suite = h.gateway.get("/test-suites/s1").await.unwrap();
    assert_eq!(suite.id, "s1");

    assert_eq!(h.auth.current_access_token().as_deref(), Some("a2"));
    let stored = h.store.get().unwrap();
    assert_eq!(stored.access, "a2");
    assert_eq!(stored.refresh, "r2");
    assert_eq!(drain(&mut events), vec![SessionEvent::Refreshed]);
}

#[tokio::test]
async fn test_retried_request_rejected_again_ends_session() {
    let h = harness().await;
    let mut events = h.auth.events();
    Mock::given(method("GET"))
        .and(path("/api/v1/test-suites/s1"))
        .and(header("Authorization", "Bearer a1"))
        .respond_with(ResponseTemplate::new(401))
        .expect(1)
        .mount(&h.server)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/v1/test-suites/s1"))
        .and(header("Authorization", "Bearer a2"))
        .respond_with(ResponseTemplate::new(401))
        .expect(1)
        .mount(&h.server)
        .await;
    mount_refresh(&h.server, "a2", Duration::ZERO).await;

    let err = h.gateway.get::<Suite>("/test-suites/s1").await.unwrap_err();
    assert_eq!(err, HttpError::Unauthorized);

    assert_eq!(h.auth.state(), AuthState::Unauthenticated);
    assert!(h.auth.current_access_token().is_none());
    assert!(h.store.get().is_none());
    assert_eq!(
        drain(&mut events),
        vec![SessionEvent::Refreshed, SessionEvent::Expired]
    );
}

#[tokio::test]
async fn test_rejected_refresh_clears_session_once() {
    let h = harness().await;
    let mut events = h.auth.events();
    Mock::given(method("GET"))
        .and(path("/api/v1/test-suites/s1"))
        .respond_with(ResponseTemplate::new(401))
        .expect(1)
        .mount(&h.server)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/v1/auth/refresh"))
        .respond_with(ResponseTemplate::new(401).set_body_json(json!({"detail": "Token revoked"})))
        .expect(1)
        .mount(&h.server)
        .await;

    let err = h.gateway.get::<Suite>("/test-suites/s1").await.unwrap_err();
    assert_eq!(err, HttpError::Unauthorized);

    assert_eq!(h.auth.state(), AuthState::Unauthenticated);
    assert!(h.store.get().is_none());
    assert_eq!(drain(&mut events), vec![SessionEvent::Expired]);
}

#[tokio::test]
async fn test_concurrent_unauthorized_requests_share_one_refresh() {
    let h = harness().await;
    Mock::given(method("GET"))
        .and(path("/api/v1/test-suites/s1"))
        .and(header("Authorization", "Bearer a1"))
        .respond_with(ResponseTemplate::new(401))
        .expect(3)
        .mount(&h.server)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/v1/test-suites/s1"))
        .and(header("Authorization", "Bearer a2"))
        .respond_with(ResponseTemplate::new(200).set_body_json(suite_body()))
        .expect(3)
        .mount(&h.server)
        .await;
    mount_refresh(&h.server, "a2", Duration::from_millis(200)).await;

    let (a, b, c) = tokio::join!(
        h.gateway.get::<Suite>("/test-suites/s1"),
        h.gateway.get::<Suite>("/test-suites/s1"),
        h.gateway.get::<Suite>("/test-suites/s1"),
    );
    assert_eq!(a.unwrap().id, "s1");
    assert_eq!(b.unwrap().id, "s1");
    assert_eq!(c.unwrap().id, "s1");
    assert_eq!(h.auth.current_access_token().as_deref(), Some("a2"));
}

#[tokio::test]
async fn test_unauthorized_on_auth_endpoint_is_final() {
    let h = harness().await;
    Mock::given(method("POST"))
        .and(path("/api/v1/auth/login"))
        .respond_with(ResponseTemplate::new(401))
        .expect(1)
        .mount(&h.server)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/v1/auth/refresh"))
        .respond_with(ResponseTemplate::new(500))
        .expect(0)
        .mount(&h.server)
        .await;

    let err = h
        .gateway
        .post::<Value, _>("/auth/login", &json!({"username": "alice", "password": "nope"}))
        .await
        .unwrap_err();
    assert_eq!(err, HttpError::Unauthorized);
    assert_eq!(h.auth.state(), AuthState::Authenticated);
}

#[tokio::test]
async fn test_unreachable_server_is_a_network_error() {
    let h = harness().await;
    // Grab a free port, then release it so nothing is listening there.
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);

    let api_base = format!("http://127.0.0.1:{}/api/v1", port);
    let err = HttpGateway::new(api_base, Duration::from_secs(2), h.auth.clone())
        .unwrap()
        .get::<Value>("/test-suites")
        .await
        .unwrap_err();
    assert!(matches!(err, HttpError::Network(_)), "{:?}", err);
    assert!(err.is_transient());
    assert_eq!(h.auth.state(), AuthState::Authenticated);
}

#[tokio::test]
async fn test_slow_response_times_out_as_network_error() {
    let h = harness().await;
    let mut events = h.auth.events();
    Mock::given(method("GET"))
        .and(path("/api/v1/test-suites/s1"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(suite_body())
                .set_delay(Duration::from_millis(300)),
        )
        .expect(1)
        .mount(&h.server)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/v1/auth/refresh"))
        .respond_with(ResponseTemplate::new(500))
        .expect(0)
        .mount(&h.server)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/v1/auth/logout"))
        .respond_with(ResponseTemplate::new(500))
        .expect(0)
        .mount(&h.server)
        .await;

    let api_base = format!("{}/api/v1", h.server.uri());
    let gateway = HttpGateway::new(api_base, Duration::from_millis(100), h.auth.clone()).unwrap();
    let err = gateway.get::<Suite>("/test-suites/s1").await.unwrap_err();

    assert!(matches!(&err, HttpError::Network(message) if message.contains("timed out")), "{:?}", err);
    assert!(err.is_transient());

    // A timeout says nothing about the token.
    assert_eq!(h.auth.state(), AuthState::Authenticated);
    assert_eq!(h.auth.current_access_token().as_deref(), Some("a1"));
    assert_eq!(h.store.get().unwrap().access, "a1");
    assert!(drain(&mut events).is_empty());
}

// =============================================================================
// Login and logout through the session
// =============================================================================

#[tokio::test]
async fn test_login_then_logout_round_trip() {
    let server = MockServer::start().await;
    let api_base = format!("{}/api/v1", server.uri());
    Mock::given(method("POST"))
        .and(path("/api/v1/auth/login"))
        .respond_with(ResponseTemplate::new(200).set_body_json(envelope(json!({
            "access_token": "a1",
            "refresh_token": "r1",
            "token_type": "bearer",
            "user": {"id": "u1", "username": "alice"}
        }))))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/v1/auth/logout"))
        .and(header("Authorization", "Bearer a1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(envelope(Value::Null)))
        .expect(1)
        .mount(&server)
        .await;

    let store = Arc::new(MemoryCredentialStore::new());
    let exchange = HttpAuthExchange::new(api_base, Duration::from_secs(5)).unwrap();
    let auth = AuthSession::new(Arc::new(exchange), store.clone());
    let mut events = auth.events();

    auth.login(&ats_client::Credentials::new("alice", "pw"))
        .await
        .unwrap();
    assert_eq!(auth.user().unwrap().username, "alice");
    assert_eq!(store.get().unwrap().access, "a1");

    auth.logout().await;
    auth.logout().await;
    assert!(store.get().is_none());
    assert_eq!(
        drain(&mut events),
        vec![SessionEvent::LoggedIn, SessionEvent::LoggedOut]
    );
}
