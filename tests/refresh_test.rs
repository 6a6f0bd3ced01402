//! Integration tests for the single-flight credential refresh.
//!
//! A wiremock server plays the API: requests carrying the stale token get a
//! 401, the refresh endpoint hands out a new pair, and requests carrying the
//! new token succeed.

use std::time::Duration;

use futures_util::future::join_all;
use opsdeck::auth::{ApiClient, ApiError, ApiRequest, AuthError, AuthEvent, TokenPair, TokenStore};
use serde_json::json;
use wiremock::matchers::{body_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn client(server: &MockServer) -> ApiClient {
    let tokens = TokenStore::with_pair(TokenPair::new("stale".into(), "refresh-1".into()));
    ApiClient::new(&server.uri(), tokens)
}

async fn mount_resource(server: &MockServer) {
    Mock::given(method("GET"))
        .and(path("/api/servers"))
        .and(header("authorization", "Bearer stale"))
        .respond_with(ResponseTemplate::new(401))
        .mount(server)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/servers"))
        .and(header("authorization", "Bearer fresh"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([{ "id": 1 }])))
        .mount(server)
        .await;
}

#[tokio::test]
async fn test_concurrent_401s_share_one_refresh() {
    let server = MockServer::start().await;
    mount_resource(&server).await;
    Mock::given(method("POST"))
        .and(path("/api/auth/refresh"))
        .and(body_json(json!({ "refreshToken": "refresh-1" })))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({ "accessToken": "fresh", "refreshToken": "refresh-2" }))
                .set_delay(Duration::from_millis(200)),
        )
        .expect(1)
        .mount(&server)
        .await;

    let client = client(&server);
    let request = ApiRequest::get("/api/servers");
    let results = join_all((0..8).map(|_| client.send(&request))).await;

    for result in results {
        assert_eq!(result.unwrap().status().as_u16(), 200);
    }
    assert_eq!(client.refresh_coordinator().refresh_calls(), 1);
    assert_eq!(client.tokens().access_token().as_deref(), Some("fresh"));
    assert_eq!(client.tokens().refresh_token().as_deref(), Some("refresh-2"));
    assert!(!client.refresh_coordinator().is_refreshing());
}

#[tokio::test]
async fn test_refresh_failure_rejects_every_queued_call() {
    let server = MockServer::start().await;
    mount_resource(&server).await;
    Mock::given(method("POST"))
        .and(path("/api/auth/refresh"))
        .respond_with(
            ResponseTemplate::new(401)
                .set_body_string("refresh token revoked")
                .set_delay(Duration::from_millis(200)),
        )
        .expect(1)
        .mount(&server)
        .await;

    let client = client(&server);
    let mut events = client.refresh_coordinator().subscribe();
    let request = ApiRequest::get("/api/servers");

    let results = join_all((0..3).map(|_| client.send(&request))).await;

    for result in results {
        match result {
            Err(ApiError::Auth(AuthError::Rejected { status, .. })) => assert_eq!(status, 401),
            other => panic!("expected refresh rejection, got {other:?}"),
        }
    }
    assert!(!client.tokens().is_authenticated());
    assert!(matches!(events.try_recv(), Ok(AuthEvent::ForcedLogout { .. })));
    assert!(events.try_recv().is_err(), "exactly one forced logout");
}

#[tokio::test]
async fn test_replayed_call_is_not_retried_twice() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/admin"))
        .respond_with(ResponseTemplate::new(401))
        .expect(2)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/auth/refresh"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({ "accessToken": "fresh", "refreshToken": "refresh-2" })),
        )
        .expect(1)
        .mount(&server)
        .await;

    let client = client(&server);
    let response = client.send(&ApiRequest::get("/api/admin")).await.unwrap();
    assert_eq!(response.status().as_u16(), 401);
    assert!(client.tokens().is_authenticated());
}

#[tokio::test]
async fn test_auth_endpoints_bypass_refresh() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/auth/login"))
        .respond_with(ResponseTemplate::new(401).set_body_string("bad password"))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/auth/refresh"))
        .respond_with(ResponseTemplate::new(500))
        .expect(0)
        .mount(&server)
        .await;

    let client = client(&server);
    let err = client.login("ops@example.com", "nope").await.unwrap_err();
    assert_eq!(err.status().map(|s| s.as_u16()), Some(401));
    assert_eq!(client.tokens().access_token().as_deref(), Some("stale"));
}

#[tokio::test]
async fn test_login_installs_credentials_and_bumps_identity() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/auth/login"))
        .and(body_json(json!({ "email": "ops@example.com", "password": "pw" })))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({ "accessToken": "a1", "refreshToken": "r1" })),
        )
        .mount(&server)
        .await;

    let client = ApiClient::new(&server.uri(), TokenStore::in_memory());
    let epoch = client.tokens().identity_epoch();
    client.login("ops@example.com", "pw").await.unwrap();

    assert_eq!(client.tokens().access_token().as_deref(), Some("a1"));
    assert!(client.tokens().identity_epoch() > epoch);

    client.logout();
    assert!(!client.tokens().is_authenticated());
}
