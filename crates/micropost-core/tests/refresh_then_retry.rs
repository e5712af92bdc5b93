//! Refresh-then-retry behaviour of the request pipeline.
//!
//! The fake server accepts `Bearer new r2` and rejects `Bearer old r1`, so a
//! request only succeeds if it was retried with refreshed credentials.


use std::sync::Arc;
use std::time::Duration;

use fixtures::{
    api_path, bearer, client_for, client_with_policy, login_body, mount_login, refresh_body,
    FlakyStore,
};
use futures::future::join_all;
use micropost_core::auth::{MemoryStore, RefreshPhase, ACCESS_TOKEN_KEY, REFRESH_TOKEN_KEY};
use micropost_core::{ApiError, LoginCredentials, SessionNotice, StorageFailurePolicy};
use serde_json::{json, Value};
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

async fn mount_feed(server: &MockServer) {
    Mock::given(method("GET"))
        .and(path(api_path("feed")))
        .and(header("authorization", bearer("old", "r1").as_str()))
        .respond_with(ResponseTemplate::new(401).set_body_json(json!({"error": "expired"})))
        .mount(server)
        .await;
    Mock::given(method("GET"))
        .and(path(api_path("feed")))
        .and(header("authorization", bearer("new", "r2").as_str()))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"microposts": []})))
        .mount(server)
        .await;
}

async fn sign_in(client: &micropost_core::ApiClient) {
    client
        .login(&LoginCredentials::new("a@b.com", "password", true))
        .await
        .unwrap();
}

#[tokio::test]
async fn test_concurrent_401s_trigger_exactly_one_refresh() {
    let server = MockServer::start().await;
    mount_login(&server, "old", "r1").await;
    mount_feed(&server).await;
    Mock::given(method("POST"))
        .and(path(api_path("refresh")))
        .respond_with(ResponseTemplate::new(200).set_body_json(refresh_body("new", "r2")))
        .expect(1)
        .mount(&server)
        .await;

    let store = Arc::new(MemoryStore::new());
    let client = client_for(&server, store.clone());
    sign_in(&client).await;

    let results = join_all((0..5).map(|_| client.get::<Value>("feed"))).await;
    for result in results {
        assert_eq!(result.unwrap(), json!({"microposts": []}));
    }

    let retried_with_new = server
        .received_requests()
        .await
        .unwrap()
        .iter()
        .filter(|r| {
            r.url.path() == api_path("feed")
                && r.headers.get("authorization").map(|v| v.as_bytes()) == Some(bearer("new", "r2").as_bytes())
        })
        .count();
    assert_eq!(retried_with_new, 5);

    let session = client.snapshot();
    assert!(session.authenticated);
    assert_eq!(session.access_token.as_deref(), Some("new"));
    assert_eq!(store.peek(ACCESS_TOKEN_KEY).as_deref(), Some("new"));
    assert_eq!(store.peek(REFRESH_TOKEN_KEY).as_deref(), Some("r2"));
}

#[tokio::test]
async fn test_failed_refresh_logs_out_exactly_once() {
    let server = MockServer::start().await;
    mount_login(&server, "old", "r1").await;
    mount_feed(&server).await;
    Mock::given(method("POST"))
        .and(path(api_path("refresh")))
        .respond_with(ResponseTemplate::new(401).set_body_json(json!({"error": "revoked"})))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("DELETE"))
        .and(path(api_path("logout")))
        .respond_with(ResponseTemplate::new(401))
        .expect(1)
        .mount(&server)
        .await;

    let store = Arc::new(MemoryStore::new());
    let client = client_for(&server, store.clone());
    client.initialize().await;
    sign_in(&client).await;

    let results = join_all((0..4).map(|_| client.get::<Value>("feed"))).await;
    for result in results {
        assert!(result.unwrap_err().is_session_expired());
    }

    let session = client.snapshot();
    assert!(!session.authenticated);
    assert!(session.initialized);
    assert!(session.user.is_none());
    assert!(session.access_token.is_none());
    assert_eq!(session.notice, Some(SessionNotice::Expired));
    assert!(store.peek(ACCESS_TOKEN_KEY).is_none());
    assert!(store.peek(REFRESH_TOKEN_KEY).is_none());
}

#[tokio::test]
async fn test_unauthenticated_401_skips_refresh() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(api_path("feed")))
        .respond_with(ResponseTemplate::new(401))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path(api_path("refresh")))
        .respond_with(ResponseTemplate::new(200).set_body_json(refresh_body("new", "r2")))
        .expect(0)
        .mount(&server)
        .await;

    let client = client_for(&server, Arc::new(MemoryStore::new()));
    let err = client.get::<Value>("feed").await.unwrap_err();
    assert!(matches!(err, ApiError::Unauthorized));
}

#[tokio::test]
async fn test_second_401_after_refresh_is_not_refreshed_again() {
    let server = MockServer::start().await;
    mount_login(&server, "old", "r1").await;
    Mock::given(method("GET"))
        .and(path(api_path("admin")))
        .respond_with(ResponseTemplate::new(401))
        .expect(2)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path(api_path("refresh")))
        .respond_with(ResponseTemplate::new(200).set_body_json(refresh_body("new", "r2")))
        .expect(1)
        .mount(&server)
        .await;

    let client = client_for(&server, Arc::new(MemoryStore::new()));
    sign_in(&client).await;

    let err = client.get::<Value>("admin").await.unwrap_err();
    assert!(matches!(err, ApiError::Unauthorized));
    assert!(client.snapshot().authenticated);
}

#[tokio::test]
async fn test_storage_failure_continues_in_memory() {
    let server = MockServer::start().await;
    mount_login(&server, "old", "r1").await;
    mount_feed(&server).await;
    Mock::given(method("POST"))
        .and(path(api_path("refresh")))
        .respond_with(ResponseTemplate::new(200).set_body_json(refresh_body("new", "r2")))
        .expect(1)
        .mount(&server)
        .await;

    let store = Arc::new(FlakyStore::default());
    let client = client_with_policy(&server, store.clone(), StorageFailurePolicy::ContinueInMemory);
    sign_in(&client).await;
    store.break_writes();

    let body: Value = client.get("feed").await.unwrap();
    assert_eq!(body, json!({"microposts": []}));
    assert!(client.session().is_memory_only());
    assert_eq!(client.snapshot().access_token.as_deref(), Some("new"));
    // The old durable pair must not survive to the next start.
    assert!(store.inner.peek(ACCESS_TOKEN_KEY).is_none());
}

#[tokio::test]
async fn test_storage_failure_can_force_logout() {
    let server = MockServer::start().await;
    mount_login(&server, "old", "r1").await;
    mount_feed(&server).await;
    Mock::given(method("POST"))
        .and(path(api_path("refresh")))
        .respond_with(ResponseTemplate::new(200).set_body_json(refresh_body("new", "r2")))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("DELETE"))
        .and(path(api_path("logout")))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&server)
        .await;

    let store = Arc::new(FlakyStore::default());
    let client = client_with_policy(&server, store.clone(), StorageFailurePolicy::ForceLogout);
    sign_in(&client).await;
    store.break_writes();

    let err = client.get::<Value>("feed").await.unwrap_err();
    assert!(err.is_session_expired());
    assert!(!client.snapshot().authenticated);
}

#[tokio::test]
async fn test_login_401_does_not_refresh() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(api_path("login")))
        .respond_with(
            ResponseTemplate::new(401)
                .set_body_json(json!({"error": "Invalid email/password combination"})),
        )
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path(api_path("refresh")))
        .respond_with(ResponseTemplate::new(200).set_body_json(refresh_body("new", "r2")))
        .expect(0)
        .mount(&server)
        .await;

    let client = client_for(&server, Arc::new(MemoryStore::with_tokens("old", "r1")));
    let err = client
        .login(&LoginCredentials::new("a@b.com", "wrong", false))
        .await
        .unwrap_err();
    match err {
        ApiError::Rejected(messages) => {
            assert_eq!(messages, vec!["Invalid email/password combination".to_string()])
        }
        other => panic!("unexpected error: {other:?}"),
    }
}

async fn mount_slow_refresh(server: &MockServer, delay: Duration) {
    Mock::given(method("POST"))
        .and(path(api_path("refresh")))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(refresh_body("new", "r2"))
                .set_delay(delay),
        )
        .expect(1)
        .mount(server)
        .await;
}

#[tokio::test]
async fn test_logout_during_refresh_stays_signed_out() {
    let server = MockServer::start().await;
    mount_login(&server, "old", "r1").await;
    mount_feed(&server).await;
    mount_slow_refresh(&server, Duration::from_millis(500)).await;
    Mock::given(method("DELETE"))
        .and(path(api_path("logout")))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&server)
        .await;

    let store = Arc::new(MemoryStore::new());
    let client = client_for(&server, store.clone());
    sign_in(&client).await;

    let pending = tokio::spawn({
        let client = client.clone();
        async move { client.get::<Value>("feed").await }
    });
    tokio::time::sleep(Duration::from_millis(150)).await;
    client.logout().await;

    let err = pending.await.unwrap().unwrap_err();
    assert!(err.is_session_expired());

    let session = client.snapshot();
    assert!(!session.authenticated);
    assert!(session.access_token.is_none());
    assert!(session.notice.is_none());
    assert!(store.peek(ACCESS_TOKEN_KEY).is_none());
    assert!(store.peek(REFRESH_TOKEN_KEY).is_none());
    assert_eq!(client.refresh_phase(), RefreshPhase::Idle);
}

#[tokio::test]
async fn test_login_during_refresh_keeps_new_session() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(api_path("login")))
        .respond_with(ResponseTemplate::new(200).set_body_json(login_body("old", "r1")))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    mount_login(&server, "fresh", "r5").await;
    mount_feed(&server).await;
    Mock::given(method("GET"))
        .and(path(api_path("feed")))
        .and(header("authorization", bearer("fresh", "r5").as_str()))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"microposts": [1]})))
        .expect(1)
        .mount(&server)
        .await;
    mount_slow_refresh(&server, Duration::from_millis(500)).await;

    let store = Arc::new(MemoryStore::new());
    let client = client_for(&server, store.clone());
    sign_in(&client).await;

    let pending = tokio::spawn({
        let client = client.clone();
        async move { client.get::<Value>("feed").await }
    });
    tokio::time::sleep(Duration::from_millis(150)).await;
    sign_in(&client).await;

    // The late refresh result belongs to the old session and is dropped.
    let body = pending.await.unwrap().unwrap();
    assert_eq!(body, json!({"microposts": [1]}));

    let session = client.snapshot();
    assert!(session.authenticated);
    assert_eq!(session.access_token.as_deref(), Some("fresh"));
    assert_eq!(store.peek(ACCESS_TOKEN_KEY).as_deref(), Some("fresh"));
    assert_eq!(store.peek(REFRESH_TOKEN_KEY).as_deref(), Some("r5"));
}

#[tokio::test]
async fn test_late_401_after_failed_refresh_uses_new_login() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(api_path("login")))
        .respond_with(ResponseTemplate::new(200).set_body_json(login_body("old", "r1")))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    mount_login(&server, "new", "r2").await;
    mount_feed(&server).await;
    Mock::given(method("GET"))
        .and(path(api_path("inbox")))
        .and(header("authorization", bearer("old", "r1").as_str()))
        .respond_with(ResponseTemplate::new(401).set_delay(Duration::from_millis(500)))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path(api_path("inbox")))
        .and(header("authorization", bearer("new", "r2").as_str()))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"messages": []})))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path(api_path("refresh")))
        .respond_with(ResponseTemplate::new(401))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("DELETE"))
        .and(path(api_path("logout")))
        .respond_with(ResponseTemplate::new(204))
        .mount(&server)
        .await;

    let client = client_for(&server, Arc::new(MemoryStore::new()));
    sign_in(&client).await;

    let slow = tokio::spawn({
        let client = client.clone();
        async move { client.get::<Value>("inbox").await }
    });
    tokio::time::sleep(Duration::from_millis(50)).await;

    let err = client.get::<Value>("feed").await.unwrap_err();
    assert!(err.is_session_expired());
    assert_eq!(client.snapshot().notice, Some(SessionNotice::Expired));

    sign_in(&client).await;
    assert_eq!(client.refresh_phase(), RefreshPhase::Idle);

    // The old token's 401 lands after the new login and retries with it.
    let body = slow.await.unwrap().unwrap();
    assert_eq!(body, json!({"messages": []}));

    let session = client.snapshot();
    assert!(session.authenticated);
    assert_eq!(session.access_token.as_deref(), Some("new"));
    assert_eq!(client.refresh_phase(), RefreshPhase::Idle);
}
