//! End-to-end session lifecycle against a mock token service.

mod common;

use std::time::Duration;

use common::*;
use serde_json::{json, Value};
use sessionkeep_core::auth::CookieStorage;
use sessionkeep_core::{
    ApiError, Credential, Identity, LoginCredentials, RefreshError, SessionError, SessionEvent,
    SessionManager, TokenPair, TokenStore,
};
use wiremock::matchers::{body_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const WAIT: Duration = Duration::from_secs(5);

fn identity_for(email: &str) -> Identity {
    Identity {
        id: format!("id-{}", email),
        email: email.to_string(),
        display_name: None,
        roles: Vec::new(),
    }
}

fn seeded(access: &str, refresh: &str) -> TokenStore {
    let store = TokenStore::memory();
    store.set_tokens(&TokenPair {
        access_token: access.to_string(),
        refresh_token: Some(refresh.to_string()),
        expires_in: None,
        token_type: None,
    });
    store
}

async fn mount_login(server: &MockServer, access: &str, refresh: &str) {
    Mock::given(method("POST"))
        .and(path("/auth/login"))
        .and(body_json(json!({"email": "a@b.com", "password": "x"})))
        .respond_with(ResponseTemplate::new(200).set_body_json(pair_json(access, refresh)))
        .mount(server)
        .await;
}

async fn mount_logout(server: &MockServer, status: u16) {
    Mock::given(method("POST"))
        .and(path("/auth/logout"))
        .respond_with(ResponseTemplate::new(status))
        .mount(server)
        .await;
}

fn credentials() -> LoginCredentials {
    LoginCredentials::new("a@b.com", "x")
}

async fn wait_for_identity(session: &SessionManager, present: bool) {
    let mut rx = session.watch_identity();
    tokio::time::timeout(WAIT, rx.wait_for(|identity| identity.is_some() == present))
        .await
        .expect("identity change in time")
        .expect("session alive");
}

// ===== Login / logout =====

#[tokio::test]
async fn test_login_then_expired_request_refreshes_once() {
    let server = MockServer::start().await;
    let t1 = token_for("a@b.com", 3600);
    let t2 = token_for("a@b.com", 3600 * 2);
    mount_login(&server, &t1, "r1").await;
    Mock::given(method("GET"))
        .and(path("/data"))
        .and(header("authorization", format!("Bearer {}", t1).as_str()))
        .respond_with(ResponseTemplate::new(401))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/data"))
        .and(header("authorization", format!("Bearer {}", t2).as_str()))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([1, 2, 3])))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/auth/refresh"))
        .and(body_json(json!({"refreshToken": "r1"})))
        .respond_with(ResponseTemplate::new(200).set_body_json(pair_json(&t2, "r2")))
        .expect(1)
        .mount(&server)
        .await;

    let session = memory_session(&server.uri());
    let identity = session.login(&credentials()).await.unwrap();

    assert_eq!(identity, identity_for("a@b.com"));
    assert!(session.is_authenticated());

    let data: Value = session.client().get("/data").await.unwrap();
    assert_eq!(data, json!([1, 2, 3]));
    assert_eq!(session.identity(), Some(identity_for("a@b.com")));
}

#[tokio::test]
async fn test_login_failure_messages() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/auth/login"))
        .and(body_json(json!({"email": "a@b.com", "password": "wrong"})))
        .respond_with(ResponseTemplate::new(401).set_body_json(json!({"message": "Invalid credentials"})))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/auth/login"))
        .and(body_json(json!({"email": "a@b.com", "password": "x"})))
        .respond_with(ResponseTemplate::new(401))
        .mount(&server)
        .await;

    let session = memory_session(&server.uri());

    let err = session
        .login(&LoginCredentials::new("a@b.com", "wrong"))
        .await
        .unwrap_err();
    assert!(matches!(err, SessionError::Authentication(ref m) if m == "Invalid credentials"));

    let err = session.login(&credentials()).await.unwrap_err();
    assert_eq!(err.to_string(), "Login failed. Check your email and password.");

    assert!(!session.is_authenticated());
    assert!(!session.store().has_tokens());
}

#[tokio::test]
async fn test_login_unreachable_server_is_transport_error() {
    let session = memory_session("http://127.0.0.1:1");
    let err = session.login(&credentials()).await.unwrap_err();
    assert!(matches!(err, SessionError::Transport(_)));
}

#[tokio::test]
async fn test_opaque_token_falls_back_to_profile() {
    let server = MockServer::start().await;
    mount_login(&server, "opaque-token", "r1").await;
    Mock::given(method("GET"))
        .and(path("/auth/profile"))
        .and(header("authorization", "Bearer opaque-token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": "u1",
            "email": "a@b.com",
            "name": "Alice",
            "roles": ["admin"],
        })))
        .expect(1)
        .mount(&server)
        .await;

    let session = memory_session(&server.uri());
    let identity = session.login(&credentials()).await.unwrap();

    assert_eq!(identity.id, "u1");
    assert_eq!(identity.label(), "Alice");
    assert_eq!(identity.roles, vec!["admin".to_string()]);
    assert_eq!(session.identity(), Some(identity));
}

#[tokio::test]
async fn test_failed_profile_fallback_clears_tokens() {
    let server = MockServer::start().await;
    mount_login(&server, "opaque-token", "r1").await;
    Mock::given(method("GET"))
        .and(path("/auth/profile"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;

    let session = memory_session(&server.uri());
    let err = session.login(&credentials()).await.unwrap_err();

    assert!(matches!(err, SessionError::Api(ApiError::ServerError { status: 503 })));
    assert!(!session.store().has_tokens());
    assert!(!session.is_authenticated());
}

#[tokio::test]
async fn test_logout_clears_locally_when_server_fails() {
    let server = MockServer::start().await;
    mount_login(&server, &token_for("a@b.com", 3600), "r1").await;
    mount_logout(&server, 500).await;

    let session = memory_session(&server.uri());
    session.login(&credentials()).await.unwrap();
    session.logout().await;

    assert!(!session.is_authenticated());
    assert!(!session.store().has_tokens());
    assert!(session.store().refresh_token().is_none());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_logout_wins_over_in_flight_refresh() {
    let server = MockServer::start().await;
    let t1 = token_for("a@b.com", 3600);
    mount_login(&server, &t1, "r1").await;
    mount_logout(&server, 204).await;
    Mock::given(method("GET"))
        .and(path("/data"))
        .respond_with(ResponseTemplate::new(401))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/auth/refresh"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(pair_json(&token_for("a@b.com", 7200), "r2"))
                .set_delay(Duration::from_millis(300)),
        )
        .expect(1)
        .mount(&server)
        .await;

    let session = memory_session(&server.uri());
    session.login(&credentials()).await.unwrap();
    let mut events = session.subscribe();

    let background = session.clone();
    let request = tokio::spawn(async move { background.client().get::<Value>("/data").await });

    tokio::time::timeout(WAIT, async {
        while !session.coordinator().is_refreshing().await {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("refresh started");

    session.logout().await;

    let err = request.await.unwrap().unwrap_err();
    assert_eq!(err, ApiError::RefreshFailed(RefreshError::Superseded));
    assert!(!session.store().has_tokens());
    assert!(!session.is_authenticated());

    let seen = drain_events(&mut events, Duration::from_millis(50)).await;
    assert_eq!(count(&seen, &SessionEvent::SessionInvalidated), 0);
    assert_eq!(count(&seen, &SessionEvent::TokensRefreshed), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_logout_outlasts_snapshot_write_from_refresh() {
    let server = MockServer::start().await;
    let t1 = token_for("a@b.com", 3600);
    let t2 = token_for("a@b.com", 7200);
    mount_login(&server, &t1, "r1").await;
    Mock::given(method("POST"))
        .and(path("/auth/logout"))
        .respond_with(ResponseTemplate::new(204).set_delay(Duration::from_millis(250)))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/data"))
        .and(header("authorization", format!("Bearer {}", t1).as_str()))
        .respond_with(ResponseTemplate::new(401))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/data"))
        .and(header("authorization", format!("Bearer {}", t2).as_str()))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"ok": true})))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/auth/refresh"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(pair_json(&t2, "r2"))
                .set_delay(Duration::from_millis(100)),
        )
        .expect(1)
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let session = SessionManager::from_parts(
        api(&server.uri()),
        TokenStore::memory(),
        Some(slow_snapshot_store(dir.path())),
    );
    session.initialize().await;
    session.login(&credentials()).await.unwrap();

    let background = session.clone();
    let request = tokio::spawn(async move { background.client().get::<Value>("/data").await });
    tokio::time::timeout(WAIT, async {
        while !session.coordinator().is_refreshing().await {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("refresh started");

    // The refresh settles while the logout call is still on the wire
    session.logout().await;
    let _ = request.await.unwrap();

    // Give a pending snapshot write and its watcher notification time to land
    tokio::time::sleep(Duration::from_secs(2)).await;

    assert!(!dir.path().join("app.auth").exists());
    assert!(!session.is_authenticated());
    assert!(!session.store().has_tokens());
    assert_eq!(slow_snapshot_store(dir.path()).load().await, None);
}

async fn mount_second_login(server: &MockServer, access: &str) {
    Mock::given(method("POST"))
        .and(path("/auth/login"))
        .and(body_json(json!({"email": "b@c.com", "password": "y"})))
        .respond_with(ResponseTemplate::new(200).set_body_json(pair_json(access, "rb")))
        .mount(server)
        .await;
}

async fn login_during_refresh(session: &SessionManager) -> Result<Value, ApiError> {
    let background = session.clone();
    let request = tokio::spawn(async move { background.client().get::<Value>("/data").await });
    tokio::time::timeout(WAIT, async {
        while !session.coordinator().is_refreshing().await {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("refresh started");

    let identity = session
        .login(&LoginCredentials::new("b@c.com", "y"))
        .await
        .unwrap();
    assert_eq!(identity, identity_for("b@c.com"));
    request.await.unwrap()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_failed_stale_refresh_keeps_newer_login() {
    let server = MockServer::start().await;
    let tb = token_for("b@c.com", 3600);
    mount_login(&server, &token_for("a@b.com", 3600), "r1").await;
    mount_second_login(&server, &tb).await;
    Mock::given(method("GET"))
        .and(path("/data"))
        .respond_with(ResponseTemplate::new(401))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/auth/refresh"))
        .respond_with(ResponseTemplate::new(401).set_delay(Duration::from_millis(300)))
        .expect(1)
        .mount(&server)
        .await;

    let session = memory_session(&server.uri());
    session.login(&credentials()).await.unwrap();
    let mut events = session.subscribe();

    let err = login_during_refresh(&session).await.unwrap_err();
    assert_eq!(err, ApiError::RefreshFailed(RefreshError::Superseded));

    assert_eq!(session.store().access_token(), Some(Credential::Bearer(tb)));
    assert_eq!(session.store().refresh_token(), Some(Credential::Bearer("rb".to_string())));

    let seen = drain_events(&mut events, Duration::from_millis(50)).await;
    assert_eq!(count(&seen, &SessionEvent::SessionInvalidated), 0);
    assert_eq!(session.identity(), Some(identity_for("b@c.com")));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_successful_stale_refresh_does_not_replace_newer_login() {
    let server = MockServer::start().await;
    let tb = token_for("b@c.com", 3600);
    mount_login(&server, &token_for("a@b.com", 3600), "r1").await;
    mount_second_login(&server, &tb).await;
    Mock::given(method("GET"))
        .and(path("/data"))
        .respond_with(ResponseTemplate::new(401))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/auth/refresh"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(pair_json(&token_for("a@b.com", 7200), "r2"))
                .set_delay(Duration::from_millis(300)),
        )
        .expect(1)
        .mount(&server)
        .await;

    let session = memory_session(&server.uri());
    session.login(&credentials()).await.unwrap();

    let err = login_during_refresh(&session).await.unwrap_err();
    assert_eq!(err, ApiError::RefreshFailed(RefreshError::Superseded));

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(session.store().access_token(), Some(Credential::Bearer(tb)));
    assert_eq!(session.identity(), Some(identity_for("b@c.com")));
}

fn cookie_session(server: &MockServer) -> SessionManager {
    let api = api(&server.uri());
    let storage = CookieStorage::new(api.http().clone(), format!("{}/auth/logout", server.uri()));
    SessionManager::from_parts(api, TokenStore::new(Box::new(storage)), None)
}

async fn mount_cookie_profile(server: &MockServer) {
    Mock::given(method("GET"))
        .and(path("/auth/profile"))
        .and(NoAuthorization)
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": "u1",
            "email": "a@b.com",
        })))
        .mount(server)
        .await;
}

#[tokio::test]
async fn test_cookie_logout_sends_one_request() {
    let server = MockServer::start().await;
    mount_login(&server, "opaque", "opaque-r").await;
    mount_cookie_profile(&server).await;
    Mock::given(method("POST"))
        .and(path("/auth/logout"))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&server)
        .await;

    let session = cookie_session(&server);
    session.login(&credentials()).await.unwrap();
    assert_eq!(session.store().access_token(), Some(Credential::Cookie));

    session.logout().await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert!(!session.store().has_tokens());
    assert!(!session.is_authenticated());
}

#[tokio::test]
async fn test_cookie_logout_retries_invalidation_after_server_failure() {
    let server = MockServer::start().await;
    mount_login(&server, "opaque", "opaque-r").await;
    mount_cookie_profile(&server).await;
    Mock::given(method("POST"))
        .and(path("/auth/logout"))
        .respond_with(ResponseTemplate::new(503))
        .expect(2)
        .mount(&server)
        .await;

    let session = cookie_session(&server);
    session.login(&credentials()).await.unwrap();

    session.logout().await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert!(!session.store().has_tokens());
}

// ===== Profile =====

#[tokio::test]
async fn test_refresh_profile_when_signed_out() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/auth/profile"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;

    let session = memory_session(&server.uri());
    assert_eq!(session.refresh_profile().await.unwrap(), None);
}

#[tokio::test]
async fn test_refresh_profile_updates_identity() {
    let server = MockServer::start().await;
    let token = token_for("a@b.com", 3600);
    mount_login(&server, &token, "r1").await;
    Mock::given(method("GET"))
        .and(path("/auth/profile"))
        .and(header("authorization", format!("Bearer {}", token).as_str()))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": "id-a@b.com",
            "email": "a@b.com",
            "displayName": "Alice",
        })))
        .expect(1)
        .mount(&server)
        .await;

    let session = memory_session(&server.uri());
    session.login(&credentials()).await.unwrap();
    let identity = session.refresh_profile().await.unwrap().unwrap();

    assert_eq!(identity.display_name.as_deref(), Some("Alice"));
    assert_eq!(session.identity(), Some(identity));
}

#[tokio::test]
async fn test_refresh_profile_server_error_is_reported() {
    let server = MockServer::start().await;
    mount_login(&server, &token_for("a@b.com", 3600), "r1").await;
    Mock::given(method("GET"))
        .and(path("/auth/profile"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;

    let session = memory_session(&server.uri());
    session.login(&credentials()).await.unwrap();
    let mut events = session.subscribe();

    let err = session.refresh_profile().await.unwrap_err();
    assert!(matches!(err, SessionError::Api(ApiError::ServerError { status: 500 })));
    assert_eq!(session.identity(), Some(identity_for("a@b.com")));

    let seen = drain_events(&mut events, Duration::from_millis(20)).await;
    assert_eq!(
        seen,
        vec![SessionEvent::TransportError {
            message: "Server error. Please try again later.".to_string(),
            status: Some(500),
        }]
    );
}

// ===== Startup =====

#[tokio::test]
async fn test_initialize_with_valid_token() {
    let server = MockServer::start().await;
    let session = SessionManager::from_parts(
        api(&server.uri()),
        seeded(&token_for("a@b.com", 3600), "r1"),
        None,
    );

    assert!(!session.is_ready());
    session.initialize().await;

    assert!(session.is_ready());
    assert_eq!(session.identity(), Some(identity_for("a@b.com")));
}

#[tokio::test]
async fn test_initialize_refreshes_expired_token() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/auth/refresh"))
        .and(body_json(json!({"refreshToken": "r1"})))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(pair_json(&token_for("a@b.com", 3600), "r2")),
        )
        .expect(1)
        .mount(&server)
        .await;

    let session = SessionManager::from_parts(
        api(&server.uri()),
        seeded(&token_for("a@b.com", -60), "r1"),
        None,
    );
    session.initialize().await;

    assert!(session.is_ready());
    assert_eq!(session.identity(), Some(identity_for("a@b.com")));
}

#[tokio::test]
async fn test_initialize_with_rejected_refresh_signs_out() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/auth/refresh"))
        .respond_with(ResponseTemplate::new(401))
        .expect(1)
        .mount(&server)
        .await;

    let session = SessionManager::from_parts(
        api(&server.uri()),
        seeded(&token_for("a@b.com", -60), "r1"),
        None,
    );
    session.initialize().await;

    assert!(session.is_ready());
    assert!(!session.is_authenticated());
    assert!(!session.store().has_tokens());
}

#[tokio::test]
async fn test_initialize_restores_snapshot_once() {
    let server = MockServer::start().await;
    let dir = tempfile::tempdir().unwrap();
    snapshot_store(dir.path())
        .save(&identity_for("a@b.com"))
        .await
        .unwrap();

    let session = SessionManager::from_parts(
        api(&server.uri()),
        TokenStore::memory(),
        Some(snapshot_store(dir.path())),
    );
    session.initialize().await;
    assert_eq!(session.identity(), Some(identity_for("a@b.com")));

    // A second initialize does not reload the record
    session.apply_storage_change(None).await;
    session.initialize().await;
    assert_eq!(session.identity(), None);
}

// ===== Snapshot sync =====

#[tokio::test]
async fn test_apply_storage_change() {
    let server = MockServer::start().await;
    let dir = tempfile::tempdir().unwrap();
    let writer = snapshot_store(dir.path());
    writer.save(&identity_for("a@b.com")).await.unwrap();
    let record = writer.read_record().unwrap();

    let session = SessionManager::from_parts(
        api(&server.uri()),
        TokenStore::memory(),
        Some(snapshot_store(dir.path())),
    );

    session.apply_storage_change(Some(&record)).await;
    assert_eq!(session.identity(), Some(identity_for("a@b.com")));

    session.apply_storage_change(Some("garbage")).await;
    assert_eq!(session.identity(), None);

    session.apply_storage_change(Some(&record)).await;
    session.apply_storage_change(None).await;
    assert_eq!(session.identity(), None);
}

#[tokio::test]
async fn test_storage_change_ignored_without_snapshot() {
    let server = MockServer::start().await;
    let dir = tempfile::tempdir().unwrap();
    let writer = snapshot_store(dir.path());
    writer.save(&identity_for("a@b.com")).await.unwrap();

    let session = memory_session(&server.uri());
    session
        .apply_storage_change(writer.read_record().as_deref())
        .await;
    assert_eq!(session.identity(), None);
}

#[tokio::test]
async fn test_invalidation_drops_identity_and_snapshot() {
    let server = MockServer::start().await;
    mount_login(&server, &token_for("a@b.com", 3600), "r1").await;
    Mock::given(method("GET"))
        .and(path("/data"))
        .respond_with(ResponseTemplate::new(401))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/auth/refresh"))
        .respond_with(ResponseTemplate::new(401).set_body_json(json!({"error": "revoked"})))
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let session = SessionManager::from_parts(
        api(&server.uri()),
        TokenStore::memory(),
        Some(snapshot_store(dir.path())),
    );
    session.login(&credentials()).await.unwrap();
    let record = dir.path().join("app.auth");
    assert!(record.exists());

    let err = session.client().get::<Value>("/data").await.unwrap_err();
    assert!(matches!(err, ApiError::RefreshFailed(RefreshError::Rejected(_))));

    wait_for_identity(&session, false).await;
    assert!(!record.exists());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_login_and_logout_propagate_to_other_process() {
    let server = MockServer::start().await;
    mount_login(&server, &token_for("a@b.com", 3600), "r1").await;
    mount_logout(&server, 204).await;

    let dir = tempfile::tempdir().unwrap();
    let first = SessionManager::from_parts(
        api(&server.uri()),
        TokenStore::memory(),
        Some(snapshot_store(dir.path())),
    );
    let second = SessionManager::from_parts(
        api(&server.uri()),
        TokenStore::memory(),
        Some(snapshot_store(dir.path())),
    );
    second.initialize().await;
    assert!(!second.is_authenticated());

    first.login(&credentials()).await.unwrap();
    wait_for_identity(&second, true).await;
    assert_eq!(second.identity(), Some(identity_for("a@b.com")));

    first.logout().await;
    wait_for_identity(&second, false).await;
}
