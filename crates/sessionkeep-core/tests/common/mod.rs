//! Shared helpers for the integration tests.

#![allow(dead_code)]

use std::path::Path;
use std::time::Duration;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::Utc;
use serde_json::{json, Value};
use sessionkeep_core::crypto::{CryptoCodec, KdfParams};
use sessionkeep_core::{ApiClient, Config, SessionEvent, SessionManager, SnapshotStore, TokenStore};
use tokio::sync::broadcast;
use wiremock::{Match, Request};

/// Unsigned JWT carrying `claims`.
pub fn make_token(claims: Value) -> String {
    let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"none","typ":"JWT"}"#);
    let payload = URL_SAFE_NO_PAD.encode(claims.to_string());
    format!("{}.{}.sig", header, payload)
}

/// Token for `email` expiring `ttl_secs` from now (negative = already expired).
pub fn token_for(email: &str, ttl_secs: i64) -> String {
    make_token(json!({
        "sub": format!("id-{}", email),
        "email": email,
        "exp": Utc::now().timestamp() + ttl_secs,
    }))
}

/// Wire form of a token pair.
pub fn pair_json(access: &str, refresh: &str) -> Value {
    json!({
        "accessToken": access,
        "refreshToken": refresh,
        "expiresIn": 3600,
        "tokenType": "Bearer",
    })
}

pub fn api(uri: &str) -> ApiClient {
    ApiClient::new(&Config::new(uri)).expect("client builds")
}

pub fn fast_codec() -> CryptoCodec {
    CryptoCodec::new(KdfParams {
        memory_kib: 8,
        iterations: 1,
        parallelism: 1,
    })
}

pub fn snapshot_store(dir: &Path) -> SnapshotStore {
    SnapshotStore::new(dir.join("app.auth"), fast_codec(), "test-passphrase".to_string())
}

/// Snapshot store whose key derivation takes long enough for other
/// operations to interleave with a save.
pub fn slow_snapshot_store(dir: &Path) -> SnapshotStore {
    let codec = CryptoCodec::new(KdfParams {
        memory_kib: 8 * 1024,
        iterations: 3,
        parallelism: 1,
    });
    SnapshotStore::new(dir.join("app.auth"), codec, "test-passphrase".to_string())
}

/// Session backed by in-memory tokens and no snapshot.
pub fn memory_session(uri: &str) -> SessionManager {
    SessionManager::from_parts(api(uri), TokenStore::memory(), None)
}

/// Everything received on `rx` within `wait`.
pub async fn drain_events(rx: &mut broadcast::Receiver<SessionEvent>, wait: Duration) -> Vec<SessionEvent> {
    tokio::time::sleep(wait).await;
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

pub fn count(events: &[SessionEvent], wanted: &SessionEvent) -> usize {
    events.iter().filter(|e| *e == wanted).count()
}

/// Matches requests that carry no `Authorization` header.
pub struct NoAuthorization;

impl Match for NoAuthorization {
    fn matches(&self, request: &Request) -> bool {
        !request.headers.contains_key("authorization")
    }
}
