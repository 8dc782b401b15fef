use std::sync::Arc;

use reqwest::Method;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tracing::debug;

use super::client::PROFILE_PATH;
use super::{ApiClient, ApiError};
use crate::auth::{Identity, RefreshCoordinator, TokenStore};
use crate::events::{EventBus, SessionEvent};

/// Outbound requests carrying the current credential.
///
/// A 401 hands over to the `RefreshCoordinator` and the request is replayed
/// once with the new credential. Other failures are broadcast as
/// `SessionEvent::TransportError` before being returned.
#[derive(Clone)]
pub struct AuthorizedClient {
    api: ApiClient,
    store: Arc<TokenStore>,
    coordinator: Arc<RefreshCoordinator>,
    events: EventBus,
}

impl AuthorizedClient {
    pub fn new(
        api: ApiClient,
        store: Arc<TokenStore>,
        coordinator: Arc<RefreshCoordinator>,
        events: EventBus,
    ) -> Self {
        Self {
            api,
            store,
            coordinator,
            events,
        }
    }

    pub async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T, ApiError> {
        self.execute(Method::GET, path, None).await
    }

    pub async fn post<T, B>(&self, path: &str, body: &B) -> Result<T, ApiError>
    where
        T: DeserializeOwned,
        B: Serialize + ?Sized,
    {
        let body = serde_json::to_value(body).map_err(|e| ApiError::InvalidResponse(e.to_string()))?;
        self.execute(Method::POST, path, Some(body)).await
    }

    /// `GET /auth/profile` with refresh handling.
    pub async fn profile(&self) -> Result<Identity, ApiError> {
        self.get(PROFILE_PATH).await
    }

    pub async fn execute<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        body: Option<Value>,
    ) -> Result<T, ApiError> {
        let result = self.execute_with_refresh(method, path, body.as_ref()).await;
        if let Err(ref e) = result {
            if !e.is_auth_failure() {
                self.events.emit(SessionEvent::TransportError {
                    message: e.to_string(),
                    status: e.status(),
                });
            }
        }
        result
    }

    async fn execute_with_refresh<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        body: Option<&Value>,
    ) -> Result<T, ApiError> {
        let sent = self.store.access_token();
        match self.api.send(method.clone(), path, body, sent.as_ref()).await {
            Err(ApiError::Unauthorized(_)) => {}
            other => return other,
        }

        // Someone else may have refreshed while this request was in flight;
        // replay with their token instead of starting another cycle.
        let credential = match self.store.access_token() {
            Some(current) if !current.is_cookie() && Some(&current) != sent.as_ref() => {
                debug!(path, "Token changed while request was in flight; replaying");
                current
            }
            _ => {
                debug!(path, "Request unauthorized; refreshing");
                self.coordinator
                    .refresh()
                    .await
                    .map_err(ApiError::RefreshFailed)?
            }
        };

        // Replayed at most once; a second 401 is returned as-is.
        self.api.send(method, path, body, Some(&credential)).await
    }
}
