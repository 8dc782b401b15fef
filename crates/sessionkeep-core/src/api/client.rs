//! HTTP client for the token-issuing service.
//!
//! `ApiClient` speaks the raw contract (login, refresh, logout, profile) and
//! never retries. `AuthorizedClient` layers the refresh protocol on top.

use std::fmt;

use reqwest::{Client, Method, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{json, Value};
use tracing::debug;

use super::ApiError;
use crate::auth::{Credential, Identity, TokenPair};
use crate::config::Config;

// ============================================================================
// Constants
// ============================================================================

pub const LOGIN_PATH: &str = "/auth/login";
pub const REFRESH_PATH: &str = "/auth/refresh";
pub const LOGOUT_PATH: &str = "/auth/logout";
pub const PROFILE_PATH: &str = "/auth/profile";

/// Join the service base URL and an endpoint path.
pub fn endpoint_url(base_url: &str, path: &str) -> String {
    format!("{}{}", base_url.trim_end_matches('/'), path)
}

/// Email/password pair for `POST /auth/login`.
#[derive(Clone, Serialize)]
pub struct LoginCredentials {
    pub email: String,
    pub password: String,
}

impl LoginCredentials {
    pub fn new(email: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            email: email.into(),
            password: password.into(),
        }
    }
}

impl fmt::Debug for LoginCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoginCredentials")
            .field("email", &self.email)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// API client for the token service.
/// Clone is cheap - reqwest::Client uses Arc internally, cookie jar included.
#[derive(Clone)]
pub struct ApiClient {
    client: Client,
    base_url: String,
}

impl ApiClient {
    /// Create a client for `config.api_url`. The cookie jar is always on so
    /// the cookie storage strategy works without extra setup.
    pub fn new(config: &Config) -> Result<Self, ApiError> {
        let client = Client::builder()
            .timeout(config.request_timeout())
            .cookie_store(true)
            .build()?;

        Ok(Self {
            client,
            base_url: config.api_url.trim_end_matches('/').to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// The underlying HTTP client (shares the cookie jar).
    pub fn http(&self) -> &Client {
        &self.client
    }

    fn url(&self, path: &str) -> String {
        endpoint_url(&self.base_url, path)
    }

    /// Attach a bearer header unless the credential lives in a cookie.
    fn authorize(builder: RequestBuilder, credential: Option<&Credential>) -> RequestBuilder {
        match credential.and_then(Credential::bearer) {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    /// Check if response is successful, returning an error with body if not.
    async fn check_response(response: Response) -> Result<Response, ApiError> {
        if response.status().is_success() {
            Ok(response)
        } else {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            debug!(%status, "Request rejected");
            Err(ApiError::from_status(status, &body))
        }
    }

    /// Parse a JSON body; an empty body reads as `null`.
    async fn parse_body<T: DeserializeOwned>(response: Response) -> Result<T, ApiError> {
        let text = response.text().await?;
        let body = if text.trim().is_empty() { "null" } else { text.as_str() };
        serde_json::from_str(body).map_err(|e| ApiError::InvalidResponse(e.to_string()))
    }

    /// `POST /auth/login`
    pub async fn login(&self, credentials: &LoginCredentials) -> Result<TokenPair, ApiError> {
        let response = self
            .client
            .post(self.url(LOGIN_PATH))
            .json(credentials)
            .send()
            .await?;
        let response = Self::check_response(response).await?;
        Self::parse_body(response).await
    }

    /// `POST /auth/refresh`. A cookie-held refresh token is sent by the
    /// cookie jar, so the body stays empty.
    pub async fn refresh(&self, refresh_token: &Credential) -> Result<TokenPair, ApiError> {
        let body = match refresh_token.bearer() {
            Some(token) => json!({ "refreshToken": token }),
            None => json!({}),
        };
        let response = self
            .client
            .post(self.url(REFRESH_PATH))
            .json(&body)
            .send()
            .await?;
        let response = Self::check_response(response).await?;
        Self::parse_body(response).await
    }

    /// `POST /auth/logout`
    pub async fn logout(&self, credential: Option<&Credential>) -> Result<(), ApiError> {
        let request = Self::authorize(self.client.post(self.url(LOGOUT_PATH)), credential);
        let response = request.send().await?;
        Self::check_response(response).await?;
        Ok(())
    }

    /// `GET /auth/profile`
    pub async fn fetch_profile(&self, credential: Option<&Credential>) -> Result<Identity, ApiError> {
        self.send(Method::GET, PROFILE_PATH, None, credential).await
    }

    /// One request, no retry.
    pub async fn send<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        body: Option<&Value>,
        credential: Option<&Credential>,
    ) -> Result<T, ApiError> {
        let mut request = Self::authorize(self.client.request(method, self.url(path)), credential);
        if let Some(body) = body {
            request = request.json(body);
        }
        let response = request.send().await?;
        let response = Self::check_response(response).await?;
        Self::parse_body(response).await
    }
}
