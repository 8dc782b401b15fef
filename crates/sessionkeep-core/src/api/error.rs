use serde_json::Value;
use thiserror::Error;

use crate::auth::RefreshError;

/// Fallback text for a 400 without a usable server message
const INVALID_REQUEST_MESSAGE: &str = "Invalid request";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),

    #[error("Unauthorized - token may be expired")]
    Unauthorized(Option<String>),

    #[error("Access denied: {0}")]
    AccessDenied(String),

    #[error("Resource not found: {0}")]
    NotFound(String),

    #[error("Rate limited - please wait before retrying")]
    RateLimited,

    #[error("Server error. Please try again later.")]
    ServerError { status: u16 },

    #[error("Network error: {0}")]
    NetworkError(String),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("Unauthorized - session could not be refreshed: {0}")]
    RefreshFailed(RefreshError),
}

impl From<reqwest::Error> for ApiError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            ApiError::InvalidResponse(e.to_string())
        } else {
            ApiError::NetworkError(e.to_string())
        }
    }
}

/// Maximum length for error response bodies in error messages
const MAX_ERROR_BODY_LENGTH: usize = 500;

impl ApiError {
    /// Truncate a response body to avoid logging excessive data
    fn truncate_body(body: &str) -> String {
        if body.len() <= MAX_ERROR_BODY_LENGTH {
            body.to_string()
        } else {
            let mut end = MAX_ERROR_BODY_LENGTH;
            while !body.is_char_boundary(end) {
                end -= 1;
            }
            format!("{}... (truncated, {} total bytes)", &body[..end], body.len())
        }
    }

    pub fn from_status(status: reqwest::StatusCode, body: &str) -> Self {
        let message = extract_server_message(body);
        let detail = || message.clone().unwrap_or_else(|| Self::truncate_body(body));
        match status.as_u16() {
            400 => ApiError::BadRequest(
                message
                    .clone()
                    .unwrap_or_else(|| INVALID_REQUEST_MESSAGE.to_string()),
            ),
            401 => ApiError::Unauthorized(message.clone()),
            403 => ApiError::AccessDenied(detail()),
            404 => ApiError::NotFound(detail()),
            429 => ApiError::RateLimited,
            code @ 500..=599 => ApiError::ServerError { status: code },
            _ => ApiError::InvalidResponse(format!("Status {}: {}", status, detail())),
        }
    }

    /// HTTP status behind this error, when there was a response.
    pub fn status(&self) -> Option<u16> {
        match self {
            ApiError::BadRequest(_) => Some(400),
            ApiError::Unauthorized(_) | ApiError::RefreshFailed(_) => Some(401),
            ApiError::AccessDenied(_) => Some(403),
            ApiError::NotFound(_) => Some(404),
            ApiError::RateLimited => Some(429),
            ApiError::ServerError { status } => Some(*status),
            ApiError::NetworkError(_) | ApiError::InvalidResponse(_) => None,
        }
    }

    /// Message the server supplied, if any.
    pub fn server_message(&self) -> Option<&str> {
        match self {
            ApiError::BadRequest(m) | ApiError::AccessDenied(m) | ApiError::NotFound(m) => Some(m),
            ApiError::Unauthorized(m) => m.as_deref(),
            _ => None,
        }
    }

    /// Authorization failures go through the refresh protocol instead of the
    /// transport-error signal.
    pub fn is_auth_failure(&self) -> bool {
        matches!(self, ApiError::Unauthorized(_) | ApiError::RefreshFailed(_))
    }
}

/// Pull a human-readable message out of an error body: `message`, then
/// `error`, then the first entry of `errors` (a string or `{message}`). A
/// body that is itself a JSON string is used as-is.
pub fn extract_server_message(body: &str) -> Option<String> {
    let value: Value = serde_json::from_str(body).ok()?;
    let message = match &value {
        Value::String(s) => Some(s.as_str()),
        Value::Object(map) => map
            .get("message")
            .and_then(Value::as_str)
            .or_else(|| map.get("error").and_then(Value::as_str))
            .or_else(|| {
                let first = map.get("errors")?.as_array()?.first()?;
                first
                    .as_str()
                    .or_else(|| first.get("message").and_then(Value::as_str))
            }),
        _ => None,
    };
    message
        .map(str::trim)
        .filter(|m| !m.is_empty())
        .map(str::to_string)
}
