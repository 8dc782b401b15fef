use std::fmt;

use base64::engine::general_purpose::{STANDARD_NO_PAD, URL_SAFE_NO_PAD};
use base64::Engine;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::debug;

/// Textual form of `Credential::Cookie`.
pub const COOKIE_SENTINEL: &str = "httponly";

/// Access/refresh pair issued by the token service on login and refresh.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
#[serde(rename_all = "camelCase")]
pub struct TokenPair {
    pub access_token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    /// Seconds until the access token expires
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_in: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_type: Option<String>,
}

impl fmt::Debug for TokenPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenPair")
            .field("access_token", &"<redacted>")
            .field("refresh_token", &self.refresh_token.as_ref().map(|_| "<redacted>"))
            .field("expires_in", &self.expires_in)
            .field("token_type", &self.token_type)
            .finish()
    }
}

/// A credential to present to the token service.
///
/// `Cookie` means the real token sits in an httpOnly cookie that the HTTP
/// client sends on its own; no `Authorization` header must be attached.
#[derive(Clone, PartialEq, Eq)]
pub enum Credential {
    Bearer(String),
    Cookie,
}

impl Credential {
    /// The raw token, unless cookie-held.
    pub fn bearer(&self) -> Option<&str> {
        match self {
            Credential::Bearer(token) => Some(token),
            Credential::Cookie => None,
        }
    }

    pub fn is_cookie(&self) -> bool {
        matches!(self, Credential::Cookie)
    }

    pub fn as_str(&self) -> &str {
        match self {
            Credential::Bearer(token) => token,
            Credential::Cookie => COOKIE_SENTINEL,
        }
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Credential::Bearer(_) => f.write_str("Bearer(<redacted>)"),
            Credential::Cookie => f.write_str("Cookie"),
        }
    }
}

/// Minimal user profile. Never carries credentials.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
#[serde(rename_all = "camelCase")]
pub struct Identity {
    pub id: String,
    pub email: String,
    #[serde(default, alias = "name", skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub roles: Vec<String>,
}

impl Identity {
    /// Display name, falling back to the email address
    pub fn label(&self) -> &str {
        self.display_name.as_deref().unwrap_or(&self.email)
    }
}

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("token has no payload segment")]
    Format,

    #[error("payload is not valid base64")]
    Base64,

    #[error("payload is not a JSON object: {0}")]
    Json(#[from] serde_json::Error),
}

/// Decode the payload segment of a JWT. The signature is not checked; the
/// result is a hint for client-side decisions only.
pub fn decode_payload(token: &str) -> Result<Map<String, Value>, DecodeError> {
    let mut segments = token.split('.');
    let payload = match (segments.next(), segments.next()) {
        (Some(_), Some(payload)) if !payload.is_empty() => payload.trim_end_matches('='),
        _ => return Err(DecodeError::Format),
    };

    let bytes = URL_SAFE_NO_PAD
        .decode(payload)
        .or_else(|_| STANDARD_NO_PAD.decode(payload))
        .map_err(|_| DecodeError::Base64)?;

    Ok(serde_json::from_slice(&bytes)?)
}

/// Fail-soft `decode_payload`.
pub fn decode_claims(token: &str) -> Option<Map<String, Value>> {
    match decode_payload(token) {
        Ok(claims) => Some(claims),
        Err(e) => {
            debug!(error = %e, "Could not decode token payload");
            None
        }
    }
}

/// Expiry instant from the `exp` claim.
pub fn expires_at(token: &str) -> Option<DateTime<Utc>> {
    let claims = decode_claims(token)?;
    let exp = claims.get("exp")?.as_f64()?;
    DateTime::from_timestamp(exp.floor() as i64, 0)
}

/// True when the `exp` claim lies in the past. Undecodable tokens and
/// tokens without `exp` count as expired.
pub fn is_expired(token: &str) -> bool {
    match expires_at(token) {
        Some(expiry) => expiry.timestamp() < Utc::now().timestamp(),
        None => true,
    }
}

/// Seconds left before expiry, negative once expired.
pub fn seconds_until_expiry(token: &str) -> Option<i64> {
    expires_at(token).map(|expiry| (expiry - Utc::now()).num_seconds())
}

/// Best-effort identity from the token payload. Requires an id (`sub`, `id`
/// or `userId`) and an `email` claim.
pub fn identity_from_token(token: &str) -> Option<Identity> {
    let claims = decode_claims(token)?;

    let id = ["sub", "id", "userId"]
        .iter()
        .find_map(|key| claims.get(*key).and_then(claim_to_string))?;
    let email = claims.get("email")?.as_str()?.to_string();

    let display_name = ["displayName", "name"]
        .iter()
        .find_map(|key| claims.get(*key).and_then(Value::as_str))
        .map(str::to_string);

    let mut roles: Vec<String> = claims
        .get("roles")
        .and_then(Value::as_array)
        .map(|roles| {
            roles
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();
    if let Some(role) = claims.get("role").and_then(Value::as_str) {
        if !roles.iter().any(|r| r == role) {
            roles.push(role.to_string());
        }
    }

    Some(Identity {
        id,
        email,
        display_name,
        roles,
    })
}

fn claim_to_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}
