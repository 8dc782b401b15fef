//! REST client module for the token-issuing service.
//!
//! This module provides the `ApiClient` for the raw auth endpoints and the
//! `AuthorizedClient` that attaches the current credential and runs the
//! refresh protocol on a 401.
//!
//! Error bodies are mapped to `ApiError` with the server's message when it
//! supplies one.

pub mod authorized;
pub mod client;
pub mod error;

pub use authorized::AuthorizedClient;
pub use client::{
    endpoint_url, ApiClient, LoginCredentials, LOGIN_PATH, LOGOUT_PATH, PROFILE_PATH, REFRESH_PATH,
};
pub use error::{extract_server_message, ApiError};
