//! Token lifecycle.
//!
//! This module provides:
//! - `TokenPair`, `Credential`, `Identity` and payload introspection (`token`)
//! - `TokenStore` over one of three storage strategies (`storage`, `store`)
//! - `RefreshCoordinator`: at most one refresh call in flight (`refresh`)
//!
//! Payload decoding never verifies signatures; expiry checks are hints for
//! the client, not a security boundary.

pub mod refresh;
pub mod storage;
pub mod store;
pub mod token;

pub use refresh::{RefreshCoordinator, RefreshError};
pub use storage::{CookieStorage, MemoryStorage, SessionStorage, TokenStorage};
pub use store::TokenStore;
pub use token::{
    decode_claims, identity_from_token, is_expired, seconds_until_expiry, Credential, DecodeError,
    Identity, TokenPair, COOKIE_SENTINEL,
};
