//! sessionkeep core library.
//!
//! Client-side session lifecycle management:
//! - `crypto`: passphrase-keyed envelopes for the persisted session snapshot
//! - `auth`: token storage strategies, payload introspection, single-flight refresh
//! - `api`: HTTP client for the token-issuing service, refresh-aware requests
//! - `session`: the `SessionManager` facade tying everything together
//!
//! Frontends (the CLI, a GUI shell) only talk to `SessionManager` and
//! subscribe to `SessionEvent`s.

pub mod api;
pub mod auth;
pub mod config;
pub mod crypto;
pub mod events;
pub mod session;

pub use api::{ApiClient, ApiError, AuthorizedClient, LoginCredentials};
pub use auth::{Credential, Identity, RefreshCoordinator, RefreshError, TokenPair, TokenStore};
pub use config::{Config, SnapshotConfig, StorageKind};
pub use crypto::{CryptoCodec, KdfParams};
pub use events::{EventBus, SessionEvent};
pub use session::{SessionError, SessionManager, SessionSnapshot, SnapshotStore};
