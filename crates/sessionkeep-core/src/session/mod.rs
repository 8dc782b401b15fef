//! Session management.
//!
//! This module provides:
//! - `SessionManager`: login/logout/profile, startup restore, identity observers
//! - `SnapshotStore`: the encrypted `{user}` record that survives restarts
//! - `SnapshotWatcher`: cross-process sync of that record

pub mod manager;
pub mod snapshot;
pub mod watcher;

use thiserror::Error;

use crate::api::ApiError;

pub use manager::SessionManager;
pub use snapshot::{SessionSnapshot, SnapshotStore};
pub use watcher::SnapshotWatcher;

#[derive(Error, Debug)]
pub enum SessionError {
    /// Credentials rejected; the message is fit for display.
    #[error("{0}")]
    Authentication(String),

    #[error("Network error: {0}")]
    Transport(String),

    #[error(transparent)]
    Api(#[from] ApiError),

    #[error("Configuration error: {0}")]
    Config(String),
}
