//! Token storage strategies.
//!
//! One strategy is picked when the `TokenStore` is built:
//! - `CookieStorage`: the server keeps tokens in httpOnly cookies
//! - `MemoryStorage`: tokens live only as long as the process
//! - `SessionStorage`: memory plus a file in the user's runtime directory
//!
//! None of them write raw tokens to durable cross-session storage.

use std::io::ErrorKind;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::token::{Credential, TokenPair};
use crate::config::StorageKind;

pub trait TokenStorage: Send {
    fn kind(&self) -> StorageKind;

    fn store(&mut self, pair: &TokenPair);

    fn access_token(&self) -> Option<Credential>;

    fn refresh_token(&self) -> Option<Credential>;

    /// Remove every trace of the tokens. Must be idempotent and infallible.
    fn clear(&mut self);

    /// `clear` for when the server already ended the session.
    fn clear_local(&mut self) {
        self.clear();
    }
}

// ============================================================================
// Memory
// ============================================================================

#[derive(Default)]
pub struct MemoryStorage {
    access_token: Option<String>,
    refresh_token: Option<String>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

impl TokenStorage for MemoryStorage {
    fn kind(&self) -> StorageKind {
        StorageKind::Memory
    }

    fn store(&mut self, pair: &TokenPair) {
        self.access_token = Some(pair.access_token.clone());
        self.refresh_token = pair.refresh_token.clone().filter(|t| !t.is_empty());
    }

    fn access_token(&self) -> Option<Credential> {
        self.access_token.clone().map(Credential::Bearer)
    }

    fn refresh_token(&self) -> Option<Credential> {
        self.refresh_token.clone().map(Credential::Bearer)
    }

    fn clear(&mut self) {
        self.access_token = None;
        self.refresh_token = None;
    }
}

// ============================================================================
// Session-scoped file
// ============================================================================

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SessionRecord {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
}

/// Memory first, then a file under the runtime directory, which the OS
/// empties when the user's login session ends.
pub struct SessionStorage {
    memory: MemoryStorage,
    path: PathBuf,
}

impl SessionStorage {
    pub fn new(path: PathBuf) -> Self {
        Self {
            memory: MemoryStorage::new(),
            path,
        }
    }

    fn read_record(&self) -> Option<SessionRecord> {
        let contents = match std::fs::read_to_string(&self.path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == ErrorKind::NotFound => return None,
            Err(e) => {
                warn!(error = %e, path = ?self.path, "Failed to read session token file");
                return None;
            }
        };
        match serde_json::from_str(&contents) {
            Ok(record) => Some(record),
            Err(e) => {
                warn!(error = %e, "Ignoring unreadable session token file");
                None
            }
        }
    }

    fn write_record(&self, record: &SessionRecord) -> std::io::Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let contents = serde_json::to_vec(record)?;
        write_private(&self.path, &contents)
    }
}

#[cfg(unix)]
fn write_private(path: &std::path::Path, contents: &[u8]) -> std::io::Result<()> {
    use std::io::Write;
    use std::os::unix::fs::OpenOptionsExt;

    let mut file = std::fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(path)?;
    file.write_all(contents)
}

#[cfg(not(unix))]
fn write_private(path: &std::path::Path, contents: &[u8]) -> std::io::Result<()> {
    std::fs::write(path, contents)
}

impl TokenStorage for SessionStorage {
    fn kind(&self) -> StorageKind {
        StorageKind::Session
    }

    fn store(&mut self, pair: &TokenPair) {
        self.memory.store(pair);
        let record = SessionRecord {
            access_token: pair.access_token.clone(),
            refresh_token: pair.refresh_token.clone().filter(|t| !t.is_empty()),
        };
        // Memory still holds the tokens if the file cannot be written
        if let Err(e) = self.write_record(&record) {
            warn!(error = %e, path = ?self.path, "Cannot use session token file");
        }
    }

    fn access_token(&self) -> Option<Credential> {
        self.memory.access_token().or_else(|| {
            self.read_record()
                .map(|record| Credential::Bearer(record.access_token))
        })
    }

    fn refresh_token(&self) -> Option<Credential> {
        self.memory.refresh_token().or_else(|| {
            self.read_record()
                .and_then(|record| record.refresh_token)
                .map(Credential::Bearer)
        })
    }

    fn clear(&mut self) {
        self.memory.clear();
        match std::fs::remove_file(&self.path) {
            Ok(()) => debug!(path = ?self.path, "Removed session token file"),
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => warn!(error = %e, path = ?self.path, "Failed to remove session token file"),
        }
    }
}

// ============================================================================
// Server-managed cookies
// ============================================================================

/// The token service sets httpOnly cookies on login/refresh; the shared
/// `reqwest::Client` cookie jar replays them. Only the fact that a session
/// was installed is tracked here.
pub struct CookieStorage {
    client: reqwest::Client,
    logout_url: String,
    installed: bool,
}

impl CookieStorage {
    /// `client` must be the client whose cookie jar receives the cookies.
    pub fn new(client: reqwest::Client, logout_url: String) -> Self {
        Self {
            client,
            logout_url,
            installed: false,
        }
    }

    /// Ask the server to expire its cookies. Fire-and-forget.
    fn invalidate_cookies(&self) {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            warn!("No async runtime; server-side cookies were not invalidated");
            return;
        };
        let request = self.client.post(&self.logout_url);
        handle.spawn(async move {
            match request.send().await {
                Ok(response) if response.status().is_success() => {
                    debug!("Server-side session cookies invalidated");
                }
                Ok(response) => {
                    warn!(status = %response.status(), "Cookie invalidation rejected");
                }
                Err(e) => warn!(error = %e, "Cookie invalidation request failed"),
            }
        });
    }
}

impl TokenStorage for CookieStorage {
    fn kind(&self) -> StorageKind {
        StorageKind::Cookie
    }

    fn store(&mut self, _pair: &TokenPair) {
        debug!("Tokens are held in server-managed cookies");
        self.installed = true;
    }

    fn access_token(&self) -> Option<Credential> {
        self.installed.then_some(Credential::Cookie)
    }

    fn refresh_token(&self) -> Option<Credential> {
        self.installed.then_some(Credential::Cookie)
    }

    fn clear(&mut self) {
        if self.installed {
            self.installed = false;
            self.invalidate_cookies();
        }
    }

    fn clear_local(&mut self) {
        self.installed = false;
    }
}
