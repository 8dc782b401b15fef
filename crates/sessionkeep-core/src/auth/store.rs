use std::sync::{Mutex, MutexGuard, PoisonError};

use tracing::{debug, warn};

use super::storage::{CookieStorage, MemoryStorage, SessionStorage, TokenStorage};
use super::token::{self, Credential, Identity, TokenPair};
use crate::config::{Config, StorageKind};

struct Inner {
    storage: Box<dyn TokenStorage>,
    /// Bumped on every install and every clear. A refresh that started
    /// under an older epoch must neither resurrect an ended session nor
    /// touch a newer one.
    epoch: u64,
}

/// Sole owner of the current access/refresh tokens.
pub struct TokenStore {
    inner: Mutex<Inner>,
}

impl TokenStore {
    pub fn new(storage: Box<dyn TokenStorage>) -> Self {
        Self {
            inner: Mutex::new(Inner { storage, epoch: 0 }),
        }
    }

    pub fn memory() -> Self {
        Self::new(Box::new(MemoryStorage::new()))
    }

    /// Pick the storage strategy named in `config`. `client` is the HTTP
    /// client whose cookie jar holds server-managed cookies.
    pub fn from_config(config: &Config, client: &reqwest::Client) -> Self {
        let storage: Box<dyn TokenStorage> = match config.token_storage {
            StorageKind::Cookie => Box::new(CookieStorage::new(
                client.clone(),
                crate::api::endpoint_url(&config.api_url, crate::api::LOGOUT_PATH),
            )),
            StorageKind::Memory => Box::new(MemoryStorage::new()),
            StorageKind::Session => match config.session_token_path() {
                Some(path) => Box::new(SessionStorage::new(path)),
                None => {
                    warn!("No runtime directory available; keeping tokens in memory only");
                    Box::new(MemoryStorage::new())
                }
            },
        };
        debug!(kind = ?storage.kind(), "Token storage selected");
        Self::new(storage)
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn kind(&self) -> StorageKind {
        self.lock().storage.kind()
    }

    pub fn set_tokens(&self, pair: &TokenPair) {
        let mut inner = self.lock();
        inner.storage.store(pair);
        inner.epoch += 1;
    }

    /// Install `pair` only if nothing was installed or cleared since `epoch`.
    pub fn set_tokens_if_current(&self, epoch: u64, pair: &TokenPair) -> bool {
        let mut inner = self.lock();
        if inner.epoch != epoch {
            return false;
        }
        inner.storage.store(pair);
        inner.epoch += 1;
        true
    }

    pub fn access_token(&self) -> Option<Credential> {
        self.lock().storage.access_token()
    }

    pub fn refresh_token(&self) -> Option<Credential> {
        self.lock().storage.refresh_token()
    }

    pub fn has_tokens(&self) -> bool {
        self.access_token().is_some()
    }

    /// Wipe every trace of the tokens. Idempotent.
    pub fn clear_tokens(&self) {
        let mut inner = self.lock();
        inner.storage.clear();
        inner.epoch += 1;
        debug!(epoch = inner.epoch, "Tokens cleared");
    }

    /// Clear only if nothing was installed or cleared since `epoch`.
    pub fn clear_tokens_if_current(&self, epoch: u64) -> bool {
        let mut inner = self.lock();
        if inner.epoch != epoch {
            return false;
        }
        inner.storage.clear();
        inner.epoch += 1;
        debug!(epoch = inner.epoch, "Tokens cleared");
        true
    }

    /// Clear after the server already ended the session: no out-of-band
    /// invalidation is sent.
    pub fn clear_local_tokens(&self) {
        let mut inner = self.lock();
        inner.storage.clear_local();
        inner.epoch += 1;
        debug!(epoch = inner.epoch, "Local tokens cleared");
    }

    pub fn epoch(&self) -> u64 {
        self.lock().epoch
    }

    pub fn is_expired(&self, token: &str) -> bool {
        token::is_expired(token)
    }

    pub fn identity_from_token(&self, token: &str) -> Option<Identity> {
        token::identity_from_token(token)
    }

    /// Identity carried by the current access token, if it is a readable bearer token.
    pub fn current_identity(&self) -> Option<Identity> {
        self.access_token()
            .as_ref()
            .and_then(Credential::bearer)
            .and_then(token::identity_from_token)
    }
}
