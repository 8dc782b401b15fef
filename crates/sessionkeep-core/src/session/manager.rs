//! Session facade.
//!
//! `SessionManager` owns one token store, one refresh coordinator and the
//! optional snapshot store. Identity is derived from the access token (or
//! the profile endpoint, or the decrypted snapshot) and published through a
//! `watch` channel; readiness likewise.

use std::io::ErrorKind;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, watch, OnceCell};
use tracing::{debug, info, warn};

use super::snapshot::SnapshotStore;
use super::watcher::SnapshotWatcher;
use super::SessionError;
use crate::api::{ApiClient, ApiError, AuthorizedClient, LoginCredentials};
use crate::auth::{self, Credential, Identity, RefreshCoordinator, TokenStore};
use crate::config::Config;
use crate::events::{EventBus, SessionEvent};

/// Shown when a failed login carries no usable server message
const GENERIC_LOGIN_FAILURE: &str = "Login failed. Check your email and password.";

struct SessionInner {
    api: ApiClient,
    client: AuthorizedClient,
    store: Arc<TokenStore>,
    coordinator: Arc<RefreshCoordinator>,
    events: EventBus,
    snapshot: Option<SnapshotStore>,
    identity: watch::Sender<Option<Identity>>,
    ready: watch::Sender<bool>,
    initialized: OnceCell<()>,
    watcher: Mutex<Option<SnapshotWatcher>>,
    /// Orders snapshot writes against removals; never held across an await
    snapshot_writes: Mutex<()>,
}

/// Cheap-to-clone handle; all clones share one session.
#[derive(Clone)]
pub struct SessionManager {
    inner: Arc<SessionInner>,
}

impl SessionManager {
    /// Build the whole stack from `config`. Must be called inside a tokio
    /// runtime.
    pub fn new(config: &Config) -> Result<Self, SessionError> {
        let api = ApiClient::new(config)?;
        let store = TokenStore::from_config(config, api.http());
        let snapshot =
            SnapshotStore::from_config(config).map_err(|e| SessionError::Config(format!("{:#}", e)))?;
        Ok(Self::from_parts(api, store, snapshot))
    }

    /// Assemble from explicit parts, e.g. a custom storage strategy.
    pub fn from_parts(api: ApiClient, store: TokenStore, snapshot: Option<SnapshotStore>) -> Self {
        let events = EventBus::new();
        let store = Arc::new(store);
        let coordinator = Arc::new(RefreshCoordinator::new(
            api.clone(),
            Arc::clone(&store),
            events.clone(),
        ));
        let client = AuthorizedClient::new(
            api.clone(),
            Arc::clone(&store),
            Arc::clone(&coordinator),
            events.clone(),
        );

        let inner = Arc::new(SessionInner {
            api,
            client,
            store,
            coordinator,
            events,
            snapshot,
            identity: watch::channel(None).0,
            ready: watch::channel(false).0,
            initialized: OnceCell::new(),
            watcher: Mutex::new(None),
            snapshot_writes: Mutex::new(()),
        });
        spawn_reactor(&inner);
        Self { inner }
    }

    // ===== Observers =====

    pub fn identity(&self) -> Option<Identity> {
        self.inner.identity.borrow().clone()
    }

    pub fn is_authenticated(&self) -> bool {
        self.inner.identity.borrow().is_some()
    }

    pub fn is_ready(&self) -> bool {
        *self.inner.ready.borrow()
    }

    pub fn watch_identity(&self) -> watch::Receiver<Option<Identity>> {
        self.inner.identity.subscribe()
    }

    pub fn watch_ready(&self) -> watch::Receiver<bool> {
        self.inner.ready.subscribe()
    }

    /// `SessionInvalidated` / `TransportError` / `TokensRefreshed` signals.
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.inner.events.subscribe()
    }

    /// Refresh-aware client for application requests.
    pub fn client(&self) -> &AuthorizedClient {
        &self.inner.client
    }

    pub fn store(&self) -> &TokenStore {
        &self.inner.store
    }

    pub fn coordinator(&self) -> &Arc<RefreshCoordinator> {
        &self.inner.coordinator
    }

    // ===== Lifecycle =====

    /// Restore state from storage. Runs once; later calls return immediately.
    /// Always ends with the session marked ready.
    pub async fn initialize(&self) {
        self.inner
            .initialized
            .get_or_init(|| self.run_initialize())
            .await;
    }

    async fn run_initialize(&self) {
        if let Some(ref snapshot) = self.inner.snapshot {
            let restored = snapshot.load().await;
            debug!(restored = restored.is_some(), "Session snapshot loaded");
            self.set_identity(restored);
            self.start_watcher();
        }

        match self.inner.store.access_token() {
            Some(Credential::Bearer(token)) if !auth::is_expired(&token) => {
                if let Some(identity) = auth::identity_from_token(&token) {
                    self.set_identity(Some(identity));
                }
            }
            Some(Credential::Bearer(_)) => {
                info!("Stored access token expired; attempting refresh");
                match self.inner.coordinator.refresh().await {
                    Ok(credential) => {
                        if let Some(identity) =
                            credential.bearer().and_then(auth::identity_from_token)
                        {
                            self.set_identity(Some(identity));
                        }
                    }
                    Err(e) => {
                        warn!(error = %e, "Could not restore session");
                        self.drop_identity();
                    }
                }
            }
            // Cookie-held tokens cannot be inspected; the snapshot identity stands
            Some(Credential::Cookie) => {}
            None => debug!("No stored tokens"),
        }

        self.inner.ready.send_replace(true);
        info!(authenticated = self.is_authenticated(), "Session ready");
    }

    /// Authenticate, install the issued tokens and return the identity.
    pub async fn login(&self, credentials: &LoginCredentials) -> Result<Identity, SessionError> {
        let pair = self
            .inner
            .api
            .login(credentials)
            .await
            .map_err(login_failure)?;
        self.inner.store.set_tokens(&pair);

        let identity = match self.inner.store.current_identity() {
            Some(identity) => identity,
            None => {
                debug!("Access token carries no identity; fetching profile");
                match self.inner.client.profile().await {
                    Ok(identity) => identity,
                    Err(e) => {
                        self.inner.store.clear_tokens();
                        return Err(e.into());
                    }
                }
            }
        };

        let epoch = self.inner.store.epoch();
        self.adopt(identity.clone(), epoch).await;
        info!(user = %identity.email, "Logged in");
        Ok(identity)
    }

    /// End the session. The server call is best-effort; local state is
    /// always cleared.
    pub async fn logout(&self) {
        let credential = self.inner.store.access_token();
        match self.inner.api.logout(credential.as_ref()).await {
            // The server has already expired its cookies
            Ok(()) => self.inner.store.clear_local_tokens(),
            Err(e) => {
                warn!(error = %e, "Logout request failed; clearing local session anyway");
                self.inner.store.clear_tokens();
            }
        }
        self.drop_identity();
        info!("Logged out");
    }

    /// Re-fetch the profile. `Ok(None)` when not authenticated.
    pub async fn refresh_profile(&self) -> Result<Option<Identity>, SessionError> {
        if !self.is_authenticated() {
            return Ok(None);
        }
        let identity = self.inner.client.profile().await?;
        let epoch = self.inner.store.epoch();
        self.adopt(identity.clone(), epoch).await;
        Ok(Some(identity))
    }

    /// Adopt a snapshot record written elsewhere (`None` = record removed).
    /// Ignored unless the snapshot strategy is enabled.
    pub async fn apply_storage_change(&self, record: Option<&str>) {
        let Some(ref snapshot) = self.inner.snapshot else {
            debug!("Snapshot strategy disabled; ignoring storage change");
            return;
        };
        let identity = match record {
            Some(record) => snapshot.decode(record).await,
            None => None,
        };
        debug!(present = identity.is_some(), "Adopting identity from storage change");
        self.set_identity(identity);
    }

    // ===== Internals =====

    fn set_identity(&self, identity: Option<Identity>) {
        self.inner.identity.send_if_modified(|current| {
            if *current == identity {
                false
            } else {
                *current = identity;
                true
            }
        });
    }

    fn drop_identity(&self) {
        let _writes = self.snapshot_writes();
        if let Some(ref snapshot) = self.inner.snapshot {
            snapshot.remove();
        }
        self.set_identity(None);
    }

    /// Publish and persist `identity`, which was derived while the store was
    /// at `epoch`. Dropped if the tokens changed since, e.g. a logout that
    /// ran while the snapshot was being encrypted.
    async fn adopt(&self, identity: Identity, epoch: u64) {
        let envelope = match self.inner.snapshot {
            Some(ref snapshot) => match snapshot.seal(&identity).await {
                Ok(envelope) => Some(envelope),
                Err(e) => {
                    warn!(error = %format!("{:#}", e), "Failed to persist session snapshot");
                    None
                }
            },
            None => None,
        };
        self.commit(identity, envelope, epoch);
    }

    fn commit(&self, identity: Identity, envelope: Option<String>, epoch: u64) {
        let _writes = self.snapshot_writes();
        if self.inner.store.epoch() != epoch {
            debug!("Session changed while persisting identity; discarding");
            return;
        }
        self.set_identity(Some(identity));
        if let (Some(snapshot), Some(envelope)) = (self.inner.snapshot.as_ref(), envelope) {
            if let Err(e) = snapshot.write(&envelope) {
                warn!(error = %format!("{:#}", e), "Failed to persist session snapshot");
            }
        }
    }

    fn snapshot_writes(&self) -> MutexGuard<'_, ()> {
        self.inner
            .snapshot_writes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn start_watcher(&self) {
        let Some(ref snapshot) = self.inner.snapshot else {
            return;
        };
        let (tx, mut rx) = mpsc::unbounded_channel();
        let watcher = match SnapshotWatcher::start(snapshot.path(), tx) {
            Ok(watcher) => watcher,
            Err(e) => {
                warn!(error = %format!("{:#}", e), "Cross-process session sync unavailable");
                return;
            }
        };
        *self
            .inner
            .watcher
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(watcher);

        let weak = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            while rx.recv().await.is_some() {
                let Some(session) = upgrade(&weak) else { break };
                let Some(ref snapshot) = session.inner.snapshot else { break };
                let path = snapshot.path().to_path_buf();
                let record = match std::fs::read_to_string(&path) {
                    Ok(contents) => Some(contents),
                    Err(e) if e.kind() == ErrorKind::NotFound => None,
                    Err(e) => {
                        warn!(error = %e, "Failed to read changed snapshot");
                        continue;
                    }
                };
                session.apply_storage_change(record.as_deref()).await;
            }
            debug!("Snapshot watch task finished");
        });
    }

    async fn on_event(&self, event: SessionEvent) {
        match event {
            SessionEvent::SessionInvalidated => {
                // A login that completed after the failed refresh keeps its session
                if !self.inner.store.has_tokens() {
                    info!("Session invalidated");
                    self.drop_identity();
                }
            }
            SessionEvent::TokensRefreshed => {
                let epoch = self.inner.store.epoch();
                if let Some(identity) = self.inner.store.current_identity() {
                    self.adopt(identity, epoch).await;
                }
            }
            SessionEvent::TransportError { .. } => {}
        }
    }
}

fn upgrade(weak: &Weak<SessionInner>) -> Option<SessionManager> {
    weak.upgrade().map(|inner| SessionManager { inner })
}

/// React to coordinator signals for as long as the session exists.
fn spawn_reactor(inner: &Arc<SessionInner>) {
    let mut rx = inner.events.subscribe();
    let weak = Arc::downgrade(inner);
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(event) => {
                    let Some(session) = upgrade(&weak) else { break };
                    session.on_event(event).await;
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Session reactor lagged behind events");
                }
                Err(RecvError::Closed) => break,
            }
        }
    });
}

fn login_failure(err: ApiError) -> SessionError {
    match err {
        ApiError::NetworkError(message) => SessionError::Transport(message),
        ApiError::ServerError { .. } | ApiError::RateLimited => {
            SessionError::Authentication(err.to_string())
        }
        other => SessionError::Authentication(
            other
                .server_message()
                .unwrap_or(GENERIC_LOGIN_FAILURE)
                .to_string(),
        ),
    }
}
