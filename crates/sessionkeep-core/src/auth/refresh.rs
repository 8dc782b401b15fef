//! Single-flight token refresh.
//!
//! The coordinator is a two-state machine. In `Idle`, the first caller
//! starts a refresh cycle; while `Refreshing`, later callers queue behind it.
//! The cycle runs as its own task so a caller that gives up cannot cancel it,
//! and it settles the queue exactly once.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::{oneshot, Mutex};
use tracing::{debug, error, info, warn};

use super::store::TokenStore;
use super::token::Credential;
use crate::api::ApiClient;
use crate::events::{EventBus, SessionEvent};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RefreshError {
    #[error("No refresh token available")]
    MissingRefreshToken,

    #[error("Refresh rejected: {0}")]
    Rejected(String),

    /// A logout or login replaced the session while the refresh was in flight.
    #[error("Session changed while the refresh was in flight")]
    Superseded,

    #[error("Refresh task ended without a result")]
    Abandoned,
}

impl RefreshError {
    /// Whether this failure ends the session and must be broadcast.
    fn invalidates_session(&self) -> bool {
        matches!(self, RefreshError::MissingRefreshToken | RefreshError::Rejected(_))
    }
}

type Waiter = oneshot::Sender<Result<Credential, RefreshError>>;

enum State {
    Idle,
    Refreshing { waiters: Vec<Waiter> },
}

pub struct RefreshCoordinator {
    api: ApiClient,
    store: Arc<TokenStore>,
    events: EventBus,
    state: Mutex<State>,
    /// Refresh calls actually sent to the token service
    calls: AtomicU64,
}

impl RefreshCoordinator {
    pub fn new(api: ApiClient, store: Arc<TokenStore>, events: EventBus) -> Self {
        Self {
            api,
            store,
            events,
            state: Mutex::new(State::Idle),
            calls: AtomicU64::new(0),
        }
    }

    /// Obtain a fresh access credential, joining the in-flight refresh if
    /// there is one. Every caller of one cycle gets the same result.
    pub async fn refresh(self: &Arc<Self>) -> Result<Credential, RefreshError> {
        let (tx, rx) = oneshot::channel();

        let start_cycle = {
            let mut state = self.state.lock().await;
            match &mut *state {
                State::Refreshing { waiters } => {
                    waiters.push(tx);
                    debug!(queued = waiters.len(), "Refresh in flight; request queued");
                    false
                }
                State::Idle => {
                    *state = State::Refreshing { waiters: vec![tx] };
                    true
                }
            }
        };

        if start_cycle {
            let coordinator = Arc::clone(self);
            tokio::spawn(async move { coordinator.run_cycle().await });
        }

        rx.await.unwrap_or(Err(RefreshError::Abandoned))
    }

    pub async fn is_refreshing(&self) -> bool {
        matches!(*self.state.lock().await, State::Refreshing { .. })
    }

    /// Number of refresh calls issued so far.
    pub fn refresh_calls(&self) -> u64 {
        self.calls.load(Ordering::Relaxed)
    }

    async fn run_cycle(&self) {
        let outcome = self.perform().await;

        // The store is already updated (or cleared) at this point.
        let waiters = match std::mem::replace(&mut *self.state.lock().await, State::Idle) {
            State::Refreshing { waiters } => waiters,
            State::Idle => Vec::new(),
        };

        match &outcome {
            Ok(_) => info!(waiters = waiters.len(), "Token refresh succeeded"),
            Err(e) => warn!(error = %e, waiters = waiters.len(), "Token refresh failed"),
        }

        for waiter in waiters {
            // A waiter that stopped listening does not affect the others
            let _ = waiter.send(outcome.clone());
        }

        if let Err(ref e) = outcome {
            if e.invalidates_session() {
                self.events.emit(SessionEvent::SessionInvalidated);
            }
        }
    }

    async fn perform(&self) -> Result<Credential, RefreshError> {
        let epoch = self.store.epoch();

        let Some(refresh_token) = self.store.refresh_token() else {
            if !self.store.clear_tokens_if_current(epoch) {
                return Err(RefreshError::Superseded);
            }
            return Err(RefreshError::MissingRefreshToken);
        };

        self.calls.fetch_add(1, Ordering::Relaxed);
        match self.api.refresh(&refresh_token).await {
            Ok(pair) => {
                if !self.store.set_tokens_if_current(epoch, &pair) {
                    debug!("Discarding refreshed tokens; session changed meanwhile");
                    return Err(RefreshError::Superseded);
                }
                self.events.emit(SessionEvent::TokensRefreshed);
                Ok(self
                    .store
                    .access_token()
                    .unwrap_or(Credential::Bearer(pair.access_token)))
            }
            Err(e) => {
                // A login or logout since the cycle started owns the store now
                if !self.store.clear_tokens_if_current(epoch) {
                    debug!(error = %e, "Refresh failed after the session changed; leaving store alone");
                    return Err(RefreshError::Superseded);
                }
                error!(error = %e, "Refresh call failed; session cleared");
                Err(RefreshError::Rejected(e.to_string()))
            }
        }
    }
}
