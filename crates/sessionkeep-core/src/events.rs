//! Process-wide session signals.
//!
//! Frontends subscribe to learn when the session was invalidated (navigate to
//! a login surface) or when a request failed (stop spinners, show a message).
//! Sending never blocks and never waits for a subscriber.

use tokio::sync::broadcast;
use tracing::debug;

/// Capacity of the event channel. Slow subscribers see `Lagged` instead of
/// blocking the sender.
const EVENT_CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// A token refresh failed; the stored tokens have been cleared.
    SessionInvalidated,
    /// A non-auth request failed.
    TransportError {
        message: String,
        status: Option<u16>,
    },
    /// A refresh installed a new token pair.
    TokensRefreshed,
}

/// Cloneable handle to the event channel.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<SessionEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.tx.subscribe()
    }

    pub fn emit(&self, event: SessionEvent) {
        // Err only means nobody is listening right now
        if self.tx.send(event.clone()).is_err() {
            debug!(?event, "No subscribers for session event");
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
