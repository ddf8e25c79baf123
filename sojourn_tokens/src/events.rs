//! Notifications about changes to the session's token pair
//!
//! The session, the request pipeline and any persistence layer share one
//! [`SessionEvents`] channel. Whoever renews the pair publishes the new pair
//! here, so that a renewal triggered deep inside a single resource call still
//! reaches the session record and any store that mirrors it.

use std::sync::Arc;

use tokio::sync::broadcast;

use crate::{IssuedTokenPair, RefreshToken, SessionErrorKind};

const DEFAULT_CAPACITY: usize = 16;

/// Which path renewed the token pair
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RenewalOrigin {
    /// The session renewed ahead of the estimated expiry
    Proactive,
    /// A resource call was rejected as unauthorized and renewed mid-flight
    Reactive,
}

/// A change in the session's state
#[derive(Clone, Debug)]
pub enum SessionEvent {
    /// A login produced a new token pair
    Established(Arc<IssuedTokenPair>),
    /// A previously persisted token pair was restored
    Resumed(Arc<IssuedTokenPair>),
    /// A renewal produced a new token pair
    ///
    /// The pair only belongs to a session whose current refresh token is
    /// still `replaced`. A renewal that settles after a logout or a fresh
    /// login belongs to no session at all.
    Renewed {
        /// The newly issued pair
        tokens: Arc<IssuedTokenPair>,
        /// The refresh token exchanged for `tokens`
        replaced: RefreshToken,
        /// Which path performed the renewal
        origin: RenewalOrigin,
    },
    /// Renewal failed and the session requires a fresh login
    Terminated {
        /// Why the session ended
        kind: SessionErrorKind,
    },
    /// The session was ended by logging out
    Ended,
}

/// A broadcast channel of [`SessionEvent`]s
#[derive(Clone, Debug)]
pub struct SessionEvents {
    tx: broadcast::Sender<SessionEvent>,
}

impl Default for SessionEvents {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }
}

impl SessionEvents {
    /// Constructs a channel that buffers up to `capacity` events per subscriber
    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Subscribes to events published after this call
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.tx.subscribe()
    }

    /// Publishes an event to all current subscribers
    ///
    /// Returns the number of subscribers that will observe the event.
    pub fn publish(&self, event: SessionEvent) -> usize {
        match self.tx.send(event) {
            Ok(receivers) => receivers,
            Err(_) => {
                tracing::trace!("no one is listening for session events");
                0
            }
        }
    }
}
