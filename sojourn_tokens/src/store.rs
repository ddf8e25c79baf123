//! Persistence of the session's token pair

use std::error;

use async_trait::async_trait;
use tokio::{sync::broadcast::error::RecvError, task::JoinHandle};

use crate::{IssuedTokenPair, RefreshToken, SessionEvent, SessionEvents};

#[cfg(feature = "file")]
pub mod file;
pub mod in_memory;

#[cfg(feature = "file")]
pub use file::FileSessionStore;
pub use in_memory::InMemorySessionStore;

/// A boxed error returned by a session store
pub type StoreError = Box<dyn error::Error + Send + Sync + 'static>;

/// An asynchronous store mirroring the session's current token pair
///
/// This can be used to carry a session across process restarts.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Loads the persisted token pair, if one exists
    async fn load(&mut self) -> Result<Option<IssuedTokenPair>, StoreError>;

    /// Persists a token pair, replacing any previous one
    async fn persist(&mut self, tokens: &IssuedTokenPair) -> Result<(), StoreError>;

    /// Removes any persisted token pair
    async fn clear(&mut self) -> Result<(), StoreError>;
}

/// Spawns a task that mirrors session events into `store`
///
/// Newly established and resumed pairs are persisted, as are renewals of the
/// pair most recently persisted. A renewal that arrives after the session was
/// ended or replaced by another login is dropped. Terminated and ended
/// sessions are cleared. Store failures are logged and do not stop the task,
/// which runs until every publisher of `events` has been dropped.
pub fn spawn_persistence<S>(events: &SessionEvents, mut store: S) -> JoinHandle<()>
where
    S: SessionStore + 'static,
{
    let mut rx = events.subscribe();

    tokio::spawn(async move {
        let mut current: Option<RefreshToken> = None;
        loop {
            let event = match rx.recv().await {
                Ok(event) => event,
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "session store fell behind on session events");
                    continue;
                }
                Err(RecvError::Closed) => {
                    tracing::info!("no more session events, halting persistence");
                    return;
                }
            };

            let result = match &event {
                SessionEvent::Established(tokens) | SessionEvent::Resumed(tokens) => {
                    current = Some(tokens.refresh_token().to_owned());
                    store.persist(tokens).await
                }
                SessionEvent::Renewed {
                    tokens, replaced, ..
                } => {
                    if current.as_ref() != Some(replaced) {
                        tracing::debug!("renewal does not belong to the persisted session, skipping");
                        continue;
                    }
                    current = Some(tokens.refresh_token().to_owned());
                    store.persist(tokens).await
                }
                SessionEvent::Terminated { .. } | SessionEvent::Ended => {
                    current = None;
                    store.clear().await
                }
            };

            match result {
                Ok(()) => tracing::trace!("mirrored session event to store"),
                Err(error) => {
                    tracing::warn!(error = (&*error as &dyn error::Error), "unable to update session store")
                }
            }
        }
    })
}
