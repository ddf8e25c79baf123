use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use sojourn_clock::{Clock, System};
use tokio::sync::broadcast::{self, error::TryRecvError};

use crate::{
    IssuedTokenPair, RefreshCoordinator, RefreshTokenRef, RenewalError, RenewalOrigin,
    SessionError, SessionErrorKind, SessionEvent, SessionEvents, TokenPair,
};

/// The session state held for the authenticated principal
#[derive(Clone, Debug)]
pub struct SessionRecord {
    current: Arc<IssuedTokenPair>,
    last_error: Option<SessionErrorKind>,
}

impl SessionRecord {
    fn new(current: Arc<IssuedTokenPair>) -> Self {
        Self {
            current,
            last_error: None,
        }
    }

    /// The current token pair and its expiry estimate
    #[inline]
    pub fn current(&self) -> &Arc<IssuedTokenPair> {
        &self.current
    }

    /// The renewal failure that ended this session, if any
    #[inline]
    pub fn last_error(&self) -> Option<SessionErrorKind> {
        self.last_error
    }

    /// Whether the session can no longer be used without a fresh login
    #[inline]
    pub fn is_terminal(&self) -> bool {
        self.last_error.is_some()
    }
}

#[derive(Debug)]
struct Inner {
    record: Option<SessionRecord>,
    updates: broadcast::Receiver<SessionEvent>,
}

impl Inner {
    fn apply_pending(&mut self) {
        loop {
            match self.updates.try_recv() {
                Ok(SessionEvent::Renewed {
                    tokens,
                    replaced,
                    origin: RenewalOrigin::Reactive,
                }) => {
                    if self.adopt(&tokens, &replaced) {
                        tracing::debug!(
                            issued = tokens.issued().0,
                            expiry = tokens.expiry().0,
                            "adopted token pair renewed by a resource call"
                        );
                    }
                }
                Ok(_) => {}
                Err(TryRecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "session fell behind on renewal events");
                }
                Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => break,
            }
        }
    }

    fn discard_pending(&mut self) {
        loop {
            match self.updates.try_recv() {
                Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => break,
                _ => {}
            }
        }
    }

    /// Replaces the current pair, but only with a renewal of that very pair
    fn adopt(&mut self, tokens: &Arc<IssuedTokenPair>, replaced: &RefreshTokenRef) -> bool {
        match &mut self.record {
            Some(record)
                if !record.is_terminal() && record.current.refresh_token() == replaced =>
            {
                record.current = Arc::clone(tokens);
                true
            }
            _ => false,
        }
    }

    fn fail(&mut self, refresh_token: &RefreshTokenRef, kind: SessionErrorKind) -> bool {
        match &mut self.record {
            Some(record)
                if !record.is_terminal() && record.current.refresh_token() == refresh_token =>
            {
                record.last_error = Some(kind);
                true
            }
            _ => false,
        }
    }
}

/// The process-wide holder of the current token pair
///
/// Every call to [`valid_token_pair()`][Self::valid_token_pair()] checks the
/// expiry estimate and proactively renews through the shared
/// [`RefreshCoordinator`] once the renewal margin is reached, so that steady
/// state traffic rarely sees an unauthorized response.
///
/// A failed renewal is terminal. The session reports
/// [`SessionError::Expired`] until a fresh login [establishes][Self::establish()]
/// a new pair.
#[derive(Debug)]
pub struct Session<C = System> {
    coordinator: Arc<RefreshCoordinator<C>>,
    events: SessionEvents,
    inner: Mutex<Inner>,
}

impl<C> Session<C>
where
    C: Clock + Clone + Send + Sync + 'static,
{
    /// Constructs an empty session that renews through `coordinator`
    pub fn new(coordinator: Arc<RefreshCoordinator<C>>) -> Self {
        Self::with_events(coordinator, SessionEvents::default())
    }

    /// Constructs an empty session that publishes to and follows `events`
    pub fn with_events(coordinator: Arc<RefreshCoordinator<C>>, events: SessionEvents) -> Self {
        let updates = events.subscribe();
        Self {
            coordinator,
            events,
            inner: Mutex::new(Inner {
                record: None,
                updates,
            }),
        }
    }

    /// The channel this session publishes to and adopts reactive renewals from
    #[inline]
    pub fn events(&self) -> &SessionEvents {
        &self.events
    }

    /// The coordinator shared with the request pipeline
    #[inline]
    pub fn coordinator(&self) -> &Arc<RefreshCoordinator<C>> {
        &self.coordinator
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Starts a session from a freshly issued token pair, replacing any
    /// previous session
    pub fn establish(&self, tokens: TokenPair) -> Arc<IssuedTokenPair> {
        let issued = Arc::new(self.coordinator.config().issue(tokens));
        self.install(Arc::clone(&issued));

        tracing::info!(
            issued = issued.issued().0,
            renew_at = issued.renew_at().0,
            expiry = issued.expiry().0,
            "session established"
        );
        self.events
            .publish(SessionEvent::Established(Arc::clone(&issued)));

        issued
    }

    /// Restores a previously persisted session, keeping its original expiry
    /// estimate
    pub fn resume(&self, tokens: IssuedTokenPair) -> Arc<IssuedTokenPair> {
        let tokens = Arc::new(tokens);
        self.install(Arc::clone(&tokens));

        tracing::info!(
            issued = tokens.issued().0,
            expiry = tokens.expiry().0,
            "session resumed"
        );
        self.events
            .publish(SessionEvent::Resumed(Arc::clone(&tokens)));

        tokens
    }

    fn install(&self, tokens: Arc<IssuedTokenPair>) {
        let mut inner = self.lock();
        inner.discard_pending();
        inner.record = Some(SessionRecord::new(tokens));
    }

    /// Ends the session
    pub fn end(&self) {
        let had_session = {
            let mut inner = self.lock();
            inner.discard_pending();
            inner.record.take().is_some()
        };

        if had_session {
            tracing::info!("session ended");
            self.events.publish(SessionEvent::Ended);
        }
    }

    /// A snapshot of the session record, if a session exists
    pub fn record(&self) -> Option<SessionRecord> {
        let mut inner = self.lock();
        inner.apply_pending();
        inner.record.clone()
    }

    /// Records a renewal failure observed outside the session
    ///
    /// Only applies if `refresh_token` still belongs to the current pair, so a
    /// failure from an older pair cannot end a newer session.
    pub fn mark_failed(&self, refresh_token: &RefreshTokenRef, error: &RenewalError) {
        let kind = error.kind();
        let failed = self.lock().fail(refresh_token, kind);

        if failed {
            tracing::warn!(%kind, "session terminated by failed renewal");
            self.events.publish(SessionEvent::Terminated { kind });
        }
    }

    /// Gets a token pair that is usable for at least the renewal margin
    ///
    /// Renews proactively when the current pair is within the renewal margin
    /// of its estimated expiry. Never falls back to the stale pair if that
    /// renewal fails.
    ///
    /// A renewal only replaces the pair it was exchanged from. If the session
    /// was ended or replaced by a fresh login while the renewal was in
    /// flight, the outcome is discarded and the current session is consulted
    /// again.
    pub async fn valid_token_pair(&self) -> Result<Arc<IssuedTokenPair>, SessionError> {
        loop {
            let refresh_token = {
                let mut inner = self.lock();
                inner.apply_pending();

                let record = inner.record.as_ref().ok_or(SessionError::NotEstablished)?;
                if let Some(kind) = record.last_error {
                    return Err(SessionError::Expired { kind, source: None });
                }

                let now = self.coordinator.config().clock().now();
                if !record.current.needs_renewal_at(now) {
                    return Ok(Arc::clone(&record.current));
                }

                tracing::debug!(
                    now = now.0,
                    renew_at = record.current.renew_at().0,
                    expiry = record.current.expiry().0,
                    "access token within renewal margin, renewing proactively"
                );

                record.current.refresh_token().to_owned()
            };

            match self.coordinator.renew(&refresh_token).await {
                Ok(renewal) => {
                    let mut inner = self.lock();
                    inner.apply_pending();

                    if inner.adopt(renewal.tokens(), renewal.replaced()) {
                        drop(inner);
                        self.events.publish(SessionEvent::Renewed {
                            tokens: Arc::clone(renewal.tokens()),
                            replaced: renewal.replaced().to_owned(),
                            origin: RenewalOrigin::Proactive,
                        });
                        return Ok(renewal.into_tokens());
                    }

                    tracing::debug!(
                        "renewed pair no longer belongs to the session, rechecking"
                    );
                }
                Err(error) => {
                    let kind = error.kind();
                    let failed = self.lock().fail(&refresh_token, kind);

                    if !failed {
                        tracing::debug!(
                            %error,
                            "failed renewal no longer belongs to the session, rechecking"
                        );
                        continue;
                    }

                    tracing::warn!(%error, "proactive renewal failed, session terminated");
                    self.events.publish(SessionEvent::Terminated { kind });

                    return Err(SessionError::Expired {
                        kind,
                        source: Some(error),
                    });
                }
            }
        }
    }
}
