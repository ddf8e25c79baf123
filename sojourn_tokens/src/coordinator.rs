use std::{
    fmt,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use futures::future::{BoxFuture, FutureExt, Shared};
use sojourn_clock::{Clock, System};

use crate::{
    sources::TokenExchange, IssuedTokenPair, RefreshToken, RefreshTokenRef, RenewalError,
    SessionConfig,
};

type PendingRenewal = Shared<BoxFuture<'static, Result<Renewal, RenewalError>>>;

/// A renewed token pair and the refresh token it was exchanged for
///
/// Holders of a session should only adopt the pair if their current pair
/// still carries [`replaced()`][Self::replaced()].
#[derive(Clone, Debug)]
pub struct Renewal {
    replaced: RefreshToken,
    tokens: Arc<IssuedTokenPair>,
}

impl Renewal {
    /// The refresh token consumed by the exchange
    #[inline]
    pub fn replaced(&self) -> &RefreshTokenRef {
        &self.replaced
    }

    /// The newly issued pair
    #[inline]
    pub fn tokens(&self) -> &Arc<IssuedTokenPair> {
        &self.tokens
    }

    /// Takes the newly issued pair
    #[inline]
    pub fn into_tokens(self) -> Arc<IssuedTokenPair> {
        self.tokens
    }
}

struct InFlight {
    generation: u64,
    renewal: PendingRenewal,
}

#[derive(Default)]
struct CoordinatorState {
    next_generation: u64,
    in_flight: Option<InFlight>,
}

/// Collapses concurrent renewal requests onto a single exchange
///
/// While an exchange is in flight, every caller of [`renew()`][Self::renew()]
/// joins it and observes the same outcome. Once it settles, the in-flight
/// marker is cleared, so the next caller starts a brand-new exchange. Neither
/// successes nor failures are cached beyond that point.
///
/// The exchange runs as its own task. A caller that gives up waiting (for
/// example, because its own timeout elapsed) does not cancel the renewal for
/// the callers still joined onto it.
pub struct RefreshCoordinator<C = System> {
    exchange: Arc<dyn TokenExchange>,
    config: SessionConfig<C>,
    state: Arc<Mutex<CoordinatorState>>,
}

impl<C: fmt::Debug> fmt::Debug for RefreshCoordinator<C> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let state = lock(&self.state);
        f.debug_struct("RefreshCoordinator")
            .field("config", &self.config)
            .field(
                "in_flight",
                &state.in_flight.as_ref().map(|in_flight| in_flight.generation),
            )
            .finish()
    }
}

fn lock(state: &Mutex<CoordinatorState>) -> MutexGuard<'_, CoordinatorState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

impl<C> RefreshCoordinator<C>
where
    C: Clock + Clone + Send + Sync + 'static,
{
    /// Constructs a coordinator that renews through `exchange`
    pub fn new<E>(exchange: E, config: SessionConfig<C>) -> Self
    where
        E: TokenExchange + 'static,
    {
        Self {
            exchange: Arc::new(exchange),
            config,
            state: Arc::default(),
        }
    }

    /// The configuration used to bound and stamp renewals
    #[inline]
    pub fn config(&self) -> &SessionConfig<C> {
        &self.config
    }

    /// Whether an exchange is currently in flight
    pub fn is_renewing(&self) -> bool {
        lock(&self.state).in_flight.is_some()
    }

    /// Exchanges `refresh_token` for a new token pair, or joins the exchange
    /// already in flight
    ///
    /// A joined caller receives the in-flight exchange's outcome even if it
    /// presented a different refresh token. This coordinator serves a single
    /// session, and [`Renewal::replaced()`] tells callers which pair the
    /// outcome belongs to.
    pub async fn renew(&self, refresh_token: &RefreshTokenRef) -> Result<Renewal, RenewalError> {
        self.join_or_start(refresh_token).await
    }

    fn join_or_start(&self, refresh_token: &RefreshTokenRef) -> PendingRenewal {
        let mut state = lock(&self.state);

        if let Some(in_flight) = &state.in_flight {
            tracing::debug!(
                generation = in_flight.generation,
                "joining renewal already in flight"
            );
            return in_flight.renewal.clone();
        }

        let generation = state.next_generation;
        state.next_generation += 1;

        tracing::debug!(generation, "starting renewal exchange");

        let task = tokio::spawn(run_exchange(
            Arc::clone(&self.exchange),
            self.config.clone(),
            Arc::clone(&self.state),
            refresh_token.to_owned(),
            generation,
        ));

        let renewal = async move {
            match task.await {
                Ok(outcome) => outcome,
                Err(error) => {
                    if error.is_panic() {
                        tracing::error!(generation, "renewal exchange panicked!");
                    } else {
                        tracing::info!(generation, "renewal exchange was cancelled");
                    }
                    Err(RenewalError::Aborted)
                }
            }
        }
        .boxed()
        .shared();

        state.in_flight = Some(InFlight {
            generation,
            renewal: renewal.clone(),
        });

        renewal
    }
}

#[tracing::instrument(level = "debug", skip_all, fields(generation = generation))]
async fn run_exchange<C: Clock>(
    exchange: Arc<dyn TokenExchange>,
    config: SessionConfig<C>,
    state: Arc<Mutex<CoordinatorState>>,
    refresh_token: RefreshToken,
    generation: u64,
) -> Result<Renewal, RenewalError> {
    let timeout = config.request_timeout();

    let exchanged = tokio::time::timeout(timeout, exchange.exchange(&refresh_token)).await;

    let outcome = match exchanged {
        Ok(Ok(tokens)) => {
            let issued = config.issue(tokens);
            tracing::info!(
                issued = issued.issued().0,
                renew_at = issued.renew_at().0,
                expiry = issued.expiry().0,
                "received renewed token pair"
            );
            Ok(Renewal {
                replaced: refresh_token,
                tokens: Arc::new(issued),
            })
        }
        Ok(Err(error)) => {
            tracing::warn!(%error, "renewal exchange failed");
            Err(error)
        }
        Err(_) => {
            tracing::warn!(timeout_ms = timeout.as_millis() as u64, "renewal exchange timed out");
            Err(RenewalError::Timeout(timeout))
        }
    };

    let mut state = lock(&state);
    if state
        .in_flight
        .as_ref()
        .map_or(false, |in_flight| in_flight.generation == generation)
    {
        state.in_flight = None;
    }

    outcome
}
