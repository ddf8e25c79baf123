//! Process-wide session tunables

use std::time::Duration;

use sojourn_clock::{Clock, DurationSecs, System, UnixTime};

use crate::{IssuedTokenPair, TokenPair};

/// Configuration shared by the refresh coordinator, the session and the
/// request pipeline
///
/// These are process-wide values. Individual calls cannot override them.
#[derive(Clone, Debug)]
pub struct SessionConfig<C = System> {
    request_timeout: Duration,
    renewal_margin: DurationSecs,
    access_token_lifetime: DurationSecs,
    clock: C,
}

impl Default for SessionConfig {
    /// Default session configuration
    ///
    /// Uses a 10 second request timeout, renews access tokens 60 seconds before
    /// their estimated expiry, assumes a 15 minute access token lifetime, and
    /// uses the system clock.
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(10),
            renewal_margin: DurationSecs(60),
            access_token_lifetime: DurationSecs(15 * 60),
            clock: System,
        }
    }
}

impl SessionConfig {
    /// Constructs a new session configuration using the system clock
    pub fn new(
        request_timeout: Duration,
        renewal_margin: DurationSecs,
        access_token_lifetime: DurationSecs,
    ) -> Self {
        Self {
            request_timeout,
            renewal_margin,
            access_token_lifetime,
            clock: System,
        }
    }
}

impl<C> SessionConfig<C> {
    /// Sets a custom clock to be used
    ///
    /// Useful for testing purposes
    pub fn with_clock<D>(self, clock: D) -> SessionConfig<D> {
        SessionConfig {
            request_timeout: self.request_timeout,
            renewal_margin: self.renewal_margin,
            access_token_lifetime: self.access_token_lifetime,
            clock,
        }
    }

    /// Bound applied to every network call, renewals included
    #[inline]
    pub fn request_timeout(&self) -> Duration {
        self.request_timeout
    }

    /// How long before the estimated expiry a token is proactively renewed
    #[inline]
    pub fn renewal_margin(&self) -> DurationSecs {
        self.renewal_margin
    }

    /// The assumed lifetime of a freshly issued access token
    #[inline]
    pub fn access_token_lifetime(&self) -> DurationSecs {
        self.access_token_lifetime
    }

    /// The clock used for issuance and expiry checks
    #[inline]
    pub fn clock(&self) -> &C {
        &self.clock
    }

    /// Stamps a token pair with an expiry estimate as if it was issued at `issued`
    pub fn issue_at(&self, tokens: TokenPair, issued: UnixTime) -> IssuedTokenPair {
        IssuedTokenPair::new(
            tokens,
            issued,
            self.access_token_lifetime,
            self.renewal_margin,
        )
    }
}

impl<C: Clock> SessionConfig<C> {
    /// Stamps a token pair with an expiry estimate, as issued now
    pub fn issue(&self, tokens: TokenPair) -> IssuedTokenPair {
        self.issue_at(tokens, self.clock.now())
    }
}
