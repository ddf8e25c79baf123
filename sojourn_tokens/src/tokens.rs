use serde::{Deserialize, Serialize};
use sojourn_clock::{Clock, DurationSecs, System, UnixTime};

use crate::{AccessToken, AccessTokenRef, RefreshToken, RefreshTokenRef};

/// An access token and the refresh token that can replace it, as issued by the
/// identity backend
///
/// Pairs are never modified after issuance. A renewal yields a new pair.
#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenPair {
    access_token: AccessToken,
    refresh_token: RefreshToken,
}

impl TokenPair {
    /// Constructs a token pair
    pub fn new(access_token: AccessToken, refresh_token: RefreshToken) -> Self {
        Self {
            access_token,
            refresh_token,
        }
    }

    /// Gets the access token
    #[inline]
    pub fn access_token(&self) -> &AccessTokenRef {
        &self.access_token
    }

    /// Gets the refresh token
    #[inline]
    pub fn refresh_token(&self) -> &RefreshTokenRef {
        &self.refresh_token
    }
}

/// A token pair along with an estimate of when its access token expires
///
/// The estimate is taken at issuance from a known access token lifetime. The
/// token itself is opaque and never decoded.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct IssuedTokenPair {
    tokens: TokenPair,
    lifetime: DurationSecs,
    issued: UnixTime,
    renew_at: UnixTime,
    expiry: UnixTime,
}

/// A token's lifecycle status
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TokenStatus {
    /// The access token is valid and outside the renewal margin
    Fresh,
    /// The access token is valid, but inside the renewal margin
    Stale,
    /// The access token is estimated to have expired
    Expired,
}

impl IssuedTokenPair {
    pub(crate) fn new(
        tokens: TokenPair,
        issued: UnixTime,
        lifetime: DurationSecs,
        renewal_margin: DurationSecs,
    ) -> Self {
        let expiry = issued + lifetime;
        Self {
            tokens,
            lifetime,
            issued,
            renew_at: (expiry - renewal_margin).max(issued),
            expiry,
        }
    }

    /// Gets the token pair
    #[inline]
    pub fn tokens(&self) -> &TokenPair {
        &self.tokens
    }

    /// Gets the current access token
    #[inline]
    pub fn access_token(&self) -> &AccessTokenRef {
        self.tokens.access_token()
    }

    /// Gets the refresh token
    #[inline]
    pub fn refresh_token(&self) -> &RefreshTokenRef {
        self.tokens.refresh_token()
    }

    /// Gets the assumed access token lifetime
    #[inline]
    pub fn lifetime(&self) -> DurationSecs {
        self.lifetime
    }

    /// Gets the time that the pair was issued
    #[inline]
    pub fn issued(&self) -> UnixTime {
        self.issued
    }

    /// Gets the time from which the pair should be proactively renewed
    #[inline]
    pub fn renew_at(&self) -> UnixTime {
        self.renew_at
    }

    /// Gets the estimated time that the access token expires
    #[inline]
    pub fn expiry(&self) -> UnixTime {
        self.expiry
    }

    /// Whether the access token is close enough to expiry that it should be
    /// renewed before use
    #[inline]
    pub fn needs_renewal_at(&self, time: UnixTime) -> bool {
        time >= self.renew_at
    }

    /// Gets the token's current lifetime status
    #[inline]
    pub fn token_status(&self) -> TokenStatus {
        self.token_status_with_clock(&System)
    }

    /// Gets the token's lifetime status based on the current time
    /// as reported by the provided clock
    #[inline]
    pub fn token_status_with_clock<C: Clock>(&self, clock: &C) -> TokenStatus {
        self.token_status_at(clock.now())
    }

    /// Gets the token's lifetime status as of the provided time
    #[inline]
    pub fn token_status_at(&self, time: UnixTime) -> TokenStatus {
        if time < self.renew_at {
            TokenStatus::Fresh
        } else if time < self.expiry {
            TokenStatus::Stale
        } else {
            TokenStatus::Expired
        }
    }

    /// Gets a duration for how much longer the pair can be used before it
    /// should be renewed, as of the provided time
    #[inline]
    pub fn until_renewal_at(&self, time: UnixTime) -> DurationSecs {
        self.renew_at - time
    }

    /// Gets a duration for how much longer the access token would be valid
    /// as of the provided time
    #[inline]
    pub fn until_expired_at(&self, time: UnixTime) -> DurationSecs {
        self.expiry - time
    }
}
