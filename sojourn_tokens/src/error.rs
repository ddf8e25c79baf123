use std::{error, fmt, sync::Arc, time::Duration};

use thiserror::Error;

/// A shareable, type-erased error
pub type SharedError = Arc<dyn error::Error + Send + Sync + 'static>;

/// An error while exchanging a refresh token for a new token pair
///
/// Every caller joined onto the same renewal receives a clone of the same
/// error.
#[derive(Clone, Debug, Error)]
pub enum RenewalError {
    /// The identity backend rejected the refresh token as revoked, expired or
    /// malformed
    #[error("refresh token rejected by identity backend ({status}): {message}")]
    Rejected {
        /// The HTTP status returned by the backend
        status: u16,
        /// The message returned by the backend, or the status reason
        message: String,
    },
    /// The identity backend failed without judging the refresh token
    #[error("identity backend failed to renew tokens ({status}): {message}")]
    Backend {
        /// The HTTP status returned by the backend
        status: u16,
        /// The message returned by the backend, or the status reason
        message: String,
    },
    /// Unable to reach the identity backend
    #[error("error sending renewal request to identity backend")]
    Transport(#[source] SharedError),
    /// The exchange did not settle within the request timeout
    #[error("renewal exchange timed out after {0:?}")]
    Timeout(Duration),
    /// The identity backend answered with a body that could not be understood
    #[error("malformed renewal response: {0}")]
    MalformedResponse(String),
    /// The renewal task panicked or was cancelled before it settled
    #[error("renewal task ended before settling")]
    Aborted,
}

impl RenewalError {
    /// Wraps a connection-level failure
    pub fn transport<E>(error: E) -> Self
    where
        E: error::Error + Send + Sync + 'static,
    {
        Self::Transport(Arc::new(error))
    }

    /// Classifies this error for the session record
    pub fn kind(&self) -> SessionErrorKind {
        match self {
            Self::Rejected { .. } | Self::MalformedResponse(_) => SessionErrorKind::RefreshRejected,
            Self::Timeout(_) => SessionErrorKind::RefreshTimeout,
            Self::Backend { .. } | Self::Transport(_) | Self::Aborted => {
                SessionErrorKind::RefreshTransport
            }
        }
    }

    /// Whether the refresh token itself was refused
    ///
    /// Agrees with [`kind()`](Self::kind): a renewal answered with a body
    /// that carries no usable pair counts as a rejection.
    #[inline]
    pub fn is_rejection(&self) -> bool {
        self.kind() == SessionErrorKind::RefreshRejected
    }
}

/// The class of renewal failure that ended a session
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionErrorKind {
    /// The refresh token was refused by the identity backend
    RefreshRejected,
    /// The identity backend could not be reached
    RefreshTransport,
    /// The renewal exchange timed out
    RefreshTimeout,
}

impl fmt::Display for SessionErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::RefreshRejected => "refresh token rejected",
            Self::RefreshTransport => "identity backend unreachable",
            Self::RefreshTimeout => "renewal timed out",
        })
    }
}

/// An error obtaining a usable token pair from the session
#[derive(Debug, Error)]
pub enum SessionError {
    /// No login has occurred, or the session was ended
    #[error("no session has been established")]
    NotEstablished,
    /// Renewal failed and the session cannot be used until a fresh login
    #[error("session expired: {kind}")]
    Expired {
        /// Why the session ended
        kind: SessionErrorKind,
        /// The renewal failure, when this access observed it directly
        #[source]
        source: Option<RenewalError>,
    },
}
