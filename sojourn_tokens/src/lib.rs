//! Lifecycle management for an access token paired with a refresh token
//!
//! A short-lived access token accompanies every resource call, and a longer
//! lived refresh token mints replacement pairs. This crate keeps such a pair
//! usable without the callers that depend on it having to think about expiry.
//!
//! Three pieces cooperate:
//!
//! * A [`RefreshCoordinator`] owns the renewal exchange. However many callers
//!   ask for a renewal at the same time, exactly one exchange is performed
//!   and every caller observes its outcome.
//! * A [`Session`] holds the current pair with an estimate of when its access
//!   token expires. On each access it renews proactively once the estimate
//!   falls within the renewal margin, and treats a failed renewal as the end
//!   of the session.
//! * A [`SessionEvents`] channel carries every change to the pair, so that a
//!   renewal performed by a request pipeline after an unauthorized response
//!   reaches the session and any [store][store::SessionStore] mirroring it.
//!
//! # General Flow
//!
//! ```
//! use std::sync::Arc;
//!
//! use sojourn_tokens::{
//!     sources::TokenExchange, AccessToken, RefreshCoordinator, RefreshToken, RefreshTokenRef,
//!     RenewalError, Session, SessionConfig, TokenPair,
//! };
//!
//! struct Backend;
//!
//! #[async_trait::async_trait]
//! impl TokenExchange for Backend {
//!     async fn exchange(&self, _: &RefreshTokenRef) -> Result<TokenPair, RenewalError> {
//!         Ok(TokenPair::new(
//!             AccessToken::from_static("renewed"),
//!             RefreshToken::from_static("rotated"),
//!         ))
//!     }
//! }
//!
//! # #[tokio::main(flavor = "current_thread")] async fn main() {
//! let coordinator = Arc::new(RefreshCoordinator::new(Backend, SessionConfig::default()));
//! let session = Session::new(coordinator);
//!
//! session.establish(TokenPair::new(
//!     AccessToken::from_static("from-login"),
//!     RefreshToken::from_static("from-login"),
//! ));
//!
//! let tokens = session.valid_token_pair().await.unwrap();
//! assert_eq!(tokens.access_token().as_str(), "from-login");
//! # }
//! ```
//!
//! Renewals are spawned onto the ambient Tokio runtime, so the coordinator
//! must be used from within one.
//!
//! # Features
//!
//! * `file` (default): Provides [`FileSessionStore`][store::FileSessionStore],
//!   which keeps the session in a local JSON file.

#![cfg_attr(docsrs, feature(doc_cfg))]
#![warn(
    missing_docs,
    unused_import_braces,
    unused_imports,
    unused_qualifications
)]
#![deny(
    missing_debug_implementations,
    trivial_numeric_casts,
    unsafe_code,
    unused_must_use
)]

mod braids;
pub mod config;
mod coordinator;
mod error;
pub mod events;
mod session;
pub mod sources;
pub mod store;
#[cfg(test)]
mod test_support;
mod tokens;

pub use braids::*;
pub use config::SessionConfig;
pub use coordinator::{RefreshCoordinator, Renewal};
pub use error::{RenewalError, SessionError, SessionErrorKind, SharedError};
pub use events::{RenewalOrigin, SessionEvent, SessionEvents};
pub use session::{Session, SessionRecord};
pub use tokens::{IssuedTokenPair, TokenPair, TokenStatus};
