//! Authenticated `reqwest` calls that survive access token expiry
//!
//! [`SessionClient`] is the one call shape resource clients need. It obtains
//! a usable token pair from the [`Session`](sojourn_tokens::Session),
//! renewing proactively when the access token nears its estimated expiry,
//! and sends the call through an [`AuthenticatedClient`].
//!
//! The pipeline injects `Authorization: Bearer …`, bounds every send with the
//! configured request timeout, and on a `401 Unauthorized` renews through the
//! shared [`RefreshCoordinator`](sojourn_tokens::RefreshCoordinator) before
//! retrying exactly once. A second `401` is reported as
//! [`CallError::Unauthorized`] and never triggers another renewal.
//!
//! Renewals are exchanged with the identity backend by
//! [`HttpIdentityBackend`], which speaks the `auth/refresh-token` and
//! `auth/login` endpoints.
//!
//! Errors that should send the user back to the login screen are
//! distinguished from errors of the action itself by
//! [`FetchError::requires_sign_in()`].

#![warn(
    missing_docs,
    unused_import_braces,
    unused_imports,
    unused_qualifications
)]
#![deny(
    missing_debug_implementations,
    missing_copy_implementations,
    trivial_casts,
    trivial_numeric_casts,
    unsafe_code,
    unused_must_use
)]

mod client;
mod identity;
mod pipeline;
#[cfg(test)]
mod test_support;

pub use client::{FetchError, SessionClient};
pub use identity::{Credentials, HttpIdentityBackend, Login, LoginError};
pub use pipeline::{AuthenticatedClient, CallError, RequestOptions};
