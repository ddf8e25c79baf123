//! A single authenticated call shape for resource clients

use std::sync::Arc;

use reqwest::{Response, Url};
use reqwest_middleware::ClientWithMiddleware;
use serde::de::DeserializeOwned;
use sojourn_clock::{Clock, System};
use sojourn_tokens::{RefreshCoordinator, Session, SessionConfig, SessionError};
use thiserror::Error;

use crate::{
    identity::{error_message, Credentials, HttpIdentityBackend, LoginError},
    pipeline::{AuthenticatedClient, CallError, RequestOptions},
};

/// An error from [`SessionClient::fetch()`]
#[derive(Debug, Error)]
pub enum FetchError {
    /// No usable session exists
    #[error(transparent)]
    Session(#[from] SessionError),
    /// The authenticated call failed
    #[error(transparent)]
    Call(#[from] CallError),
    /// The resource answered with an error status
    #[error("request failed ({status}): {message}")]
    Status {
        /// The HTTP status returned by the resource
        status: u16,
        /// The message returned by the resource, or the status reason
        message: String,
    },
    /// Unable to read the response body
    #[error("error reading response body")]
    Body(#[source] reqwest::Error),
    /// The response body was not the expected JSON
    #[error("unable to decode response body")]
    Decode(#[source] serde_json::Error),
}

impl FetchError {
    /// Whether the user must sign in again, as opposed to the action itself
    /// having failed
    pub fn requires_sign_in(&self) -> bool {
        match self {
            Self::Session(_) => true,
            Self::Call(CallError::Failed(error)) => error.is_rejection(),
            _ => false,
        }
    }
}

/// Logs in, keeps the session alive and sends authenticated resource calls
///
/// Wires one identity backend, one [`RefreshCoordinator`], one [`Session`]
/// and one [`AuthenticatedClient`] together, so that the proactive and
/// reactive renewal paths share a single in-flight exchange.
///
/// ```no_run
/// use sojourn_reqwest::{Credentials, RequestOptions, SessionClient};
/// use sojourn_tokens::{Password, Username};
/// use reqwest::Client;
/// use reqwest_middleware::ClientBuilder;
///
/// # #[tokio::main(flavor = "current_thread")] async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let client = ClientBuilder::new(Client::default()).build();
/// let sessions = SessionClient::new(client, &"https://api.example.com/v1".parse()?)?;
///
/// sessions
///     .login(&Credentials {
///         username: Username::from_static("ada"),
///         password: Password::from_static("correct horse"),
///     })
///     .await?;
///
/// let restaurants: serde_json::Value = sessions
///     .fetch_json("/restaurants", &RequestOptions::get())
///     .await?;
/// # drop(restaurants);
/// # Ok(()) }
/// ```
#[derive(Debug)]
pub struct SessionClient<C = System> {
    session: Arc<Session<C>>,
    pipeline: AuthenticatedClient<C>,
    identity: HttpIdentityBackend,
}

impl SessionClient {
    /// Constructs a client for the API at `base_url` with the default
    /// configuration
    pub fn new(client: ClientWithMiddleware, base_url: &Url) -> Result<Self, url::ParseError> {
        Self::with_config(client, base_url, SessionConfig::default())
    }
}

impl<C> SessionClient<C>
where
    C: Clock + Clone + Send + Sync + 'static,
{
    /// Constructs a client for the API at `base_url`
    pub fn with_config(
        client: ClientWithMiddleware,
        base_url: &Url,
        config: SessionConfig<C>,
    ) -> Result<Self, url::ParseError> {
        let identity = HttpIdentityBackend::new(client.clone(), base_url)?
            .with_login_timeout(config.request_timeout());
        let coordinator = Arc::new(RefreshCoordinator::new(identity.clone(), config));
        let session = Arc::new(Session::new(Arc::clone(&coordinator)));
        let pipeline =
            AuthenticatedClient::new(client, base_url, coordinator, session.events().clone());

        Ok(Self {
            session,
            pipeline,
            identity,
        })
    }

    /// The session kept alive by this client
    #[inline]
    pub fn session(&self) -> &Arc<Session<C>> {
        &self.session
    }

    /// The pipeline used for resource calls
    #[inline]
    pub fn pipeline(&self) -> &AuthenticatedClient<C> {
        &self.pipeline
    }

    /// Logs in and establishes a new session, returning the principal
    pub async fn login(&self, credentials: &Credentials) -> Result<serde_json::Value, LoginError> {
        let login = self.identity.login(credentials).await?;
        self.session.establish(login.tokens);
        Ok(login.principal)
    }

    /// Ends the session
    pub fn logout(&self) {
        self.session.end();
    }

    /// Sends an authenticated call, returning the successful response
    ///
    /// Error statuses other than an unrecoverable `401` are returned as
    /// [`FetchError::Status`]. A refresh token rejected during a reactive
    /// renewal ends the session.
    pub async fn fetch(&self, path: &str, options: &RequestOptions) -> Result<Response, FetchError> {
        let current = self.session.valid_token_pair().await?;

        match self.pipeline.call(path, options, current.tokens()).await {
            Ok(resp) if resp.status().is_success() => Ok(resp),
            Ok(resp) => {
                let status = resp.status();
                let body = resp.bytes().await.map_err(FetchError::Body)?;
                Err(FetchError::Status {
                    status: status.as_u16(),
                    message: error_message(status, &body),
                })
            }
            Err(CallError::Failed(error)) => {
                if error.is_rejection() {
                    self.session.mark_failed(current.refresh_token(), &error);
                }
                Err(CallError::Failed(error).into())
            }
            Err(error) => Err(error.into()),
        }
    }

    /// Sends an authenticated call and decodes its JSON body
    pub async fn fetch_json<T: DeserializeOwned>(
        &self,
        path: &str,
        options: &RequestOptions,
    ) -> Result<T, FetchError> {
        let resp = self.fetch(path, options).await?;
        let body = resp.bytes().await.map_err(FetchError::Body)?;
        serde_json::from_slice(&body).map_err(FetchError::Decode)
    }
}
