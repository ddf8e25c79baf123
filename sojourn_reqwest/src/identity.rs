//! The identity backend's token endpoints

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{StatusCode, Url};
use reqwest_middleware::ClientWithMiddleware;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use sojourn_tokens::{
    sources::TokenExchange, Password, RefreshTokenRef, RenewalError, TokenPair, Username,
};
use thiserror::Error;

const REFRESH_PATH: &str = "auth/refresh-token";
const LOGIN_PATH: &str = "auth/login";
const DEFAULT_LOGIN_TIMEOUT: Duration = Duration::from_secs(10);

/// Credentials presented at login
#[derive(Clone, Debug, Serialize)]
pub struct Credentials {
    /// The username
    pub username: Username,

    /// The password
    pub password: Password,
}

/// The outcome of a successful login
#[derive(Clone, Debug)]
pub struct Login {
    /// The initial token pair
    pub tokens: TokenPair,

    /// The authenticated principal, as described by the identity backend
    pub principal: serde_json::Value,
}

/// An error while logging in
#[derive(Debug, Error)]
pub enum LoginError {
    /// The identity backend refused the credentials
    #[error("credentials rejected by identity backend ({status}): {message}")]
    Rejected {
        /// The HTTP status returned by the backend
        status: u16,
        /// The message returned by the backend, or the status reason
        message: String,
    },
    /// The identity backend failed without judging the credentials
    #[error("identity backend failed to log in ({status}): {message}")]
    Backend {
        /// The HTTP status returned by the backend
        status: u16,
        /// The message returned by the backend, or the status reason
        message: String,
    },
    /// Unable to send the login request
    #[error("error sending login request to identity backend")]
    Transport(#[source] reqwest_middleware::Error),
    /// Unable to read the login response
    #[error("error reading login response body")]
    Body(#[source] reqwest::Error),
    /// The login did not complete within the request timeout
    #[error("login timed out after {0:?}")]
    Timeout(Duration),
    /// The identity backend answered with a body that could not be understood
    #[error("malformed login response: {0}")]
    MalformedResponse(String),
}

/// The identity backend, reached over HTTP
///
/// Renews token pairs through `POST auth/refresh-token` and logs in through
/// `POST auth/login`, both relative to the API base URL.
#[derive(Clone, Debug)]
pub struct HttpIdentityBackend {
    client: ClientWithMiddleware,
    refresh_url: Url,
    login_url: Url,
    login_timeout: Duration,
}

impl HttpIdentityBackend {
    /// Constructs a backend rooted at `base_url`
    pub fn new(client: ClientWithMiddleware, base_url: &Url) -> Result<Self, url::ParseError> {
        let base = directory_url(base_url);
        Ok(Self {
            client,
            refresh_url: base.join(REFRESH_PATH)?,
            login_url: base.join(LOGIN_PATH)?,
            login_timeout: DEFAULT_LOGIN_TIMEOUT,
        })
    }

    /// Sets the bound applied to login requests
    ///
    /// Renewal exchanges are bounded by the
    /// [`RefreshCoordinator`](sojourn_tokens::RefreshCoordinator) instead.
    pub fn with_login_timeout(mut self, login_timeout: Duration) -> Self {
        self.login_timeout = login_timeout;
        self
    }

    /// The URL renewals are sent to
    #[inline]
    pub fn refresh_url(&self) -> &Url {
        &self.refresh_url
    }

    /// The URL logins are sent to
    #[inline]
    pub fn login_url(&self) -> &Url {
        &self.login_url
    }

    /// Exchanges credentials for an initial token pair
    #[tracing::instrument(
        err,
        skip_all,
        fields(login_url = %self.login_url, username = %credentials.username),
    )]
    pub async fn login(&self, credentials: &Credentials) -> Result<Login, LoginError> {
        tracing::trace!("requesting login from identity backend");

        let request = self.client.post(self.login_url.clone()).json(credentials);
        let resp = match tokio::time::timeout(self.login_timeout, request.send()).await {
            Ok(resp) => resp.map_err(LoginError::Transport)?,
            Err(_) => return Err(LoginError::Timeout(self.login_timeout)),
        };

        let status = resp.status();
        tracing::debug!(
            response.status = status.as_u16(),
            "received login response from identity backend"
        );

        let body = resp.bytes().await.map_err(LoginError::Body)?;
        let data: LoginData = decode_envelope(status, &body)?;

        tracing::info!(
            has_principal = !data.user.is_null(),
            "logged in with identity backend"
        );

        Ok(Login {
            tokens: data.tokens,
            principal: data.user,
        })
    }
}

#[async_trait]
impl TokenExchange for HttpIdentityBackend {
    #[tracing::instrument(err, skip_all, fields(refresh_url = %self.refresh_url))]
    async fn exchange(&self, refresh_token: &RefreshTokenRef) -> Result<TokenPair, RenewalError> {
        tracing::trace!("requesting token renewal from identity backend");

        let resp = self
            .client
            .post(self.refresh_url.clone())
            .json(&RefreshRequest { refresh_token })
            .send()
            .await
            .map_err(RenewalError::transport)?;

        let status = resp.status();
        tracing::debug!(
            response.status = status.as_u16(),
            "received renewal response from identity backend"
        );

        let body = resp.bytes().await.map_err(RenewalError::transport)?;
        Ok(decode_envelope(status, &body)?)
    }
}

/// Ensures relative joins land beneath the base path rather than replacing
/// its last segment
pub(crate) fn directory_url(base: &Url) -> Url {
    let mut url = base.clone();
    if !url.path().ends_with('/') {
        let path = format!("{}/", url.path());
        url.set_path(&path);
    }
    url
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct RefreshRequest<'a> {
    refresh_token: &'a RefreshTokenRef,
}

#[derive(Deserialize)]
struct LoginData {
    #[serde(flatten)]
    tokens: TokenPair,
    #[serde(default, alias = "principal")]
    user: serde_json::Value,
}

#[derive(Deserialize)]
struct Envelope<T> {
    success: Option<bool>,
    data: Option<T>,
    message: Option<String>,
}

#[derive(Deserialize)]
struct ErrorBody {
    message: Option<String>,
}

enum Refusal {
    Rejected { status: u16, message: String },
    Backend { status: u16, message: String },
    Malformed(String),
}

impl From<Refusal> for RenewalError {
    fn from(refusal: Refusal) -> Self {
        match refusal {
            Refusal::Rejected { status, message } => Self::Rejected { status, message },
            Refusal::Backend { status, message } => Self::Backend { status, message },
            Refusal::Malformed(reason) => Self::MalformedResponse(reason),
        }
    }
}

impl From<Refusal> for LoginError {
    fn from(refusal: Refusal) -> Self {
        match refusal {
            Refusal::Rejected { status, message } => Self::Rejected { status, message },
            Refusal::Backend { status, message } => Self::Backend { status, message },
            Refusal::Malformed(reason) => Self::MalformedResponse(reason),
        }
    }
}

/// Extracts the backend's `{ "message": … }`, falling back to the status reason
pub(crate) fn error_message(status: StatusCode, body: &[u8]) -> String {
    serde_json::from_slice::<ErrorBody>(body)
        .ok()
        .and_then(|body| body.message)
        .unwrap_or_else(|| {
            status
                .canonical_reason()
                .unwrap_or("request refused")
                .to_owned()
        })
}

fn decode_envelope<T: DeserializeOwned>(status: StatusCode, body: &[u8]) -> Result<T, Refusal> {
    if status.is_server_error() {
        return Err(Refusal::Backend {
            status: status.as_u16(),
            message: error_message(status, body),
        });
    }

    if !status.is_success() {
        return Err(Refusal::Rejected {
            status: status.as_u16(),
            message: error_message(status, body),
        });
    }

    let envelope: Envelope<T> =
        serde_json::from_slice(body).map_err(|err| Refusal::Malformed(err.to_string()))?;

    match envelope {
        Envelope {
            success: Some(false),
            message,
            ..
        } => Err(Refusal::Rejected {
            status: status.as_u16(),
            message: message.unwrap_or_else(|| "request refused".to_owned()),
        }),
        Envelope {
            data: Some(data), ..
        } => Ok(data),
        Envelope { data: None, .. } => Err(Refusal::Malformed(
            "response did not include any data".to_owned(),
        )),
    }
}
