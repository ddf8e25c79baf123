//! Resource calls that survive a mid-flight access token expiry

use std::{sync::Arc, time::Duration};

use bytes::{BufMut, Bytes, BytesMut};
use reqwest::{
    header::{self, HeaderMap, HeaderName, HeaderValue, InvalidHeaderValue},
    Method, Response, StatusCode, Url,
};
use reqwest_middleware::ClientWithMiddleware;
use serde::Serialize;
use sojourn_clock::{Clock, System};
use sojourn_tokens::{
    AccessTokenRef, RefreshCoordinator, RenewalError, RenewalOrigin, SessionEvent, SessionEvents,
    TokenPair,
};
use thiserror::Error;

use crate::identity::directory_url;

/// An error from a single authenticated call
#[derive(Debug, Error)]
pub enum CallError {
    /// The access token was rejected and renewing it failed
    #[error("unable to renew rejected access token")]
    Failed(#[source] RenewalError),
    /// The call was rejected as unauthorized even with a renewed access token
    #[error("call rejected as unauthorized after renewing the access token")]
    Unauthorized,
    /// A send did not produce a response within the request timeout
    #[error("call timed out after {0:?}")]
    Timeout(Duration),
    /// Unable to send the request
    #[error("error sending request")]
    Transport(#[source] reqwest_middleware::Error),
    /// The path could not be resolved against the API base URL
    #[error("unable to resolve `{path}` against the API base URL")]
    InvalidRequest {
        /// The path as given
        path: String,
        /// The reason resolution failed
        #[source]
        source: url::ParseError,
    },
    /// The access token contains bytes that cannot appear in a header
    #[error("access token cannot be sent in an authorization header")]
    InvalidToken(#[source] InvalidHeaderValue),
}

/// The method, headers and body of a resource call
///
/// Kept whole so that a retry reissues an identical request.
#[derive(Clone, Debug)]
pub struct RequestOptions {
    method: Method,
    headers: HeaderMap,
    body: Option<Bytes>,
}

impl Default for RequestOptions {
    fn default() -> Self {
        Self::new(Method::GET)
    }
}

impl RequestOptions {
    /// A bodiless request using `method`
    pub fn new(method: Method) -> Self {
        Self {
            method,
            headers: HeaderMap::new(),
            body: None,
        }
    }

    /// A `GET` request
    pub fn get() -> Self {
        Self::new(Method::GET)
    }

    /// A `POST` request
    pub fn post() -> Self {
        Self::new(Method::POST)
    }

    /// A `PUT` request
    pub fn put() -> Self {
        Self::new(Method::PUT)
    }

    /// A `PATCH` request
    pub fn patch() -> Self {
        Self::new(Method::PATCH)
    }

    /// A `DELETE` request
    pub fn delete() -> Self {
        Self::new(Method::DELETE)
    }

    /// Adds a header, replacing any previous value for `name`
    ///
    /// Any `Authorization` header is replaced by the session's bearer token
    /// when sent.
    pub fn with_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    /// Sets a raw body
    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = Some(body.into());
        self
    }

    /// Sets a JSON body and content type
    pub fn with_json<T: Serialize + ?Sized>(self, body: &T) -> Result<Self, serde_json::Error> {
        let body = serde_json::to_vec(body)?;
        Ok(self
            .with_header(
                header::CONTENT_TYPE,
                HeaderValue::from_static("application/json"),
            )
            .with_body(body))
    }

    /// The request method
    #[inline]
    pub fn method(&self) -> &Method {
        &self.method
    }

    /// The request headers
    #[inline]
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// The request body
    #[inline]
    pub fn body(&self) -> Option<&Bytes> {
        self.body.as_ref()
    }
}

/// Sends resource calls with a bearer token, renewing and retrying once
/// when the token is rejected
///
/// Every send is bounded by the request timeout. A `401 Unauthorized` is the
/// only status that triggers a renewal. The renewal goes through the shared
/// [`RefreshCoordinator`], and its result is published as
/// [`SessionEvent::Renewed`] before the single retry is sent. Every other
/// status is returned unchanged.
#[derive(Debug)]
pub struct AuthenticatedClient<C = System> {
    client: ClientWithMiddleware,
    base_url: Url,
    coordinator: Arc<RefreshCoordinator<C>>,
    events: SessionEvents,
    request_timeout: Duration,
}

impl<C> AuthenticatedClient<C>
where
    C: Clock + Clone + Send + Sync + 'static,
{
    /// Constructs a pipeline resolving paths against `base_url`
    ///
    /// The request timeout is taken from the coordinator's configuration.
    pub fn new(
        client: ClientWithMiddleware,
        base_url: &Url,
        coordinator: Arc<RefreshCoordinator<C>>,
        events: SessionEvents,
    ) -> Self {
        let request_timeout = coordinator.config().request_timeout();
        Self {
            client,
            base_url: directory_url(base_url),
            coordinator,
            events,
            request_timeout,
        }
    }

    /// The base URL paths are resolved against
    #[inline]
    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// Sends one logical call on behalf of `tokens`
    ///
    /// Performs at most one renewal and at most one retry. A retry that is
    /// also rejected fails with [`CallError::Unauthorized`].
    #[tracing::instrument(
        err,
        skip_all,
        fields(method = %options.method, path = path),
    )]
    pub async fn call(
        &self,
        path: &str,
        options: &RequestOptions,
        tokens: &TokenPair,
    ) -> Result<Response, CallError> {
        let url = self.resolve(path)?;

        let resp = self.send(&url, options, tokens.access_token()).await?;
        if resp.status() != StatusCode::UNAUTHORIZED {
            return Ok(resp);
        }

        tracing::debug!("access token rejected, renewing before retrying once");

        let renewal = self
            .coordinator
            .renew(tokens.refresh_token())
            .await
            .map_err(CallError::Failed)?;

        let listeners = self.events.publish(SessionEvent::Renewed {
            tokens: Arc::clone(renewal.tokens()),
            replaced: renewal.replaced().to_owned(),
            origin: RenewalOrigin::Reactive,
        });
        tracing::trace!(listeners, "published reactive renewal");

        let resp = self
            .send(&url, options, renewal.tokens().access_token())
            .await?;
        if resp.status() == StatusCode::UNAUTHORIZED {
            tracing::warn!("renewed access token was also rejected");
            return Err(CallError::Unauthorized);
        }

        Ok(resp)
    }

    fn resolve(&self, path: &str) -> Result<Url, CallError> {
        self.base_url
            .join(path.trim_start_matches('/'))
            .map_err(|source| CallError::InvalidRequest {
                path: path.to_owned(),
                source,
            })
    }

    async fn send(
        &self,
        url: &Url,
        options: &RequestOptions,
        access_token: &AccessTokenRef,
    ) -> Result<Response, CallError> {
        let mut headers = options.headers.clone();
        headers.insert(header::AUTHORIZATION, bearer(access_token)?);

        let mut request = self
            .client
            .request(options.method.clone(), url.clone())
            .headers(headers);
        if let Some(body) = &options.body {
            request = request.body(body.clone());
        }

        let resp = match tokio::time::timeout(self.request_timeout, request.send()).await {
            Ok(resp) => resp.map_err(CallError::Transport)?,
            Err(_) => {
                tracing::debug!(timeout = ?self.request_timeout, "call timed out");
                return Err(CallError::Timeout(self.request_timeout));
            }
        };

        tracing::debug!(response.status = resp.status().as_u16(), "received response");
        Ok(resp)
    }
}

fn bearer(access_token: &AccessTokenRef) -> Result<HeaderValue, CallError> {
    let token = access_token.as_str();
    let mut header_value = BytesMut::with_capacity(token.len() + 7);
    header_value.put_slice(b"Bearer ");
    header_value.put_slice(token.as_bytes());

    let mut value = HeaderValue::from_maybe_shared(header_value.freeze())
        .map_err(CallError::InvalidToken)?;
    value.set_sensitive(true);
    Ok(value)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use futures::future::join_all;
    use sojourn_clock::DurationSecs;
    use sojourn_tokens::SessionConfig;

    use super::*;
    use crate::{
        identity::HttpIdentityBackend,
        test_support::{base_url, pair, StubApi},
    };

    fn pipeline(api: &Arc<StubApi>, request_timeout: Duration) -> AuthenticatedClient {
        let client = api.client();
        let identity = HttpIdentityBackend::new(client.clone(), &base_url()).unwrap();
        let config = SessionConfig::new(request_timeout, DurationSecs(60), DurationSecs(900));
        let coordinator = Arc::new(RefreshCoordinator::new(identity, config));

        AuthenticatedClient::new(client, &base_url(), coordinator, SessionEvents::default())
    }

    fn logged_in(renewal_delay: Duration) -> (Arc<StubApi>, TokenPair) {
        let api = StubApi::new(renewal_delay);
        let tokens = pair("access-0", "refresh-0");
        api.issue(&tokens);
        (api, tokens)
    }

    mod when_the_access_token_is_accepted {
        use super::*;

        #[tokio::test]
        async fn the_response_is_returned_without_renewing() {
            let (api, tokens) = logged_in(Duration::ZERO);
            let pipeline = pipeline(&api, Duration::from_secs(5));

            let resp = pipeline
                .call("/restaurants", &RequestOptions::get(), &tokens)
                .await
                .unwrap();

            assert_eq!(resp.status(), StatusCode::OK);
            assert_eq!(api.renewals(), 0);
            assert_eq!(api.authorizations(), vec!["Bearer access-0".to_owned()]);
        }

        #[tokio::test]
        async fn paths_resolve_beneath_the_base_url() {
            let (api, tokens) = logged_in(Duration::ZERO);
            let pipeline = pipeline(&api, Duration::from_secs(5));

            let resp = pipeline
                .call("recipes/12", &RequestOptions::get(), &tokens)
                .await
                .unwrap();
            let body: serde_json::Value = resp.json().await.unwrap();

            assert_eq!(body["path"], "/v1/recipes/12");
        }

        #[tokio::test]
        async fn resource_errors_pass_through_unchanged() {
            let (api, tokens) = logged_in(Duration::ZERO);
            let pipeline = pipeline(&api, Duration::from_secs(5));

            let resp = pipeline
                .call("/broken", &RequestOptions::delete(), &tokens)
                .await
                .unwrap();

            assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
            assert_eq!(api.resource_calls(), 1);
            assert_eq!(api.renewals(), 0);
        }
    }

    mod when_the_access_token_has_expired {
        use super::*;

        #[tokio::test]
        async fn the_call_is_retried_once_with_the_renewed_token() {
            let (api, tokens) = logged_in(Duration::ZERO);
            api.expire_access();
            let pipeline = pipeline(&api, Duration::from_secs(5));

            let resp = pipeline
                .call("/markets", &RequestOptions::get(), &tokens)
                .await
                .unwrap();

            assert_eq!(resp.status(), StatusCode::OK);
            assert_eq!(api.renewals(), 1);
            assert_eq!(
                api.authorizations(),
                vec!["Bearer access-0".to_owned(), "Bearer access-1".to_owned()]
            );
        }

        #[tokio::test]
        async fn concurrent_calls_share_a_single_renewal() {
            let (api, tokens) = logged_in(Duration::from_millis(50));
            api.expire_access();
            let pipeline = pipeline(&api, Duration::from_secs(5));
            let options = RequestOptions::get();

            let results =
                join_all((0..3).map(|_| pipeline.call("/doctors", &options, &tokens))).await;

            for result in results {
                assert_eq!(result.unwrap().status(), StatusCode::OK);
            }
            assert_eq!(api.renewals(), 1);
            assert_eq!(api.resource_calls(), 6);

            let retries: Vec<_> = api
                .authorizations()
                .into_iter()
                .filter(|a| a != "Bearer access-0")
                .collect();
            assert_eq!(retries, vec!["Bearer access-1".to_owned(); 3]);
        }

        #[tokio::test]
        async fn the_renewal_is_published_before_the_retry() {
            let (api, tokens) = logged_in(Duration::ZERO);
            api.expire_access();
            let pipeline = pipeline(&api, Duration::from_secs(5));
            api.observe(&pipeline.events);
            let mut rx = pipeline.events.subscribe();

            pipeline
                .call("/reviews", &RequestOptions::get(), &tokens)
                .await
                .unwrap();

            assert_eq!(api.renewals_observed(), vec![0, 1]);
            match rx.try_recv().unwrap() {
                SessionEvent::Renewed {
                    tokens: renewed,
                    replaced,
                    origin,
                } => {
                    assert_eq!(origin, RenewalOrigin::Reactive);
                    assert_eq!(&*replaced, tokens.refresh_token());
                    assert_eq!(renewed.access_token().as_str(), "access-1");
                }
                other => panic!("unexpected event: {:?}", other),
            }
        }

        #[tokio::test]
        async fn the_retry_reissues_the_same_request() {
            let (api, tokens) = logged_in(Duration::ZERO);
            api.expire_access();
            let pipeline = pipeline(&api, Duration::from_secs(5));
            let options = RequestOptions::post()
                .with_json(&serde_json::json!({ "rating": 5 }))
                .unwrap();

            let resp = pipeline.call("/reviews", &options, &tokens).await.unwrap();

            assert_eq!(resp.status(), StatusCode::OK);
            assert_eq!(options.method(), Method::POST);
            assert_eq!(
                options.body().map(|b| &b[..]),
                Some(&br#"{"rating":5}"#[..])
            );
            assert_eq!(api.resource_calls(), 2);
        }
    }

    mod when_the_refresh_token_is_rejected {
        use super::*;

        #[tokio::test]
        async fn the_call_fails_with_the_renewal_error() {
            let (api, tokens) = logged_in(Duration::ZERO);
            api.expire_access();
            api.revoke_refresh();
            let pipeline = pipeline(&api, Duration::from_secs(5));

            let err = pipeline
                .call("/posts", &RequestOptions::get(), &tokens)
                .await
                .unwrap_err();

            match err {
                CallError::Failed(RenewalError::Rejected { message, .. }) => {
                    assert_eq!(message, "Invalid refresh token")
                }
                other => panic!("unexpected error: {:?}", other),
            }
            assert_eq!(api.resource_calls(), 1);
        }
    }

    mod when_the_resource_always_rejects {
        use super::*;

        #[tokio::test]
        async fn exactly_two_calls_are_made_before_giving_up() {
            let (api, tokens) = logged_in(Duration::ZERO);
            let pipeline = pipeline(&api, Duration::from_secs(5));

            let err = pipeline
                .call("/forbidden", &RequestOptions::get(), &tokens)
                .await
                .unwrap_err();

            assert!(matches!(err, CallError::Unauthorized));
            assert_eq!(api.resource_calls(), 2);
            assert_eq!(api.renewals(), 1);
        }
    }

    mod when_the_resource_is_slow {
        use super::*;

        #[tokio::test]
        async fn the_call_times_out() {
            let (api, tokens) = logged_in(Duration::ZERO);
            let pipeline = pipeline(&api, Duration::from_millis(50));

            let err = pipeline
                .call("/slow", &RequestOptions::get(), &tokens)
                .await
                .unwrap_err();

            assert!(matches!(err, CallError::Timeout(t) if t == Duration::from_millis(50)));
            assert_eq!(api.renewals(), 0);
        }
    }

    #[test]
    fn bearer_values_are_sensitive() {
        let value = bearer(AccessTokenRef::from_str("abc")).unwrap();
        assert_eq!(value.to_str().unwrap(), "Bearer abc");
        assert!(value.is_sensitive());
    }

    #[test]
    fn tokens_with_line_breaks_are_refused() {
        let err = bearer(AccessTokenRef::from_str("abc\r\nX-Evil: 1")).unwrap_err();
        assert!(matches!(err, CallError::InvalidToken(_)));
    }
}
