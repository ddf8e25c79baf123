use std::{
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use reqwest::{header, Client, Request, Response, Url};
use reqwest_middleware::{ClientBuilder, ClientWithMiddleware, Middleware, Next, Result};
use sojourn_tokens::{AccessToken, RefreshToken, SessionEvent, SessionEvents, TokenPair};
use tokio::sync::broadcast;

pub(crate) const BASE_URL: &str = "https://api.example.com/v1";

pub(crate) fn base_url() -> Url {
    BASE_URL.parse().unwrap()
}

pub(crate) fn pair(access: &str, refresh: &str) -> TokenPair {
    TokenPair::new(
        AccessToken::new(access.to_owned()),
        RefreshToken::new(refresh.to_owned()),
    )
}

struct Valid {
    access: Option<String>,
    refresh: Option<String>,
}

/// An identity backend and resource server in one terminal middleware
///
/// Logins issue `access-0`/`refresh-0`. Each accepted renewal issues
/// `access-{n}`/`refresh-{n}` and retires the previous pair. Resource paths
/// answer 200 with `{"path": …}` for the current access token and 401
/// otherwise. `/forbidden` always answers 401, `/broken` always answers 500,
/// and `/slow` waits a second before answering.
pub(crate) struct StubApi {
    valid: Mutex<Valid>,
    renewal_delay: Duration,
    renewals: AtomicUsize,
    resource_calls: AtomicUsize,
    authorizations: Mutex<Vec<String>>,
    reject_login: AtomicBool,
    observer: Mutex<Option<broadcast::Receiver<SessionEvent>>>,
    renewals_observed: Mutex<Vec<usize>>,
}

impl StubApi {
    pub(crate) fn new(renewal_delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            valid: Mutex::new(Valid {
                access: None,
                refresh: None,
            }),
            renewal_delay,
            renewals: AtomicUsize::new(0),
            resource_calls: AtomicUsize::new(0),
            authorizations: Mutex::new(Vec::new()),
            reject_login: AtomicBool::new(false),
            observer: Mutex::new(None),
            renewals_observed: Mutex::new(Vec::new()),
        })
    }

    /// Accepts `tokens` as if they had just been issued by a login
    pub(crate) fn issue(&self, tokens: &TokenPair) {
        let mut valid = self.valid.lock().unwrap();
        valid.access = Some(tokens.access_token().as_str().to_owned());
        valid.refresh = Some(tokens.refresh_token().as_str().to_owned());
    }

    /// Stops accepting the current access token, as though it had expired
    pub(crate) fn expire_access(&self) {
        self.valid.lock().unwrap().access = None;
    }

    /// Stops accepting the current refresh token, as though it had been revoked
    pub(crate) fn revoke_refresh(&self) {
        self.valid.lock().unwrap().refresh = None;
    }

    pub(crate) fn reject_logins(&self) {
        self.reject_login.store(true, Ordering::SeqCst);
    }

    /// Counts the renewals published on `events` as each resource call arrives
    pub(crate) fn observe(&self, events: &SessionEvents) {
        *self.observer.lock().unwrap() = Some(events.subscribe());
    }

    pub(crate) fn renewals(&self) -> usize {
        self.renewals.load(Ordering::SeqCst)
    }

    pub(crate) fn resource_calls(&self) -> usize {
        self.resource_calls.load(Ordering::SeqCst)
    }

    pub(crate) fn authorizations(&self) -> Vec<String> {
        self.authorizations.lock().unwrap().clone()
    }

    pub(crate) fn renewals_observed(&self) -> Vec<usize> {
        self.renewals_observed.lock().unwrap().clone()
    }

    pub(crate) fn client(self: &Arc<Self>) -> ClientWithMiddleware {
        let api: Arc<dyn Middleware> = self.clone();
        ClientBuilder::new(Client::default()).with_arc(api).build()
    }

    fn login(&self, body: serde_json::Value) -> (u16, String) {
        if self.reject_login.load(Ordering::SeqCst) || body["password"] != "correct horse" {
            return (401, r#"{"message":"Invalid credentials"}"#.to_owned());
        }

        self.issue(&pair("access-0", "refresh-0"));
        (
            200,
            serde_json::json!({
                "success": true,
                "data": {
                    "accessToken": "access-0",
                    "refreshToken": "refresh-0",
                    "user": { "id": 7, "name": body["username"] },
                },
            })
            .to_string(),
        )
    }

    async fn renew(&self, body: serde_json::Value) -> (u16, String) {
        let n = self.renewals.fetch_add(1, Ordering::SeqCst) + 1;
        tokio::time::sleep(self.renewal_delay).await;

        let mut valid = self.valid.lock().unwrap();
        if valid.refresh.is_none() || body["refreshToken"] != valid.refresh.as_deref().unwrap() {
            return (401, r#"{"message":"Invalid refresh token"}"#.to_owned());
        }

        let access = format!("access-{}", n);
        let refresh = format!("refresh-{}", n);
        valid.access = Some(access.clone());
        valid.refresh = Some(refresh.clone());

        (
            200,
            serde_json::json!({
                "success": true,
                "data": { "accessToken": access, "refreshToken": refresh },
            })
            .to_string(),
        )
    }

    async fn resource(&self, path: &str, authorization: String) -> (u16, String) {
        self.resource_calls.fetch_add(1, Ordering::SeqCst);
        self.authorizations
            .lock()
            .unwrap()
            .push(authorization.clone());

        if let Some(observer) = self.observer.lock().unwrap().as_mut() {
            let mut renewals = self.renewals_observed.lock().unwrap();
            let mut seen = renewals.last().copied().unwrap_or(0);
            while let Ok(event) = observer.try_recv() {
                if matches!(event, SessionEvent::Renewed { .. }) {
                    seen += 1;
                }
            }
            renewals.push(seen);
        }

        match path {
            "/v1/forbidden" => return (401, r#"{"message":"Forbidden forever"}"#.to_owned()),
            "/v1/broken" => return (500, r#"{"message":"Kitchen on fire"}"#.to_owned()),
            "/v1/slow" => tokio::time::sleep(Duration::from_secs(1)).await,
            _ => {}
        }

        let accepted = self
            .valid
            .lock()
            .unwrap()
            .access
            .as_ref()
            .map(|access| authorization == format!("Bearer {}", access))
            .unwrap_or(false);

        if accepted {
            (200, serde_json::json!({ "path": path }).to_string())
        } else {
            (401, r#"{"message":"Unauthorized"}"#.to_owned())
        }
    }
}

#[async_trait::async_trait]
impl Middleware for StubApi {
    async fn handle(
        &self,
        req: Request,
        _: &mut http::Extensions,
        _: Next<'_>,
    ) -> Result<Response> {
        let body = req
            .body()
            .and_then(|b| b.as_bytes())
            .and_then(|b| serde_json::from_slice(b).ok())
            .unwrap_or(serde_json::Value::Null);
        let authorization = req
            .headers()
            .get(header::AUTHORIZATION)
            .map(|v| v.to_str().unwrap().to_owned())
            .unwrap_or_default();

        let (status, body) = match req.url().path() {
            "/v1/auth/login" => self.login(body),
            "/v1/auth/refresh-token" => self.renew(body).await,
            path => self.resource(path, authorization).await,
        };

        Ok(http::Response::builder()
            .status(status)
            .header(header::CONTENT_TYPE, "application/json")
            .body(body)
            .unwrap()
            .into())
    }
}
