use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Mutex,
    },
    time::Duration,
};

use async_trait::async_trait;

use crate::{
    sources::TokenExchange, AccessToken, RefreshToken, RefreshTokenRef, RenewalError, TokenPair,
};

pub(crate) fn pair(access: &str, refresh: &str) -> TokenPair {
    TokenPair::new(
        AccessToken::new(access.to_owned()),
        RefreshToken::new(refresh.to_owned()),
    )
}

/// Counts exchanges and answers each one after `delay`
pub(crate) struct MockExchange {
    calls: AtomicUsize,
    delay: Duration,
    reject: bool,
    seen: Mutex<Vec<String>>,
}

impl MockExchange {
    pub(crate) fn succeeding(delay: Duration) -> Self {
        Self {
            calls: AtomicUsize::new(0),
            delay,
            reject: false,
            seen: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn rejecting(delay: Duration) -> Self {
        Self {
            reject: true,
            ..Self::succeeding(delay)
        }
    }

    pub(crate) fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub(crate) fn seen(&self) -> Vec<String> {
        self.seen.lock().unwrap().clone()
    }
}

#[async_trait]
impl TokenExchange for MockExchange {
    async fn exchange(&self, refresh_token: &RefreshTokenRef) -> Result<TokenPair, RenewalError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        self.seen
            .lock()
            .unwrap()
            .push(refresh_token.as_str().to_owned());
        tokio::time::sleep(self.delay).await;

        if self.reject {
            Err(RenewalError::Rejected {
                status: 401,
                message: "Invalid refresh token".into(),
            })
        } else {
            Ok(pair(&format!("access-{}", n), &format!("refresh-{}", n)))
        }
    }
}
