/// Token cache that authorizes outgoing requests, logging in again when the token expires
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::Mutex;
use tracing::{debug, info};

use super::{AuthError, Authenticator, TokenState};

pub const DEFAULT_EXPIRY_SKEW_SECS: i64 = 5;

#[derive(Default)]
struct Cache {
    token: Option<TokenState>,
    // Error of the most recent login, if it failed
    failure: Option<AuthError>,
}

pub struct TokenManager {
    authenticator: Arc<dyn Authenticator>,
    // Held across a login so concurrent callers share one refresh
    cache: Mutex<Cache>,
    // Number of finished login attempts, bumped under the lock
    attempts: AtomicU64,
    skew: chrono::Duration,
}

impl TokenManager {
    pub fn new(authenticator: Arc<dyn Authenticator>) -> Self {
        Self::with_skew(authenticator, chrono::Duration::seconds(DEFAULT_EXPIRY_SKEW_SECS))
    }

    pub fn with_skew(authenticator: Arc<dyn Authenticator>, skew: chrono::Duration) -> Self {
        Self {
            authenticator,
            cache: Mutex::new(Cache::default()),
            attempts: AtomicU64::new(0),
            skew,
        }
    }

    /// Get a valid access token, logging in if it is missing or about to expire.
    ///
    /// Callers that queued behind a login share its result, failure included.
    pub async fn ensure_token(&self) -> Result<String, AuthError> {
        let seen = self.attempts.load(Ordering::SeqCst);
        let mut cache = self.cache.lock().await;

        if let Some(current) = cache.token.as_ref() {
            if current.is_fresh(Utc::now(), self.skew) {
                return Ok(current.access_token.clone());
            }
        }

        if self.attempts.load(Ordering::SeqCst) != seen {
            if let Some(failure) = cache.failure.as_ref() {
                debug!("Login finished while waiting and failed: {}", failure);
                return Err(AuthError::AuthenticationRequired(Box::new(failure.clone())));
            }
        }

        match cache.token.as_ref() {
            Some(stale) => info!("Access token expired at {}, logging in again", stale.expiry),
            None => debug!("No access token cached, logging in"),
        }

        let result = self.login().await;
        self.attempts.fetch_add(1, Ordering::SeqCst);

        match result {
            Ok(fresh) => {
                let access_token = fresh.access_token.clone();
                cache.token = Some(fresh);
                cache.failure = None;
                Ok(access_token)
            }
            Err(e) => {
                cache.failure = Some(e.clone());
                Err(AuthError::AuthenticationRequired(Box::new(e)))
            }
        }
    }

    async fn login(&self) -> Result<TokenState, AuthError> {
        let fresh = self.authenticator.login().await?;
        if !fresh.is_fresh(Utc::now(), self.skew) {
            return Err(AuthError::token_exchange(
                "login",
                format!("token already expired at {}", fresh.expiry),
            ));
        }
        Ok(fresh)
    }

    /// Attach `Authorization: Bearer <token>` to a request
    pub async fn authorize(&self, request: reqwest::RequestBuilder) -> Result<reqwest::RequestBuilder, AuthError> {
        let access_token = self.ensure_token().await?;
        Ok(request.bearer_auth(access_token))
    }

    /// Drop the cached token so the next request logs in again
    pub async fn invalidate(&self) {
        self.cache.lock().await.token = None;
    }

    /// Time until expiration, if a token is cached
    pub async fn time_until_expiration(&self) -> Option<chrono::Duration> {
        self.cache
            .lock()
            .await
            .token
            .as_ref()
            .map(|t| t.expiry - Utc::now())
    }
}
