/// Login entry point used by the token manager
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use super::browser::{BrowserLauncher, Credentials};
use super::flow::{AuthorizationCodeFlow, LoginSettings, TokenState};
use super::AuthError;

/// Produces a fresh token by logging in.
#[async_trait]
pub trait Authenticator: Send + Sync {
    async fn login(&self) -> Result<TokenState, AuthError>;
}

/// Browser-based OIDC login. Each attempt runs a brand-new flow.
pub struct OidcAuthenticator {
    settings: LoginSettings,
    http: reqwest::Client,
    launcher: Arc<dyn BrowserLauncher>,
    credentials: Option<Credentials>,
    max_attempts: u32,
    cancel: CancellationToken,
}

impl OidcAuthenticator {
    pub fn new(
        settings: LoginSettings,
        launcher: Arc<dyn BrowserLauncher>,
        http_timeout: Duration,
    ) -> Result<Self, AuthError> {
        let http = reqwest::Client::builder()
            .timeout(http_timeout)
            .build()
            .map_err(|e| AuthError::discovery(&settings.authority, format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            settings,
            http,
            launcher,
            credentials: None,
            max_attempts: 1,
            cancel: CancellationToken::new(),
        })
    }

    /// Credentials handed to the launcher (used by the headless browser).
    pub fn with_credentials(mut self, credentials: Option<Credentials>) -> Self {
        self.credentials = credentials;
        self
    }

    /// Total attempts allowed when the provider reports a recoverable login error.
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    /// Token whose cancellation aborts a pending callback wait.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }
}

#[async_trait]
impl Authenticator for OidcAuthenticator {
    async fn login(&self) -> Result<TokenState, AuthError> {
        println!("+-----------------------+");
        println!("|  Sign in with OIDC    |");
        println!("+-----------------------+\n");

        let mut attempt = 1;
        loop {
            println!("Prompting for login via a browser...");

            let mut flow = AuthorizationCodeFlow::new(
                &self.settings,
                &self.http,
                self.launcher.as_ref(),
                self.credentials.as_ref(),
                self.cancel.clone(),
            );

            match flow.run().await {
                Ok(outcome) => return Ok(outcome.token),
                Err(e) if e.is_recoverable() && attempt < self.max_attempts => {
                    warn!("Login attempt {}/{} failed: {}", attempt, self.max_attempts, e);
                    println!("{}", e);
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}
