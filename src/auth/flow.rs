/// Authorization-code flow with PKCE and a loopback redirect
use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

use super::browser::{BrowserLauncher, Credentials};
use super::callback::{CallbackListener, CallbackOutcome};
use super::discovery::ProviderEndpoints;
use super::pkce::PkceParameters;
use super::AuthError;

pub const DEFAULT_CALLBACK_TIMEOUT: Duration = Duration::from_secs(300);

/// Bearer token plus its absolute expiry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenState {
    pub access_token: String,
    pub expiry: DateTime<Utc>,
}

impl TokenState {
    /// Usable if it stays valid for at least `skew` from `now`.
    pub fn is_fresh(&self, now: DateTime<Utc>, skew: chrono::Duration) -> bool {
        now + skew < self.expiry
    }
}

/// Per-attempt login parameters
#[derive(Debug, Clone)]
pub struct LoginRequest {
    pub client_id: String,
    pub scope: String,
    /// Extra front-channel parameters, e.g. `acr_values=tenant:<id>`
    pub extra_params: BTreeMap<String, String>,
}

/// Everything a flow needs, passed in explicitly at construction.
#[derive(Debug, Clone)]
pub struct LoginSettings {
    /// Base URL that serves `/.well-known/openid-configuration`
    pub authority: String,
    pub redirect_host: String,
    /// `None` binds an ephemeral port
    pub redirect_port: Option<u16>,
    pub redirect_path: String,
    pub callback_timeout: Duration,
    pub validate_issuer_name: bool,
    pub request: LoginRequest,
}

impl LoginSettings {
    fn redirect_uri(&self, port: u16) -> String {
        format!(
            "{}:{}/{}",
            self.redirect_host.trim_end_matches('/'),
            port,
            self.redirect_path.trim_start_matches('/')
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowState {
    Idle,
    DiscoveringEndpoints,
    AwaitingCallback,
    ExchangingCode,
    Complete,
    Failed,
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: i64,
    #[serde(default)]
    #[allow(dead_code)]
    token_type: Option<String>,
    #[serde(default)]
    id_token: Option<String>,
    #[serde(default)]
    #[allow(dead_code)]
    refresh_token: Option<String>,
}

#[derive(Deserialize)]
struct TokenErrorResponse {
    error: String,
    error_description: Option<String>,
}

/// Parameters the provider sent back on the redirect
#[derive(Debug, Default, PartialEq, Eq)]
struct CallbackParams {
    code: Option<String>,
    state: Option<String>,
    error: Option<String>,
    error_description: Option<String>,
}

impl CallbackParams {
    fn parse(raw_query: &str) -> Self {
        let mut params = Self::default();
        for (key, value) in url::form_urlencoded::parse(raw_query.trim_start_matches('?').as_bytes()) {
            let value = Some(value.into_owned());
            match key.as_ref() {
                "code" => params.code = value,
                "state" => params.state = value,
                "error" => params.error = value,
                "error_description" => params.error_description = value,
                _ => {}
            }
        }
        params
    }
}

/// Result of a completed flow
#[derive(Debug, Clone)]
pub struct LoginOutcome {
    pub token: TokenState,
    pub id_token: Option<String>,
    pub endpoints: ProviderEndpoints,
}

/// Single-use login attempt. Construct a new one for every login.
pub struct AuthorizationCodeFlow<'a> {
    settings: &'a LoginSettings,
    http: &'a reqwest::Client,
    launcher: &'a dyn BrowserLauncher,
    credentials: Option<&'a Credentials>,
    cancel: CancellationToken,
    state: FlowState,
}

impl<'a> AuthorizationCodeFlow<'a> {
    pub fn new(
        settings: &'a LoginSettings,
        http: &'a reqwest::Client,
        launcher: &'a dyn BrowserLauncher,
        credentials: Option<&'a Credentials>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            settings,
            http,
            launcher,
            credentials,
            cancel,
            state: FlowState::Idle,
        }
    }

    pub fn state(&self) -> FlowState {
        self.state
    }

    fn transition(&mut self, next: FlowState) {
        debug!("Login flow {:?} -> {:?}", self.state, next);
        self.state = next;
    }

    /// Drive the flow to `Complete` or `Failed`.
    pub async fn run(&mut self) -> Result<LoginOutcome, AuthError> {
        if self.state != FlowState::Idle {
            return Err(AuthError::FlowReused);
        }

        let result = self.drive().await;
        self.transition(if result.is_ok() {
            FlowState::Complete
        } else {
            FlowState::Failed
        });
        result
    }

    async fn drive(&mut self) -> Result<LoginOutcome, AuthError> {
        self.transition(FlowState::DiscoveringEndpoints);
        let endpoints = ProviderEndpoints::discover(
            self.http,
            &self.settings.authority,
            self.settings.validate_issuer_name,
        )
        .await?;

        let listener =
            CallbackListener::start(self.settings.redirect_port, &self.settings.redirect_path).await?;
        let pkce = PkceParameters::generate(self.settings.redirect_uri(listener.port()));
        let authorize_url = build_authorize_url(&endpoints, &self.settings.request, &pkce)?;

        self.transition(FlowState::AwaitingCallback);
        let raw_query = self.await_callback(listener, &authorize_url).await?;

        let code = validate_callback(&raw_query, &pkce.state)?;

        self.transition(FlowState::ExchangingCode);
        let (token, id_token) = self.exchange_code(&endpoints, &code, &pkce).await?;

        info!("Login complete, token valid until {}", token.expiry);
        Ok(LoginOutcome {
            token,
            id_token,
            endpoints,
        })
    }

    /// Open the browser while the listener is already waiting.
    async fn await_callback(&self, listener: CallbackListener, authorize_url: &str) -> Result<String, AuthError> {
        let timeout = self.settings.callback_timeout;
        let wait = listener.wait_for_callback(timeout, self.cancel.clone());
        tokio::pin!(wait);
        let open = self.launcher.open(authorize_url, self.credentials);
        tokio::pin!(open);

        let result = tokio::select! {
            opened = &mut open => {
                // Dropping `wait` on error closes the socket right away
                opened?;
                wait.await
            }
            result = &mut wait => result,
        };

        match result.outcome {
            CallbackOutcome::Success => Ok(result.raw_query),
            CallbackOutcome::Timeout => Err(AuthError::CallbackTimeout(timeout)),
            CallbackOutcome::Cancelled => Err(AuthError::CallbackCancelled),
            CallbackOutcome::Error(message) => Err(AuthError::Callback(message)),
        }
    }

    async fn exchange_code(
        &self,
        endpoints: &ProviderEndpoints,
        code: &str,
        pkce: &PkceParameters,
    ) -> Result<(TokenState, Option<String>), AuthError> {
        let endpoint = endpoints.token_endpoint.as_str();
        let params = [
            ("grant_type", "authorization_code"),
            ("code", code),
            ("redirect_uri", pkce.redirect_uri.as_str()),
            ("client_id", self.settings.request.client_id.as_str()),
            ("code_verifier", pkce.code_verifier.as_str()),
        ];

        let res = self
            .http
            .post(endpoint)
            .form(&params)
            .header("Accept", "application/json")
            .send()
            .await
            .map_err(|e| AuthError::token_exchange(endpoint, e))?;

        let status = res.status();
        let text = res
            .text()
            .await
            .map_err(|e| AuthError::token_exchange(endpoint, e))?;

        if !status.is_success() {
            let message = match serde_json::from_str::<TokenErrorResponse>(&text) {
                Ok(err) => match err.error_description {
                    Some(description) => format!("{}: {}", err.error, description),
                    None => err.error,
                },
                Err(_) => format!("HTTP {}: {}", status, text),
            };
            return Err(AuthError::token_exchange(endpoint, message));
        }

        let token: TokenResponse = serde_json::from_str(&text)
            .map_err(|e| AuthError::token_exchange(endpoint, format!("malformed token response: {}", e)))?;

        if token.access_token.is_empty() {
            return Err(AuthError::token_exchange(endpoint, "empty access_token"));
        }
        if token.expires_in <= 0 {
            return Err(AuthError::token_exchange(
                endpoint,
                format!("non-positive expires_in: {}", token.expires_in),
            ));
        }

        let expiry = Utc::now() + chrono::Duration::seconds(token.expires_in);
        Ok((
            TokenState {
                access_token: token.access_token,
                expiry,
            },
            token.id_token,
        ))
    }
}

fn build_authorize_url(
    endpoints: &ProviderEndpoints,
    request: &LoginRequest,
    pkce: &PkceParameters,
) -> Result<String, AuthError> {
    let mut url = Url::parse(&endpoints.authorize_endpoint)
        .map_err(|e| AuthError::discovery(&endpoints.authorize_endpoint, e))?;
    {
        let mut query = url.query_pairs_mut();
        query
            .append_pair("response_type", "code")
            .append_pair("client_id", &request.client_id)
            .append_pair("redirect_uri", &pkce.redirect_uri)
            .append_pair("scope", &request.scope)
            .append_pair("code_challenge", &pkce.code_challenge)
            .append_pair("code_challenge_method", "S256")
            .append_pair("state", &pkce.state);
        for (key, value) in &request.extra_params {
            query.append_pair(key, value);
        }
    }
    Ok(url.to_string())
}

/// Check `state` first, then provider errors, then pull out the code.
fn validate_callback(raw_query: &str, expected_state: &str) -> Result<String, AuthError> {
    let params = CallbackParams::parse(raw_query);

    if params.state.as_deref() != Some(expected_state) {
        warn!("Login callback state did not match the request");
        return Err(AuthError::StateMismatch);
    }

    if let Some(error) = params.error {
        return Err(AuthError::Login {
            error,
            description: params.error_description,
        });
    }

    params
        .code
        .filter(|c| !c.is_empty())
        .ok_or_else(|| AuthError::Callback("callback carried no authorization code".to_string()))
}
