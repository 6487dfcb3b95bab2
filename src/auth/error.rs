//! Authentication error types.

use std::time::Duration;
use thiserror::Error;

/// Provider login errors that allow re-prompting the user.
const RECOVERABLE_LOGIN_ERRORS: &[&str] = &[
    "login_required",
    "interaction_required",
    "temporarily_unavailable",
];

/// Errors raised by the login flow and the token interceptor.
#[derive(Debug, Clone, Error)]
pub enum AuthError {
    /// Provider metadata could not be fetched or was unusable.
    #[error("discovery failed at {endpoint}: {message}")]
    Discovery { endpoint: String, message: String },

    /// Browser could not be opened or driven.
    #[error("browser launch failed: {0}")]
    BrowserLaunch(String),

    /// Local callback listener could not be set up.
    #[error("callback listener error: {0}")]
    Listener(String),

    /// No redirect arrived in time.
    #[error("no login callback received within {0:?}")]
    CallbackTimeout(Duration),

    /// Wait aborted by the caller.
    #[error("login callback wait was cancelled")]
    CallbackCancelled,

    /// Callback arrived but was unusable (missing code, I/O failure).
    #[error("invalid login callback: {0}")]
    Callback(String),

    /// Anti-CSRF check failed.
    #[error("state mismatch in login callback")]
    StateMismatch,

    /// Provider reported an error on the authorize step.
    #[error("login rejected by provider: {error}{}", parenthesized(.description))]
    Login {
        error: String,
        description: Option<String>,
    },

    /// Token endpoint rejected the code/verifier.
    #[error("token exchange failed at {endpoint}: {message}")]
    TokenExchange { endpoint: String, message: String },

    /// A flow instance was run twice.
    #[error("authorization code flow already used")]
    FlowReused,

    /// No valid token could be obtained for an outgoing request.
    #[error("authentication required: {0}")]
    AuthenticationRequired(#[source] Box<AuthError>),
}

fn parenthesized(description: &Option<String>) -> String {
    description
        .as_deref()
        .map(|d| format!(" ({d})"))
        .unwrap_or_default()
}

impl AuthError {
    pub(crate) fn discovery(endpoint: impl Into<String>, message: impl std::fmt::Display) -> Self {
        Self::Discovery {
            endpoint: endpoint.into(),
            message: message.to_string(),
        }
    }

    pub(crate) fn token_exchange(endpoint: impl Into<String>, message: impl std::fmt::Display) -> Self {
        Self::TokenExchange {
            endpoint: endpoint.into(),
            message: message.to_string(),
        }
    }

    /// Whether a fresh login attempt may succeed where this one failed.
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Login { error, .. } => RECOVERABLE_LOGIN_ERRORS.contains(&error.as_str()),
            _ => false,
        }
    }
}
