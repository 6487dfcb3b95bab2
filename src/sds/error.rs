use thiserror::Error;

use crate::auth::AuthError;

/// Data/metadata service errors.
#[derive(Debug, Error)]
pub enum SdsError {
    /// No token could be attached to the request.
    #[error(transparent)]
    Auth(#[from] AuthError),

    /// Transport or decoding failure.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Response body could not be decoded.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Resource does not exist.
    #[error("not found: {url}")]
    NotFound { url: String },

    /// Any other non-success status.
    #[error("{method} {url} returned {status}: {body}")]
    Status {
        method: String,
        url: String,
        status: u16,
        body: String,
    },
}

impl SdsError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}
