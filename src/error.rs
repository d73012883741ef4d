use reqwest::StatusCode;
use serde::Deserialize;
use std::time::Duration;
use thiserror::Error;

/// Structured error body returned by the Nox API on non-2xx responses.
///
/// All fields are optional; responses that fail to parse into this shape are
/// surfaced with the raw status text instead.
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
pub struct ErrorResponse {
    pub code: Option<String>,
    pub message: Option<String>,
    pub detail: Option<String>,
    pub suggestions: Option<Vec<String>>,
    pub documentation_url: Option<String>,
}

impl ErrorResponse {
    pub(crate) fn is_empty(&self) -> bool {
        self.code.is_none()
            && self.message.is_none()
            && self.detail.is_none()
            && self.suggestions.is_none()
            && self.documentation_url.is_none()
    }
}

/// Error surface for all client operations.
#[derive(Debug, Error)]
pub enum NoxError {
    /// No response was received: DNS failure, connection refused, or timeout.
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    /// Non-2xx response with whatever body detail could be parsed.
    #[error("api error: status={status} code={code:?}: {message}")]
    Api {
        status: StatusCode,
        code: Option<String>,
        message: String,
        details: Option<ErrorResponse>,
        request_id: Option<String>,
    },

    /// 429 surfaced after the retry budget was exhausted.
    #[error("rate limited; retry after {retry_after:?}")]
    RateLimited {
        retry_after: Option<Duration>,
        request_id: Option<String>,
    },

    /// 401 with no refresh path, or a token refresh that itself failed.
    #[error("authentication failed: {0}")]
    Authentication(String),

    /// Request rejected client-side before dispatch.
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("invalid url: {0}")]
    Url(#[from] url::ParseError),

    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("websocket error: {0}")]
    Ws(String),
}

impl NoxError {
    /// True when the underlying transport reported a timeout.
    pub fn is_timeout(&self) -> bool {
        matches!(self, NoxError::Network(err) if err.is_timeout())
    }

    /// Remediation hint suitable for display alongside the error message.
    ///
    /// Server-provided suggestions, when present in the response body, take
    /// precedence over these built-in hints.
    pub fn suggestion(&self) -> Option<&str> {
        match self {
            NoxError::Network(err) if err.is_timeout() => {
                Some("the request timed out; retry or raise the configured timeout")
            }
            NoxError::Network(_) => {
                Some("check the base URL and network connectivity to the Nox API")
            }
            NoxError::Api { details, .. } => details
                .as_ref()
                .and_then(|d| d.suggestions.as_ref())
                .and_then(|s| s.first())
                .map(String::as_str),
            NoxError::RateLimited { .. } => {
                Some("reduce request volume or wait for the rate-limit window to reset")
            }
            NoxError::Authentication(_) => {
                Some("re-authenticate with login() or supply a valid API token")
            }
            NoxError::Validation(_) => Some("fix the request fields before resubmitting"),
            _ => None,
        }
    }
}
