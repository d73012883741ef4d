use url::Url;

use crate::error::NoxError;

/// Path prefix for the platform's REST endpoints, e.g. `/api/execute`.
pub const REST_PREFIX: &str = "/api";

/// Path prefix for the authentication endpoints (`/auth/login` etc.).
pub const AUTH_PREFIX: &str = "/auth";

/// Fixed path suffix appended to the WebSocket origin.
pub const WS_PATH: &str = "/ws";

/// Target deployment of the Nox API: the REST origin plus the WebSocket URL
/// derived from it by protocol substitution (`http` → `ws`, `https` → `wss`).
#[derive(Debug, Clone)]
pub struct NoxEnvironment {
    pub rest_origin: Url,
    pub ws_url: String,
}

impl NoxEnvironment {
    /// Build an environment from a base URL such as `https://api.nox.example`.
    ///
    /// A trailing slash is stripped so endpoint paths can be joined uniformly.
    pub fn new(base_url: &str) -> Result<Self, NoxError> {
        let trimmed = base_url.trim_end_matches('/');
        let rest_origin = Url::parse(trimmed)?;

        let ws_url = match rest_origin.scheme() {
            "https" => format!("wss{}{}", &trimmed["https".len()..], WS_PATH),
            "http" => format!("ws{}{}", &trimmed["http".len()..], WS_PATH),
            other => {
                return Err(NoxError::Validation(format!(
                    "unsupported base URL scheme: {other}"
                )));
            }
        };

        Ok(Self {
            rest_origin,
            ws_url,
        })
    }

    /// Local development default used by the platform tooling.
    pub fn localhost() -> Self {
        Self::new("http://localhost:8080").expect("static localhost URL should parse")
    }
}
