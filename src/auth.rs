use serde::{Deserialize, Serialize};
use std::time::{Duration, SystemTime};

/// OAuth2 token pair held by a client instance.
///
/// Owned exclusively by the client that obtained it; mutated only by
/// `login`, refresh, and `logout`. There is no cross-instance sharing.
#[derive(Debug, Clone, PartialEq)]
pub struct TokenState {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_at: Option<SystemTime>,
}

impl TokenState {
    /// True when `expires_at` is known and in the past.
    pub fn is_expired(&self) -> bool {
        match self.expires_at {
            Some(at) => at <= SystemTime::now(),
            None => false,
        }
    }
}

#[derive(Debug, Serialize)]
pub(crate) struct LoginRequest<'a> {
    pub username: &'a str,
    pub password: &'a str,
}

#[derive(Debug, Serialize)]
pub(crate) struct RefreshRequest<'a> {
    pub refresh_token: &'a str,
}

/// Body of `POST /auth/login` and `POST /auth/refresh` responses.
///
/// Older deployments return `token` instead of `access_token`; the alias
/// covers both.
#[derive(Debug, Deserialize)]
pub(crate) struct TokenResponse {
    #[serde(alias = "token")]
    pub access_token: String,
    pub expires_in: Option<u64>,
    pub refresh_token: Option<String>,
}

impl TokenResponse {
    /// Convert into client token state, carrying the previous refresh token
    /// forward when the server omits a new one.
    pub(crate) fn into_state(self, previous_refresh: Option<String>) -> TokenState {
        TokenState {
            access_token: self.access_token,
            refresh_token: self.refresh_token.or(previous_refresh),
            expires_at: self
                .expires_in
                .map(|secs| SystemTime::now() + Duration::from_secs(secs)),
        }
    }
}

/// Token state plus a generation counter bumped on every token change.
///
/// The generation lets 401 handlers detect that another task already
/// refreshed while they were waiting on the refresh gate, collapsing
/// concurrent refreshes into a single flight.
#[derive(Debug, Default)]
pub(crate) struct AuthState {
    pub tokens: Option<TokenState>,
    pub generation: u64,
}
