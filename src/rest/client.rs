use crate::auth::{AuthState, LoginRequest, RefreshRequest, TokenResponse, TokenState};
use crate::env::{AUTH_PREFIX, NoxEnvironment, REST_PREFIX};
use crate::error::{ErrorResponse, NoxError};
use crate::metrics::{ClientMetrics, MetricsCollector, RateLimitStatus};
use crate::rest::types::{ExecutionRequest, ExecutionResult, HealthStatus, UserProfile};
use crate::retry::{RetryConfig, retry_after_delay, retryable_status, retryable_transport_error};

use rand::Rng;
use rand::distributions::Alphanumeric;
use reqwest::header::{CONTENT_TYPE, HeaderMap};
use reqwest::{Client, Method, StatusCode};
use serde::{Serialize, de::DeserializeOwned};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::{Mutex, RwLock, broadcast};
use tokio::time::{Duration, Instant, sleep};
use tracing::{debug, warn};
use url::Url;

/// Lifecycle notifications emitted on the client's event channel.
///
/// Replaces the event-emitter pattern of earlier SDKs with an explicit
/// broadcast subscription; see [`NoxRestClient::events`].
#[derive(Debug, Clone)]
pub enum ClientEvent {
    /// One attempt finished, successfully or not.
    RequestCompleted {
        method: Method,
        path: String,
        status: Option<StatusCode>,
        elapsed: Duration,
    },
    /// Dispatch paused until the advertised rate-limit window resets.
    RateLimitWait { wait: Duration },
    TokenRefreshed,
    /// Refresh failed; the caller should prompt for re-authentication.
    TokenRefreshFailed { reason: String },
}

fn generate_request_id() -> String {
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis();
    let suffix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(9)
        .map(char::from)
        .collect();
    format!("req_{millis}_{suffix}")
}

fn header_i64(headers: &HeaderMap, name: &str) -> Option<i64> {
    headers.get(name)?.to_str().ok()?.trim().parse().ok()
}

fn extract_request_id(headers: &HeaderMap) -> Option<String> {
    headers
        .get("x-request-id")
        .or_else(|| headers.get("request-id"))
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

fn build_api_error(status: StatusCode, bytes: &[u8], request_id: Option<String>) -> NoxError {
    #[derive(serde::Deserialize)]
    struct WrappedErrorBody {
        error: ErrorResponse,
    }

    let normalize = |body: ErrorResponse| if body.is_empty() { None } else { Some(body) };
    let details = serde_json::from_slice::<WrappedErrorBody>(bytes)
        .ok()
        .and_then(|wrapped| normalize(wrapped.error))
        .or_else(|| {
            serde_json::from_slice::<ErrorResponse>(bytes)
                .ok()
                .and_then(normalize)
        });

    let message = details
        .as_ref()
        .and_then(|d| d.message.clone().or_else(|| d.detail.clone()))
        .or_else(|| status.canonical_reason().map(str::to_string))
        .unwrap_or_else(|| format!("http status {status}"));

    NoxError::Api {
        status,
        code: details.as_ref().and_then(|d| d.code.clone()),
        message,
        details,
        request_id,
    }
}

/// Bearer/static token view captured before an attempt is dispatched.
enum AuthSnapshot {
    None,
    Static(String),
    Bearer {
        token: String,
        generation: u64,
        can_refresh: bool,
    },
}

/// Builder for [`NoxRestClient`] with transport and retry customization.
#[derive(Debug, Clone)]
pub struct NoxRestClientBuilder {
    env: NoxEnvironment,
    static_token: Option<String>,
    retry_config: RetryConfig,
    timeout: Option<Duration>,
    connect_timeout: Option<Duration>,
    user_agent: Option<String>,
    default_headers: Option<HeaderMap>,
    http_client: Option<Client>,
    metrics_enabled: bool,
}

impl NoxRestClientBuilder {
    fn new(env: NoxEnvironment) -> Self {
        Self {
            env,
            static_token: None,
            retry_config: RetryConfig::default(),
            timeout: None,
            connect_timeout: None,
            user_agent: None,
            default_headers: None,
            http_client: None,
            metrics_enabled: true,
        }
    }

    /// Authenticate every request with a static API token (`X-API-Token`).
    pub fn with_static_token(mut self, token: impl Into<String>) -> Self {
        self.static_token = Some(token.into());
        self
    }

    pub fn with_retry_config(mut self, config: RetryConfig) -> Self {
        self.retry_config = config;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = Some(timeout);
        self
    }

    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = Some(user_agent.into());
        self
    }

    pub fn with_default_headers(mut self, headers: HeaderMap) -> Self {
        self.default_headers = Some(headers);
        self
    }

    pub fn with_http_client(mut self, client: Client) -> Self {
        self.http_client = Some(client);
        self
    }

    /// Disable the metrics collector (events are still emitted).
    pub fn without_metrics(mut self) -> Self {
        self.metrics_enabled = false;
        self
    }

    pub fn build(self) -> Result<NoxRestClient, NoxError> {
        let http = if let Some(client) = self.http_client {
            client
        } else {
            let mut builder = Client::builder();
            if let Some(timeout) = self.timeout {
                builder = builder.timeout(timeout);
            }
            if let Some(timeout) = self.connect_timeout {
                builder = builder.connect_timeout(timeout);
            }
            if let Some(user_agent) = self.user_agent {
                builder = builder.user_agent(user_agent);
            }
            if let Some(headers) = self.default_headers {
                builder = builder.default_headers(headers);
            }
            builder.build()?
        };

        let (events, _) = broadcast::channel(64);

        Ok(NoxRestClient {
            http,
            env: self.env,
            static_token: self.static_token,
            retry_config: self.retry_config,
            auth: Arc::new(RwLock::new(AuthState::default())),
            refresh_gate: Arc::new(Mutex::new(())),
            rate_limit: Arc::new(StdMutex::new(RateLimitStatus::default())),
            metrics: Arc::new(MetricsCollector::new()),
            metrics_enabled: self.metrics_enabled,
            events,
        })
    }
}

/// Async HTTP client for the Nox REST API.
///
/// Every request goes through one dispatch loop that attaches auth headers
/// and a per-attempt `X-Request-ID`, honors the server-advertised rate
/// limit, retries transient failures with backoff, refreshes an expired
/// OAuth token on 401 (single-flight across concurrent requests), and feeds
/// the metrics collector.
///
/// Cloning is cheap and clones share token, rate-limit, and metrics state.
///
/// # Construction
///
/// ```no_run
/// use nox_client::{NoxEnvironment, NoxRestClient};
///
/// # fn run() -> Result<(), nox_client::NoxError> {
/// let client = NoxRestClient::builder(NoxEnvironment::new("https://api.nox.example")?)
///     .with_static_token("nox_live_abc123")
///     .build()?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct NoxRestClient {
    http: Client,
    env: NoxEnvironment,
    static_token: Option<String>,
    retry_config: RetryConfig,
    auth: Arc<RwLock<AuthState>>,
    refresh_gate: Arc<Mutex<()>>,
    rate_limit: Arc<StdMutex<RateLimitStatus>>,
    metrics: Arc<MetricsCollector>,
    metrics_enabled: bool,
    events: broadcast::Sender<ClientEvent>,
}

impl NoxRestClient {
    /// Start a configurable client builder.
    pub fn builder(env: NoxEnvironment) -> NoxRestClientBuilder {
        NoxRestClientBuilder::new(env)
    }

    /// Create a client with default settings for the given environment.
    pub fn new(env: NoxEnvironment) -> Self {
        Self::builder(env)
            .build()
            .expect("default rest client builder should not fail")
    }

    pub fn environment(&self) -> &NoxEnvironment {
        &self.env
    }

    /// Subscribe to lifecycle events. Missed events are dropped when a
    /// receiver lags; this channel is advisory, not a delivery guarantee.
    pub fn events(&self) -> broadcast::Receiver<ClientEvent> {
        self.events.subscribe()
    }

    /// Current request statistics plus the last-seen rate-limit headers.
    pub fn metrics(&self) -> ClientMetrics {
        self.metrics.snapshot()
    }

    /// True when an OAuth token pair is held.
    pub async fn is_authenticated(&self) -> bool {
        self.auth.read().await.tokens.is_some()
    }

    /// Current token state, if any. Useful for persisting a session.
    pub async fn token_state(&self) -> Option<TokenState> {
        self.auth.read().await.tokens.clone()
    }

    /// Install a token pair, e.g. one restored from a persisted session.
    pub async fn set_token_state(&self, tokens: TokenState) {
        let mut auth = self.auth.write().await;
        auth.tokens = Some(tokens);
        auth.generation += 1;
    }

    // -----------------------------------------------
    // Auth endpoints
    // -----------------------------------------------

    /// `POST /auth/login`; stores the returned token pair on success.
    pub async fn login(&self, username: &str, password: &str) -> Result<(), NoxError> {
        let path = format!("{AUTH_PREFIX}/login");
        let body: TokenResponse = self
            .send(
                Method::POST,
                &path,
                Option::<&()>::None,
                Some(&LoginRequest { username, password }),
            )
            .await?;

        let mut auth = self.auth.write().await;
        auth.tokens = Some(body.into_state(None));
        auth.generation += 1;
        Ok(())
    }

    /// Force a token refresh with the stored refresh token, without waiting
    /// for a 401. Fails when no refresh token is held.
    pub async fn refresh_session(&self) -> Result<(), NoxError> {
        let generation = self.auth.read().await.generation;
        self.refresh_access_token(generation).await
    }

    /// `POST /auth/logout`; the local token pair is dropped regardless of
    /// whether the server acknowledged the logout.
    pub async fn logout(&self) -> Result<(), NoxError> {
        let path = format!("{AUTH_PREFIX}/logout");
        let result: Result<serde_json::Value, NoxError> = self
            .send(Method::POST, &path, Option::<&()>::None, Option::<&()>::None)
            .await;

        let mut auth = self.auth.write().await;
        auth.tokens = None;
        auth.generation += 1;
        drop(auth);

        result.map(|_| ())
    }

    // -----------------------------------------------
    // Executions
    // -----------------------------------------------

    /// Submit a script for execution.
    pub async fn execute_script(
        &self,
        request: &ExecutionRequest,
    ) -> Result<ExecutionResult, NoxError> {
        request.validate()?;
        let path = format!("{REST_PREFIX}/execute");
        self.send(Method::POST, &path, Option::<&()>::None, Some(request))
            .await
    }

    /// Fetch an execution record by id.
    pub async fn get_execution_result(
        &self,
        execution_id: &str,
    ) -> Result<ExecutionResult, NoxError> {
        let path = format!("{REST_PREFIX}/executions/{execution_id}");
        self.send(Method::GET, &path, Option::<&()>::None, Option::<&()>::None)
            .await
    }

    /// Request cancellation of a pending or running execution.
    pub async fn cancel_execution(&self, execution_id: &str) -> Result<(), NoxError> {
        let path = format!("{REST_PREFIX}/executions/{execution_id}/cancel");
        let _: serde_json::Value = self
            .send(Method::POST, &path, Option::<&()>::None, Option::<&()>::None)
            .await?;
        Ok(())
    }

    // -----------------------------------------------
    // Account and platform
    // -----------------------------------------------

    pub async fn get_user_profile(&self) -> Result<UserProfile, NoxError> {
        let path = format!("{REST_PREFIX}/user/profile");
        self.send(Method::GET, &path, Option::<&()>::None, Option::<&()>::None)
            .await
    }

    pub async fn get_health_status(&self) -> Result<HealthStatus, NoxError> {
        let path = format!("{REST_PREFIX}/health");
        self.send(Method::GET, &path, Option::<&()>::None, Option::<&()>::None)
            .await
    }

    /// Server-side metrics endpoint; shape varies by deployment.
    pub async fn get_system_metrics(&self) -> Result<serde_json::Value, NoxError> {
        let path = format!("{REST_PREFIX}/metrics");
        self.send(Method::GET, &path, Option::<&()>::None, Option::<&()>::None)
            .await
    }

    // -----------------------------------------------
    // Generic verbs
    // -----------------------------------------------

    pub async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T, NoxError> {
        self.send(Method::GET, path, Option::<&()>::None, Option::<&()>::None)
            .await
    }

    pub async fn get_with_query<Q, T>(&self, path: &str, query: &Q) -> Result<T, NoxError>
    where
        Q: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        self.send(Method::GET, path, Some(query), Option::<&()>::None)
            .await
    }

    pub async fn post<B, T>(&self, path: &str, body: &B) -> Result<T, NoxError>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        self.send(Method::POST, path, Option::<&()>::None, Some(body))
            .await
    }

    pub async fn put<B, T>(&self, path: &str, body: &B) -> Result<T, NoxError>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        self.send(Method::PUT, path, Option::<&()>::None, Some(body))
            .await
    }

    pub async fn patch<B, T>(&self, path: &str, body: &B) -> Result<T, NoxError>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        self.send(Method::PATCH, path, Option::<&()>::None, Some(body))
            .await
    }

    pub async fn delete<T: DeserializeOwned>(&self, path: &str) -> Result<T, NoxError> {
        self.send(
            Method::DELETE,
            path,
            Option::<&()>::None,
            Option::<&()>::None,
        )
        .await
    }

    // -----------------------------------------------
    // Dispatch
    // -----------------------------------------------

    fn build_url(&self, path: &str) -> Result<Url, NoxError> {
        Ok(self.env.rest_origin.join(path)?)
    }

    fn emit(&self, event: ClientEvent) {
        let _ = self.events.send(event);
    }

    fn observe_attempt(
        &self,
        method: &Method,
        path: &str,
        status: Option<StatusCode>,
        elapsed: Duration,
        is_error: bool,
    ) {
        if self.metrics_enabled {
            self.metrics.record(elapsed, is_error);
        }
        self.emit(ClientEvent::RequestCompleted {
            method: method.clone(),
            path: path.to_string(),
            status,
            elapsed,
        });
    }

    fn update_rate_limit(&self, headers: &HeaderMap) {
        let remaining = header_i64(headers, "x-ratelimit-remaining");
        let reset = header_i64(headers, "x-ratelimit-reset");
        let limit = header_i64(headers, "x-ratelimit-limit");
        if remaining.is_none() && reset.is_none() && limit.is_none() {
            return;
        }

        let status = RateLimitStatus {
            remaining,
            reset_at: reset
                .filter(|secs| *secs >= 0)
                .map(|secs| UNIX_EPOCH + Duration::from_secs(secs as u64)),
            limit,
        };
        *self.rate_limit.lock().expect("rate limit lock poisoned") = status;
        if self.metrics_enabled {
            self.metrics.set_rate_limit(status);
        }
    }

    /// Advisory self-throttle: wait out the rate-limit window only when the
    /// server said the quota is exhausted. Blocks this dispatch, not other
    /// in-flight requests.
    async fn wait_for_rate_limit(&self) {
        let wait = {
            let state = self.rate_limit.lock().expect("rate limit lock poisoned");
            match (state.remaining, state.reset_at) {
                (Some(remaining), Some(reset_at)) if remaining <= 0 => {
                    reset_at.duration_since(SystemTime::now()).ok()
                }
                _ => None,
            }
        };
        if let Some(wait) = wait {
            debug!(?wait, "rate limit exhausted, delaying dispatch");
            self.emit(ClientEvent::RateLimitWait { wait });
            sleep(wait).await;
        }
    }

    async fn auth_snapshot(&self) -> AuthSnapshot {
        let auth = self.auth.read().await;
        if let Some(tokens) = &auth.tokens {
            return AuthSnapshot::Bearer {
                token: tokens.access_token.clone(),
                generation: auth.generation,
                can_refresh: tokens.refresh_token.is_some(),
            };
        }
        match &self.static_token {
            Some(token) => AuthSnapshot::Static(token.clone()),
            None => AuthSnapshot::None,
        }
    }

    /// Single-flight token refresh. Concurrent 401s all call this; the gate
    /// serializes them and the generation check makes every waiter after the
    /// first observe the refreshed token instead of refreshing again.
    async fn refresh_access_token(&self, seen_generation: u64) -> Result<(), NoxError> {
        let _gate = self.refresh_gate.lock().await;

        let refresh_token = {
            let auth = self.auth.read().await;
            if auth.generation != seen_generation {
                // Another task already replaced the token while we waited.
                return Ok(());
            }
            match auth.tokens.as_ref().and_then(|t| t.refresh_token.clone()) {
                Some(token) => token,
                None => {
                    return Err(NoxError::Authentication(
                        "no refresh token available".into(),
                    ));
                }
            }
        };

        debug!("refreshing access token");
        let url = self.build_url(&format!("{AUTH_PREFIX}/refresh"))?;
        let outcome = async {
            let response = self
                .http
                .post(url)
                .json(&RefreshRequest {
                    refresh_token: &refresh_token,
                })
                .send()
                .await?;
            let status = response.status();
            if !status.is_success() {
                return Err(NoxError::Authentication(format!(
                    "token refresh rejected with status {status}"
                )));
            }
            let body: TokenResponse = response.json().await?;
            Ok(body)
        }
        .await;

        match outcome {
            Ok(body) => {
                let mut auth = self.auth.write().await;
                auth.tokens = Some(body.into_state(Some(refresh_token)));
                auth.generation += 1;
                drop(auth);
                self.emit(ClientEvent::TokenRefreshed);
                Ok(())
            }
            Err(err) => {
                warn!(error = %err, "token refresh failed");
                self.emit(ClientEvent::TokenRefreshFailed {
                    reason: err.to_string(),
                });
                match err {
                    NoxError::Authentication(_) => Err(err),
                    other => Err(NoxError::Authentication(other.to_string())),
                }
            }
        }
    }

    async fn send<Q, B, T>(
        &self,
        method: Method,
        path: &str,
        query: Option<&Q>,
        body: Option<&B>,
    ) -> Result<T, NoxError>
    where
        Q: Serialize + ?Sized,
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let url = self.build_url(path)?;
        let body_bytes = match body {
            Some(value) => Some(serde_json::to_vec(value)?),
            None => None,
        };

        let mut retry_number: u32 = 0;
        let mut refreshed = false;

        loop {
            self.wait_for_rate_limit().await;

            let auth = self.auth_snapshot().await;
            let request_id = generate_request_id();
            let mut req = self
                .http
                .request(method.clone(), url.clone())
                .header("x-request-id", &request_id);

            match &auth {
                AuthSnapshot::Bearer { token, .. } => {
                    req = req.bearer_auth(token);
                }
                AuthSnapshot::Static(token) => {
                    req = req.header("x-api-token", token);
                }
                AuthSnapshot::None => {}
            }

            if let Some(q) = query {
                req = req.query(q);
            }
            if let Some(bytes) = &body_bytes {
                req = req
                    .header(CONTENT_TYPE, "application/json")
                    .body(bytes.clone());
            }

            let attempt_started = Instant::now();
            match req.send().await {
                Ok(resp) => {
                    let status = resp.status();
                    let headers = resp.headers().clone();
                    self.update_rate_limit(&headers);
                    let server_request_id = extract_request_id(&headers);
                    let retry_after = if status == StatusCode::TOO_MANY_REQUESTS {
                        retry_after_delay(&headers)
                    } else {
                        None
                    };
                    let bytes = resp.bytes().await?;
                    let elapsed = attempt_started.elapsed();

                    if status.is_success() {
                        self.observe_attempt(&method, path, Some(status), elapsed, false);
                        let payload: &[u8] = if bytes.is_empty() { b"{}" } else { &bytes };
                        return Ok(serde_json::from_slice::<T>(payload)?);
                    }

                    self.observe_attempt(&method, path, Some(status), elapsed, true);

                    if status == StatusCode::UNAUTHORIZED {
                        if let AuthSnapshot::Bearer {
                            generation,
                            can_refresh: true,
                            ..
                        } = auth
                            && !refreshed
                        {
                            self.refresh_access_token(generation).await?;
                            // One resubmit with the fresh token, outside the
                            // normal retry budget.
                            refreshed = true;
                            continue;
                        }
                        return Err(NoxError::Authentication(
                            if refreshed {
                                "request unauthorized even after token refresh".into()
                            } else {
                                "request unauthorized and no refresh token is available".into()
                            },
                        ));
                    }

                    let should_retry =
                        retry_number < self.retry_config.max_retries && retryable_status(status);
                    if should_retry {
                        retry_number = retry_number.saturating_add(1);
                        let delay = retry_after
                            .unwrap_or_else(|| self.retry_config.backoff_delay(retry_number));
                        debug!(
                            %status,
                            retry_number,
                            ?delay,
                            "transient failure, retrying"
                        );
                        if !delay.is_zero() {
                            sleep(delay).await;
                        }
                        continue;
                    }

                    if status == StatusCode::TOO_MANY_REQUESTS {
                        return Err(NoxError::RateLimited {
                            retry_after,
                            request_id: server_request_id,
                        });
                    }
                    return Err(build_api_error(status, &bytes, server_request_id));
                }
                Err(err) => {
                    let elapsed = attempt_started.elapsed();
                    self.observe_attempt(&method, path, None, elapsed, true);

                    let should_retry = retry_number < self.retry_config.max_retries
                        && retryable_transport_error(&err);
                    if should_retry {
                        retry_number = retry_number.saturating_add(1);
                        let delay = self.retry_config.backoff_delay(retry_number);
                        debug!(error = %err, retry_number, ?delay, "network failure, retrying");
                        if !delay.is_zero() {
                            sleep(delay).await;
                        }
                        continue;
                    }
                    return Err(err.into());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_ids_are_unique_and_well_formed() {
        let a = generate_request_id();
        let b = generate_request_id();
        assert!(a.starts_with("req_"));
        assert_eq!(a.split('_').count(), 3);
        assert_ne!(a, b);
    }

    #[test]
    fn api_error_built_from_wrapped_and_flat_bodies() {
        let flat = br#"{"code":"NOT_FOUND","message":"no such execution"}"#;
        match build_api_error(StatusCode::NOT_FOUND, flat, Some("rid".into())) {
            NoxError::Api {
                status,
                code,
                message,
                request_id,
                ..
            } => {
                assert_eq!(status, StatusCode::NOT_FOUND);
                assert_eq!(code.as_deref(), Some("NOT_FOUND"));
                assert_eq!(message, "no such execution");
                assert_eq!(request_id.as_deref(), Some("rid"));
            }
            other => panic!("expected api error, got {other:?}"),
        }

        let wrapped = br#"{"error":{"code":"QUOTA","detail":"quota exhausted"}}"#;
        match build_api_error(StatusCode::FORBIDDEN, wrapped, None) {
            NoxError::Api { code, message, .. } => {
                assert_eq!(code.as_deref(), Some("QUOTA"));
                assert_eq!(message, "quota exhausted");
            }
            other => panic!("expected api error, got {other:?}"),
        }
    }

    #[test]
    fn api_error_falls_back_to_status_text() {
        match build_api_error(StatusCode::BAD_GATEWAY, b"<html>oops</html>", None) {
            NoxError::Api {
                message, details, ..
            } => {
                assert_eq!(message, "Bad Gateway");
                assert!(details.is_none());
            }
            other => panic!("expected api error, got {other:?}"),
        }
    }
}
