//! Async client for the Nox script-execution API.
//!
//! The crate covers the full request lifecycle against a Nox deployment:
//! authenticated REST dispatch with retries and backoff, transparent access
//! token refresh, rate-limit tracking, client-side metrics, and a pooled
//! WebSocket layer for realtime execution updates.
//!
//! # REST quick start
//!
//! ```no_run
//! use nox_client::{ExecutionRequest, NoxEnvironment, NoxRestClient, ScriptLanguage};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), nox_client::NoxError> {
//!     let env = NoxEnvironment::new("https://api.nox.example")?;
//!     let client = NoxRestClient::builder(env)
//!         .with_static_token("nox_api_token")
//!         .build()?;
//!
//!     let request = ExecutionRequest::inline("print('hello')", ScriptLanguage::Python);
//!     let result = client.execute_script(&request).await?;
//!     println!("execution {} is {}", result.execution_id, result.status);
//!     Ok(())
//! }
//! ```
//!
//! # Realtime updates
//!
//! ```no_run
//! use nox_client::{NoxEnvironment, WsPool, WsPoolConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), nox_client::NoxError> {
//!     let env = NoxEnvironment::new("https://api.nox.example")?;
//!     let pool = WsPool::new(WsPoolConfig::default());
//!
//!     let conn = pool.get_connection(&env.ws_url, "dashboard").await?;
//!     let mut updates = conn.subscribe();
//!     while let Ok(envelope) = updates.recv().await {
//!         println!("{envelope:?}");
//!     }
//!
//!     pool.release_connection(&env.ws_url, "dashboard");
//!     Ok(())
//! }
//! ```
//!
//! # Features
//!
//! - Bearer and static API token authentication, with single-flight token
//!   refresh when a request hits a 401.
//! - Retries with exponential or linear backoff, jitter, and `Retry-After`
//!   awareness for 429 responses.
//! - Per-request IDs and latency measurement published as [`ClientEvent`]s.
//! - Rate-limit header tracking with advisory pacing before dispatch.
//! - URL-deduplicated WebSocket pool with heartbeats and reconnect backoff.

pub mod auth;
pub mod env;
pub mod error;
pub mod metrics;
pub mod rest;
pub mod retry;
pub mod types;
pub mod ws;

pub use auth::TokenState;
pub use env::NoxEnvironment;
pub use error::{ErrorResponse, NoxError};
pub use metrics::{ClientMetrics, MetricsCollector, RateLimitStatus};
pub use rest::types::{ExecutionRequest, ExecutionResult, HealthStatus, UserProfile};
pub use rest::{ClientEvent, NoxRestClient, NoxRestClientBuilder};
pub use retry::{BackoffStrategy, RetryConfig};
pub use types::{ExecutionMode, ExecutionStatus, ScriptLanguage};
pub use ws::{ExecutionUpdate, WsConnection, WsEnvelope, WsPool, WsPoolConfig, WsPoolStats};
