use serde::{Deserialize, Serialize};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::types::ExecutionStatus;

/// Tuning knobs for [`WsPool`](crate::ws::WsPool).
///
/// Reconnect delay grows as `reconnect_base_delay * 2^attempt`, capped at
/// `max_reconnect_delay`.
#[derive(Debug, Clone)]
pub struct WsPoolConfig {
    pub reconnect_base_delay: Duration,
    pub max_reconnect_delay: Duration,
    pub max_reconnect_attempts: u32,
    pub heartbeat_interval: Duration,
    /// How long an unsubscribed connection is kept alive before teardown,
    /// absorbing quick release/resubscribe churn.
    pub idle_grace: Duration,
}

impl Default for WsPoolConfig {
    fn default() -> Self {
        Self {
            reconnect_base_delay: Duration::from_secs(1),
            max_reconnect_delay: Duration::from_secs(30),
            max_reconnect_attempts: 5,
            heartbeat_interval: Duration::from_secs(30),
            idle_grace: Duration::from_secs(5),
        }
    }
}

/// Progress report carried by [`WsEnvelope::ExecutionUpdate`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExecutionUpdate {
    pub execution_id: String,
    pub status: ExecutionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// JSON message envelope on the WebSocket channel, discriminated by `type`.
///
/// Consumers pattern-match exhaustively instead of inspecting untyped JSON.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WsEnvelope {
    Ping {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timestamp: Option<u64>,
    },
    Pong {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timestamp: Option<u64>,
    },
    ExecutionUpdate {
        data: ExecutionUpdate,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timestamp: Option<u64>,
    },
    Notification {
        data: serde_json::Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timestamp: Option<u64>,
    },
}

impl WsEnvelope {
    /// Heartbeat ping stamped with the current unix time.
    pub fn ping() -> Self {
        WsEnvelope::Ping {
            timestamp: unix_now(),
        }
    }

}

fn unix_now() -> Option<u64> {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .ok()
        .map(|d| d.as_secs())
}
