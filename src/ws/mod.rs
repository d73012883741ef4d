//! WebSocket connection pooling and realtime message types.

pub mod pool;
pub mod types;

pub use pool::{WsConnection, WsPool, WsPoolStats};
pub use types::{ExecutionUpdate, WsEnvelope, WsPoolConfig};
