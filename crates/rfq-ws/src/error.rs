//! WebSocket error types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum WsError {
    #[error("Circuit breaker open, retry in {retry_after_ms}ms")]
    CircuitOpen { retry_after_ms: u64 },

    #[error("Not connected")]
    NotConnected,

    #[error("Message queue full (capacity {capacity})")]
    QueueFull { capacity: usize },

    #[error("Send failed: {0}")]
    SendFailed(String),

    #[error("Message parse error: {0}")]
    ParseError(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Connection manager stopped")]
    ManagerStopped,

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type WsResult<T> = Result<T, WsError>;
