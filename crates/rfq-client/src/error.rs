//! Application error types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] rfq_ws::WsError),

    #[error("Invalid pair: {0}")]
    Pair(#[from] rfq_core::CoreError),

    #[error("Telemetry error: {0}")]
    Telemetry(#[from] rfq_telemetry::TelemetryError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type AppResult<T> = Result<T, AppError>;
