//! Quote stream client.
//!
//! Wires the maker connection manager into a small service:
//! - TOML configuration for the maker URL, pairs and connection tunables
//! - Sink consumer turning quotes and notices into logs and metrics
//! - Periodic quote requests for the configured pairs
//! - Graceful shutdown on Ctrl-C

pub mod app;
pub mod config;
pub mod error;

pub use app::{Application, RunSummary};
pub use config::AppConfig;
pub use error::{AppError, AppResult};
