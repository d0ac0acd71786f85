//! Prometheus metrics and structured logging for the RFQ client.
//!
//! - Connection gauges (state, circuit breaker, stability score, queue depth)
//! - Reconnect and quote counters
//! - Structured logging with tracing, JSON in production

pub mod error;
pub mod logging;
pub mod metrics;

pub use error::{TelemetryError, TelemetryResult};
pub use logging::init_logging;
pub use metrics::Metrics;
