//! Resilient WebSocket connection to a quoting maker.
//!
//! Provides:
//! - Automatic reconnection with 1.5x exponential backoff and jitter
//! - Circuit breaker gating connection attempts after repeated failures
//! - Heartbeat monitoring with a recovery probe before reconnecting
//! - Priority-ordered, rate-adaptive outbound queue with per-pair dedup
//! - Pair subscriptions re-asserted on every open
//! - A single-task actor with a cloneable handle and published snapshots

pub mod backoff;
pub mod circuit_breaker;
pub mod config;
pub mod connection;
pub mod error;
pub mod handle;
pub mod heartbeat;
#[cfg(feature = "test-support")]
pub mod memory;
pub mod message;
pub mod message_queue;
pub mod rate_limiter;
pub mod sink;
pub mod stability;
pub mod subscription;
pub mod timer;
pub mod transport;

pub use circuit_breaker::{BreakerTransition, CircuitBreaker, CircuitBreakerState};
pub use config::ConnectionConfig;
pub use connection::{ConnectionManager, ConnectionSnapshot, ConnectionState, DisconnectReason};
pub use error::{WsError, WsResult};
pub use handle::ConnectionHandle;
pub use heartbeat::{HeartbeatAction, HeartbeatMonitor, HeartbeatStats};
#[cfg(feature = "test-support")]
pub use memory::MemoryConnector;
pub use message_queue::{MessageQueue, QueueRejection, QueuedMessage};
pub use rate_limiter::{RateLimitBackoff, RateLimitStats};
pub use sink::{Notice, NoticeKind, NoticeLevel, SinkEvent};
pub use stability::{MessageHealth, StabilityMetrics, StabilityTracker};
pub use transport::{Connector, SocketEvent, TungsteniteConnector};

use std::sync::Once;

static INIT_CRYPTO: Once = Once::new();

/// Initialize the TLS crypto provider.
/// Must be called before any WebSocket connections are made.
pub fn init_crypto() {
    INIT_CRYPTO.call_once(|| {
        let _ = rustls::crypto::ring::default_provider().install_default();
    });
}
