//! Connection configuration.

use crate::error::{WsError, WsResult};
use std::time::Duration;

/// Tunables for the connection manager and its components.
///
/// All durations are in milliseconds so the struct maps 1:1 onto the
/// application's TOML `[websocket]` table.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Reconnect attempts before giving up and surfacing a persistent error.
    pub max_reconnect_attempts: u32,
    /// Base delay for the 1.5x exponential reconnect backoff.
    pub reconnect_base_delay_ms: u64,
    /// Cap applied before jitter is added.
    pub reconnect_max_delay_ms: u64,
    /// Upper bound of the uniform jitter added to every reconnect delay.
    pub reconnect_jitter_ms: u64,
    /// How often a ping is sent while open.
    pub heartbeat_interval_ms: u64,
    /// Silence longer than this counts as a missed heartbeat.
    pub heartbeat_timeout_ms: u64,
    /// Missed heartbeats before the connection is declared dead.
    pub max_missed_heartbeats: u32,
    /// Delay between a recovery ping and its follow-up staleness check.
    pub recovery_check_delay_ms: u64,
    /// Consecutive failures that open the circuit breaker.
    pub circuit_failure_threshold: u32,
    /// How long the breaker stays open before allowing a trial.
    pub circuit_open_duration_ms: u64,
    /// Maximum number of queued outbound messages.
    pub queue_capacity: usize,
    /// Initial drain interval, restored on every successful open.
    pub queue_base_interval_ms: u64,
    /// Floor the drain interval decays toward when healthy.
    pub queue_min_interval_ms: u64,
    /// Ceiling for the drain interval when unhealthy.
    pub queue_max_interval_ms: u64,
    /// Stability score tick period.
    pub health_check_interval_ms: u64,
    /// Debounce after the network comes back before reconnecting.
    pub network_settle_delay_ms: u64,
    /// Delay before retrying a failed subscription sync.
    pub sync_retry_delay_ms: u64,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            max_reconnect_attempts: 8,
            reconnect_base_delay_ms: 5_000,
            reconnect_max_delay_ms: 30_000,
            reconnect_jitter_ms: 1_000,
            heartbeat_interval_ms: 10_000,
            heartbeat_timeout_ms: 20_000,
            max_missed_heartbeats: 3,
            recovery_check_delay_ms: 2_000,
            circuit_failure_threshold: 5,
            circuit_open_duration_ms: 30_000,
            queue_capacity: 200,
            queue_base_interval_ms: 300,
            queue_min_interval_ms: 500,
            queue_max_interval_ms: 2_000,
            health_check_interval_ms: 15_000,
            network_settle_delay_ms: 1_000,
            sync_retry_delay_ms: 3_000,
        }
    }
}

impl ConnectionConfig {
    /// Reject values that would make the manager spin or never connect.
    pub fn validate(&self) -> WsResult<()> {
        if self.heartbeat_interval_ms == 0 {
            return Err(WsError::InvalidConfig(
                "heartbeat_interval_ms must be > 0".to_string(),
            ));
        }
        if self.health_check_interval_ms == 0 {
            return Err(WsError::InvalidConfig(
                "health_check_interval_ms must be > 0".to_string(),
            ));
        }
        if self.queue_capacity == 0 {
            return Err(WsError::InvalidConfig(
                "queue_capacity must be > 0".to_string(),
            ));
        }
        if self.circuit_failure_threshold == 0 {
            return Err(WsError::InvalidConfig(
                "circuit_failure_threshold must be > 0".to_string(),
            ));
        }
        if self.queue_min_interval_ms > self.queue_max_interval_ms {
            return Err(WsError::InvalidConfig(format!(
                "queue_min_interval_ms ({}) exceeds queue_max_interval_ms ({})",
                self.queue_min_interval_ms, self.queue_max_interval_ms
            )));
        }
        Ok(())
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_millis(self.heartbeat_timeout_ms)
    }

    pub fn recovery_check_delay(&self) -> Duration {
        Duration::from_millis(self.recovery_check_delay_ms)
    }

    pub fn circuit_open_duration(&self) -> Duration {
        Duration::from_millis(self.circuit_open_duration_ms)
    }

    pub fn health_check_interval(&self) -> Duration {
        Duration::from_millis(self.health_check_interval_ms)
    }

    pub fn network_settle_delay(&self) -> Duration {
        Duration::from_millis(self.network_settle_delay_ms)
    }

    pub fn sync_retry_delay(&self) -> Duration {
        Duration::from_millis(self.sync_retry_delay_ms)
    }
}
