//! Heartbeat monitoring for the maker connection.
//!
//! Tracks liveness from inbound traffic and decides, on every heartbeat
//! tick, whether to ping, attempt a recovery probe, or declare the
//! connection dead. Any inbound frame counts as a response, not only
//! `pong`.
//!
//! The monitor only decides; the connection manager performs the sends
//! and owns the timers.

use crate::config::ConnectionConfig;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HeartbeatPhase {
    #[default]
    Idle,
    Running,
}

/// What the manager should do for this heartbeat tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatAction {
    /// Not running or socket not open; do nothing.
    Skip,
    /// Send the regular ping.
    Ping,
    /// Send the regular ping, then a recovery ping with subscription
    /// re-assertion, and schedule a recovery check.
    PingAndRecover,
    /// Too many missed heartbeats; treat the connection as dead.
    Fatal { missed: u32 },
}

/// Result of the follow-up check after a recovery probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryOutcome {
    /// Traffic arrived after the probe.
    Recovered,
    /// Still silent; the connection is considered dead.
    Stale,
    /// No probe was outstanding (stopped or already resolved).
    NotPending,
}

/// Heartbeat statistics.
#[derive(Debug, Clone, Default, Serialize)]
pub struct HeartbeatStats {
    pub phase: HeartbeatPhase,
    pub last_response_at: Option<DateTime<Utc>>,
    pub missed: u32,
    pub ms_since_last_response: u64,
    pub recovery_pending: bool,
}

#[derive(Debug)]
pub struct HeartbeatMonitor {
    interval: Duration,
    timeout: Duration,
    max_missed: u32,
    recovery_delay: Duration,
    phase: HeartbeatPhase,
    last_response_at: Instant,
    last_response_wall: Option<DateTime<Utc>>,
    missed: u32,
    /// Send time of an outstanding recovery probe.
    recovery_sent_at: Option<Instant>,
}

impl HeartbeatMonitor {
    pub fn new(
        interval: Duration,
        timeout: Duration,
        max_missed: u32,
        recovery_delay: Duration,
        now: Instant,
    ) -> Self {
        Self {
            interval,
            timeout,
            max_missed: max_missed.max(1),
            recovery_delay,
            phase: HeartbeatPhase::Idle,
            last_response_at: now,
            last_response_wall: None,
            missed: 0,
            recovery_sent_at: None,
        }
    }

    pub fn from_config(config: &ConnectionConfig, now: Instant) -> Self {
        Self::new(
            config.heartbeat_interval(),
            config.heartbeat_timeout(),
            config.max_missed_heartbeats,
            config.recovery_check_delay(),
            now,
        )
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn recovery_delay(&self) -> Duration {
        self.recovery_delay
    }

    pub fn phase(&self) -> HeartbeatPhase {
        self.phase
    }

    pub fn is_running(&self) -> bool {
        self.phase == HeartbeatPhase::Running
    }

    pub fn missed(&self) -> u32 {
        self.missed
    }

    /// Start monitoring (called on open).
    pub fn start(&mut self, now: Instant) {
        self.phase = HeartbeatPhase::Running;
        self.last_response_at = now;
        self.missed = 0;
        self.recovery_sent_at = None;
        debug!(interval_ms = self.interval.as_millis() as u64, "Heartbeat started");
    }

    /// Stop monitoring and drop any outstanding recovery probe.
    pub fn stop(&mut self) {
        if self.phase == HeartbeatPhase::Running {
            debug!("Heartbeat stopped");
        }
        self.phase = HeartbeatPhase::Idle;
        self.recovery_sent_at = None;
    }

    /// Record any inbound frame.
    pub fn record_inbound(&mut self, now: Instant) {
        self.last_response_at = now;
        self.last_response_wall = Some(Utc::now());
        self.missed = 0;
    }

    /// Decide the action for a heartbeat tick.
    pub fn on_tick(&mut self, now: Instant, socket_open: bool) -> HeartbeatAction {
        if self.phase == HeartbeatPhase::Idle {
            return HeartbeatAction::Skip;
        }
        if !socket_open {
            debug!("Socket not open during heartbeat tick, skipping");
            return HeartbeatAction::Skip;
        }

        let elapsed = now.saturating_duration_since(self.last_response_at);
        if elapsed <= self.timeout {
            return HeartbeatAction::Ping;
        }

        self.missed += 1;
        warn!(
            elapsed_ms = elapsed.as_millis() as u64,
            missed = self.missed,
            max_missed = self.max_missed,
            "Heartbeat response overdue"
        );

        if self.missed >= self.max_missed {
            return HeartbeatAction::Fatal {
                missed: self.missed,
            };
        }

        if self.recovery_sent_at.is_some() {
            // A probe is already outstanding; its check decides.
            return HeartbeatAction::Ping;
        }

        self.recovery_sent_at = Some(now);
        HeartbeatAction::PingAndRecover
    }

    /// Follow-up check for the outstanding recovery probe.
    pub fn check_recovery(&mut self) -> RecoveryOutcome {
        let Some(sent_at) = self.recovery_sent_at.take() else {
            return RecoveryOutcome::NotPending;
        };

        if self.phase == HeartbeatPhase::Idle {
            return RecoveryOutcome::NotPending;
        }

        if self.last_response_at >= sent_at {
            RecoveryOutcome::Recovered
        } else {
            RecoveryOutcome::Stale
        }
    }

    pub fn stats(&self, now: Instant) -> HeartbeatStats {
        HeartbeatStats {
            phase: self.phase,
            last_response_at: self.last_response_wall,
            missed: self.missed,
            ms_since_last_response: now
                .saturating_duration_since(self.last_response_at)
                .as_millis() as u64,
            recovery_pending: self.recovery_sent_at.is_some(),
        }
    }
}
