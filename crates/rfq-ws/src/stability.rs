//! Connection stability scoring.
//!
//! Pure bookkeeping over connection failures/successes and message
//! outcomes. The resulting health signal only tunes pacing; gating of
//! connection attempts is the circuit breaker's job.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::time::Duration;
use tokio::time::Instant;

/// Score of a fresh (or explicitly reset) tracker.
pub const MAX_SCORE: u8 = 100;

/// Failure-free period after which each tick raises the score.
const RECOVERY_WINDOW: Duration = Duration::from_secs(60);
/// Failures younger than this lower the score on each tick.
const RECENT_FAILURE_WINDOW: Duration = Duration::from_secs(30);

const TICK_REWARD: u8 = 1;
const RECENT_FAILURE_PENALTY: u8 = 5;
const CONNECTION_FAILURE_PENALTY: u8 = 10;

/// Below this score the connection is reported unhealthy.
const HEALTHY_SCORE_FLOOR: u8 = 50;
/// Message outcomes required before the success rate is trusted.
const HEALTH_MIN_SAMPLES: u64 = 5;
const HEALTH_MIN_SUCCESS_RATE: f64 = 0.7;

/// Snapshot of stability state for diagnostics.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StabilityMetrics {
    pub consecutive_failures: u32,
    pub last_success_at: Option<DateTime<Utc>>,
    pub last_failure_at: Option<DateTime<Utc>>,
    pub reconnect_attempts: u32,
    pub score: u8,
}

/// Message send/receive outcome counters.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MessageHealth {
    pub successful: u64,
    pub failed: u64,
    /// `None` until at least one outcome was recorded.
    pub success_rate: Option<f64>,
}

#[derive(Debug)]
pub struct StabilityTracker {
    score: u8,
    consecutive_failures: u32,
    reconnect_attempts: u32,
    tracking_since: Instant,
    last_success: Option<Instant>,
    last_failure: Option<Instant>,
    last_success_wall: Option<DateTime<Utc>>,
    last_failure_wall: Option<DateTime<Utc>>,
    messages_ok: u64,
    messages_failed: u64,
}

impl StabilityTracker {
    pub fn new(now: Instant) -> Self {
        Self {
            score: MAX_SCORE,
            consecutive_failures: 0,
            reconnect_attempts: 0,
            tracking_since: now,
            last_success: None,
            last_failure: None,
            last_success_wall: None,
            last_failure_wall: None,
            messages_ok: 0,
            messages_failed: 0,
        }
    }

    pub fn score(&self) -> u8 {
        self.score
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    /// Record a connection-level failure (socket error, abnormal close).
    pub fn on_failure(&mut self, now: Instant) {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        self.last_failure = Some(now);
        self.last_failure_wall = Some(Utc::now());
        self.score = self.score.saturating_sub(CONNECTION_FAILURE_PENALTY);
    }

    /// Record a successful open.
    pub fn on_success(&mut self, now: Instant) {
        self.consecutive_failures = 0;
        self.last_success = Some(now);
        self.last_success_wall = Some(Utc::now());
    }

    /// Periodic health tick.
    pub fn tick(&mut self, now: Instant) {
        let recent_failure = self
            .last_failure
            .is_some_and(|at| now.saturating_duration_since(at) < RECENT_FAILURE_WINDOW);

        if recent_failure {
            self.score = self.score.saturating_sub(RECENT_FAILURE_PENALTY);
            return;
        }

        let failure_free_since = self.last_failure.unwrap_or(self.tracking_since);
        if now.saturating_duration_since(failure_free_since) >= RECOVERY_WINDOW {
            self.score = self.score.saturating_add(TICK_REWARD).min(MAX_SCORE);
        }
    }

    pub fn set_reconnect_attempts(&mut self, attempts: u32) {
        self.reconnect_attempts = attempts;
    }

    pub fn record_message_success(&mut self) {
        self.messages_ok = self.messages_ok.saturating_add(1);
    }

    pub fn record_message_failure(&mut self) {
        self.messages_failed = self.messages_failed.saturating_add(1);
    }

    /// Clear message counters (done on every successful open).
    pub fn reset_message_health(&mut self) {
        self.messages_ok = 0;
        self.messages_failed = 0;
    }

    /// Health signal used for adaptive queue pacing.
    pub fn is_healthy(&self) -> bool {
        if self.score < HEALTHY_SCORE_FLOOR {
            return false;
        }

        let total = self.messages_ok + self.messages_failed;
        if total < HEALTH_MIN_SAMPLES {
            return true;
        }

        (self.messages_ok as f64 / total as f64) >= HEALTH_MIN_SUCCESS_RATE
    }

    /// Return to the initial full-health state.
    pub fn reset(&mut self, now: Instant) {
        *self = Self::new(now);
    }

    pub fn metrics(&self) -> StabilityMetrics {
        StabilityMetrics {
            consecutive_failures: self.consecutive_failures,
            last_success_at: self.last_success_wall,
            last_failure_at: self.last_failure_wall,
            reconnect_attempts: self.reconnect_attempts,
            score: self.score,
        }
    }

    pub fn message_health(&self) -> MessageHealth {
        let total = self.messages_ok + self.messages_failed;
        MessageHealth {
            successful: self.messages_ok,
            failed: self.messages_failed,
            success_rate: (total > 0).then(|| self.messages_ok as f64 / total as f64),
        }
    }
}
