//! Circuit breaker for connection attempts.
//!
//! # States
//! - Closed: connection attempts pass through
//! - Open: maker assumed unhealthy, attempts are refused
//! - HalfOpen: one trial attempt is in flight
//!
//! # State Transitions
//! ```text
//! Closed   → Open:     failure_count >= threshold
//! Open     → HalfOpen: can_attempt() after open_duration has elapsed
//! HalfOpen → Closed:   record_success()
//! HalfOpen → Open:     record_failure()
//! ```
//!
//! The breaker never performs I/O. Transitions that the user should see
//! are returned as [`BreakerTransition`] and turned into notices by the
//! connection manager.

use crate::config::ConnectionConfig;
use serde::Serialize;
use std::fmt;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{info, warn};

/// Circuit breaker state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitBreakerState {
    #[default]
    Closed,
    Open,
    HalfOpen,
}

impl CircuitBreakerState {
    /// Numeric encoding for gauges (0 = closed, 1 = half-open, 2 = open).
    pub fn as_gauge(&self) -> f64 {
        match self {
            Self::Closed => 0.0,
            Self::HalfOpen => 1.0,
            Self::Open => 2.0,
        }
    }
}

impl fmt::Display for CircuitBreakerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::Open => write!(f, "open"),
            Self::HalfOpen => write!(f, "half_open"),
        }
    }
}

/// Externally visible effect of a breaker update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerTransition {
    /// State unchanged.
    None,
    /// Breaker tripped (from Closed or HalfOpen).
    Opened,
    /// Breaker recovered to Closed.
    Closed,
}

/// Gate deciding whether a new connection attempt may be made.
#[derive(Debug)]
pub struct CircuitBreaker {
    failure_threshold: u32,
    open_duration: Duration,
    state: CircuitBreakerState,
    failure_count: u32,
    opened_at: Option<Instant>,
    /// Set while the single HalfOpen trial is outstanding.
    trial_in_flight: bool,
}

impl CircuitBreaker {
    pub fn new(failure_threshold: u32, open_duration: Duration) -> Self {
        Self {
            failure_threshold: failure_threshold.max(1),
            open_duration,
            state: CircuitBreakerState::Closed,
            failure_count: 0,
            opened_at: None,
            trial_in_flight: false,
        }
    }

    pub fn from_config(config: &ConnectionConfig) -> Self {
        Self::new(
            config.circuit_failure_threshold,
            config.circuit_open_duration(),
        )
    }

    pub fn state(&self) -> CircuitBreakerState {
        self.state
    }

    pub fn failure_count(&self) -> u32 {
        self.failure_count
    }

    /// Whether a connection attempt may be made now.
    ///
    /// Performs the time-based `Open → HalfOpen` transition. The call that
    /// performs it receives the single trial; later calls are refused until
    /// the trial resolves through `record_success`/`record_failure`.
    pub fn can_attempt(&mut self, now: Instant) -> bool {
        match self.state {
            CircuitBreakerState::Closed => true,
            CircuitBreakerState::Open => {
                let elapsed = self
                    .opened_at
                    .map(|opened| now.saturating_duration_since(opened))
                    .unwrap_or(Duration::MAX);

                if elapsed > self.open_duration {
                    self.state = CircuitBreakerState::HalfOpen;
                    self.trial_in_flight = true;
                    info!(
                        elapsed_ms = elapsed.as_millis() as u64,
                        "Circuit breaker half-open, allowing trial connection"
                    );
                    true
                } else {
                    false
                }
            }
            CircuitBreakerState::HalfOpen => {
                if self.trial_in_flight {
                    false
                } else {
                    self.trial_in_flight = true;
                    true
                }
            }
        }
    }

    /// Record a connection failure.
    pub fn record_failure(&mut self, now: Instant) -> BreakerTransition {
        self.failure_count = self.failure_count.saturating_add(1);

        match self.state {
            CircuitBreakerState::Closed if self.failure_count >= self.failure_threshold => {
                self.trip(now);
                warn!(
                    failures = self.failure_count,
                    open_ms = self.open_duration.as_millis() as u64,
                    "Circuit breaker opened"
                );
                BreakerTransition::Opened
            }
            CircuitBreakerState::HalfOpen => {
                self.trip(now);
                warn!("Circuit breaker trial failed, re-opening");
                BreakerTransition::Opened
            }
            _ => BreakerTransition::None,
        }
    }

    /// Record a successful connection.
    pub fn record_success(&mut self) -> BreakerTransition {
        let previous = self.state;
        self.state = CircuitBreakerState::Closed;
        self.failure_count = 0;
        self.opened_at = None;
        self.trial_in_flight = false;

        if previous == CircuitBreakerState::Closed {
            BreakerTransition::None
        } else {
            info!(from = %previous, "Circuit breaker closed");
            BreakerTransition::Closed
        }
    }

    /// Release a HalfOpen trial that ended without an outcome (explicit close).
    pub fn abandon_trial(&mut self) {
        if self.state == CircuitBreakerState::HalfOpen {
            self.trial_in_flight = false;
        }
    }

    /// Time until `can_attempt` can succeed again (zero unless Open).
    pub fn retry_after(&self, now: Instant) -> Duration {
        match (self.state, self.opened_at) {
            (CircuitBreakerState::Open, Some(opened)) => {
                let elapsed = now.saturating_duration_since(opened);
                // `can_attempt` requires strictly more than open_duration.
                self.open_duration.saturating_sub(elapsed) + Duration::from_millis(1)
            }
            _ => Duration::ZERO,
        }
    }

    fn trip(&mut self, now: Instant) {
        self.state = CircuitBreakerState::Open;
        self.opened_at = Some(now);
        self.trial_in_flight = false;
    }
}
