//! Backoff for server-side rate limiting.
//!
//! When the maker answers with a rate-limit error the drain loop pauses
//! outbound sends for the current backoff window. The window doubles on
//! repeated errors (at most once per window) and returns to the base on
//! any sign that the server is accepting traffic again.

use serde::Serialize;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

const BASE_DELAY: Duration = Duration::from_millis(500);
const MAX_DELAY: Duration = Duration::from_secs(30);
const FACTOR: u32 = 2;

/// Snapshot of the backoff state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RateLimitStats {
    pub attempts: u32,
    pub current_delay_ms: u64,
}

#[derive(Debug)]
pub struct RateLimitBackoff {
    base_delay: Duration,
    max_delay: Duration,
    current_delay: Duration,
    attempts: u32,
    last_hit: Option<Instant>,
}

impl Default for RateLimitBackoff {
    fn default() -> Self {
        Self::new(BASE_DELAY, MAX_DELAY)
    }
}

impl RateLimitBackoff {
    pub fn new(base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            base_delay,
            max_delay: max_delay.max(base_delay),
            current_delay: base_delay,
            attempts: 0,
            last_hit: None,
        }
    }

    /// Record a rate-limit error from the server.
    ///
    /// Errors arriving inside the current window only restart it; the
    /// delay grows once the previous window has passed.
    pub fn on_rate_limit(&mut self, now: Instant) {
        let window_passed = self
            .last_hit
            .map_or(true, |hit| now.saturating_duration_since(hit) > self.current_delay);

        if window_passed {
            self.attempts = self.attempts.saturating_add(1);
            self.current_delay = (self.current_delay * FACTOR).min(self.max_delay);
        }
        self.last_hit = Some(now);

        warn!(
            delay_ms = self.current_delay.as_millis() as u64,
            attempts = self.attempts,
            "Rate limit exceeded, backing off"
        );
    }

    /// Return to the base delay.
    pub fn reset(&mut self) {
        if self.current_delay != self.base_delay {
            debug!(
                from_ms = self.current_delay.as_millis() as u64,
                to_ms = self.base_delay.as_millis() as u64,
                "Resetting rate limit backoff"
            );
        }
        self.current_delay = self.base_delay;
        self.attempts = 0;
        self.last_hit = None;
    }

    /// Remaining pause before the next send (zero when not limited).
    pub fn remaining(&self, now: Instant) -> Duration {
        match self.last_hit {
            Some(hit) => self
                .current_delay
                .saturating_sub(now.saturating_duration_since(hit)),
            None => Duration::ZERO,
        }
    }

    pub fn is_limited(&self, now: Instant) -> bool {
        !self.remaining(now).is_zero()
    }

    pub fn stats(&self) -> RateLimitStats {
        RateLimitStats {
            attempts: self.attempts,
            current_delay_ms: self.current_delay.as_millis() as u64,
        }
    }
}
