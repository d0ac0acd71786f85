//! Single-shot deadlines polled by the connection event loop.

use std::future::pending;
use std::time::Duration;
use tokio::time::{sleep_until, Instant};

/// An optional point in time. Disarmed deadlines never fire.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Deadline {
    at: Option<Instant>,
}

impl Deadline {
    pub fn arm_at(&mut self, at: Instant) {
        self.at = Some(at);
    }

    pub fn arm_in(&mut self, now: Instant, delay: Duration) {
        self.at = Some(now + delay);
    }

    pub fn disarm(&mut self) {
        self.at = None;
    }

    pub fn is_armed(&self) -> bool {
        self.at.is_some()
    }

    pub fn at(&self) -> Option<Instant> {
        self.at
    }

    /// Resolves when the deadline passes; pends forever when disarmed.
    ///
    /// The caller disarms (or re-arms) after it fires.
    pub async fn wait(&self) {
        match self.at {
            Some(at) => sleep_until(at).await,
            None => pending::<()>().await,
        }
    }
}
