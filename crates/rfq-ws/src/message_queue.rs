//! Priority-ordered, rate-adaptive outbound message queue.
//!
//! Messages are kept strictly descending by priority, FIFO within a
//! priority. At most one `quote_request` per asset pair is queued: a newer
//! request for the same pair overwrites the queued payload in place so the
//! maker always receives the latest amount.
//!
//! Pacing adapts to the connection health signal: an unhealthy connection
//! stretches the send interval by 1.5x (capped), a healthy one decays it
//! back toward the floor by 0.9x.

use crate::backoff::add_jitter;
use crate::config::ConnectionConfig;
use crate::error::{WsError, WsResult};
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::VecDeque;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Action name of quote requests, which are deduplicated per pair.
pub const QUOTE_REQUEST_ACTION: &str = "quote_request";

/// Subscribe/unsubscribe traffic.
pub const PRIORITY_SUBSCRIPTION: i32 = 2;
/// Quote requests: above routine traffic, below control frames.
pub const PRIORITY_QUOTE: i32 = 3;
/// Connection-management control frames (subscription sync).
pub const PRIORITY_CONTROL: i32 = 5;
/// Messages at or above this priority are retried after a failed send.
pub const RETRY_PRIORITY_THRESHOLD: i32 = 3;
/// Retries never escalate beyond this.
pub const MAX_PRIORITY: i32 = 10;

const GROWTH_FACTOR: f64 = 1.5;
const DECAY_FACTOR: f64 = 0.9;
const MIN_TICK: Duration = Duration::from_millis(10);
const UNHEALTHY_JITTER: f64 = 0.3;

/// A message waiting to be sent.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueuedMessage {
    pub action: String,
    pub payload: Map<String, Value>,
    pub priority: i32,
    #[serde(skip)]
    pub enqueued_at: Instant,
}

impl QueuedMessage {
    pub fn new(action: impl Into<String>, payload: Map<String, Value>, priority: i32) -> Self {
        Self {
            action: action.into(),
            payload,
            priority,
            enqueued_at: Instant::now(),
        }
    }

    /// Pair key for `quote_request` deduplication.
    pub fn dedup_key(&self) -> Option<(&str, &str)> {
        if self.action != QUOTE_REQUEST_ACTION {
            return None;
        }
        let from = self.payload.get("from_asset")?.as_str()?;
        let to = self.payload.get("to_asset")?.as_str()?;
        Some((from, to))
    }

    /// Serialize as `{"action": .., ..payload}`.
    pub fn to_frame(&self) -> WsResult<String> {
        let mut frame = Map::with_capacity(self.payload.len() + 1);
        frame.insert("action".to_string(), Value::from(self.action.clone()));
        for (key, value) in &self.payload {
            if key != "action" {
                frame.insert(key.clone(), value.clone());
            }
        }
        Ok(serde_json::to_string(&Value::Object(frame))?)
    }
}

/// Why an enqueue was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueRejection {
    NotConnected,
    Full { capacity: usize },
}

impl From<QueueRejection> for WsError {
    fn from(rejection: QueueRejection) -> Self {
        match rejection {
            QueueRejection::NotConnected => WsError::NotConnected,
            QueueRejection::Full { capacity } => WsError::QueueFull { capacity },
        }
    }
}

/// Accepted enqueue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    /// New entry inserted.
    Queued,
    /// Existing entry for the same pair overwritten in place.
    Replaced,
}

/// What happened to a message whose send failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryOutcome {
    /// Re-queued with the given (escalated) priority.
    Requeued { priority: i32 },
    /// Low priority; discarded.
    Dropped,
    /// A newer request for the same pair is already queued.
    Superseded,
    /// Could not be re-queued (disconnected or full).
    Rejected(QueueRejection),
}

/// Outbound buffer with adaptive pacing.
#[derive(Debug)]
pub struct MessageQueue {
    capacity: usize,
    messages: VecDeque<QueuedMessage>,
    base_interval: Duration,
    min_interval: Duration,
    max_interval: Duration,
    process_interval: Duration,
    last_sent_at: Option<Instant>,
}

impl MessageQueue {
    pub fn new(
        capacity: usize,
        base_interval: Duration,
        min_interval: Duration,
        max_interval: Duration,
    ) -> Self {
        Self {
            capacity,
            messages: VecDeque::with_capacity(capacity),
            base_interval,
            min_interval,
            max_interval,
            process_interval: base_interval,
            last_sent_at: None,
        }
    }

    pub fn from_config(config: &ConnectionConfig) -> Self {
        Self::new(
            config.queue_capacity,
            Duration::from_millis(config.queue_base_interval_ms),
            Duration::from_millis(config.queue_min_interval_ms),
            Duration::from_millis(config.queue_max_interval_ms),
        )
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn process_interval(&self) -> Duration {
        self.process_interval
    }

    /// Queued messages in send order.
    pub fn iter(&self) -> impl Iterator<Item = &QueuedMessage> {
        self.messages.iter()
    }

    /// Add a message.
    ///
    /// A `quote_request` for a pair already queued replaces that entry's
    /// payload without moving it, and is accepted even at capacity.
    pub fn enqueue(
        &mut self,
        message: QueuedMessage,
        connected: bool,
    ) -> Result<EnqueueOutcome, QueueRejection> {
        if !connected {
            debug!(action = %message.action, "Not queuing message, socket not connected");
            return Err(QueueRejection::NotConnected);
        }

        if let Some(existing) = self.find_same_pair_mut(&message) {
            existing.payload = message.payload;
            existing.enqueued_at = message.enqueued_at;
            debug!(action = %existing.action, "Replaced queued request for same pair");
            return Ok(EnqueueOutcome::Replaced);
        }

        if self.messages.len() >= self.capacity {
            warn!(
                action = %message.action,
                capacity = self.capacity,
                "Message queue full, dropping message"
            );
            return Err(QueueRejection::Full {
                capacity: self.capacity,
            });
        }

        let position = self
            .messages
            .partition_point(|queued| queued.priority >= message.priority);
        self.messages.insert(position, message);
        Ok(EnqueueOutcome::Queued)
    }

    /// Whether the pacing interval has elapsed since the last send.
    pub fn is_ready(&self, now: Instant) -> bool {
        self.last_sent_at
            .map_or(true, |sent| now.saturating_duration_since(sent) >= self.process_interval)
    }

    /// Pop the highest-priority message if the pacing interval allows.
    pub fn pop_ready(&mut self, now: Instant) -> Option<QueuedMessage> {
        if !self.is_ready(now) {
            return None;
        }
        self.messages.pop_front()
    }

    /// Record a successful send and adapt the interval.
    pub fn record_sent(&mut self, now: Instant, healthy: bool) {
        self.last_sent_at = Some(now);

        if !healthy {
            let grown = self.process_interval.mul_f64(GROWTH_FACTOR);
            self.process_interval = grown.min(self.max_interval);
            debug!(
                interval_ms = self.process_interval.as_millis() as u64,
                "Increasing message interval due to poor connection health"
            );
        } else if self.process_interval > self.min_interval {
            let decayed = self.process_interval.mul_f64(DECAY_FACTOR);
            self.process_interval = decayed.max(self.min_interval);
        }
    }

    /// Handle a message whose send failed.
    ///
    /// Messages with priority >= 3 are re-queued one priority higher so
    /// important requests are not lost on a transient error; lower
    /// priorities are dropped.
    pub fn requeue_failed(&mut self, mut message: QueuedMessage, connected: bool) -> RetryOutcome {
        if message.priority < RETRY_PRIORITY_THRESHOLD {
            return RetryOutcome::Dropped;
        }

        // Never overwrite a newer request with the one that just failed.
        if self.find_same_pair_mut(&message).is_some() {
            return RetryOutcome::Superseded;
        }

        message.priority = (message.priority + 1).min(MAX_PRIORITY);
        let priority = message.priority;
        match self.enqueue(message, connected) {
            Ok(_) => RetryOutcome::Requeued { priority },
            Err(rejection) => RetryOutcome::Rejected(rejection),
        }
    }

    /// Delay until the next drain tick.
    pub fn next_delay(&self, now: Instant, healthy: bool) -> Duration {
        if healthy {
            let since_last = self
                .last_sent_at
                .map_or(self.process_interval, |sent| now.saturating_duration_since(sent));
            self.process_interval
                .saturating_sub(since_last)
                .max(MIN_TICK)
        } else {
            add_jitter(self.process_interval, UNHEALTHY_JITTER)
        }
    }

    /// Restore the base interval (called on every successful open).
    pub fn reset_interval(&mut self) {
        self.process_interval = self.base_interval;
        self.last_sent_at = None;
    }

    /// Drop all queued messages.
    pub fn clear(&mut self) {
        self.messages.clear();
    }

    fn find_same_pair_mut(&mut self, message: &QueuedMessage) -> Option<&mut QueuedMessage> {
        let (from, to) = message.dedup_key()?;
        self.messages
            .iter_mut()
            .find(|queued| queued.dedup_key() == Some((from, to)))
    }
}
