//! Events delivered to the embedding application.

use rfq_core::{PriceUpdate, QuoteResponse};
use serde::Serialize;
use std::collections::VecDeque;
use std::fmt;
use tokio::sync::mpsc;
use tracing::warn;

/// Events held back while the consumer is behind.
pub const OVERFLOW_CAPACITY: usize = 1_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NoticeKind {
    /// Circuit breaker opened.
    ConnectionUnstable,
    /// Abnormal closure (1006).
    ConnectionLost,
    /// Server-side error closure (1011).
    ServerError,
    /// Reconnect postponed until the network is back.
    NetworkOffline,
    /// Reconnect budget spent; needs a manual reconnect.
    ReconnectExhausted,
}

impl fmt::Display for NoticeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ConnectionUnstable => write!(f, "connection_unstable"),
            Self::ConnectionLost => write!(f, "connection_lost"),
            Self::ServerError => write!(f, "server_error"),
            Self::NetworkOffline => write!(f, "network_offline"),
            Self::ReconnectExhausted => write!(f, "reconnect_exhausted"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NoticeLevel {
    Warning,
    Error,
}

/// User-facing notice (toast).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Notice {
    pub kind: NoticeKind,
    pub level: NoticeLevel,
    pub message: String,
    /// Stays until dismissed instead of auto-closing.
    pub persistent: bool,
}

impl Notice {
    pub fn for_kind(kind: NoticeKind) -> Self {
        let (level, message, persistent) = match kind {
            NoticeKind::ConnectionUnstable => (
                NoticeLevel::Warning,
                "Connection to maker is unstable. Pausing reconnection attempts.",
                false,
            ),
            NoticeKind::ConnectionLost => (
                NoticeLevel::Warning,
                "Connection to maker was lost. Attempting to reconnect...",
                false,
            ),
            NoticeKind::ServerError => (
                NoticeLevel::Error,
                "Server error detected. Attempting to reconnect...",
                false,
            ),
            NoticeKind::NetworkOffline => (
                NoticeLevel::Warning,
                "Network connection unavailable. Will reconnect when online.",
                false,
            ),
            NoticeKind::ReconnectExhausted => (
                NoticeLevel::Error,
                "Could not establish a stable connection. Please try reconnecting.",
                true,
            ),
        };
        Self {
            kind,
            level,
            message: message.to_string(),
            persistent,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SinkEvent {
    Connectivity(bool),
    Quote(QuoteResponse),
    Price(PriceUpdate),
    Subscribed(String),
    Unsubscribed(String),
    Notice(Notice),
    DismissNotice(NoticeKind),
}

impl SinkEvent {
    /// Price updates are superseded by the next one and may be dropped
    /// when the consumer falls behind. Everything else is held back.
    fn droppable(&self) -> bool {
        matches!(self, Self::Price(_))
    }
}

/// Non-blocking sender of sink events.
///
/// The event loop never waits on the consumer. When the channel is full,
/// price updates are dropped and every other event is held in an overflow
/// buffer (at most [`OVERFLOW_CAPACITY`], oldest dropped first) that the
/// manager flushes in order as the consumer catches up.
#[derive(Debug, Default)]
pub struct EventSink {
    tx: Option<mpsc::Sender<SinkEvent>>,
    connected: Option<bool>,
    overflow: VecDeque<SinkEvent>,
}

impl EventSink {
    pub fn new(tx: Option<mpsc::Sender<SinkEvent>>) -> Self {
        Self {
            tx,
            connected: None,
            overflow: VecDeque::new(),
        }
    }

    pub fn has_overflow(&self) -> bool {
        !self.overflow.is_empty()
    }

    pub fn overflow_len(&self) -> usize {
        self.overflow.len()
    }

    /// Wait for channel capacity, then move held events across.
    /// Cancel-safe: nothing is popped before a permit is in hand.
    pub async fn flush_overflow(&mut self) {
        let Some(tx) = self.tx.clone() else {
            self.overflow.clear();
            return;
        };
        match tx.reserve().await {
            Ok(permit) => {
                if let Some(event) = self.overflow.pop_front() {
                    permit.send(event);
                }
                self.drain_overflow(&tx);
            }
            Err(_) => self.overflow.clear(),
        };
    }

    fn drain_overflow(&mut self, tx: &mpsc::Sender<SinkEvent>) {
        while let Some(event) = self.overflow.pop_front() {
            match tx.try_send(event) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(event)) => {
                    self.overflow.push_front(event);
                    return;
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    self.overflow.clear();
                    return;
                }
            }
        }
    }

    fn hold(&mut self, event: SinkEvent) {
        if event.droppable() {
            warn!(?event, "Sink channel full, dropping price update");
            return;
        }
        if self.overflow.len() >= OVERFLOW_CAPACITY {
            if let Some(oldest) = self.overflow.pop_front() {
                warn!(event = ?oldest, "Sink overflow full, dropping oldest event");
            }
        }
        self.overflow.push_back(event);
    }

    /// Report connectivity; repeated identical values are suppressed.
    pub fn connectivity(&mut self, connected: bool) {
        if self.connected == Some(connected) {
            return;
        }
        self.connected = Some(connected);
        self.emit(SinkEvent::Connectivity(connected));
    }

    pub fn notice(&mut self, kind: NoticeKind) {
        self.emit(SinkEvent::Notice(Notice::for_kind(kind)));
    }

    pub fn dismiss(&mut self, kind: NoticeKind) {
        self.emit(SinkEvent::DismissNotice(kind));
    }

    pub fn emit(&mut self, event: SinkEvent) {
        let Some(tx) = self.tx.clone() else {
            return;
        };
        if self.has_overflow() {
            self.drain_overflow(&tx);
        }
        if self.has_overflow() {
            // Keep delivery order behind what is already held.
            self.hold(event);
            return;
        }
        match tx.try_send(event) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(event)) => self.hold(event),
            Err(mpsc::error::TrySendError::Closed(_)) => {}
        }
    }
}
