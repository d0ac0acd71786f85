//! Socket transport.
//!
//! A [`Connector`] opens one socket per connection attempt and reports
//! everything that happens to it as [`SocketEvent`]s on the manager's
//! single event channel. Every event is tagged with the socket id so the
//! manager can ignore events from sockets it has already abandoned.

use crate::error::{WsError, WsResult};
use futures_util::{SinkExt, StreamExt};
use std::borrow::Cow;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

/// Identifies one socket (one connection attempt).
pub type SocketId = u64;

/// Normal closure.
pub const CLOSE_NORMAL: u16 = 1000;
/// Closed without a close frame (network loss, refused connection).
pub const CLOSE_ABNORMAL: u16 = 1006;
/// Server hit an internal error.
pub const CLOSE_SERVER_ERROR: u16 = 1011;

/// Upper bound on the TCP/TLS/WebSocket handshake.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Path appended to the maker base URL.
pub const MARKET_WS_PATH: &str = "/api/v1/market/ws";

/// Lifecycle event of a socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SocketEvent {
    Opened,
    Message(String),
    Errored(String),
    /// `clean` is true when the close handshake completed.
    Closed {
        code: u16,
        reason: String,
        clean: bool,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaggedEvent {
    pub socket: SocketId,
    pub event: SocketEvent,
}

pub type EventSender = mpsc::UnboundedSender<TaggedEvent>;

/// Frame to write on a socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WsOutbound {
    Text(String),
    Close { code: u16, reason: String },
}

/// Write side of an open (or opening) socket.
#[derive(Debug, Clone)]
pub struct SocketHandle {
    id: SocketId,
    tx: mpsc::UnboundedSender<WsOutbound>,
}

impl SocketHandle {
    pub fn new(id: SocketId, tx: mpsc::UnboundedSender<WsOutbound>) -> Self {
        Self { id, tx }
    }

    pub fn id(&self) -> SocketId {
        self.id
    }

    pub fn send_text(&self, text: String) -> WsResult<()> {
        self.tx
            .send(WsOutbound::Text(text))
            .map_err(|_| WsError::SendFailed("socket writer gone".to_string()))
    }

    /// Request a close. Errors are ignored: a socket whose writer is gone
    /// is already closed.
    pub fn close(&self, code: u16, reason: &str) {
        let _ = self.tx.send(WsOutbound::Close {
            code,
            reason: reason.to_string(),
        });
    }
}

/// Opens sockets for the connection manager.
pub trait Connector: Send + Sync + 'static {
    /// Start connecting to `url`. Must not block: the outcome is reported
    /// through `events` (`Opened`, or `Errored` followed by `Closed`).
    fn connect(&self, url: &str, id: SocketId, events: EventSender) -> SocketHandle;
}

/// Trim trailing slashes and map `http(s)` to `ws(s)`.
pub fn normalize_url(url: &str) -> String {
    let trimmed = url.trim().trim_end_matches('/');
    if let Some(rest) = trimmed.strip_prefix("http") {
        format!("ws{rest}")
    } else {
        trimmed.to_string()
    }
}

/// Full socket URL for a maker base URL and client id.
pub fn build_transport_url(url: &str, client_id: &str) -> String {
    format!("{}{}/{}", normalize_url(url), MARKET_WS_PATH, client_id)
}

// ============================================================================
// tokio-tungstenite connector
// ============================================================================

/// Production connector backed by `tokio-tungstenite`.
#[derive(Debug, Default, Clone)]
pub struct TungsteniteConnector;

impl Connector for TungsteniteConnector {
    fn connect(&self, url: &str, id: SocketId, events: EventSender) -> SocketHandle {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(run_socket(url.to_string(), id, events, rx, CONNECT_TIMEOUT));
        SocketHandle::new(id, tx)
    }
}

async fn run_socket(
    url: String,
    id: SocketId,
    events: EventSender,
    mut outbound: mpsc::UnboundedReceiver<WsOutbound>,
    connect_timeout: Duration,
) {
    let emit = |event: SocketEvent| {
        let _ = events.send(TaggedEvent { socket: id, event });
    };
    let abnormal = |reason: &str| SocketEvent::Closed {
        code: CLOSE_ABNORMAL,
        reason: reason.to_string(),
        clean: false,
    };

    info!(socket = id, url = %url, "Connecting to maker WebSocket");
    let ws_stream = match tokio::time::timeout(connect_timeout, connect_async(url.as_str())).await
    {
        Ok(Ok((stream, _response))) => stream,
        Ok(Err(e)) => {
            warn!(socket = id, error = %e, "WebSocket connect failed");
            emit(SocketEvent::Errored(e.to_string()));
            emit(abnormal("connect failed"));
            return;
        }
        Err(_) => {
            warn!(
                socket = id,
                timeout_ms = connect_timeout.as_millis() as u64,
                "WebSocket connect timed out"
            );
            emit(SocketEvent::Errored("connect timed out".to_string()));
            emit(abnormal("connect timed out"));
            return;
        }
    };
    emit(SocketEvent::Opened);

    let (mut write, mut read) = ws_stream.split();

    loop {
        tokio::select! {
            frame = outbound.recv() => match frame {
                Some(WsOutbound::Text(text)) => {
                    if let Err(e) = write.send(Message::Text(text)).await {
                        warn!(socket = id, error = %e, "WebSocket write failed");
                        emit(SocketEvent::Errored(e.to_string()));
                        emit(abnormal("write failed"));
                        return;
                    }
                }
                Some(WsOutbound::Close { code, reason }) => {
                    let frame = CloseFrame {
                        code: CloseCode::from(code),
                        reason: Cow::Owned(reason.clone()),
                    };
                    if let Err(e) = write.send(Message::Close(Some(frame))).await {
                        debug!(socket = id, error = %e, "Close frame not delivered");
                    }
                    emit(SocketEvent::Closed { code, reason, clean: true });
                    return;
                }
                None => {
                    // Manager dropped the handle; nobody listens any more.
                    let _ = write.send(Message::Close(None)).await;
                    return;
                }
            },
            msg = read.next() => match msg {
                Some(Ok(Message::Text(text))) => emit(SocketEvent::Message(text)),
                Some(Ok(Message::Ping(data))) => {
                    if let Err(e) = write.send(Message::Pong(data)).await {
                        debug!(socket = id, error = %e, "Failed to answer ping");
                    }
                }
                Some(Ok(Message::Close(frame))) => {
                    let (code, reason) = frame
                        .map(|f| (u16::from(f.code), f.reason.to_string()))
                        .unwrap_or((CLOSE_NORMAL, String::new()));
                    info!(socket = id, code, reason = %reason, "WebSocket closed by server");
                    emit(SocketEvent::Closed { code, reason, clean: true });
                    return;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    warn!(socket = id, error = %e, "WebSocket read error");
                    emit(SocketEvent::Errored(e.to_string()));
                    emit(abnormal("read error"));
                    return;
                }
                None => {
                    warn!(socket = id, "WebSocket stream ended");
                    emit(abnormal("stream ended"));
                    return;
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_url() {
        assert_eq!(normalize_url("http://maker.example///"), "ws://maker.example");
        assert_eq!(normalize_url("https://maker.example/"), "wss://maker.example");
        assert_eq!(normalize_url("wss://maker.example"), "wss://maker.example");
    }

    #[test]
    fn test_build_transport_url() {
        assert_eq!(
            build_transport_url("https://maker.example/", "client-1"),
            "wss://maker.example/api/v1/market/ws/client-1"
        );
    }

    #[tokio::test]
    async fn test_stalled_handshake_times_out() {
        // Accepts TCP but never answers the upgrade request.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}/stall", listener.local_addr().unwrap());

        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let (_outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        tokio::time::timeout(
            Duration::from_secs(5),
            run_socket(url, 3, events_tx, outbound_rx, Duration::from_millis(100)),
        )
        .await
        .expect("connect should give up");

        assert_eq!(
            events_rx.recv().await.unwrap(),
            TaggedEvent {
                socket: 3,
                event: SocketEvent::Errored("connect timed out".to_string()),
            }
        );
        assert_eq!(
            events_rx.recv().await.unwrap().event,
            SocketEvent::Closed {
                code: CLOSE_ABNORMAL,
                reason: "connect timed out".to_string(),
                clean: false,
            }
        );
        drop(listener);
    }

    #[test]
    fn test_socket_handle_send_after_drop() {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = SocketHandle::new(7, tx);
        drop(rx);

        assert_eq!(handle.id(), 7);
        assert!(matches!(
            handle.send_text("x".to_string()),
            Err(WsError::SendFailed(_))
        ));
        handle.close(CLOSE_NORMAL, "bye");
    }
}
