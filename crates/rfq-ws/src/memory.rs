//! In-memory connector for driving the connection manager in tests.
//!
//! Sockets are recorded in the order they were opened. The test plays
//! the server: it opens sockets, pushes frames, raises errors and closes,
//! and inspects what the manager wrote.

use crate::transport::{
    Connector, EventSender, SocketEvent, SocketHandle, SocketId, TaggedEvent, WsOutbound,
};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::mpsc;

#[derive(Debug)]
struct MemorySocket {
    id: SocketId,
    url: String,
    events: EventSender,
    outbound: mpsc::UnboundedReceiver<WsOutbound>,
    sent: Vec<String>,
    close_frame: Option<(u16, String)>,
}

impl MemorySocket {
    fn drain_outbound(&mut self) {
        while let Ok(frame) = self.outbound.try_recv() {
            match frame {
                WsOutbound::Text(text) => self.sent.push(text),
                WsOutbound::Close { code, reason } => {
                    self.close_frame.get_or_insert((code, reason));
                }
            }
        }
    }

    fn emit(&self, event: SocketEvent) {
        let _ = self.events.send(TaggedEvent {
            socket: self.id,
            event,
        });
    }
}

#[derive(Debug, Default)]
struct Inner {
    sockets: Vec<MemorySocket>,
    auto_open: bool,
}

/// Cloneable handle to the shared socket list.
#[derive(Debug, Clone, Default)]
pub struct MemoryConnector {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Report `Opened` as soon as a socket is created.
    pub fn with_auto_open(self) -> Self {
        self.inner.lock().auto_open = true;
        self
    }

    pub fn socket_count(&self) -> usize {
        self.inner.lock().sockets.len()
    }

    pub fn url(&self, index: usize) -> Option<String> {
        self.inner.lock().sockets.get(index).map(|s| s.url.clone())
    }

    pub fn open(&self, index: usize) {
        self.emit(index, SocketEvent::Opened);
    }

    pub fn push(&self, index: usize, text: impl Into<String>) {
        self.emit(index, SocketEvent::Message(text.into()));
    }

    pub fn error(&self, index: usize, message: impl Into<String>) {
        self.emit(index, SocketEvent::Errored(message.into()));
    }

    pub fn server_close(&self, index: usize, code: u16, clean: bool) {
        self.emit(
            index,
            SocketEvent::Closed {
                code,
                reason: String::new(),
                clean,
            },
        );
    }

    /// Text frames written by the manager on this socket so far.
    pub fn sent(&self, index: usize) -> Vec<String> {
        let mut inner = self.inner.lock();
        match inner.sockets.get_mut(index) {
            Some(socket) => {
                socket.drain_outbound();
                socket.sent.clone()
            }
            None => Vec::new(),
        }
    }

    /// Close frame requested by the manager, if any.
    pub fn close_frame(&self, index: usize) -> Option<(u16, String)> {
        let mut inner = self.inner.lock();
        let socket = inner.sockets.get_mut(index)?;
        socket.drain_outbound();
        socket.close_frame.clone()
    }

    fn emit(&self, index: usize, event: SocketEvent) {
        if let Some(socket) = self.inner.lock().sockets.get(index) {
            socket.emit(event);
        }
    }
}

impl Connector for MemoryConnector {
    fn connect(&self, url: &str, id: SocketId, events: EventSender) -> SocketHandle {
        let (tx, rx) = mpsc::unbounded_channel();
        let socket = MemorySocket {
            id,
            url: url.to_string(),
            events,
            outbound: rx,
            sent: Vec::new(),
            close_frame: None,
        };

        let mut inner = self.inner.lock();
        if inner.auto_open {
            socket.emit(SocketEvent::Opened);
        }
        inner.sockets.push(socket);

        SocketHandle::new(id, tx)
    }
}
