//! Mock maker WebSocket server for integration tests.
//!
//! Provides a server that can:
//! - Accept connections and record the request path
//! - Answer pings, subscription syncs and quote requests
//! - Drop the first connection with a 1011 close frame

use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::{accept_hdr_async, tungstenite::Message};

/// Quote rate applied to every request: `to_amount = from_amount * QUOTE_RATE`.
pub const QUOTE_RATE: u64 = 2_500;

#[derive(Debug, Default)]
struct ServerState {
    connections: u32,
    paths: Vec<String>,
    messages: VecDeque<String>,
}

/// A mock maker server for testing.
pub struct MockWsServer {
    addr: SocketAddr,
    shutdown_tx: mpsc::Sender<()>,
    state: Arc<Mutex<ServerState>>,
}

impl MockWsServer {
    /// Start a well-behaved server on an available port.
    pub async fn start() -> Self {
        Self::start_with(false).await
    }

    /// Start a server that closes the first connection with 1011.
    pub async fn start_dropping_first() -> Self {
        Self::start_with(true).await
    }

    async fn start_with(drop_first: bool) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let state = Arc::new(Mutex::new(ServerState::default()));
        let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);

        let state_clone = state.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    Ok((stream, _)) = listener.accept() => {
                        tokio::spawn(handle_connection(stream, state_clone.clone(), drop_first));
                    }
                    _ = shutdown_rx.recv() => break,
                }
            }
        });

        Self {
            addr,
            shutdown_tx,
            state,
        }
    }

    /// Maker base URL as configured by clients.
    pub fn http_url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub async fn connection_count(&self) -> u32 {
        self.state.lock().await.connections
    }

    /// Request paths of accepted connections, in order.
    pub async fn paths(&self) -> Vec<String> {
        self.state.lock().await.paths.clone()
    }

    /// All text frames received, parsed.
    pub async fn received(&self) -> Vec<Value> {
        self.state
            .lock()
            .await
            .messages
            .iter()
            .filter_map(|text| serde_json::from_str(text).ok())
            .collect()
    }

    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(()).await;
    }
}

async fn handle_connection(stream: TcpStream, state: Arc<Mutex<ServerState>>, drop_first: bool) {
    let mut path = String::new();
    let ws_stream = match accept_hdr_async(stream, |request: &Request, response: Response| {
        path = request.uri().path().to_string();
        Ok::<Response, ErrorResponse>(response)
    })
    .await
    {
        Ok(ws) => ws,
        Err(e) => {
            eprintln!("WebSocket handshake failed: {}", e);
            return;
        }
    };

    let connection_number = {
        let mut state = state.lock().await;
        state.connections += 1;
        state.paths.push(path);
        state.connections
    };

    let (mut write, mut read) = ws_stream.split();

    if drop_first && connection_number == 1 {
        let frame = CloseFrame {
            code: CloseCode::Error,
            reason: "restarting".into(),
        };
        let _ = write.send(Message::Close(Some(frame))).await;
        return;
    }

    while let Some(msg) = read.next().await {
        match msg {
            Ok(Message::Text(text)) => {
                state.lock().await.messages.push_back(text.clone());

                if let Some(reply) = reply_for(&text) {
                    let _ = write.send(Message::Text(reply.to_string())).await;
                }
            }
            Ok(Message::Ping(data)) => {
                let _ = write.send(Message::Pong(data)).await;
            }
            Ok(Message::Close(_)) => break,
            Err(_) => break,
            _ => {}
        }
    }
}

fn reply_for(text: &str) -> Option<Value> {
    let frame: Value = serde_json::from_str(text).ok()?;
    match frame.get("action")?.as_str()? {
        "ping" => Some(json!({ "action": "pong" })),
        "subscribe" => Some(json!({ "action": "subscribed", "pair": frame.get("pair") })),
        "sync_subscriptions" => Some(json!({
            "action": "sync_result",
            "success": true,
            "subscribed_pairs": frame.get("pairs").cloned().unwrap_or_else(|| json!([])),
        })),
        "quote_request" => {
            let amount = frame.get("from_amount")?.as_u64()?;
            Some(json!({
                "action": "quote_response",
                "data": {
                    "from_asset": frame.get("from_asset"),
                    "to_asset": frame.get("to_asset"),
                    "from_amount": amount,
                    "to_amount": amount * QUOTE_RATE,
                    "rfq_id": format!("rfq-{amount}"),
                }
            }))
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mock_server_starts() {
        let server = MockWsServer::start().await;
        assert!(server.http_url().starts_with("http://127.0.0.1:"));
        server.shutdown().await;
    }

    #[test]
    fn test_quote_reply() {
        let reply = reply_for(
            r#"{"action":"quote_request","from_asset":"BTC","to_asset":"USD","from_amount":2}"#,
        )
        .unwrap();
        assert_eq!(reply["data"]["to_amount"], json!(5_000));
    }
}
