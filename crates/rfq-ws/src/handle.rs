//! Cloneable handle to a running [`ConnectionManager`](crate::ConnectionManager).
//!
//! Every mutating call is a [`Command`] sent to the manager task and
//! answered over a oneshot once the manager has applied it. Read-only
//! queries (`is_connected`, `diagnostics`) read the latest published
//! snapshot without a round trip.

use crate::connection::{ConnectionSnapshot, ConnectionState};
use crate::error::{WsError, WsResult};
use rfq_core::{AssetPair, QuoteRequest};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Request processed by the manager task.
#[derive(Debug)]
pub(crate) enum Command {
    Init {
        url: String,
        client_id: String,
        reply: oneshot::Sender<WsResult<bool>>,
    },
    UpdateUrl {
        url: String,
        reply: oneshot::Sender<WsResult<bool>>,
    },
    Close {
        reply: oneshot::Sender<()>,
    },
    Reconnect {
        reply: oneshot::Sender<WsResult<bool>>,
    },
    RequestQuote {
        request: QuoteRequest,
        reply: oneshot::Sender<WsResult<()>>,
    },
    Subscribe {
        pair: String,
        reply: oneshot::Sender<()>,
    },
    Unsubscribe {
        pair: String,
        reply: oneshot::Sender<()>,
    },
    VerifySubscriptions {
        reply: oneshot::Sender<WsResult<()>>,
    },
    SetNetworkOnline {
        online: bool,
        reply: oneshot::Sender<()>,
    },
}

/// Handle for talking to the connection manager.
///
/// All methods fail with `WsError::ManagerStopped` once the manager task
/// has exited.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    commands: mpsc::Sender<Command>,
    snapshot: watch::Receiver<ConnectionSnapshot>,
    shutdown: CancellationToken,
}

impl ConnectionHandle {
    pub(crate) fn new(
        commands: mpsc::Sender<Command>,
        snapshot: watch::Receiver<ConnectionSnapshot>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            commands,
            snapshot,
            shutdown,
        }
    }

    /// Connect to the maker at `url` as `client_id`.
    ///
    /// Returns `Ok(true)` when a connection is open or being opened,
    /// `Ok(false)` for missing parameters, and `WsError::CircuitOpen` when
    /// the circuit breaker refuses the attempt.
    pub async fn init(&self, url: &str, client_id: &str) -> WsResult<bool> {
        self.request(|reply| Command::Init {
            url: url.to_string(),
            client_id: client_id.to_string(),
            reply,
        })
        .await?
    }

    /// Switch to a new maker URL, reconnecting if a socket exists.
    pub async fn update_url(&self, url: &str) -> WsResult<bool> {
        self.request(|reply| Command::UpdateUrl {
            url: url.to_string(),
            reply,
        })
        .await?
    }

    /// Close the connection and drop queued messages and subscriptions.
    /// Calling it again is a no-op.
    pub async fn close(&self) -> WsResult<()> {
        self.request(|reply| Command::Close { reply }).await
    }

    /// Reset the reconnect budget, close, and connect again shortly after.
    pub async fn reconnect(&self) -> WsResult<bool> {
        self.request(|reply| Command::Reconnect { reply }).await?
    }

    /// Queue a quote request.
    ///
    /// # Errors
    ///
    /// - `WsError::NotConnected`: socket not open
    /// - `WsError::QueueFull`: outbound queue at capacity
    pub async fn request_quote(
        &self,
        from_asset: &str,
        to_asset: &str,
        from_amount: u64,
    ) -> WsResult<()> {
        let request = QuoteRequest::new(&AssetPair::new(from_asset, to_asset), from_amount);
        self.request(|reply| Command::RequestQuote { request, reply })
            .await?
    }

    pub async fn subscribe_pair(&self, pair: &AssetPair) -> WsResult<()> {
        self.request(|reply| Command::Subscribe {
            pair: pair.to_string(),
            reply,
        })
        .await
    }

    pub async fn unsubscribe_pair(&self, pair: &AssetPair) -> WsResult<()> {
        self.request(|reply| Command::Unsubscribe {
            pair: pair.to_string(),
            reply,
        })
        .await
    }

    /// Ask the server to confirm the subscribed pairs.
    pub async fn verify_subscriptions(&self) -> WsResult<()> {
        self.request(|reply| Command::VerifySubscriptions { reply })
            .await?
    }

    /// Feed the host's network visibility signal.
    pub async fn set_network_online(&self, online: bool) -> WsResult<()> {
        self.request(|reply| Command::SetNetworkOnline { online, reply })
            .await
    }

    pub fn is_connected(&self) -> bool {
        self.snapshot.borrow().is_connected
    }

    pub fn state(&self) -> ConnectionState {
        self.snapshot.borrow().state
    }

    /// Latest published snapshot.
    pub fn diagnostics(&self) -> ConnectionSnapshot {
        self.snapshot.borrow().clone()
    }

    /// Receiver that changes on every published snapshot.
    pub fn subscribe_snapshots(&self) -> watch::Receiver<ConnectionSnapshot> {
        self.snapshot.clone()
    }

    /// Wait until the connection is open. Returns false on timeout or if
    /// the manager stops first.
    pub async fn wait_for_connection(&self, timeout: Duration) -> bool {
        let mut snapshot = self.snapshot.clone();
        let outcome = tokio::time::timeout(timeout, snapshot.wait_for(|s| s.is_connected))
            .await
            .map(|opened| opened.is_ok());
        match outcome {
            Ok(opened) => opened,
            Err(_) => {
                debug!(timeout_ms = timeout.as_millis() as u64, "Timed out waiting for connection");
                false
            }
        }
    }

    /// Stop the manager task; the connection is closed on the way out.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> WsResult<T> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(build(reply))
            .await
            .map_err(|_| WsError::ManagerStopped)?;
        response.await.map_err(|_| WsError::ManagerStopped)
    }
}
