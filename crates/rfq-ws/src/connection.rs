//! Connection manager for the maker WebSocket.
//!
//! One task owns the socket and every component (breaker, stability
//! tracker, heartbeat, queue, subscriptions). Callers talk to it through a
//! [`ConnectionHandle`]; the task publishes a [`ConnectionSnapshot`] after
//! every step.
//!
//! # Lifecycle
//! ```text
//! Disconnected → Connecting: init / reconnect timer (breaker permitting)
//! Connecting   → Open:       socket opened
//! Open         → Disconnected: error, abnormal close, heartbeat loss, offline
//! any          → Closing → Disconnected: close()
//! ```

use crate::backoff::reconnect_delay;
use crate::circuit_breaker::{BreakerTransition, CircuitBreaker, CircuitBreakerState};
use crate::config::ConnectionConfig;
use crate::error::{WsError, WsResult};
use crate::handle::{Command, ConnectionHandle};
use crate::heartbeat::{HeartbeatAction, HeartbeatMonitor, HeartbeatStats, RecoveryOutcome};
use crate::message::{
    pair_payload, ping_frame, quote_payload, sync_payload, sync_subscriptions_frame, Inbound,
    InboundFrame, ACTION_SUBSCRIBE, ACTION_SYNC_SUBSCRIPTIONS, ACTION_UNSUBSCRIBE,
};
use crate::message_queue::{
    EnqueueOutcome, MessageQueue, QueueRejection, QueuedMessage, RetryOutcome, PRIORITY_CONTROL,
    PRIORITY_QUOTE, PRIORITY_SUBSCRIPTION, QUOTE_REQUEST_ACTION,
};
use crate::rate_limiter::{RateLimitBackoff, RateLimitStats};
use crate::sink::{EventSink, NoticeKind, SinkEvent};
use crate::stability::{MessageHealth, StabilityMetrics, StabilityTracker};
use crate::subscription::SubscriptionManager;
use crate::timer::Deadline;
use crate::transport::{
    build_transport_url, Connector, EventSender, SocketEvent, SocketHandle, SocketId,
    TaggedEvent, CLOSE_ABNORMAL, CLOSE_NORMAL, CLOSE_SERVER_ERROR,
};
use chrono::{DateTime, Utc};
use rfq_core::QuoteRequest;
use serde::Serialize;
use serde_json::{Map, Value};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const COMMAND_BUFFER: usize = 64;
/// Pause between the teardown and the new connect of a manual reconnect.
const MANUAL_RECONNECT_DELAY: Duration = Duration::from_millis(100);

/// Connection state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Open,
    Closing,
}

impl ConnectionState {
    /// Numeric encoding for gauges.
    pub fn as_gauge(&self) -> f64 {
        match self {
            Self::Disconnected => 0.0,
            Self::Connecting => 1.0,
            Self::Open => 2.0,
            Self::Closing => 3.0,
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disconnected => write!(f, "disconnected"),
            Self::Connecting => write!(f, "connecting"),
            Self::Open => write!(f, "open"),
            Self::Closing => write!(f, "closing"),
        }
    }
}

/// Why the last connection was lost.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DisconnectReason {
    SocketError,
    AbnormalClose,
    ServerClose,
    HeartbeatLost,
    NetworkOffline,
}

impl DisconnectReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SocketError => "socket_error",
            Self::AbnormalClose => "abnormal_close",
            Self::ServerClose => "server_close",
            Self::HeartbeatLost => "heartbeat_lost",
            Self::NetworkOffline => "network_offline",
        }
    }
}

/// Immutable view of the manager, republished after every event.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ConnectionSnapshot {
    pub state: ConnectionState,
    pub is_connected: bool,
    pub connection_initialized: bool,
    pub network_online: bool,
    pub url: Option<String>,
    /// Sockets opened since start.
    pub connection_attempts: u64,
    pub reconnect_attempts: u32,
    /// Reconnects scheduled since start.
    pub reconnects_scheduled: u64,
    pub last_disconnect_reason: Option<DisconnectReason>,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub last_successful_connection: Option<DateTime<Utc>>,
    pub queued_messages: usize,
    pub queue_interval_ms: u64,
    pub subscribed_pairs: Vec<String>,
    pub circuit_breaker_state: CircuitBreakerState,
    pub stability: StabilityMetrics,
    pub message_health: MessageHealth,
    pub heartbeat: HeartbeatStats,
    pub rate_limit: RateLimitStats,
}

/// Owns the connection and all of its state.
pub struct ConnectionManager {
    config: ConnectionConfig,
    connector: Arc<dyn Connector>,
    commands: mpsc::Receiver<Command>,
    events_tx: EventSender,
    events_rx: mpsc::UnboundedReceiver<TaggedEvent>,
    snapshot_tx: watch::Sender<ConnectionSnapshot>,
    shutdown: CancellationToken,
    sink: EventSink,

    state: ConnectionState,
    url: Option<String>,
    client_id: Option<String>,
    initialized: bool,
    network_online: bool,
    socket: Option<SocketHandle>,
    next_socket_id: SocketId,
    connect_started_at: Option<Instant>,
    last_successful_connection: Option<DateTime<Utc>>,
    connection_attempts: u64,
    reconnect_attempts: u32,
    reconnecting: bool,
    reconnects_scheduled: u64,
    last_disconnect_reason: Option<DisconnectReason>,

    breaker: CircuitBreaker,
    stability: StabilityTracker,
    heartbeat: HeartbeatMonitor,
    queue: MessageQueue,
    rate_limit: RateLimitBackoff,
    subscriptions: SubscriptionManager,

    heartbeat_timer: Deadline,
    recovery_timer: Deadline,
    drain_timer: Deadline,
    reconnect_timer: Deadline,
    stability_timer: Deadline,
    settle_timer: Deadline,
    sync_retry_timer: Deadline,
    manual_reconnect_timer: Deadline,
}

impl ConnectionManager {
    /// Build a manager and its handle. Nothing connects until `init`.
    pub fn new<C: Connector>(
        config: ConnectionConfig,
        connector: C,
        sink: Option<mpsc::Sender<SinkEvent>>,
    ) -> WsResult<(Self, ConnectionHandle)> {
        config.validate()?;

        let now = Instant::now();
        let (commands_tx, commands_rx) = mpsc::channel(COMMAND_BUFFER);
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (snapshot_tx, snapshot_rx) = watch::channel(ConnectionSnapshot::default());
        let shutdown = CancellationToken::new();

        let manager = Self {
            breaker: CircuitBreaker::from_config(&config),
            stability: StabilityTracker::new(now),
            heartbeat: HeartbeatMonitor::from_config(&config, now),
            queue: MessageQueue::from_config(&config),
            rate_limit: RateLimitBackoff::default(),
            subscriptions: SubscriptionManager::new(),
            config,
            connector: Arc::new(connector),
            commands: commands_rx,
            events_tx,
            events_rx,
            snapshot_tx,
            shutdown: shutdown.clone(),
            sink: EventSink::new(sink),
            state: ConnectionState::Disconnected,
            url: None,
            client_id: None,
            initialized: false,
            network_online: true,
            socket: None,
            next_socket_id: 1,
            connect_started_at: None,
            last_successful_connection: None,
            connection_attempts: 0,
            reconnect_attempts: 0,
            reconnecting: false,
            reconnects_scheduled: 0,
            last_disconnect_reason: None,
            heartbeat_timer: Deadline::default(),
            recovery_timer: Deadline::default(),
            drain_timer: Deadline::default(),
            reconnect_timer: Deadline::default(),
            stability_timer: Deadline::default(),
            settle_timer: Deadline::default(),
            sync_retry_timer: Deadline::default(),
            manual_reconnect_timer: Deadline::default(),
        };
        manager.publish();

        let handle = ConnectionHandle::new(commands_tx, snapshot_rx, shutdown);
        Ok((manager, handle))
    }

    /// Build a manager and run it on a new task.
    ///
    /// Events go to `sink` without blocking the loop. If the consumer falls
    /// behind, price updates are dropped and other events are held (up to
    /// `sink::OVERFLOW_CAPACITY`) until the channel has room.
    pub fn spawn<C: Connector>(
        config: ConnectionConfig,
        connector: C,
        sink: Option<mpsc::Sender<SinkEvent>>,
    ) -> WsResult<(ConnectionHandle, JoinHandle<()>)> {
        let (manager, handle) = Self::new(config, connector, sink)?;
        let task = tokio::spawn(manager.run());
        Ok((handle, task))
    }

    /// Event loop. Returns on shutdown or when every handle is dropped.
    pub async fn run(mut self) {
        info!("Connection manager started");
        self.publish();

        loop {
            tokio::select! {
                biased;

                () = self.shutdown.cancelled() => {
                    info!("Shutdown signal received, closing connection");
                    self.close(Instant::now());
                    self.publish();
                    break;
                }

                command = self.commands.recv() => match command {
                    Some(command) => self.handle_command(command),
                    None => {
                        info!("All connection handles dropped, closing connection");
                        self.close(Instant::now());
                        self.publish();
                        break;
                    }
                },

                Some(tagged) = self.events_rx.recv() => self.handle_socket_event(tagged),

                () = self.heartbeat_timer.wait() => self.on_heartbeat_tick(Instant::now()),
                () = self.recovery_timer.wait() => self.on_recovery_check(Instant::now()),
                () = self.drain_timer.wait() => self.on_drain_tick(Instant::now()),
                () = self.reconnect_timer.wait() => self.on_reconnect_due(Instant::now()),
                () = self.stability_timer.wait() => self.on_stability_tick(Instant::now()),
                () = self.settle_timer.wait() => self.on_network_settled(Instant::now()),
                () = self.sync_retry_timer.wait() => self.on_sync_retry(Instant::now()),
                () = self.manual_reconnect_timer.wait() => self.on_manual_reconnect(Instant::now()),

                () = self.sink.flush_overflow(), if self.sink.has_overflow() => {}
            }

            self.publish();
        }

        info!("Connection manager stopped");
    }

    // ========================================================================
    // Commands
    // ========================================================================

    fn handle_command(&mut self, command: Command) {
        let now = Instant::now();
        match command {
            Command::Init {
                url,
                client_id,
                reply,
            } => {
                let _ = reply.send(self.init(now, &url, &client_id));
            }
            Command::UpdateUrl { url, reply } => {
                let _ = reply.send(self.update_url(now, &url));
            }
            Command::Close { reply } => {
                self.close(now);
                let _ = reply.send(());
            }
            Command::Reconnect { reply } => {
                let _ = reply.send(self.reconnect(now));
            }
            Command::RequestQuote { request, reply } => {
                let _ = reply.send(self.request_quote(now, &request));
            }
            Command::Subscribe { pair, reply } => {
                self.subscribe_pair(now, &pair);
                let _ = reply.send(());
            }
            Command::Unsubscribe { pair, reply } => {
                self.unsubscribe_pair(now, &pair);
                let _ = reply.send(());
            }
            Command::VerifySubscriptions { reply } => {
                let _ = reply.send(self.verify_subscriptions(now));
            }
            Command::SetNetworkOnline { online, reply } => {
                self.set_network_online(now, online);
                let _ = reply.send(());
            }
        }
    }

    fn init(&mut self, now: Instant, url: &str, client_id: &str) -> WsResult<bool> {
        let clean_url = url.trim().trim_end_matches('/').to_string();
        if clean_url.is_empty() {
            error!("init: no URL provided");
            return Ok(false);
        }
        if client_id.trim().is_empty() {
            error!("init: no client id provided");
            return Ok(false);
        }

        if self.initialized
            && self.url.as_deref() == Some(clean_url.as_str())
            && self.state == ConnectionState::Open
        {
            info!(url = %clean_url, "Already connected to the same URL, skipping init");
            return Ok(true);
        }

        if self.url.as_deref() != Some(clean_url.as_str()) && self.socket.is_some() {
            info!(
                from = ?self.url,
                to = %clean_url,
                "Switching maker URL"
            );
            self.close(now);
        }

        self.url = Some(clean_url);
        self.client_id = Some(client_id.trim().to_string());
        self.initialized = true;

        self.connect_or_defer(now)
    }

    fn update_url(&mut self, now: Instant, url: &str) -> WsResult<bool> {
        let clean_url = url.trim().trim_end_matches('/').to_string();
        if clean_url.is_empty() {
            error!("update_url: no URL provided");
            return Ok(false);
        }

        if self.url.as_deref() != Some(clean_url.as_str()) {
            info!(from = ?self.url, to = %clean_url, "Updating maker URL");
            self.url = Some(clean_url);
            self.reconnect_attempts = 0;
            self.stability.set_reconnect_attempts(0);

            if self.socket.is_some() {
                self.close(now);
                self.initialized = true;
                return self.connect_or_defer(now);
            }
        }

        Ok(self.is_open())
    }

    /// Open a socket if the breaker allows it.
    fn connect(&mut self, now: Instant) -> WsResult<bool> {
        if self.url.is_none() || self.client_id.is_none() {
            error!("connect: URL or client id not set");
            self.initialized = false;
            return Ok(false);
        }

        if self.state == ConnectionState::Connecting && self.socket.is_some() {
            info!("Connection already in progress");
            return Ok(true);
        }

        if !self.breaker.can_attempt(now) {
            let retry_after = self.breaker.retry_after(now);
            warn!(
                retry_after_ms = retry_after.as_millis() as u64,
                "Circuit breaker open, refusing connection attempt"
            );
            return Err(WsError::CircuitOpen {
                retry_after_ms: retry_after.as_millis() as u64,
            });
        }

        self.open_socket(now);
        Ok(true)
    }

    /// `connect`, but a breaker refusal also schedules the attempt for
    /// when a trial is allowed. The refusal is still returned.
    fn connect_or_defer(&mut self, now: Instant) -> WsResult<bool> {
        let result = self.connect(now);
        if let Err(WsError::CircuitOpen { retry_after_ms }) = &result {
            self.reconnecting = true;
            self.reconnect_timer
                .arm_in(now, Duration::from_millis(*retry_after_ms));
        }
        result
    }

    fn open_socket(&mut self, now: Instant) {
        let (Some(url), Some(client_id)) = (self.url.as_deref(), self.client_id.as_deref()) else {
            return;
        };
        let transport_url = build_transport_url(url, client_id);

        if let Some(old) = self.socket.take() {
            old.close(CLOSE_NORMAL, "Reconnecting");
        }

        let id = self.next_socket_id;
        self.next_socket_id += 1;
        self.connection_attempts += 1;
        self.connect_started_at = Some(now);
        self.state = ConnectionState::Connecting;

        info!(socket = id, url = %transport_url, "Connecting to maker");
        self.socket = Some(
            self.connector
                .connect(&transport_url, id, self.events_tx.clone()),
        );
    }

    /// Idempotent teardown. Leaves URL and client id in place for a later
    /// `reconnect()`.
    fn close(&mut self, now: Instant) {
        info!("Closing connection");

        if self.socket.is_some() {
            self.state = ConnectionState::Closing;
            self.publish();
        }

        self.heartbeat.stop();
        self.disarm_all_timers();
        self.reconnecting = false;

        if let Some(socket) = self.socket.take() {
            socket.close(CLOSE_NORMAL, "Normal closure");
        }
        self.breaker.abandon_trial();

        self.queue.clear();
        self.subscriptions.clear();
        self.initialized = false;
        self.state = ConnectionState::Disconnected;
        self.sink.connectivity(false);

        self.stability.reset(now);
        self.rate_limit.reset();
    }

    fn reconnect(&mut self, now: Instant) -> WsResult<bool> {
        info!("Manual reconnection requested");
        if self.url.is_none() || self.client_id.is_none() {
            error!("reconnect: missing URL or client id");
            return Ok(false);
        }

        self.reconnect_attempts = 0;
        self.reconnecting = false;
        self.close(now);
        self.sink.dismiss(NoticeKind::ReconnectExhausted);
        self.manual_reconnect_timer
            .arm_in(now, MANUAL_RECONNECT_DELAY);
        Ok(true)
    }

    fn on_manual_reconnect(&mut self, now: Instant) {
        self.manual_reconnect_timer.disarm();
        self.initialized = true;

        match self.connect_or_defer(now) {
            Ok(_) | Err(WsError::CircuitOpen { .. }) => {}
            Err(e) => warn!(error = %e, "Manual reconnect failed"),
        }
    }

    fn request_quote(&mut self, now: Instant, request: &QuoteRequest) -> WsResult<()> {
        if !self.is_open() {
            warn!(
                from = %request.from_asset,
                to = %request.to_asset,
                "Cannot request quote, not connected"
            );
            return Err(WsError::NotConnected);
        }

        let outcome = self.enqueue(
            now,
            QUOTE_REQUEST_ACTION,
            quote_payload(request),
            PRIORITY_QUOTE,
        )?;
        debug!(
            from = %request.from_asset,
            to = %request.to_asset,
            amount = request.from_amount,
            replaced = outcome == EnqueueOutcome::Replaced,
            "Quote request queued"
        );
        Ok(())
    }

    fn subscribe_pair(&mut self, now: Instant, pair: &str) {
        if pair.is_empty() {
            error!("subscribe_pair: no pair provided");
            return;
        }

        self.subscriptions.add(pair);

        if self.is_open() {
            if let Err(rejection) =
                self.enqueue(now, ACTION_SUBSCRIBE, pair_payload(pair), PRIORITY_SUBSCRIPTION)
            {
                warn!(pair = %pair, ?rejection, "Subscribe not queued");
            }
            self.sink.emit(SinkEvent::Subscribed(pair.to_string()));
            info!(pair = %pair, "Subscribed");
        } else {
            info!(pair = %pair, "Socket not ready, will subscribe on reconnection");
        }
    }

    fn unsubscribe_pair(&mut self, now: Instant, pair: &str) {
        if pair.is_empty() {
            return;
        }

        self.subscriptions.remove(pair);

        if self.is_open() {
            if let Err(rejection) = self.enqueue(
                now,
                ACTION_UNSUBSCRIBE,
                pair_payload(pair),
                PRIORITY_SUBSCRIPTION,
            ) {
                warn!(pair = %pair, ?rejection, "Unsubscribe not queued");
            }
            self.sink.emit(SinkEvent::Unsubscribed(pair.to_string()));
            info!(pair = %pair, "Unsubscribed");
        }
    }

    fn verify_subscriptions(&mut self, now: Instant) -> WsResult<()> {
        if !self.is_open() {
            warn!("Cannot verify subscriptions while disconnected");
            return Err(WsError::NotConnected);
        }
        self.sync_subscriptions(now);
        Ok(())
    }

    fn set_network_online(&mut self, now: Instant, online: bool) {
        if online == self.network_online {
            return;
        }
        self.network_online = online;

        if online {
            info!("Network connection restored");
            self.sink.dismiss(NoticeKind::NetworkOffline);
            if self.initialized && !self.is_open() {
                self.settle_timer
                    .arm_in(now, self.config.network_settle_delay());
            }
        } else {
            info!("Network connection lost");
            self.settle_timer.disarm();
            if self.is_open() {
                if let Some(socket) = self.socket.take() {
                    socket.close(CLOSE_NORMAL, "Network offline");
                }
                self.on_close(now, CLOSE_ABNORMAL, "network offline", false);
                self.last_disconnect_reason = Some(DisconnectReason::NetworkOffline);
            }
        }
    }

    fn on_network_settled(&mut self, now: Instant) {
        self.settle_timer.disarm();
        if self.network_online && self.initialized && !self.is_open() {
            self.schedule_reconnect(now);
        }
    }

    // ========================================================================
    // Socket events
    // ========================================================================

    fn handle_socket_event(&mut self, tagged: TaggedEvent) {
        let current = self.socket.as_ref().map(SocketHandle::id);
        if current != Some(tagged.socket) {
            debug!(socket = tagged.socket, ?current, "Ignoring event from stale socket");
            return;
        }

        let now = Instant::now();
        match tagged.event {
            SocketEvent::Opened => self.on_open(now),
            SocketEvent::Message(text) => self.on_message(now, &text),
            SocketEvent::Errored(message) => self.on_error(now, &message),
            SocketEvent::Closed {
                code,
                reason,
                clean,
            } => self.on_close(now, code, &reason, clean),
        }
    }

    fn on_open(&mut self, now: Instant) {
        let elapsed_ms = self
            .connect_started_at
            .map(|started| now.saturating_duration_since(started).as_millis() as u64)
            .unwrap_or_default();
        info!(elapsed_ms, "Connected to maker");

        self.state = ConnectionState::Open;
        self.last_successful_connection = Some(Utc::now());
        self.reconnect_attempts = 0;
        self.reconnecting = false;
        self.reconnect_timer.disarm();

        self.stability.on_success(now);
        self.stability.set_reconnect_attempts(0);
        self.stability.reset_message_health();
        if self.breaker.record_success() == BreakerTransition::Closed {
            self.sink.dismiss(NoticeKind::ConnectionUnstable);
        }
        self.sink.dismiss(NoticeKind::ReconnectExhausted);

        self.queue.reset_interval();
        self.heartbeat.start(now);
        self.heartbeat_timer.arm_in(now, self.heartbeat.interval());
        self.stability_timer
            .arm_in(now, self.config.health_check_interval());

        self.sink.connectivity(true);
        self.sync_subscriptions(now);
        self.rate_limit.reset();

        if !self.queue.is_empty() {
            self.drain_timer.arm_at(now);
        }
    }

    fn on_message(&mut self, now: Instant, text: &str) {
        self.heartbeat.record_inbound(now);

        let frame = match InboundFrame::parse(text) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(error = %e, "Dropping unparseable frame");
                self.stability.record_message_failure();
                return;
            }
        };

        match frame.classify() {
            Inbound::Quote(quote) => {
                debug!(
                    from = %quote.from_asset,
                    to = %quote.to_asset,
                    to_amount = quote.to_amount,
                    "Quote received"
                );
                self.stability.record_message_success();
                self.sink.emit(SinkEvent::Quote(quote));
            }
            Inbound::MalformedQuote(reason) => {
                warn!(%reason, "Dropping malformed quote response");
                self.stability.record_message_failure();
            }
            Inbound::Pong => {
                debug!("Pong received");
                self.rate_limit.reset();
                self.stability.record_message_success();
            }
            Inbound::PriceUpdate(update) => {
                self.stability.record_message_success();
                self.sink.emit(SinkEvent::Price(update));
            }
            Inbound::MalformedPrice(reason) => {
                warn!(%reason, "Dropping malformed price update");
                self.stability.record_message_failure();
            }
            Inbound::Subscribed { pair } => {
                info!(pair = ?pair, "Subscription confirmed");
                self.rate_limit.reset();
                self.stability.record_message_success();
            }
            Inbound::SyncResult {
                success,
                pairs,
                error,
            } => self.on_sync_result(now, success, pairs, error),
            Inbound::ServerError {
                message,
                rate_limited,
            } => {
                error!(error = %message, "Server reported error");
                self.stability.record_message_failure();
                if rate_limited {
                    self.rate_limit.on_rate_limit(now);
                }
            }
            Inbound::Unknown { action } => {
                debug!(action = ?action, "Ignoring frame with unknown action");
            }
        }
    }

    fn on_sync_result(
        &mut self,
        now: Instant,
        success: bool,
        pairs: Option<Vec<String>>,
        error: Option<String>,
    ) {
        if !success {
            error!(error = ?error, "Subscription sync failed, retrying");
            self.stability.record_message_failure();
            self.sync_retry_timer
                .arm_in(now, self.config.sync_retry_delay());
            return;
        }

        info!(
            pairs = pairs.as_ref().map_or(0, Vec::len),
            "Subscription sync succeeded"
        );
        self.rate_limit.reset();
        self.stability.record_message_success();

        if let Some(server_pairs) = pairs {
            let diff = self.subscriptions.reconcile(&server_pairs);
            for pair in diff.to_subscribe {
                self.subscribe_pair(now, &pair);
            }
            for pair in diff.to_unsubscribe {
                self.unsubscribe_pair(now, &pair);
            }
        }
    }

    fn on_sync_retry(&mut self, now: Instant) {
        self.sync_retry_timer.disarm();
        if self.is_open() {
            self.sync_subscriptions(now);
        }
    }

    fn on_error(&mut self, now: Instant, message: &str) {
        error!(error = %message, "WebSocket error");
        self.stability.record_message_failure();
        self.record_connection_failure(now);
        self.socket_lost(DisconnectReason::SocketError);
        self.schedule_reconnect(now);
    }

    fn on_close(&mut self, now: Instant, code: u16, reason: &str, clean: bool) {
        info!(code, reason = %reason, clean, "Disconnected");

        // The socket is already gone; no close frame to send.
        self.socket = None;
        let abnormal = !clean || code != CLOSE_NORMAL;
        let cause = if clean {
            DisconnectReason::ServerClose
        } else {
            DisconnectReason::AbnormalClose
        };
        self.socket_lost(cause);

        match code {
            CLOSE_ABNORMAL => {
                warn!("Abnormal closure (1006)");
                self.sink.notice(NoticeKind::ConnectionLost);
            }
            CLOSE_SERVER_ERROR => {
                error!("Server error closure (1011)");
                self.sink.notice(NoticeKind::ServerError);
            }
            _ => {}
        }

        if abnormal {
            self.record_connection_failure(now);
            self.schedule_reconnect(now);
        } else {
            self.breaker.abandon_trial();
            self.initialized = false;
        }
    }

    // ========================================================================
    // Reconnect
    // ========================================================================

    fn record_connection_failure(&mut self, now: Instant) {
        self.stability.on_failure(now);
        if self.breaker.record_failure(now) == BreakerTransition::Opened {
            self.sink.notice(NoticeKind::ConnectionUnstable);
        }
    }

    /// Stop everything tied to the current socket and drop it.
    fn socket_lost(&mut self, reason: DisconnectReason) {
        self.heartbeat.stop();
        self.heartbeat_timer.disarm();
        self.recovery_timer.disarm();
        self.drain_timer.disarm();
        self.stability_timer.disarm();
        self.sync_retry_timer.disarm();

        if let Some(socket) = self.socket.take() {
            socket.close(CLOSE_NORMAL, "Reconnecting");
        }
        self.state = ConnectionState::Disconnected;
        self.last_disconnect_reason = Some(reason);
        self.sink.connectivity(false);
    }

    fn schedule_reconnect(&mut self, now: Instant) {
        if self.reconnecting {
            info!("Already attempting to reconnect");
            return;
        }
        if !self.initialized {
            debug!("Not initialized, skipping reconnect");
            return;
        }

        if self.reconnect_attempts >= self.config.max_reconnect_attempts {
            warn!(
                max = self.config.max_reconnect_attempts,
                "Maximum reconnect attempts reached"
            );
            self.sink.connectivity(false);
            self.sink.notice(NoticeKind::ReconnectExhausted);
            return;
        }

        if !self.network_online {
            warn!("Network is offline, waiting for connection");
            self.sink.notice(NoticeKind::NetworkOffline);
            return;
        }

        let delay = reconnect_delay(&self.config, self.reconnect_attempts);
        info!(
            delay_ms = delay.as_millis() as u64,
            attempt = self.reconnect_attempts + 1,
            max = self.config.max_reconnect_attempts,
            "Scheduling reconnect"
        );

        if let Some(socket) = self.socket.take() {
            socket.close(CLOSE_NORMAL, "Reconnecting");
        }

        self.reconnecting = true;
        self.reconnects_scheduled += 1;
        self.reconnect_timer.arm_in(now, delay);
    }

    fn on_reconnect_due(&mut self, now: Instant) {
        self.reconnect_timer.disarm();

        if self.is_open() {
            info!("Already reconnected, skipping");
            self.reconnecting = false;
            return;
        }
        if !self.initialized {
            self.reconnecting = false;
            return;
        }
        if !self.network_online {
            warn!("Network still offline, delaying reconnect");
            self.reconnecting = false;
            return;
        }

        if !self.breaker.can_attempt(now) {
            let mut wait = self.breaker.retry_after(now);
            if wait.is_zero() {
                wait = self.config.circuit_open_duration();
            }
            debug!(
                wait_ms = wait.as_millis() as u64,
                "Circuit breaker refused reconnect, deferring"
            );
            self.reconnect_timer.arm_in(now, wait);
            return;
        }

        self.reconnect_attempts += 1;
        self.stability.set_reconnect_attempts(self.reconnect_attempts);
        self.reconnecting = false;
        self.open_socket(now);
    }

    // ========================================================================
    // Heartbeat and health
    // ========================================================================

    fn on_heartbeat_tick(&mut self, now: Instant) {
        self.heartbeat_timer.arm_in(now, self.heartbeat.interval());

        match self.heartbeat.on_tick(now, self.is_open()) {
            HeartbeatAction::Skip => {}
            HeartbeatAction::Ping => self.send_direct(ping_frame()),
            HeartbeatAction::PingAndRecover => {
                self.send_direct(ping_frame());
                warn!("Heartbeat overdue, sending recovery ping");
                self.send_direct(ping_frame());
                if !self.subscriptions.is_empty() {
                    self.send_direct(sync_subscriptions_frame(&self.subscriptions.pairs()));
                }
                self.recovery_timer
                    .arm_in(now, self.heartbeat.recovery_delay());
            }
            HeartbeatAction::Fatal { missed } => {
                error!(missed, "Heartbeat lost, reconnecting");
                self.liveness_failure(now);
            }
        }

        if !self.heartbeat.is_running() {
            self.heartbeat_timer.disarm();
        }
    }

    fn on_recovery_check(&mut self, now: Instant) {
        self.recovery_timer.disarm();
        match self.heartbeat.check_recovery() {
            RecoveryOutcome::Recovered => info!("Recovery ping answered"),
            RecoveryOutcome::Stale => {
                warn!("Recovery ping unanswered, reconnecting");
                self.liveness_failure(now);
            }
            RecoveryOutcome::NotPending => {}
        }
    }

    fn liveness_failure(&mut self, now: Instant) {
        self.record_connection_failure(now);
        self.socket_lost(DisconnectReason::HeartbeatLost);
        self.schedule_reconnect(now);
    }

    fn on_stability_tick(&mut self, now: Instant) {
        self.stability.tick(now);
        if self.is_open() {
            self.stability_timer
                .arm_in(now, self.config.health_check_interval());
        } else {
            self.stability_timer.disarm();
        }
    }

    // ========================================================================
    // Queue
    // ========================================================================

    fn enqueue(
        &mut self,
        now: Instant,
        action: &str,
        payload: Map<String, Value>,
        priority: i32,
    ) -> Result<EnqueueOutcome, QueueRejection> {
        let message = QueuedMessage {
            action: action.to_string(),
            payload,
            priority,
            enqueued_at: now,
        };
        let outcome = self.queue.enqueue(message, self.is_open())?;
        if !self.drain_timer.is_armed() {
            self.drain_timer.arm_at(now);
        }
        Ok(outcome)
    }

    fn sync_subscriptions(&mut self, now: Instant) {
        if self.subscriptions.is_empty() {
            debug!("No pairs to sync");
            return;
        }

        let pairs = self.subscriptions.pairs();
        info!(count = pairs.len(), "Synchronizing subscriptions with server");
        if let Err(rejection) = self.enqueue(
            now,
            ACTION_SYNC_SUBSCRIPTIONS,
            sync_payload(&pairs),
            PRIORITY_CONTROL,
        ) {
            warn!(?rejection, "Subscription sync not queued");
        }
    }

    fn on_drain_tick(&mut self, now: Instant) {
        self.drain_timer.disarm();
        if !self.is_open() || self.queue.is_empty() {
            return;
        }

        let pause = self.rate_limit.remaining(now);
        if !pause.is_zero() {
            debug!(pause_ms = pause.as_millis() as u64, "Rate limited, deferring send");
            self.drain_timer.arm_in(now, pause);
            return;
        }

        let healthy = self.stability.is_healthy();
        if let Some(message) = self.queue.pop_ready(now) {
            let sent = message.to_frame().and_then(|frame| match &self.socket {
                Some(socket) => socket.send_text(frame),
                None => Err(WsError::NotConnected),
            });

            match sent {
                Ok(()) => {
                    debug!(action = %message.action, priority = message.priority, "Message sent");
                    self.queue.record_sent(now, healthy);
                    self.stability.record_message_success();
                }
                Err(e) => {
                    warn!(action = %message.action, error = %e, "Failed to send message");
                    self.stability.record_message_failure();
                    let action = message.action.clone();
                    match self.queue.requeue_failed(message, self.is_open()) {
                        RetryOutcome::Requeued { priority } => {
                            debug!(%action, priority, "Re-queued failed message")
                        }
                        RetryOutcome::Dropped => debug!(%action, "Dropped failed message"),
                        RetryOutcome::Superseded => {
                            debug!(%action, "Failed message superseded by newer request")
                        }
                        RetryOutcome::Rejected(rejection) => {
                            warn!(%action, ?rejection, "Could not re-queue failed message")
                        }
                    }
                }
            }
        }

        if !self.queue.is_empty() {
            let delay = self.queue.next_delay(now, self.stability.is_healthy());
            self.drain_timer.arm_in(now, delay);
        }
    }

    // ========================================================================
    // Helpers
    // ========================================================================

    fn is_open(&self) -> bool {
        self.state == ConnectionState::Open && self.socket.is_some()
    }

    fn send_direct(&mut self, frame: String) {
        let result = match &self.socket {
            Some(socket) => socket.send_text(frame),
            None => Err(WsError::NotConnected),
        };
        if let Err(e) = result {
            error!(error = %e, "Failed to send direct frame");
            self.stability.record_message_failure();
        }
    }

    fn disarm_all_timers(&mut self) {
        self.heartbeat_timer.disarm();
        self.recovery_timer.disarm();
        self.drain_timer.disarm();
        self.reconnect_timer.disarm();
        self.stability_timer.disarm();
        self.settle_timer.disarm();
        self.sync_retry_timer.disarm();
        self.manual_reconnect_timer.disarm();
    }

    fn snapshot(&self, now: Instant) -> ConnectionSnapshot {
        let heartbeat = self.heartbeat.stats(now);
        ConnectionSnapshot {
            state: self.state,
            is_connected: self.is_open(),
            connection_initialized: self.initialized,
            network_online: self.network_online,
            url: self.url.clone(),
            connection_attempts: self.connection_attempts,
            reconnect_attempts: self.reconnect_attempts,
            reconnects_scheduled: self.reconnects_scheduled,
            last_disconnect_reason: self.last_disconnect_reason,
            last_heartbeat: heartbeat.last_response_at,
            last_successful_connection: self.last_successful_connection,
            queued_messages: self.queue.len(),
            queue_interval_ms: self.queue.process_interval().as_millis() as u64,
            subscribed_pairs: self.subscriptions.pairs(),
            circuit_breaker_state: self.breaker.state(),
            stability: self.stability.metrics(),
            message_health: self.stability.message_health(),
            heartbeat,
            rate_limit: self.rate_limit.stats(),
        }
    }

    fn publish(&self) {
        self.snapshot_tx.send_replace(self.snapshot(Instant::now()));
    }
}
