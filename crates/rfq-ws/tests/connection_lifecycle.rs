//! Connection manager lifecycle tests.
//!
//! The manager runs against `MemoryConnector` on a paused tokio clock; the
//! test plays the maker by opening sockets, pushing frames and raising
//! errors, then inspects the frames the manager wrote and the sink events
//! it emitted.

use rfq_core::AssetPair;
use rfq_ws::{
    CircuitBreakerState, ConnectionConfig, ConnectionHandle, ConnectionManager, ConnectionState,
    DisconnectReason, MemoryConnector, NoticeKind, SinkEvent, WsError,
};
use serde_json::{json, Value};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

const MAKER_URL: &str = "http://maker.test/";
const CLIENT_ID: &str = "client-1";

struct Harness {
    handle: ConnectionHandle,
    server: MemoryConnector,
    events: mpsc::Receiver<SinkEvent>,
    _task: JoinHandle<()>,
}

impl Harness {
    fn start(config: ConnectionConfig) -> Self {
        Self::start_with_sink(config, 1024)
    }

    fn start_with_sink(config: ConnectionConfig, sink_capacity: usize) -> Self {
        let server = MemoryConnector::new();
        let (sink_tx, events) = mpsc::channel(sink_capacity);
        let (handle, task) =
            ConnectionManager::spawn(config, server.clone(), Some(sink_tx)).unwrap();
        Self {
            handle,
            server,
            events,
            _task: task,
        }
    }

    /// Init and open the first socket.
    async fn connect(&mut self) {
        assert!(self.handle.init(MAKER_URL, CLIENT_ID).await.unwrap());
        settle().await;
        let index = self.server.socket_count() - 1;
        self.server.open(index);
        settle().await;
        assert!(self.handle.is_connected());
    }

    fn sink_events(&mut self) -> Vec<SinkEvent> {
        let mut out = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            out.push(event);
        }
        out
    }

    /// Frames written on a socket, parsed.
    fn frames(&self, index: usize) -> Vec<Value> {
        self.server
            .sent(index)
            .iter()
            .map(|text| serde_json::from_str(text).unwrap())
            .collect()
    }

    fn frames_with_action(&self, index: usize, action: &str) -> Vec<Value> {
        self.frames(index)
            .into_iter()
            .filter(|frame| frame["action"] == action)
            .collect()
    }
}

/// Let the manager process everything that is ready.
async fn settle() {
    tokio::time::sleep(Duration::from_millis(10)).await;
}

async fn advance(ms: u64) {
    tokio::time::sleep(Duration::from_millis(ms)).await;
}

fn notices(events: &[SinkEvent]) -> Vec<NoticeKind> {
    events
        .iter()
        .filter_map(|event| match event {
            SinkEvent::Notice(notice) => Some(notice.kind),
            _ => None,
        })
        .collect()
}

// ============================================================================
// Connect / init
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_init_builds_transport_url_and_connects() {
    let mut h = Harness::start(ConnectionConfig::default());
    h.connect().await;

    assert_eq!(
        h.server.url(0).as_deref(),
        Some("ws://maker.test/api/v1/market/ws/client-1")
    );
    assert!(h.sink_events().contains(&SinkEvent::Connectivity(true)));

    let diag = h.handle.diagnostics();
    assert_eq!(diag.state, ConnectionState::Open);
    assert!(diag.connection_initialized);
    assert_eq!(diag.url.as_deref(), Some("http://maker.test"));
    assert_eq!(diag.connection_attempts, 1);
    assert!(diag.last_successful_connection.is_some());
}

#[tokio::test(start_paused = true)]
async fn test_init_same_url_is_noop() {
    let mut h = Harness::start(ConnectionConfig::default());
    h.connect().await;

    assert!(h.handle.init("http://maker.test", CLIENT_ID).await.unwrap());
    settle().await;
    assert_eq!(h.server.socket_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_init_without_url_fails() {
    let h = Harness::start(ConnectionConfig::default());
    assert!(!h.handle.init("", CLIENT_ID).await.unwrap());
    assert_eq!(h.server.socket_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_update_url_switches_socket() {
    let mut h = Harness::start(ConnectionConfig::default());
    h.connect().await;

    assert!(h.handle.update_url("https://other.test").await.unwrap());
    settle().await;

    assert_eq!(h.server.socket_count(), 2);
    assert_eq!(
        h.server.url(1).as_deref(),
        Some("wss://other.test/api/v1/market/ws/client-1")
    );
    assert_eq!(
        h.server.close_frame(0),
        Some((1000, "Normal closure".to_string()))
    );
}

#[tokio::test(start_paused = true)]
async fn test_wait_for_connection() {
    let h = Harness::start(ConnectionConfig::default());
    assert!(!h.handle.wait_for_connection(Duration::from_secs(1)).await);

    h.handle.init(MAKER_URL, CLIENT_ID).await.unwrap();
    settle().await;

    let server = h.server.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(200)).await;
        server.open(0);
    });

    assert!(h.handle.wait_for_connection(Duration::from_secs(5)).await);
}

// ============================================================================
// Quotes and queue
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_btc_quote_delivered_once() {
    let mut h = Harness::start(ConnectionConfig::default());
    h.connect().await;
    h.sink_events();

    h.handle.request_quote("BTC", "USD", 100_000).await.unwrap();
    settle().await;

    let requests = h.frames_with_action(0, "quote_request");
    assert_eq!(
        requests,
        vec![json!({
            "action": "quote_request",
            "from_asset": "BTC",
            "to_asset": "USD",
            "from_amount": 100000
        })]
    );

    h.server.push(
        0,
        json!({
            "action": "quote_response",
            "data": {
                "from_asset": "BTC",
                "to_asset": "USD",
                "from_amount": 100000,
                "to_amount": 250000000
            }
        })
        .to_string(),
    );
    settle().await;

    let quotes: Vec<_> = h
        .sink_events()
        .into_iter()
        .filter_map(|event| match event {
            SinkEvent::Quote(quote) => Some(quote),
            _ => None,
        })
        .collect();
    assert_eq!(quotes.len(), 1);
    assert_eq!(quotes[0].to_amount, 250_000_000);
    assert_eq!(quotes[0].pair(), AssetPair::new("BTC", "USD"));
}

#[tokio::test(start_paused = true)]
async fn test_quotes_survive_a_slow_consumer() {
    let mut h = Harness::start_with_sink(ConnectionConfig::default(), 1);
    h.connect().await;

    for to_amount in 1..=3 {
        h.server.push(
            0,
            json!({
                "action": "quote_response",
                "data": {"from_asset": "BTC", "to_asset": "USD", "to_amount": to_amount}
            })
            .to_string(),
        );
    }
    settle().await;

    let mut received = Vec::new();
    let mut quotes = Vec::new();
    while quotes.len() < 3 {
        let event = tokio::time::timeout(Duration::from_secs(1), h.events.recv())
            .await
            .expect("held events are flushed")
            .unwrap();
        if let SinkEvent::Quote(quote) = &event {
            quotes.push(quote.to_amount);
        }
        received.push(event);
    }

    assert!(received.contains(&SinkEvent::Connectivity(true)));
    assert_eq!(quotes, vec![1, 2, 3]);
}

#[tokio::test(start_paused = true)]
async fn test_duplicate_pair_request_sends_latest_amount_once() {
    let mut h = Harness::start(ConnectionConfig::default());
    h.connect().await;

    // Occupy the pacing window so the quote requests wait in the queue.
    h.handle
        .subscribe_pair(&AssetPair::new("ETH", "USD"))
        .await
        .unwrap();
    settle().await;
    assert_eq!(h.frames_with_action(0, "subscribe").len(), 1);

    h.handle.request_quote("BTC", "USD", 100_000).await.unwrap();
    h.handle.request_quote("BTC", "USD", 200_000).await.unwrap();
    assert_eq!(h.handle.diagnostics().queued_messages, 1);

    advance(2_000).await;

    let requests = h.frames_with_action(0, "quote_request");
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0]["from_amount"], json!(200000));
}

#[tokio::test(start_paused = true)]
async fn test_request_quote_rejected_when_disconnected() {
    let h = Harness::start(ConnectionConfig::default());
    let result = h.handle.request_quote("BTC", "USD", 1).await;
    assert!(matches!(result, Err(WsError::NotConnected)));
}

#[tokio::test(start_paused = true)]
async fn test_queue_full_rejects() {
    let config = ConnectionConfig {
        queue_capacity: 2,
        ..ConnectionConfig::default()
    };
    let mut h = Harness::start(config);
    h.connect().await;

    h.handle.request_quote("A", "USD", 1).await.unwrap();
    settle().await;
    // First request went out; the next two fill the queue.
    h.handle.request_quote("B", "USD", 1).await.unwrap();
    h.handle.request_quote("C", "USD", 1).await.unwrap();

    let result = h.handle.request_quote("D", "USD", 1).await;
    assert!(matches!(result, Err(WsError::QueueFull { capacity: 2 })));
}

#[tokio::test(start_paused = true)]
async fn test_malformed_quote_is_dropped() {
    let mut h = Harness::start(ConnectionConfig::default());
    h.connect().await;
    h.sink_events();

    h.server.push(
        0,
        r#"{"action":"quote_response","data":{"from_asset":"BTC","to_asset":"USD"}}"#,
    );
    h.server.push(0, "not json at all");
    settle().await;

    assert!(h
        .sink_events()
        .iter()
        .all(|event| !matches!(event, SinkEvent::Quote(_))));
    assert_eq!(h.handle.diagnostics().message_health.failed, 2);
    assert!(h.handle.is_connected());
}

#[tokio::test(start_paused = true)]
async fn test_rate_limit_error_pauses_drain() {
    let mut h = Harness::start(ConnectionConfig::default());
    h.connect().await;

    h.server.push(0, r#"{"error":"Rate limit exceeded"}"#);
    settle().await;
    assert_eq!(h.handle.diagnostics().rate_limit.current_delay_ms, 1_000);

    h.handle.request_quote("BTC", "USD", 1).await.unwrap();
    advance(500).await;
    assert!(h.frames_with_action(0, "quote_request").is_empty());

    advance(700).await;
    assert_eq!(h.frames_with_action(0, "quote_request").len(), 1);
    // Rate limiting is not a reason to reconnect.
    assert_eq!(h.server.socket_count(), 1);
}

// ============================================================================
// Subscriptions
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_subscriptions_synced_and_reconciled_on_open() {
    let mut h = Harness::start(ConnectionConfig::default());
    h.handle
        .subscribe_pair(&AssetPair::new("BTC", "USD"))
        .await
        .unwrap();

    h.connect().await;
    settle().await;

    assert_eq!(
        h.frames_with_action(0, "sync_subscriptions"),
        vec![json!({"action": "sync_subscriptions", "pairs": ["BTC/USD"]})]
    );

    h.server.push(
        0,
        r#"{"action":"sync_result","success":true,"subscribed_pairs":["SOL/USD"]}"#,
    );
    advance(1_000).await;

    assert_eq!(
        h.frames_with_action(0, "subscribe"),
        vec![json!({"action": "subscribe", "pair": "BTC/USD"})]
    );
    assert_eq!(
        h.frames_with_action(0, "unsubscribe"),
        vec![json!({"action": "unsubscribe", "pair": "SOL/USD"})]
    );
    assert_eq!(h.handle.diagnostics().subscribed_pairs, vec!["BTC/USD"]);
}

#[tokio::test(start_paused = true)]
async fn test_failed_sync_is_retried() {
    let mut h = Harness::start(ConnectionConfig::default());
    h.handle
        .subscribe_pair(&AssetPair::new("BTC", "USD"))
        .await
        .unwrap();
    h.connect().await;
    settle().await;
    assert_eq!(h.frames_with_action(0, "sync_subscriptions").len(), 1);

    h.server
        .push(0, r#"{"action":"sync_result","success":false,"error":"busy"}"#);
    advance(2_000).await;
    assert_eq!(h.frames_with_action(0, "sync_subscriptions").len(), 1);

    advance(1_500).await;
    assert_eq!(h.frames_with_action(0, "sync_subscriptions").len(), 2);
}

// ============================================================================
// Failures, breaker, reconnect
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_five_errors_open_breaker_for_open_duration() {
    let mut h = Harness::start(ConnectionConfig::default());
    h.handle.init(MAKER_URL, CLIENT_ID).await.unwrap();
    settle().await;

    // Reconnect delays for attempts 0..4 are below these bounds
    // (5000, 7500, 11250, 16875ms plus <1s jitter).
    let waits = [6_100, 8_600, 12_300, 18_000];
    for (index, wait) in waits.iter().enumerate() {
        h.server.error(index, "connection refused");
        settle().await;
        advance(*wait).await;
        assert_eq!(h.server.socket_count(), index + 2, "after error {}", index + 1);
    }

    h.server.error(4, "connection refused");
    settle().await;

    let diag = h.handle.diagnostics();
    assert_eq!(diag.circuit_breaker_state, CircuitBreakerState::Open);
    assert_eq!(diag.stability.score, 50);
    assert!(notices(&h.sink_events()).contains(&NoticeKind::ConnectionUnstable));

    // The attempt-4 reconnect (~25-26s) is refused; the trial comes after 30s.
    advance(29_800).await;
    assert_eq!(h.server.socket_count(), 5);

    advance(300).await;
    assert_eq!(h.server.socket_count(), 6);
    assert_eq!(
        h.handle.diagnostics().circuit_breaker_state,
        CircuitBreakerState::HalfOpen
    );

    // Successful trial closes the breaker.
    h.server.open(5);
    settle().await;
    assert_eq!(
        h.handle.diagnostics().circuit_breaker_state,
        CircuitBreakerState::Closed
    );
    assert!(h
        .sink_events()
        .contains(&SinkEvent::DismissNotice(NoticeKind::ConnectionUnstable)));
}

#[tokio::test(start_paused = true)]
async fn test_init_refused_by_open_breaker_retries_when_trial_allowed() {
    let config = ConnectionConfig {
        reconnect_base_delay_ms: 100,
        reconnect_jitter_ms: 0,
        circuit_failure_threshold: 2,
        circuit_open_duration_ms: 5_000,
        ..ConnectionConfig::default()
    };
    let mut h = Harness::start(config);
    h.handle.init(MAKER_URL, CLIENT_ID).await.unwrap();
    settle().await;

    h.server.error(0, "refused");
    settle().await;
    advance(200).await;
    h.server.error(1, "refused");
    settle().await;
    assert_eq!(
        h.handle.diagnostics().circuit_breaker_state,
        CircuitBreakerState::Open
    );

    h.handle.close().await.unwrap();
    let result = h.handle.init(MAKER_URL, CLIENT_ID).await;
    assert!(matches!(result, Err(WsError::CircuitOpen { .. })));
    assert!(h.handle.diagnostics().connection_initialized);
    assert_eq!(h.server.socket_count(), 2);

    advance(5_100).await;
    assert_eq!(h.server.socket_count(), 3);
    assert_eq!(
        h.handle.diagnostics().circuit_breaker_state,
        CircuitBreakerState::HalfOpen
    );

    h.server.open(2);
    settle().await;
    assert!(h.handle.is_connected());
    assert_eq!(
        h.handle.diagnostics().circuit_breaker_state,
        CircuitBreakerState::Closed
    );
}

#[tokio::test(start_paused = true)]
async fn test_max_attempts_raises_persistent_notice() {
    let config = ConnectionConfig {
        max_reconnect_attempts: 3,
        reconnect_base_delay_ms: 100,
        reconnect_max_delay_ms: 1_000,
        reconnect_jitter_ms: 0,
        circuit_failure_threshold: 100,
        ..ConnectionConfig::default()
    };
    let mut h = Harness::start(config);
    h.handle.init(MAKER_URL, CLIENT_ID).await.unwrap();
    settle().await;

    for index in 0..4 {
        h.server.error(index, "refused");
        settle().await;
        advance(1_000).await;
    }
    advance(60_000).await;

    // Initial socket plus three reconnects.
    assert_eq!(h.server.socket_count(), 4);

    let events = h.sink_events();
    let exhausted = events.iter().find_map(|event| match event {
        SinkEvent::Notice(notice) if notice.kind == NoticeKind::ReconnectExhausted => {
            Some(notice.clone())
        }
        _ => None,
    });
    assert!(exhausted.expect("exhausted notice").persistent);

    // Manual reconnect resets the budget.
    assert!(h.handle.reconnect().await.unwrap());
    advance(200).await;
    assert_eq!(h.server.socket_count(), 5);
    assert!(h
        .sink_events()
        .contains(&SinkEvent::DismissNotice(NoticeKind::ReconnectExhausted)));
}

#[tokio::test(start_paused = true)]
async fn test_abnormal_close_reconnects() {
    let mut h = Harness::start(ConnectionConfig::default());
    h.connect().await;
    h.sink_events();

    h.server.server_close(0, 1006, false);
    settle().await;

    let events = h.sink_events();
    assert!(events.contains(&SinkEvent::Connectivity(false)));
    assert!(notices(&events).contains(&NoticeKind::ConnectionLost));
    assert_eq!(
        h.handle.diagnostics().last_disconnect_reason,
        Some(DisconnectReason::AbnormalClose)
    );

    advance(6_100).await;
    assert_eq!(h.server.socket_count(), 2);

    h.server.open(1);
    settle().await;
    assert!(h.handle.is_connected());
    assert_eq!(h.handle.diagnostics().reconnect_attempts, 0);
}

#[tokio::test(start_paused = true)]
async fn test_server_error_close_raises_notice() {
    let mut h = Harness::start(ConnectionConfig::default());
    h.connect().await;
    h.sink_events();

    h.server.server_close(0, 1011, true);
    settle().await;
    assert!(notices(&h.sink_events()).contains(&NoticeKind::ServerError));

    advance(6_100).await;
    assert_eq!(h.server.socket_count(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_clean_close_does_not_reconnect() {
    let mut h = Harness::start(ConnectionConfig::default());
    h.connect().await;

    h.server.server_close(0, 1000, true);
    settle().await;
    advance(60_000).await;

    assert_eq!(h.server.socket_count(), 1);
    let diag = h.handle.diagnostics();
    assert!(!diag.connection_initialized);
    assert_eq!(diag.state, ConnectionState::Disconnected);
}

#[tokio::test(start_paused = true)]
async fn test_events_from_stale_socket_are_ignored() {
    let mut h = Harness::start(ConnectionConfig::default());
    h.connect().await;

    h.server.error(0, "boom");
    settle().await;
    h.sink_events();

    h.server.push(
        0,
        r#"{"action":"quote_response","data":{"from_asset":"BTC","to_asset":"USD","to_amount":1}}"#,
    );
    h.server.server_close(0, 1006, false);
    settle().await;

    assert!(h.sink_events().is_empty());
    assert_eq!(h.handle.diagnostics().stability.consecutive_failures, 1);
}

// ============================================================================
// Heartbeat
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_silent_server_triggers_exactly_one_reconnect() {
    let mut h = Harness::start(ConnectionConfig::default());
    h.connect().await;

    advance(60_000).await;

    assert_eq!(h.server.socket_count(), 2);
    assert!(h.frames_with_action(0, "ping").len() >= 3);
    assert_eq!(
        h.server.close_frame(0),
        Some((1000, "Reconnecting".to_string()))
    );
    assert_eq!(
        h.handle.diagnostics().last_disconnect_reason,
        Some(DisconnectReason::HeartbeatLost)
    );
}

#[tokio::test(start_paused = true)]
async fn test_any_frame_answers_recovery_probe() {
    let mut h = Harness::start(ConnectionConfig::default());
    h.handle
        .subscribe_pair(&AssetPair::new("BTC", "USD"))
        .await
        .unwrap();
    h.connect().await;

    // Recovery probe goes out on the 30s tick.
    advance(30_500).await;
    assert_eq!(h.frames_with_action(0, "sync_subscriptions").len(), 2);

    h.server.push(0, r#"{"action":"price_update","data":{"pair":"BTC/USD","price":1.0}}"#);
    advance(10_000).await;

    assert_eq!(h.server.socket_count(), 1);
    assert!(h.handle.is_connected());
}

// ============================================================================
// Close and network
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_close_is_idempotent() {
    let mut h = Harness::start(ConnectionConfig::default());
    h.connect().await;
    h.handle
        .subscribe_pair(&AssetPair::new("BTC", "USD"))
        .await
        .unwrap();
    h.server.error(0, "boom");
    settle().await;
    h.sink_events();

    // A reconnect is pending; close cancels it.
    h.handle.close().await.unwrap();
    h.handle.close().await.unwrap();
    advance(60_000).await;

    assert_eq!(h.server.socket_count(), 1);
    let diag = h.handle.diagnostics();
    assert_eq!(diag.state, ConnectionState::Disconnected);
    assert!(!diag.connection_initialized);
    assert_eq!(diag.queued_messages, 0);
    assert!(diag.subscribed_pairs.is_empty());
    assert_eq!(diag.stability.score, 100);
    assert_eq!(diag.stability.consecutive_failures, 0);
}

#[tokio::test(start_paused = true)]
async fn test_close_sends_normal_closure() {
    let mut h = Harness::start(ConnectionConfig::default());
    h.connect().await;
    h.sink_events();

    h.handle.close().await.unwrap();
    h.handle.close().await.unwrap();

    assert_eq!(
        h.server.close_frame(0),
        Some((1000, "Normal closure".to_string()))
    );
    let disconnects = h
        .sink_events()
        .into_iter()
        .filter(|event| *event == SinkEvent::Connectivity(false))
        .count();
    assert_eq!(disconnects, 1);
}

#[tokio::test(start_paused = true)]
async fn test_offline_then_online_reconnects_after_settle() {
    let mut h = Harness::start(ConnectionConfig::default());
    h.connect().await;
    h.sink_events();

    h.handle.set_network_online(false).await.unwrap();
    settle().await;
    assert!(!h.handle.is_connected());
    let kinds = notices(&h.sink_events());
    assert!(kinds.contains(&NoticeKind::ConnectionLost));
    assert!(kinds.contains(&NoticeKind::NetworkOffline));

    advance(60_000).await;
    assert_eq!(h.server.socket_count(), 1);

    h.handle.set_network_online(true).await.unwrap();
    // 1s settle delay plus a 5-6s reconnect delay.
    advance(7_100).await;
    assert_eq!(h.server.socket_count(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_stops_manager() {
    let mut h = Harness::start(ConnectionConfig::default());
    h.connect().await;

    h.handle.shutdown();
    settle().await;

    assert!(h.handle.is_shutdown());
    assert!(!h.handle.is_connected());
    assert!(matches!(
        h.handle.close().await,
        Err(WsError::ManagerStopped)
    ));
}
