//! Prometheus metrics for the RFQ client.
//!
//! Covers:
//! - Connection state and reconnects
//! - Circuit breaker and stability score
//! - Outbound queue depth
//! - Quotes and price updates received
//!
//! # Panics
//!
//! Metric registration uses `unwrap()`. A registration failure means a
//! duplicate metric name, which must abort at startup. These panics only
//! occur during static initialization, never at runtime.

use crate::error::{TelemetryError, TelemetryResult};
use once_cell::sync::Lazy;
use prometheus::{
    register_counter_vec, register_gauge, register_gauge_vec, register_int_gauge, CounterVec,
    Encoder, Gauge, GaugeVec, IntGauge, TextEncoder,
};

/// Connection states exported on `rfq_ws_state`.
pub const WS_STATES: [&str; 4] = ["disconnected", "connecting", "open", "closing"];

/// WebSocket connection state (1 = open, 0 = not open).
pub static WS_CONNECTED: Lazy<Gauge> = Lazy::new(|| {
    register_gauge!("rfq_ws_connected", "Maker WebSocket open (1=open)").unwrap()
});

/// Labels: state (disconnected/connecting/open/closing)
pub static WS_STATE: Lazy<GaugeVec> = Lazy::new(|| {
    register_gauge_vec!(
        "rfq_ws_state",
        "Connection manager current state (1=active, 0=inactive)",
        &["state"]
    )
    .unwrap()
});

/// Labels: reason (socket_error/abnormal_close/server_close/heartbeat_lost/network_offline)
pub static WS_RECONNECT_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "rfq_ws_reconnect_total",
        "Total reconnects scheduled after a lost connection",
        &["reason"]
    )
    .unwrap()
});

pub static QUEUE_DEPTH: Lazy<IntGauge> = Lazy::new(|| {
    register_int_gauge!("rfq_queue_depth", "Outbound messages waiting to be sent").unwrap()
});

/// Circuit breaker state (0=closed, 1=half-open, 2=open).
pub static CIRCUIT_STATE: Lazy<Gauge> = Lazy::new(|| {
    register_gauge!(
        "rfq_circuit_state",
        "Circuit breaker state (0=closed, 1=half_open, 2=open)"
    )
    .unwrap()
});

pub static STABILITY_SCORE: Lazy<IntGauge> = Lazy::new(|| {
    register_int_gauge!("rfq_stability_score", "Connection stability score (0-100)").unwrap()
});

/// Labels: pair (FROM/TO)
pub static QUOTES_RECEIVED_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "rfq_quotes_received_total",
        "Total quote responses received",
        &["pair"]
    )
    .unwrap()
});

/// Labels: pair
pub static PRICE_UPDATES_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "rfq_price_updates_total",
        "Total price updates received",
        &["pair"]
    )
    .unwrap()
});

pub static HEARTBEAT_MISSED: Lazy<IntGauge> = Lazy::new(|| {
    register_int_gauge!(
        "rfq_heartbeat_missed",
        "Consecutive heartbeat ticks without an inbound frame"
    )
    .unwrap()
});

/// Labels: kind (connection_unstable/connection_lost/...)
pub static NOTICES_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "rfq_notices_total",
        "User-facing connection notices raised",
        &["kind"]
    )
    .unwrap()
});

/// Metrics facade.
pub struct Metrics;

impl Metrics {
    pub fn ws_connected(connected: bool) {
        WS_CONNECTED.set(if connected { 1.0 } else { 0.0 });
    }

    /// Set the active state to 1 and every other state to 0.
    pub fn ws_state_set(state: &str) {
        for s in WS_STATES {
            WS_STATE.with_label_values(&[s]).set(0.0);
        }
        WS_STATE.with_label_values(&[state]).set(1.0);
    }

    pub fn ws_reconnect(reason: &str) {
        WS_RECONNECT_TOTAL.with_label_values(&[reason]).inc();
    }

    pub fn queue_depth(depth: usize) {
        QUEUE_DEPTH.set(i64::try_from(depth).unwrap_or(i64::MAX));
    }

    pub fn circuit_state(value: f64) {
        CIRCUIT_STATE.set(value);
    }

    pub fn stability_score(score: u8) {
        STABILITY_SCORE.set(i64::from(score));
    }

    pub fn quote_received(pair: &str) {
        QUOTES_RECEIVED_TOTAL.with_label_values(&[pair]).inc();
    }

    pub fn price_update(pair: &str) {
        PRICE_UPDATES_TOTAL.with_label_values(&[pair]).inc();
    }

    pub fn heartbeat_missed(missed: u32) {
        HEARTBEAT_MISSED.set(i64::from(missed));
    }

    pub fn notice_raised(kind: &str) {
        NOTICES_TOTAL.with_label_values(&[kind]).inc();
    }

    /// Render the default registry in the Prometheus text format.
    pub fn gather_text() -> TelemetryResult<String> {
        let mut buffer = Vec::new();
        TextEncoder::new()
            .encode(&prometheus::gather(), &mut buffer)
            .map_err(|e| TelemetryError::Metrics(e.to_string()))?;
        String::from_utf8(buffer).map_err(|e| TelemetryError::Metrics(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_is_exclusive() {
        Metrics::ws_state_set("connecting");
        Metrics::ws_state_set("open");

        assert_eq!(WS_STATE.with_label_values(&["open"]).get(), 1.0);
        assert_eq!(WS_STATE.with_label_values(&["connecting"]).get(), 0.0);
        assert_eq!(WS_STATE.with_label_values(&["disconnected"]).get(), 0.0);
    }

    #[test]
    fn test_counters_are_labelled() {
        let before = QUOTES_RECEIVED_TOTAL.with_label_values(&["BTC/USD"]).get();
        Metrics::quote_received("BTC/USD");
        Metrics::quote_received("BTC/USD");
        assert_eq!(
            QUOTES_RECEIVED_TOTAL.with_label_values(&["BTC/USD"]).get(),
            before + 2.0
        );
    }

    #[test]
    fn test_gather_text_contains_metrics() {
        Metrics::ws_connected(true);
        Metrics::stability_score(90);
        Metrics::ws_reconnect("heartbeat_lost");

        let text = Metrics::gather_text().unwrap();
        assert!(text.contains("rfq_ws_connected 1"));
        assert!(text.contains("rfq_stability_score 90"));
        assert!(text.contains("rfq_ws_reconnect_total{reason=\"heartbeat_lost\"}"));
    }
}
