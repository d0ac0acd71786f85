//! Wire frames exchanged with the maker.

use crate::error::{WsError, WsResult};
use rfq_core::{CoreError, PriceUpdate, QuoteRequest, QuoteResponse};
use serde::Deserialize;
use serde_json::{json, Map, Value};

// ============================================================================
// Outbound
// ============================================================================

pub const ACTION_PING: &str = "ping";
pub const ACTION_SUBSCRIBE: &str = "subscribe";
pub const ACTION_UNSUBSCRIBE: &str = "unsubscribe";
pub const ACTION_SYNC_SUBSCRIPTIONS: &str = "sync_subscriptions";

/// Direct (unqueued) heartbeat frame.
pub fn ping_frame() -> String {
    json!({ "action": ACTION_PING }).to_string()
}

/// Direct sync frame used by the heartbeat recovery probe.
pub fn sync_subscriptions_frame(pairs: &[String]) -> String {
    json!({ "action": ACTION_SYNC_SUBSCRIPTIONS, "pairs": pairs }).to_string()
}

pub fn pair_payload(pair: &str) -> Map<String, Value> {
    let mut payload = Map::new();
    payload.insert("pair".to_string(), Value::from(pair));
    payload
}

pub fn sync_payload(pairs: &[String]) -> Map<String, Value> {
    let mut payload = Map::new();
    payload.insert("pairs".to_string(), json!(pairs));
    payload
}

pub fn quote_payload(request: &QuoteRequest) -> Map<String, Value> {
    request.to_payload()
}

// ============================================================================
// Inbound
// ============================================================================

/// Raw inbound envelope. Every field is optional on the wire.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct InboundFrame {
    #[serde(default)]
    pub action: Option<String>,
    #[serde(default)]
    pub data: Option<Value>,
    #[serde(default)]
    pub error: Option<Value>,
    #[serde(default)]
    pub pair: Option<String>,
    #[serde(default)]
    pub success: Option<bool>,
    #[serde(default)]
    pub subscribed_pairs: Option<Vec<String>>,
}

/// Classified inbound message.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Quote(QuoteResponse),
    /// `quote_response` missing a required field or otherwise unusable.
    MalformedQuote(String),
    Pong,
    PriceUpdate(PriceUpdate),
    MalformedPrice(String),
    Subscribed { pair: Option<String> },
    SyncResult {
        success: bool,
        pairs: Option<Vec<String>>,
        error: Option<String>,
    },
    ServerError { message: String, rate_limited: bool },
    Unknown { action: Option<String> },
}

impl InboundFrame {
    pub fn parse(text: &str) -> WsResult<Self> {
        serde_json::from_str(text).map_err(|e| WsError::ParseError(e.to_string()))
    }

    /// Route the frame by `action`.
    ///
    /// `sync_result` carries its own failure `error`; any other frame with
    /// an `error` field is a server error regardless of its action.
    pub fn classify(self) -> Inbound {
        let action = self.action.as_deref();

        if action == Some("sync_result") {
            return Inbound::SyncResult {
                success: self.success.unwrap_or(false),
                pairs: self.subscribed_pairs,
                error: self.error.as_ref().map(error_text),
            };
        }

        if let Some(error) = self.error.as_ref().filter(|e| !e.is_null()) {
            let message = error_text(error);
            let rate_limited = is_rate_limit_error(&message);
            return Inbound::ServerError {
                message,
                rate_limited,
            };
        }

        match action {
            Some("quote_response") => {
                let data = self.data.unwrap_or(Value::Null);
                match QuoteResponse::from_data(&data) {
                    Ok(quote) => Inbound::Quote(quote),
                    Err(CoreError::MissingField(field)) => {
                        Inbound::MalformedQuote(format!("missing field `{field}`"))
                    }
                    Err(e) => Inbound::MalformedQuote(e.to_string()),
                }
            }
            Some("pong") => Inbound::Pong,
            Some("price_update") => {
                let data = self.data.unwrap_or(Value::Null);
                match PriceUpdate::from_data(&data) {
                    Ok(update) => Inbound::PriceUpdate(update),
                    Err(e) => Inbound::MalformedPrice(e.to_string()),
                }
            }
            Some("subscribed") => Inbound::Subscribed { pair: self.pair },
            _ => Inbound::Unknown {
                action: self.action,
            },
        }
    }
}

/// Server error text matching the rate-limit pattern (case-insensitive).
pub fn is_rate_limit_error(message: &str) -> bool {
    message.to_ascii_lowercase().contains("rate limit")
}

fn error_text(error: &Value) -> String {
    match error {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
