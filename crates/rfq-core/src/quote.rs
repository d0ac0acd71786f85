//! Quote request/response payloads.

use crate::error::{CoreError, Result};
use crate::pair::AssetPair;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Fields a `quote_response` payload must carry to be usable.
pub const QUOTE_RESPONSE_REQUIRED_FIELDS: [&str; 3] = ["from_asset", "to_asset", "to_amount"];

/// Request for a live quote on a pair.
///
/// Amounts are in the asset's smallest unit (e.g. sats for BTC).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuoteRequest {
    pub from_asset: String,
    pub to_asset: String,
    pub from_amount: u64,
}

impl QuoteRequest {
    pub fn new(pair: &AssetPair, from_amount: u64) -> Self {
        Self {
            from_asset: pair.from_asset.clone(),
            to_asset: pair.to_asset.clone(),
            from_amount,
        }
    }

    pub fn pair(&self) -> AssetPair {
        AssetPair::new(&self.from_asset, &self.to_asset)
    }

    /// Field map sent alongside `"action": "quote_request"`.
    pub fn to_payload(&self) -> Map<String, Value> {
        let mut payload = Map::new();
        payload.insert("from_asset".to_string(), Value::from(self.from_asset.clone()));
        payload.insert("to_asset".to_string(), Value::from(self.to_asset.clone()));
        payload.insert("from_amount".to_string(), Value::from(self.from_amount));
        payload
    }
}

/// Quote pushed by the maker in a `quote_response` frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuoteResponse {
    pub from_asset: String,
    pub to_asset: String,
    pub to_amount: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from_amount: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub price: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rfq_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<u64>,
    /// Maker-specific fields passed through untouched.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl QuoteResponse {
    /// Validate and parse the `data` object of a `quote_response` frame.
    ///
    /// A missing required field is reported as `CoreError::MissingField`
    /// so callers can log a malformed payload instead of a parse failure.
    pub fn from_data(data: &Value) -> Result<Self> {
        let object = data
            .as_object()
            .ok_or_else(|| CoreError::InvalidPayload("quote data is not an object".to_string()))?;

        for field in QUOTE_RESPONSE_REQUIRED_FIELDS {
            if object.get(field).map_or(true, Value::is_null) {
                return Err(CoreError::MissingField(field));
            }
        }

        serde_json::from_value(data.clone()).map_err(|e| CoreError::InvalidPayload(e.to_string()))
    }

    pub fn pair(&self) -> AssetPair {
        AssetPair::new(&self.from_asset, &self.to_asset)
    }
}

/// Streamed price tick for a subscribed pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceUpdate {
    #[serde(default)]
    pub pair: Option<String>,
    #[serde(default)]
    pub price: Option<f64>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl PriceUpdate {
    pub fn from_data(data: &Value) -> Result<Self> {
        if !data.is_object() {
            return Err(CoreError::InvalidPayload(
                "price data is not an object".to_string(),
            ));
        }
        Ok(serde_json::from_value(data.clone())?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_quote_request_payload() {
        let req = QuoteRequest::new(&AssetPair::new("BTC", "USD"), 100_000);
        let payload = req.to_payload();

        assert_eq!(payload["from_asset"], json!("BTC"));
        assert_eq!(payload["to_asset"], json!("USD"));
        assert_eq!(payload["from_amount"], json!(100_000));
        assert_eq!(req.pair(), AssetPair::new("BTC", "USD"));
    }

    #[test]
    fn test_quote_response_from_data() {
        let data = json!({
            "from_asset": "BTC",
            "to_asset": "USD",
            "from_amount": 100000,
            "to_amount": 250000000,
            "rfq_id": "abc",
            "fee": 12
        });

        let quote = QuoteResponse::from_data(&data).unwrap();
        assert_eq!(quote.to_amount, 250_000_000);
        assert_eq!(quote.from_amount, Some(100_000));
        assert_eq!(quote.rfq_id.as_deref(), Some("abc"));
        assert_eq!(quote.extra.get("fee"), Some(&json!(12)));
    }

    #[test]
    fn test_quote_response_missing_field() {
        let data = json!({"from_asset": "BTC", "to_asset": "USD"});

        match QuoteResponse::from_data(&data) {
            Err(CoreError::MissingField(field)) => assert_eq!(field, "to_amount"),
            other => panic!("expected MissingField, got {other:?}"),
        }
    }

    #[test]
    fn test_quote_response_null_field_is_missing() {
        let data = json!({"from_asset": null, "to_asset": "USD", "to_amount": 1});
        assert!(matches!(
            QuoteResponse::from_data(&data),
            Err(CoreError::MissingField("from_asset"))
        ));
    }

    #[test]
    fn test_quote_response_not_object() {
        assert!(matches!(
            QuoteResponse::from_data(&json!([1, 2])),
            Err(CoreError::InvalidPayload(_))
        ));
    }

    #[test]
    fn test_price_update_from_data() {
        let update = PriceUpdate::from_data(&json!({"pair": "BTC/USD", "price": 65000.5})).unwrap();
        assert_eq!(update.pair.as_deref(), Some("BTC/USD"));
        assert_eq!(update.price, Some(65000.5));
    }
}
