//! Core domain types for the maker quote stream.
//!
//! This crate provides the types exchanged with the maker:
//! - `AssetPair`: Directional pair of assets (e.g. BTC/USD)
//! - `QuoteRequest`: Outbound request for a price quote
//! - `QuoteResponse`: Validated quote pushed back by the maker
//! - `PriceUpdate`: Streamed price tick for a subscribed pair

pub mod error;
pub mod pair;
pub mod quote;

pub use error::{CoreError, Result};
pub use pair::AssetPair;
pub use quote::{PriceUpdate, QuoteRequest, QuoteResponse};
