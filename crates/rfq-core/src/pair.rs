//! Asset pair identification.
//!
//! A pair is directional: BTC/USD asks the maker how much USD a given
//! amount of BTC is worth. The canonical string form is `{from}/{to}`,
//! which is also what the maker uses in subscription frames.

use crate::error::{CoreError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Directional asset pair (from → to).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AssetPair {
    pub from_asset: String,
    pub to_asset: String,
}

impl AssetPair {
    pub fn new(from_asset: impl Into<String>, to_asset: impl Into<String>) -> Self {
        Self {
            from_asset: from_asset.into(),
            to_asset: to_asset.into(),
        }
    }

    /// Returns the canonical `{from}/{to}` representation.
    pub fn as_string(&self) -> String {
        format!("{}/{}", self.from_asset, self.to_asset)
    }

    /// Pair with the direction reversed.
    pub fn inverse(&self) -> Self {
        Self {
            from_asset: self.to_asset.clone(),
            to_asset: self.from_asset.clone(),
        }
    }
}

impl fmt::Display for AssetPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.from_asset, self.to_asset)
    }
}

impl FromStr for AssetPair {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self> {
        let (from, to) = s
            .split_once('/')
            .ok_or_else(|| CoreError::InvalidPair(s.to_string()))?;

        let (from, to) = (from.trim(), to.trim());
        if from.is_empty() || to.is_empty() || to.contains('/') {
            return Err(CoreError::InvalidPair(s.to_string()));
        }

        Ok(Self::new(from, to))
    }
}
