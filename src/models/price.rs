use std::collections::BTreeMap;
use std::fmt;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::StateError;

/// Asset class passed to price providers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssetType {
    Stock,
    Crypto,
    MutualFund,
    Etf,
    Other,
}

impl AssetType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Stock => "stock",
            Self::Crypto => "crypto",
            Self::MutualFund => "mutual_fund",
            Self::Etf => "etf",
            Self::Other => "other",
        }
    }
}

impl fmt::Display for AssetType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which provider produced a quote
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PriceSource {
    Primary,
    Fallback,
}

/// A usable price for one symbol
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceQuote {
    pub symbol: String,
    pub price: f64,
    pub currency: String,
    pub source: PriceSource,
    pub fetched_at: DateTime<Utc>,
}

impl PriceQuote {
    pub fn new(symbol: impl Into<String>, price: f64, currency: impl Into<String>, source: PriceSource) -> Self {
        Self {
            symbol: symbol.into(),
            price,
            currency: currency.into(),
            source,
            fetched_at: Utc::now(),
        }
    }

    /// Zero, negative and non-finite prices are treated as "no data"
    pub fn is_usable(&self) -> bool {
        self.price.is_finite() && self.price > 0.0
    }
}

/// A pending price lookup for one symbol
#[derive(Debug, Clone, PartialEq)]
pub struct PriceRequest {
    pub symbol: String,
    pub asset_type: AssetType,
    pub requested_at: Instant,
}

impl PriceRequest {
    pub fn new(symbol: impl Into<String>, asset_type: AssetType) -> Self {
        Self {
            symbol: symbol.into(),
            asset_type,
            requested_at: Instant::now(),
        }
    }
}

/// Display state of a live price acquisition
#[derive(Debug, Clone, PartialEq, Default)]
pub enum PriceStatus {
    #[default]
    Idle,
    Debouncing(PriceRequest),
    Fetching(PriceRequest),
    Resolved(PriceQuote),
    /// Both providers failed; shown as "price unavailable"
    Failed(PriceRequest),
}

impl PriceStatus {
    pub fn quote(&self) -> Option<&PriceQuote> {
        match self {
            PriceStatus::Resolved(quote) => Some(quote),
            _ => None,
        }
    }

    pub fn is_pending(&self) -> bool {
        matches!(self, PriceStatus::Debouncing(_) | PriceStatus::Fetching(_))
    }

    /// Error to show for a failed lookup
    pub fn failure(&self) -> Option<StateError> {
        match self {
            PriceStatus::Failed(request) => Some(StateError::PriceUnavailable {
                symbol: request.symbol.clone(),
            }),
            _ => None,
        }
    }
}

/// Outcome of a bulk live-price refresh
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RefreshSummary {
    pub updated: usize,
    #[serde(default)]
    pub failed: usize,
    /// Latest price per upper-cased symbol, when the refresher reports them
    #[serde(default)]
    pub prices: BTreeMap<String, f64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn non_positive_prices_are_not_usable() {
        assert!(PriceQuote::new("AAPL", 101.5, "USD", PriceSource::Fallback).is_usable());
        assert!(!PriceQuote::new("AAPL", 0.0, "USD", PriceSource::Primary).is_usable());
        assert!(!PriceQuote::new("AAPL", f64::NAN, "USD", PriceSource::Primary).is_usable());
    }

    #[test]
    fn asset_type_serializes_snake_case() {
        let json = serde_json::to_string(&AssetType::MutualFund).unwrap();
        assert_eq!(json, "\"mutual_fund\"");
    }

    #[test]
    fn failed_status_surfaces_price_unavailable() {
        let status = PriceStatus::Failed(PriceRequest::new("ZZZZ", AssetType::Crypto));
        assert_eq!(status.failure().map(|e| e.to_string()).as_deref(), Some("price unavailable for ZZZZ"));
        assert!(PriceStatus::Idle.failure().is_none());
    }
}
