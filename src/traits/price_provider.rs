use std::collections::HashMap;

use async_trait::async_trait;

use crate::models::price::{AssetType, PriceQuote, RefreshSummary};

/// Primary market data source; batch oriented
#[async_trait]
pub trait MarketDataProvider: Send + Sync {
    /// Quotes keyed by symbol; symbols without data are simply absent
    async fn get_market_data(
        &self,
        symbols: &[String],
        asset_type: AssetType,
    ) -> anyhow::Result<HashMap<String, PriceQuote>>;

    /// Single-symbol convenience over [`get_market_data`](Self::get_market_data)
    async fn get_quote(&self, symbol: &str, asset_type: AssetType) -> anyhow::Result<Option<PriceQuote>> {
        let mut quotes = self.get_market_data(&[symbol.to_string()], asset_type).await?;
        Ok(quotes.remove(symbol))
    }
}

/// Fallback per-symbol price lookup
#[async_trait]
pub trait AssetPriceProvider: Send + Sync {
    async fn fetch_asset_price(&self, symbol: &str, asset_type: AssetType) -> anyhow::Result<Option<PriceQuote>>;
}

/// Server-side bulk refresh of every live-tracked position
#[async_trait]
pub trait LivePriceRefresher: Send + Sync {
    async fn refresh_live_prices(&self) -> anyhow::Result<RefreshSummary>;
}
