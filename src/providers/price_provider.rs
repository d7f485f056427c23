use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::debug;

use crate::models::price::{AssetType, PriceQuote, PriceSource};
use crate::traits::function_invoker::FunctionInvoker;
use crate::traits::price_provider::{AssetPriceProvider, MarketDataProvider};

/// Edge function serving batched market data
pub const GET_MARKET_DATA: &str = "get-market-data";

const DEFAULT_CURRENCY: &str = "USD";

#[derive(Debug, Deserialize)]
struct MarketRow {
    symbol: String,
    price: Option<f64>,
    #[serde(default)]
    currency: Option<String>,
}

/// Primary provider backed by the market data edge function
pub struct FunctionMarketData {
    functions: Arc<dyn FunctionInvoker>,
}

impl FunctionMarketData {
    pub fn new(functions: Arc<dyn FunctionInvoker>) -> Self {
        Self { functions }
    }
}

/// Accepts either a bare array of rows or `{ "data": [...] }`
fn parse_market_rows(body: Value) -> anyhow::Result<Vec<MarketRow>> {
    let rows = match body {
        Value::Object(mut map) => map.remove("data").unwrap_or(Value::Array(Vec::new())),
        Value::Null => Value::Array(Vec::new()),
        other => other,
    };
    serde_json::from_value(rows).context("unexpected market data payload")
}

#[async_trait]
impl MarketDataProvider for FunctionMarketData {
    async fn get_market_data(
        &self,
        symbols: &[String],
        asset_type: AssetType,
    ) -> anyhow::Result<HashMap<String, PriceQuote>> {
        if symbols.is_empty() {
            return Ok(HashMap::new());
        }
        let body = self
            .functions
            .invoke(GET_MARKET_DATA, json!({ "symbols": symbols, "assetType": asset_type }))
            .await?;

        let quotes = parse_market_rows(body)?
            .into_iter()
            .filter_map(|row| {
                let price = row.price?;
                let currency = row.currency.unwrap_or_else(|| DEFAULT_CURRENCY.to_string());
                let quote = PriceQuote::new(row.symbol.to_uppercase(), price, currency, PriceSource::Primary);
                quote.is_usable().then(|| (quote.symbol.clone(), quote))
            })
            .collect::<HashMap<_, _>>();
        debug!(requested = symbols.len(), received = quotes.len(), "market data fetched");
        Ok(quotes)
    }
}

/// Fallback provider reading a chart-style quote endpoint, with a short-lived cache
pub struct HttpAssetPriceProvider {
    client: Client,
    base_url: String,
    price_cache: Arc<DashMap<String, PriceQuote>>,
    max_age: Duration,
}

impl HttpAssetPriceProvider {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            price_cache: Arc::new(DashMap::new()),
            max_age: Duration::from_secs(60),
        }
    }

    pub fn with_max_age(mut self, max_age: Duration) -> Self {
        self.max_age = max_age;
        self
    }

    /// Ticker as the quote endpoint expects it, e.g. `BTC` → `BTC-USD` for crypto
    fn ticker(symbol: &str, asset_type: AssetType) -> String {
        match asset_type {
            AssetType::Crypto if !symbol.contains('-') => format!("{symbol}-{DEFAULT_CURRENCY}"),
            _ => symbol.to_string(),
        }
    }

    /// Cache lookup by quote-endpoint ticker, so one symbol under two asset types never collides
    fn cached(&self, ticker: &str) -> Option<PriceQuote> {
        let quote = self.price_cache.get(ticker)?;
        let age = Utc::now().signed_duration_since(quote.fetched_at).to_std().unwrap_or_default();
        (age <= self.max_age).then(|| quote.clone())
    }

    async fn fetch_external_price(&self, symbol: &str, ticker: &str) -> anyhow::Result<Option<PriceQuote>> {
        let url = format!("{}/v8/finance/chart/{}", self.base_url, ticker);
        let response = self
            .client
            .get(&url)
            .query(&[("interval", "1d"), ("range", "1d")])
            .send()
            .await
            .with_context(|| format!("quote request for {symbol} failed"))?;
        let status = response.status();
        if !status.is_success() {
            anyhow::bail!("quote endpoint returned {status} for {symbol}");
        }
        let body: Value = response.json().await.context("invalid quote response")?;
        Ok(parse_chart_quote(symbol, &body))
    }
}

/// Extract `chart.result[0].meta.regularMarketPrice` (and its currency)
fn parse_chart_quote(symbol: &str, body: &Value) -> Option<PriceQuote> {
    let meta = body.pointer("/chart/result/0/meta")?;
    let price = meta.get("regularMarketPrice")?.as_f64()?;
    let currency = meta
        .get("currency")
        .and_then(Value::as_str)
        .unwrap_or(DEFAULT_CURRENCY);
    let quote = PriceQuote::new(symbol, price, currency, PriceSource::Fallback);
    quote.is_usable().then_some(quote)
}

#[async_trait]
impl AssetPriceProvider for HttpAssetPriceProvider {
    async fn fetch_asset_price(&self, symbol: &str, asset_type: AssetType) -> anyhow::Result<Option<PriceQuote>> {
        let ticker = Self::ticker(symbol, asset_type);
        // Check cache first
        if let Some(quote) = self.cached(&ticker) {
            return Ok(Some(quote));
        }

        let quote = self.fetch_external_price(symbol, &ticker).await?;
        if let Some(quote) = &quote {
            debug!(symbol, ticker = %ticker, price = quote.price, "fallback price fetched");
            self.price_cache.insert(ticker, quote.clone());
        }
        Ok(quote)
    }
}
