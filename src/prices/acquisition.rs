use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, ReentrantMutex};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::models::price::{AssetType, PriceQuote, PriceRequest, PriceStatus};
use crate::models::typed;
use crate::prices::race::{first_some, Generation};
use crate::store::keyed_store::KeyedStore;
use crate::traits::price_provider::{AssetPriceProvider, MarketDataProvider};
use crate::utils::helper::normalize_symbol;

pub const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(500);
pub const DEFAULT_FETCH_TIMEOUT: Duration = Duration::from_secs(10);

/// Shared pieces a fetch task needs after the caller has moved on
#[derive(Clone)]
struct FetchContext {
    primary: Arc<dyn MarketDataProvider>,
    fallback: Arc<dyn AssetPriceProvider>,
    store: Arc<KeyedStore>,
    status: Arc<watch::Sender<PriceStatus>>,
    generation: Generation,
    /// Held while checking the generation and writing a result, and while
    /// advancing the generation. Reentrant so a store listener may call `request`.
    commit: Arc<ReentrantMutex<()>>,
    debounce: Duration,
    fetch_timeout: Duration,
}

impl FetchContext {
    async fn run(self, generation: u64, request: PriceRequest) {
        tokio::time::sleep(self.debounce).await;
        {
            let _commit = self.commit.lock();
            if !self.generation.is_current(generation) {
                return;
            }
            self.status.send_replace(PriceStatus::Fetching(request.clone()));
        }

        let quote = first_some(
            self.from_primary(&request.symbol, request.asset_type),
            self.from_fallback(&request.symbol, request.asset_type),
        )
        .await;

        let _commit = self.commit.lock();
        if !self.generation.is_current(generation) {
            debug!(symbol = %request.symbol, "discarding superseded price result");
            return;
        }
        match quote {
            Some(quote) => {
                info!(symbol = %quote.symbol, price = quote.price, source = ?quote.source, "price resolved");
                let cached = quote.clone();
                self.store.update::<typed::Quotes, _>(move |quotes| {
                    quotes.insert(cached.symbol.clone(), cached);
                });
                // a Quotes listener on this thread may have issued a newer request
                if self.generation.is_current(generation) {
                    self.status.send_replace(PriceStatus::Resolved(quote));
                }
            }
            None => {
                let status = PriceStatus::Failed(request);
                if let Some(err) = status.failure() {
                    warn!("{} from both providers", err);
                }
                self.status.send_replace(status);
            }
        }
    }

    async fn from_primary(&self, symbol: &str, asset_type: AssetType) -> Option<PriceQuote> {
        match tokio::time::timeout(self.fetch_timeout, self.primary.get_quote(symbol, asset_type)).await {
            Ok(Ok(quote)) => quote.filter(PriceQuote::is_usable),
            Ok(Err(e)) => {
                warn!(symbol, "primary price provider failed: {}", e);
                None
            }
            Err(_) => {
                warn!(symbol, "primary price provider timed out");
                None
            }
        }
    }

    async fn from_fallback(&self, symbol: &str, asset_type: AssetType) -> Option<PriceQuote> {
        match tokio::time::timeout(self.fetch_timeout, self.fallback.fetch_asset_price(symbol, asset_type)).await {
            Ok(Ok(quote)) => quote.filter(PriceQuote::is_usable),
            Ok(Err(e)) => {
                warn!(symbol, "fallback price provider failed: {}", e);
                None
            }
            Err(_) => {
                warn!(symbol, "fallback price provider timed out");
                None
            }
        }
    }
}

/// Debounced, cancellable price lookup for one input (e.g. the symbol field of
/// an "add investment" form). Only the latest request can reach the store.
pub struct LivePriceAcquisition {
    ctx: FetchContext,
    pending: Mutex<Option<JoinHandle<()>>>,
}

impl LivePriceAcquisition {
    pub fn new(
        primary: Arc<dyn MarketDataProvider>,
        fallback: Arc<dyn AssetPriceProvider>,
        store: Arc<KeyedStore>,
    ) -> Self {
        Self {
            ctx: FetchContext {
                primary,
                fallback,
                store,
                status: Arc::new(watch::channel(PriceStatus::Idle).0),
                generation: Generation::new(),
                commit: Arc::new(ReentrantMutex::new(())),
                debounce: DEFAULT_DEBOUNCE,
                fetch_timeout: DEFAULT_FETCH_TIMEOUT,
            },
            pending: Mutex::new(None),
        }
    }

    pub fn with_timing(mut self, debounce: Duration, fetch_timeout: Duration) -> Self {
        self.ctx.debounce = debounce;
        self.ctx.fetch_timeout = fetch_timeout;
        self
    }

    pub fn status(&self) -> PriceStatus {
        self.ctx.status.borrow().clone()
    }

    /// Receiver that observes every status transition
    pub fn watch(&self) -> watch::Receiver<PriceStatus> {
        self.ctx.status.subscribe()
    }

    /// Start tracking `symbol`. Whatever was pending for the previous symbol is
    /// cancelled before this returns. Must be called within a Tokio runtime.
    pub fn request(&self, symbol: &str, asset_type: AssetType) {
        let generation = self.supersede();
        let symbol = normalize_symbol(symbol);
        if symbol.is_empty() {
            self.ctx.status.send_replace(PriceStatus::Idle);
            return;
        }

        let request = PriceRequest::new(symbol, asset_type);
        debug!(symbol = %request.symbol, asset_type = %asset_type, generation, "price request debouncing");
        self.ctx.status.send_replace(PriceStatus::Debouncing(request.clone()));

        let handle = tokio::spawn(self.ctx.clone().run(generation, request));
        *self.pending.lock() = Some(handle);
    }

    /// Cancel anything pending and go back to idle
    pub fn disable(&self) {
        self.supersede();
        self.ctx.status.send_replace(PriceStatus::Idle);
    }

    fn supersede(&self) -> u64 {
        let generation = {
            let _commit = self.ctx.commit.lock();
            self.ctx.generation.advance()
        };
        if let Some(previous) = self.pending.lock().take() {
            previous.abort();
        }
        generation
    }
}

impl Drop for LivePriceAcquisition {
    fn drop(&mut self) {
        if let Some(pending) = self.pending.get_mut().take() {
            pending.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::price::PriceSource;
    use async_trait::async_trait;
    use std::collections::HashMap;

    #[derive(Clone, Copy)]
    enum Reply {
        Price(f64, Duration),
        /// Answers once the test releases a gate permit
        Gated(f64),
        Nothing,
        Stall,
    }

    struct FakeProvider {
        reply: Reply,
        gate: tokio::sync::Semaphore,
        calls: Mutex<Vec<String>>,
    }

    impl FakeProvider {
        fn new(reply: Reply) -> Arc<Self> {
            Arc::new(Self {
                reply,
                gate: tokio::sync::Semaphore::new(0),
                calls: Mutex::new(Vec::new()),
            })
        }

        async fn answer(&self, symbol: &str, source: PriceSource) -> Option<PriceQuote> {
            self.calls.lock().push(symbol.to_string());
            match self.reply {
                Reply::Price(price, delay) => {
                    tokio::time::sleep(delay).await;
                    Some(PriceQuote::new(symbol, price, "USD", source))
                }
                Reply::Gated(price) => {
                    self.gate.acquire().await.ok()?.forget();
                    Some(PriceQuote::new(symbol, price, "USD", source))
                }
                Reply::Nothing => None,
                Reply::Stall => std::future::pending().await,
            }
        }
    }

    #[async_trait]
    impl MarketDataProvider for FakeProvider {
        async fn get_market_data(
            &self,
            symbols: &[String],
            _asset_type: AssetType,
        ) -> anyhow::Result<HashMap<String, PriceQuote>> {
            let mut quotes = HashMap::new();
            for symbol in symbols {
                if let Some(quote) = self.answer(symbol, PriceSource::Primary).await {
                    quotes.insert(symbol.clone(), quote);
                }
            }
            Ok(quotes)
        }
    }

    #[async_trait]
    impl AssetPriceProvider for FakeProvider {
        async fn fetch_asset_price(&self, symbol: &str, _asset_type: AssetType) -> anyhow::Result<Option<PriceQuote>> {
            Ok(self.answer(symbol, PriceSource::Fallback).await)
        }
    }

    async fn settled(acquisition: &LivePriceAcquisition) -> PriceStatus {
        let mut rx = acquisition.watch();
        let status = rx
            .wait_for(|status| matches!(status, PriceStatus::Resolved(_) | PriceStatus::Failed(_)))
            .await
            .unwrap();
        status.clone()
    }

    #[tokio::test(start_paused = true)]
    async fn newer_request_supersedes_pending_one() {
        let primary = FakeProvider::new(Reply::Price(10.0, Duration::from_millis(50)));
        let fallback = FakeProvider::new(Reply::Nothing);
        let store = Arc::new(KeyedStore::new());
        let acquisition = LivePriceAcquisition::new(primary.clone(), fallback, store.clone());

        acquisition.request("x", AssetType::Stock);
        tokio::time::sleep(Duration::from_millis(200)).await;
        acquisition.request("y", AssetType::Stock);

        let status = settled(&acquisition).await;
        assert_eq!(status.quote().map(|q| q.symbol.as_str()), Some("Y"));
        assert_eq!(*primary.calls.lock(), vec!["Y".to_string()]);

        let quotes = store.get::<typed::Quotes>();
        assert!(quotes.contains_key("Y"));
        assert!(!quotes.contains_key("X"));
    }

    #[tokio::test(start_paused = true)]
    async fn fallback_answers_when_primary_hangs() {
        let primary = FakeProvider::new(Reply::Stall);
        let fallback = FakeProvider::new(Reply::Price(101.5, Duration::from_millis(300)));
        let store = Arc::new(KeyedStore::new());
        let acquisition = LivePriceAcquisition::new(primary, fallback, store.clone());

        acquisition.request(" aapl ", AssetType::Stock);
        assert!(acquisition.status().is_pending());

        let status = settled(&acquisition).await;
        let quote = status.quote().cloned().unwrap();
        assert_eq!(quote.symbol, "AAPL");
        assert_eq!(quote.price, 101.5);
        assert_eq!(quote.currency, "USD");
        assert_eq!(quote.source, PriceSource::Fallback);
        assert_eq!(store.get::<typed::Quotes>()["AAPL"].price, 101.5);
    }

    #[tokio::test(start_paused = true)]
    async fn both_providers_failing_reports_failed() {
        let primary = FakeProvider::new(Reply::Stall);
        let fallback = FakeProvider::new(Reply::Nothing);
        let store = Arc::new(KeyedStore::new());
        let acquisition = LivePriceAcquisition::new(primary, fallback, store.clone())
            .with_timing(Duration::from_millis(500), Duration::from_secs(10));

        acquisition.request("ZZZZ", AssetType::Crypto);

        let status = settled(&acquisition).await;
        assert!(matches!(status, PriceStatus::Failed(ref request) if request.symbol == "ZZZZ"));
        assert!(store.get::<typed::Quotes>().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn disable_cancels_before_any_fetch() {
        let primary = FakeProvider::new(Reply::Price(5.0, Duration::ZERO));
        let fallback = FakeProvider::new(Reply::Nothing);
        let store = Arc::new(KeyedStore::new());
        let acquisition = LivePriceAcquisition::new(primary.clone(), fallback, store);

        acquisition.request("MSFT", AssetType::Stock);
        acquisition.disable();
        tokio::time::sleep(Duration::from_secs(2)).await;

        assert_eq!(acquisition.status(), PriceStatus::Idle);
        assert!(primary.calls.lock().is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn result_committing_after_a_newer_request_is_discarded() {
        let primary = FakeProvider::new(Reply::Gated(10.0));
        let store = Arc::new(KeyedStore::new());
        let acquisition = LivePriceAcquisition::new(primary.clone(), FakeProvider::new(Reply::Nothing), store.clone())
            .with_timing(Duration::from_millis(10), Duration::from_secs(5));

        acquisition.request("OLD", AssetType::Stock);
        while primary.calls.lock().is_empty() {
            std::thread::sleep(Duration::from_millis(5));
        }

        // the OLD fetch completes while the commit lock is held elsewhere,
        // and a newer request lands before it can commit
        let held = acquisition.ctx.commit.lock();
        primary.gate.add_permits(1);
        std::thread::sleep(Duration::from_millis(50));
        acquisition.request("NEW", AssetType::Stock);
        drop(held);
        primary.gate.add_permits(1);

        let status = settled(&acquisition).await;
        assert_eq!(status.quote().map(|q| q.symbol.as_str()), Some("NEW"));
        let quotes = store.get::<typed::Quotes>();
        assert!(quotes.contains_key("NEW"));
        assert!(!quotes.contains_key("OLD"));
    }

    #[tokio::test]
    async fn blank_symbol_goes_idle() {
        let acquisition = LivePriceAcquisition::new(
            FakeProvider::new(Reply::Nothing),
            FakeProvider::new(Reply::Nothing),
            Arc::new(KeyedStore::new()),
        );
        acquisition.request("   ", AssetType::Stock);
        assert_eq!(acquisition.status(), PriceStatus::Idle);
    }
}
