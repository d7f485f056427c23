use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::Value;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::error::StateError;
use crate::models::finance::Insight;
use crate::models::keys::StateKey;
use crate::models::price::RefreshSummary;
use crate::notifications::NoticeQueue;
use crate::prices::acquisition::LivePriceAcquisition;
use crate::prices::poller::PricePoller;
use crate::realtime::bridge::{RealtimeInvalidationBridge, TableBinding};
use crate::store::keyed_store::KeyedStore;
use crate::sync::engine::{SyncEngine, SyncReport};
use crate::tracker::aggregation::AggregationService;
use crate::traits::{
    change_feed::ChangeFeed,
    function_invoker::FunctionInvoker,
    notice_handler::{Notice, NoticeHandler},
    persistence::PersistenceClient,
    price_provider::{AssetPriceProvider, LivePriceRefresher, MarketDataProvider},
};

/// How long shutdown waits for in-flight pushes
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// External collaborators the tracker is wired to
#[derive(Clone)]
pub struct Collaborators {
    pub remote: Arc<dyn PersistenceClient>,
    pub feed: Arc<dyn ChangeFeed>,
    pub functions: Arc<dyn FunctionInvoker>,
    pub market_data: Arc<dyn MarketDataProvider>,
    pub fallback_prices: Arc<dyn AssetPriceProvider>,
    pub refresher: Arc<dyn LivePriceRefresher>,
    pub notices: Arc<dyn NoticeHandler>,
}

/// Session-scoped handle owning the store, sync engine, realtime bridge,
/// price machinery and notice queue
pub struct FinanceTracker {
    config: Config,
    store: Arc<KeyedStore>,
    engine: Arc<SyncEngine>,
    bridge: RealtimeInvalidationBridge,
    poller: Arc<PricePoller>,
    aggregation: AggregationService,
    notices: NoticeQueue,
    market_data: Arc<dyn MarketDataProvider>,
    fallback_prices: Arc<dyn AssetPriceProvider>,
    acquisitions: Mutex<Vec<Weak<LivePriceAcquisition>>>,
}

impl FinanceTracker {
    /// Wire everything together. Must be called within a Tokio runtime.
    pub fn new(config: Config, parts: Collaborators) -> Self {
        let store = Arc::new(KeyedStore::new());
        let engine = SyncEngine::new(store.clone(), parts.remote, config.retry_policy());
        let bridge = RealtimeInvalidationBridge::new(parts.feed, engine.clone(), TableBinding::defaults());
        let notices = NoticeQueue::new(parts.notices);
        let poller = Arc::new(
            PricePoller::new(parts.refresher, engine.clone(), config.poll_interval).with_notices(notices.clone()),
        );
        let aggregation =
            AggregationService::new(parts.functions, store.clone()).with_timeout(config.insights_timeout);

        Self {
            config,
            store,
            engine,
            bridge,
            poller,
            aggregation,
            notices,
            market_data: parts.market_data,
            fallback_prices: parts.fallback_prices,
            acquisitions: Mutex::new(Vec::new()),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn store(&self) -> &Arc<KeyedStore> {
        &self.store
    }

    pub fn engine(&self) -> &Arc<SyncEngine> {
        &self.engine
    }

    pub fn bridge(&self) -> &RealtimeInvalidationBridge {
        &self.bridge
    }

    pub fn poller(&self) -> &Arc<PricePoller> {
        &self.poller
    }

    pub fn notices(&self) -> &NoticeQueue {
        &self.notices
    }

    /// Session start: full pull (retried per the sync policy), then realtime
    /// and polling. A missing session is returned as `AuthRequired` and nothing
    /// else is started. Any other pull failure is reported per key and the
    /// session starts anyway.
    pub async fn start(&self) -> Result<SyncReport, StateError> {
        info!("starting finance tracker");
        let report = match self.engine.refresh_all().await {
            Ok(report) => report,
            Err(StateError::AuthRequired) => return Err(StateError::AuthRequired),
            Err(err) => {
                // realtime events and later pulls reconcile once the remote answers
                warn!("starting without an initial pull: {}", err);
                SyncReport {
                    failed: StateKey::PERSISTED.iter().map(|key| (*key, err.to_string())).collect(),
                    ..SyncReport::default()
                }
            }
        };

        if let Err(e) = self.bridge.open().await {
            // the store still works without live invalidation
            error!("realtime unavailable: {:#}", e);
        }
        self.poller.start();
        Ok(report)
    }

    /// A new price lookup bound to this session's store. Each form input gets its own.
    pub fn price_acquisition(&self) -> Arc<LivePriceAcquisition> {
        let acquisition = Arc::new(
            LivePriceAcquisition::new(self.market_data.clone(), self.fallback_prices.clone(), self.store.clone())
                .with_timing(self.config.price_debounce, self.config.price_fetch_timeout),
        );
        let mut acquisitions = self.acquisitions.lock();
        acquisitions.retain(|weak| weak.strong_count() > 0);
        acquisitions.push(Arc::downgrade(&acquisition));
        acquisition
    }

    /// User-triggered bulk price refresh
    pub async fn refresh_prices(&self) -> Result<RefreshSummary, StateError> {
        self.poller.refresh_now().await
    }

    /// User-triggered save of every pending edit
    pub async fn save_now(&self) -> Result<SyncReport, StateError> {
        let result = self.engine.sync_to_remote().await;
        let notice = match &result {
            Ok(report) if report.is_clean() => Notice::success("All changes saved"),
            Ok(report) => Notice::error("Some changes were not saved", format!("{} keys failed", report.failed.len())),
            Err(err) => Notice::error("Save failed", err.to_string()),
        };
        self.notices.notify(notice);
        result
    }

    pub async fn fetch_insights(&self, body: Value) -> Vec<Insight> {
        self.aggregation.fetch_insights(body).await
    }

    /// Close channels, stop timers, cancel lookups and give pending pushes a
    /// bounded chance to land.
    pub async fn shutdown(&self) {
        info!("shutting down finance tracker");
        self.bridge.close().await;
        self.poller.stop();
        for acquisition in self.acquisitions.lock().drain(..) {
            if let Some(acquisition) = acquisition.upgrade() {
                acquisition.disable();
            }
        }

        if tokio::time::timeout(SHUTDOWN_GRACE, self.engine.wait_idle()).await.is_err() {
            warn!(
                in_flight = self.engine.pushes_in_flight(),
                "pushes still pending at shutdown; edits stay dirty locally"
            );
        }
        self.notices.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::value::typed;
    use crate::providers::memory_remote::MemoryRemote;
    use async_trait::async_trait;
    use std::collections::HashMap;

    struct NoPrices;

    #[async_trait]
    impl MarketDataProvider for NoPrices {
        async fn get_market_data(
            &self,
            _symbols: &[String],
            _asset_type: crate::models::price::AssetType,
        ) -> anyhow::Result<HashMap<String, crate::models::price::PriceQuote>> {
            Ok(HashMap::new())
        }
    }

    #[async_trait]
    impl AssetPriceProvider for NoPrices {
        async fn fetch_asset_price(
            &self,
            _symbol: &str,
            _asset_type: crate::models::price::AssetType,
        ) -> anyhow::Result<Option<crate::models::price::PriceQuote>> {
            Ok(None)
        }
    }

    #[async_trait]
    impl LivePriceRefresher for NoPrices {
        async fn refresh_live_prices(&self) -> anyhow::Result<RefreshSummary> {
            Ok(RefreshSummary::default())
        }
    }

    #[async_trait]
    impl NoticeHandler for NoPrices {
        async fn handle_notice(&self, _notice: Notice) {}
    }

    fn tracker(remote: Arc<MemoryRemote>) -> FinanceTracker {
        let none = Arc::new(NoPrices);
        FinanceTracker::new(
            Config::default(),
            Collaborators {
                remote: remote.clone(),
                feed: remote.clone(),
                functions: remote,
                market_data: none.clone(),
                fallback_prices: none.clone(),
                refresher: none.clone(),
                notices: none,
            },
        )
    }

    #[tokio::test]
    async fn start_without_session_starts_nothing() {
        let remote = Arc::new(MemoryRemote::new());
        let tracker = tracker(remote.clone());

        let err = tracker.start().await.unwrap_err();

        assert!(matches!(err, StateError::AuthRequired));
        assert!(!tracker.bridge().is_open());
        assert!(!tracker.poller().is_running());
        assert_eq!(remote.open_channels(), 0);
    }

    #[tokio::test]
    async fn start_and_shutdown_manage_channels_and_poller() {
        let remote = Arc::new(MemoryRemote::with_user("u1"));
        let tracker = tracker(remote.clone());

        tracker.start().await.unwrap();
        assert_eq!(remote.open_channels(), 1);
        assert!(tracker.poller().is_running());

        tracker.shutdown().await;
        assert_eq!(remote.open_channels(), 0);
        assert!(!tracker.poller().is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn unreachable_remote_still_starts_the_session() {
        let remote = Arc::new(MemoryRemote::with_user("u1"));
        remote.set_fail_reads(true);
        let tracker = tracker(remote.clone());

        let report = tracker.start().await.unwrap();

        assert_eq!(report.failed.len(), StateKey::PERSISTED.len());
        assert_eq!(remote.select_count(), tracker.config().sync_max_attempts as usize);
        assert!(tracker.bridge().is_open());
        assert_eq!(remote.open_channels(), 1);
        assert!(tracker.poller().is_running());
        tracker.shutdown().await;
    }

    #[tokio::test]
    async fn save_now_pushes_dirty_keys() {
        let remote = Arc::new(MemoryRemote::with_user("u1"));
        let tracker = tracker(remote.clone());
        tracker.store().set_typed::<typed::Ui>(Default::default());
        tracker.engine().wait_idle().await;

        let report = tracker.save_now().await.unwrap();

        assert!(report.is_clean());
        assert!(!tracker.store().is_dirty(StateKey::Ui));
    }
}
