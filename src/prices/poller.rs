use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::error::StateError;
use crate::models::keys::StateKey;
use crate::models::price::RefreshSummary;
use crate::models::value::typed;
use crate::notifications::NoticeQueue;
use crate::sync::engine::SyncEngine;
use crate::traits::notice_handler::Notice;
use crate::traits::price_provider::LivePriceRefresher;

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// Periodic bulk refresh of live-tracked positions
pub struct PricePoller {
    refresher: Arc<dyn LivePriceRefresher>,
    engine: Arc<SyncEngine>,
    notices: Option<NoticeQueue>,
    period: Duration,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl PricePoller {
    pub fn new(refresher: Arc<dyn LivePriceRefresher>, engine: Arc<SyncEngine>, period: Duration) -> Self {
        Self {
            refresher,
            engine,
            notices: None,
            period,
            task: Mutex::new(None),
        }
    }

    /// Route manual-refresh feedback to `notices`
    pub fn with_notices(mut self, notices: NoticeQueue) -> Self {
        self.notices = Some(notices);
        self
    }

    pub fn is_running(&self) -> bool {
        self.task.lock().as_ref().is_some_and(|task| !task.is_finished())
    }

    /// Refresh once right away, then every period. A second call restarts the loop.
    pub fn start(self: &Arc<Self>) {
        let poller = Arc::clone(self);
        let task = tokio::spawn(async move {
            let mut ticker = interval(poller.period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                // first tick completes immediately
                ticker.tick().await;
                poller.background_cycle().await;
            }
        });
        if let Some(previous) = self.task.lock().replace(task) {
            previous.abort();
        }
        info!(period_secs = self.period.as_secs(), "price poller started");
    }

    pub fn stop(&self) {
        if let Some(task) = self.task.lock().take() {
            task.abort();
            info!("price poller stopped");
        }
    }

    /// User-triggered refresh: same bulk path, but the outcome is returned and
    /// announced as a notice.
    pub async fn refresh_now(&self) -> Result<RefreshSummary, StateError> {
        let result = self.cycle().await;
        if let Some(notices) = &self.notices {
            let notice = match &result {
                Ok(summary) if summary.updated > 0 => {
                    Notice::success("Prices refreshed").with_detail(format!("{} positions updated", summary.updated))
                }
                Ok(_) => Notice::success("Prices are up to date"),
                Err(err) => Notice::error("Price refresh failed", err.to_string()),
            };
            notices.notify(notice);
        }
        result
    }

    async fn background_cycle(&self) {
        match self.cycle().await {
            Ok(summary) if summary.updated > 0 => info!(updated = summary.updated, "live prices refreshed"),
            Ok(_) => debug!("live price refresh: nothing changed"),
            Err(err) => warn!("background price refresh failed: {}", err),
        }
    }

    async fn cycle(&self) -> Result<RefreshSummary, StateError> {
        let summary = self
            .refresher
            .refresh_live_prices()
            .await
            .map_err(|e| StateError::sync(StateKey::Investments, &e))?;
        if summary.updated > 0 {
            self.invalidate_investments().await;
            self.apply_prices(&summary.prices);
        }
        Ok(summary)
    }

    /// Write reported prices into matching live-tracked positions. The edit is
    /// pushed like any other, which is how other sessions learn of it.
    fn apply_prices(&self, prices: &BTreeMap<String, f64>) {
        let store = self.engine.store();
        let price_for = |symbol: &str| prices.get(&symbol.to_ascii_uppercase()).copied().filter(|p| *p > 0.0);
        let stale = store.get::<typed::Investments>().iter().any(|position| {
            position.is_live_tracked
                && price_for(&position.symbol).is_some_and(|price| position.current_price != Some(price))
        });
        if !stale {
            return;
        }

        let now = Utc::now();
        let mut applied = 0;
        store.update::<typed::Investments, _>(|positions| {
            for position in positions.iter_mut().filter(|position| position.is_live_tracked) {
                if let Some(price) = price_for(&position.symbol) {
                    position.current_price = Some(price);
                    position.last_price_update = Some(now);
                    applied += 1;
                }
            }
        });
        debug!(applied, "refreshed prices written to investments");
    }

    async fn invalidate_investments(&self) {
        self.engine.store().mark_stale(StateKey::Investments);
        if let Err(err) = self.engine.pull_key(StateKey::Investments).await {
            warn!("failed to re-read investments after price refresh: {}", err);
        }
    }
}

impl Drop for PricePoller {
    fn drop(&mut self) {
        if let Some(task) = self.task.get_mut().take() {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::memory_remote::MemoryRemote;
    use crate::store::keyed_store::KeyedStore;
    use crate::sync::retry::RetryPolicy;
    use crate::traits::notice_handler::{NoticeHandler, NoticeLevel};
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::mpsc::{unbounded_channel, UnboundedSender};

    struct Scripted {
        updated: usize,
        fail: bool,
        prices: BTreeMap<String, f64>,
        calls: AtomicUsize,
    }

    impl Scripted {
        fn new(updated: usize, fail: bool) -> Arc<Self> {
            Arc::new(Self {
                updated,
                fail,
                prices: BTreeMap::new(),
                calls: AtomicUsize::new(0),
            })
        }

        fn with_prices(updated: usize, prices: &[(&str, f64)]) -> Arc<Self> {
            Arc::new(Self {
                updated,
                fail: false,
                prices: prices.iter().map(|(symbol, price)| (symbol.to_string(), *price)).collect(),
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl LivePriceRefresher for Scripted {
        async fn refresh_live_prices(&self) -> anyhow::Result<RefreshSummary> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                anyhow::bail!("edge function unavailable");
            }
            Ok(RefreshSummary {
                updated: self.updated,
                failed: 0,
                prices: self.prices.clone(),
            })
        }
    }

    struct Forward(UnboundedSender<Notice>);

    #[async_trait]
    impl NoticeHandler for Forward {
        async fn handle_notice(&self, notice: Notice) {
            let _ = self.0.send(notice);
        }
    }

    fn engine_with_investments(remote: &Arc<MemoryRemote>) -> Arc<SyncEngine> {
        remote.seed(
            "user_state",
            json!({
                "user_id": "u1",
                "key": "investments",
                "value": [{
                    "id": "i1", "symbol": "AAPL", "asset_type": "stock", "quantity": 2.0,
                    "buy_price": 150.0, "current_price": 190.0, "is_live_tracked": true
                }],
                "revision": 3
            }),
        );
        SyncEngine::new(Arc::new(KeyedStore::new()), remote.clone(), RetryPolicy::none())
    }

    #[tokio::test]
    async fn updates_trigger_an_investments_pull() {
        let remote = Arc::new(MemoryRemote::with_user("u1"));
        let engine = engine_with_investments(&remote);
        let poller = PricePoller::new(Scripted::new(2, false), engine.clone(), DEFAULT_POLL_INTERVAL);

        let summary = poller.refresh_now().await.unwrap();

        assert_eq!(summary.updated, 2);
        assert_eq!(remote.select_count(), 1);
        assert_eq!(engine.store().get::<typed::Investments>()[0].current_price, Some(190.0));
        assert!(!engine.store().is_stale(StateKey::Investments));
    }

    #[tokio::test]
    async fn reported_prices_land_in_tracked_positions_and_sync() {
        let remote = Arc::new(MemoryRemote::with_user("u1"));
        let engine = engine_with_investments(&remote);
        let poller = PricePoller::new(
            Scripted::with_prices(1, &[("AAPL", 201.5), ("MSFT", 420.0)]),
            engine.clone(),
            DEFAULT_POLL_INTERVAL,
        );

        poller.refresh_now().await.unwrap();
        engine.wait_idle().await;

        let positions = engine.store().get::<typed::Investments>();
        assert_eq!(positions[0].current_price, Some(201.5));
        assert!(positions[0].last_price_update.is_some());
        assert_eq!(engine.store().revision(StateKey::Investments), 4);
        assert!(!engine.store().is_dirty(StateKey::Investments));
        let row = &remote.rows("user_state")[0];
        assert_eq!(row["revision"], 4);
        assert_eq!(row["value"][0]["current_price"], 201.5);
    }

    #[tokio::test]
    async fn unchanged_prices_do_not_bump_the_revision() {
        let remote = Arc::new(MemoryRemote::with_user("u1"));
        let engine = engine_with_investments(&remote);
        let poller = PricePoller::new(Scripted::with_prices(1, &[("AAPL", 190.0)]), engine.clone(), DEFAULT_POLL_INTERVAL);

        poller.refresh_now().await.unwrap();

        assert_eq!(engine.store().revision(StateKey::Investments), 3);
        assert!(remote.writes().is_empty());
    }

    #[tokio::test]
    async fn no_updates_means_no_pull() {
        let remote = Arc::new(MemoryRemote::with_user("u1"));
        let engine = engine_with_investments(&remote);
        let poller = PricePoller::new(Scripted::new(0, false), engine, DEFAULT_POLL_INTERVAL);

        poller.refresh_now().await.unwrap();

        assert_eq!(remote.select_count(), 0);
    }

    #[tokio::test]
    async fn manual_refresh_announces_the_outcome() {
        let remote = Arc::new(MemoryRemote::with_user("u1"));
        let engine = engine_with_investments(&remote);
        let (tx, mut rx) = unbounded_channel();
        let notices = NoticeQueue::new(Arc::new(Forward(tx)));

        let ok = PricePoller::new(Scripted::new(1, false), engine.clone(), DEFAULT_POLL_INTERVAL)
            .with_notices(notices.clone());
        ok.refresh_now().await.unwrap();
        let notice = rx.recv().await.unwrap();
        assert_eq!(notice.level, NoticeLevel::Success);
        assert_eq!(notice.detail.as_deref(), Some("1 positions updated"));

        let failing = PricePoller::new(Scripted::new(0, true), engine, DEFAULT_POLL_INTERVAL).with_notices(notices);
        assert!(failing.refresh_now().await.is_err());
        let notice = rx.recv().await.unwrap();
        assert_eq!(notice.level, NoticeLevel::Error);
        assert_eq!(notice.title, "Price refresh failed");
    }

    #[tokio::test(start_paused = true)]
    async fn background_loop_ticks_immediately_then_every_period() {
        let remote = Arc::new(MemoryRemote::with_user("u1"));
        let engine = engine_with_investments(&remote);
        let refresher = Scripted::new(0, false);
        let poller = Arc::new(PricePoller::new(refresher.clone(), engine, Duration::from_secs(300)));

        poller.start();
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(refresher.calls.load(Ordering::SeqCst), 1);

        tokio::time::sleep(Duration::from_secs(300)).await;
        assert_eq!(refresher.calls.load(Ordering::SeqCst), 2);

        poller.stop();
        assert!(!poller.is_running());
        tokio::time::sleep(Duration::from_secs(900)).await;
        assert_eq!(refresher.calls.load(Ordering::SeqCst), 2);
    }
}
