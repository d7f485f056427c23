use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::error::StateError;
use crate::models::keys::StateKey;
use crate::sync::engine::{SyncEngine, STATE_TABLE};
use crate::traits::change_feed::{ChangeEvent, ChangeFeed, ChangeStream};

const RESUBSCRIBE_BASE_DELAY: Duration = Duration::from_millis(500);
const RESUBSCRIBE_MAX_DELAY: Duration = Duration::from_secs(30);

/// How an event on a watched table maps to the key it invalidates
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyRoute {
    /// Every event invalidates this key
    Fixed(StateKey),
    /// The affected key is named by this column of the changed row
    Column(String),
}

/// Remote table whose mutations invalidate local keys
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableBinding {
    pub table: String,
    pub route: KeyRoute,
}

impl TableBinding {
    pub fn fixed(table: impl Into<String>, key: StateKey) -> Self {
        Self {
            table: table.into(),
            route: KeyRoute::Fixed(key),
        }
    }

    pub fn by_column(table: impl Into<String>, column: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            route: KeyRoute::Column(column.into()),
        }
    }

    /// The state table the sync engine pulls from, routed by its `key` column
    pub fn defaults() -> Vec<TableBinding> {
        vec![TableBinding::by_column(STATE_TABLE, "key")]
    }

    /// Key named by `event`, if it is one this process syncs
    pub fn key_for(&self, event: &ChangeEvent) -> Option<StateKey> {
        match &self.route {
            KeyRoute::Fixed(key) => Some(*key),
            KeyRoute::Column(column) => {
                let name = event.record.as_ref()?.get(column)?.as_str()?;
                name.parse::<StateKey>().ok().filter(|key| key.is_persisted())
            }
        }
    }

    /// Keys a missed event on this table could have touched
    fn keys(&self) -> Vec<StateKey> {
        match &self.route {
            KeyRoute::Fixed(key) => vec![*key],
            KeyRoute::Column(_) => StateKey::PERSISTED.to_vec(),
        }
    }

    fn channel_name(&self) -> String {
        format!("{}-changes", self.table)
    }
}

struct OpenChannel {
    name: String,
    closed: Arc<AtomicBool>,
    task: JoinHandle<()>,
}

/// Everything a channel task needs once `open` has returned
struct ChannelWorker {
    feed: Arc<dyn ChangeFeed>,
    engine: Arc<SyncEngine>,
    binding: TableBinding,
    name: String,
    closed: Arc<AtomicBool>,
}

impl ChannelWorker {
    /// Act on events until closed. A stream that ends on its own is
    /// resubscribed with backoff, then every key it covers is re-pulled.
    async fn run(self, mut stream: ChangeStream) {
        loop {
            while let Some(event) = stream.recv().await {
                if self.is_closed() {
                    return;
                }
                match self.binding.key_for(&event) {
                    Some(key) => {
                        debug!(table = %event.table, kind = ?event.kind, key = %key, "remote change");
                        self.invalidate(key).await;
                    }
                    None => debug!(table = %event.table, kind = ?event.kind, "change for no synced key; ignored"),
                }
            }
            if self.is_closed() {
                return;
            }

            warn!(channel = %self.name, "change stream ended; resubscribing");
            stream = match self.resubscribe().await {
                Some(stream) => stream,
                None => return,
            };
            for key in self.binding.keys() {
                self.invalidate(key).await;
            }
        }
    }

    async fn resubscribe(&self) -> Option<ChangeStream> {
        let mut attempt: u32 = 0;
        loop {
            let factor = 2u32.saturating_pow(attempt.min(16));
            let delay = RESUBSCRIBE_BASE_DELAY.saturating_mul(factor).min(RESUBSCRIBE_MAX_DELAY);
            tokio::time::sleep(delay).await;
            if self.is_closed() {
                return None;
            }
            attempt += 1;
            match self.feed.subscribe(&self.name, &self.binding.table).await {
                Ok(stream) => {
                    info!(channel = %self.name, attempt, "realtime channel resubscribed");
                    return Some(stream);
                }
                Err(e) => warn!(channel = %self.name, attempt, "resubscribe failed: {:#}", e),
            }
        }
    }

    async fn invalidate(&self, key: StateKey) {
        self.engine.store().mark_stale(key);
        match self.engine.refresh_key(key).await {
            Ok(outcome) => debug!(key = %key, ?outcome, "invalidation pull finished"),
            Err(StateError::AuthRequired) => warn!(key = %key, "invalidation ignored: no session"),
            Err(err) => error!(key = %key, "invalidation pull failed: {}", err),
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

/// Turns remote change events into targeted pulls of the affected key
pub struct RealtimeInvalidationBridge {
    feed: Arc<dyn ChangeFeed>,
    engine: Arc<SyncEngine>,
    bindings: Vec<TableBinding>,
    channels: Mutex<Vec<OpenChannel>>,
}

impl RealtimeInvalidationBridge {
    pub fn new(feed: Arc<dyn ChangeFeed>, engine: Arc<SyncEngine>, bindings: Vec<TableBinding>) -> Self {
        Self {
            feed,
            engine,
            bindings,
            channels: Mutex::new(Vec::new()),
        }
    }

    pub fn bindings(&self) -> &[TableBinding] {
        &self.bindings
    }

    pub fn is_open(&self) -> bool {
        !self.channels.lock().is_empty()
    }

    /// Subscribe one channel per binding. Reopening closes the previous set first.
    pub async fn open(&self) -> anyhow::Result<()> {
        if self.is_open() {
            self.close().await;
        }

        let mut opened = Vec::with_capacity(self.bindings.len());
        for binding in &self.bindings {
            let name = binding.channel_name();
            let stream = match self.feed.subscribe(&name, &binding.table).await {
                Ok(stream) => stream,
                Err(e) => {
                    // tear down what was opened so far
                    for channel in opened {
                        Self::shutdown_channel(self.feed.as_ref(), channel).await;
                    }
                    return Err(e.context(format!("failed to subscribe to {}", binding.table)));
                }
            };

            let closed = Arc::new(AtomicBool::new(false));
            let worker = ChannelWorker {
                feed: self.feed.clone(),
                engine: self.engine.clone(),
                binding: binding.clone(),
                name: name.clone(),
                closed: closed.clone(),
            };
            let task = tokio::spawn(worker.run(stream));

            info!(channel = %name, table = %binding.table, "realtime channel open");
            opened.push(OpenChannel { name, closed, task });
        }

        *self.channels.lock() = opened;
        Ok(())
    }

    /// Unsubscribe every channel. Events already queued are not acted on.
    pub async fn close(&self) {
        let channels = std::mem::take(&mut *self.channels.lock());
        for channel in channels {
            Self::shutdown_channel(self.feed.as_ref(), channel).await;
        }
    }

    async fn shutdown_channel(feed: &dyn ChangeFeed, channel: OpenChannel) {
        channel.closed.store(true, Ordering::Release);
        channel.task.abort();
        if let Err(e) = feed.remove_channel(&channel.name).await {
            warn!(channel = %channel.name, "failed to remove channel: {}", e);
        }
        info!(channel = %channel.name, "realtime channel closed");
    }
}

impl Drop for RealtimeInvalidationBridge {
    fn drop(&mut self) {
        for channel in self.channels.get_mut().drain(..) {
            channel.closed.store(true, Ordering::Release);
            channel.task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::traits::change_feed::ChangeKind;
    use serde_json::json;

    fn event(record: Option<serde_json::Value>) -> ChangeEvent {
        ChangeEvent {
            table: STATE_TABLE.to_string(),
            kind: ChangeKind::Update,
            record,
        }
    }

    #[test]
    fn state_rows_route_by_key_column() {
        let binding = &TableBinding::defaults()[0];
        assert_eq!(binding.key_for(&event(Some(json!({ "key": "expenses" })))), Some(StateKey::Expenses));
        assert_eq!(binding.key_for(&event(Some(json!({ "key": "ui" })))), Some(StateKey::Ui));
    }

    #[test]
    fn rows_without_a_synced_key_are_ignored() {
        let binding = &TableBinding::defaults()[0];
        assert_eq!(binding.key_for(&event(None)), None);
        assert_eq!(binding.key_for(&event(Some(json!({ "id": 4 })))), None);
        assert_eq!(binding.key_for(&event(Some(json!({ "key": "insights" })))), None);
        assert_eq!(binding.key_for(&event(Some(json!({ "key": "bogus" })))), None);
    }

    #[test]
    fn fixed_binding_ignores_the_row() {
        let binding = TableBinding::fixed("investments", StateKey::Investments);
        assert_eq!(binding.key_for(&event(None)), Some(StateKey::Investments));
        assert_eq!(binding.keys(), vec![StateKey::Investments]);
    }
}
