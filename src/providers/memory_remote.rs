use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use anyhow::{anyhow, bail};
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use tokio::sync::mpsc::{unbounded_channel, UnboundedSender};
use tracing::debug;

use crate::traits::change_feed::{ChangeEvent, ChangeFeed, ChangeKind, ChangeStream};
use crate::models::price::RefreshSummary;
use crate::providers::rest_client::{parse_refresh_summary, UPDATE_LIVE_PRICES};
use crate::traits::function_invoker::FunctionInvoker;
use crate::traits::price_provider::LivePriceRefresher;
use crate::traits::persistence::{AuthUser, PersistenceClient, Query};

struct Channel {
    table: String,
    sender: UnboundedSender<ChangeEvent>,
}

/// In-process remote: row store, change feed and function host in one.
/// Used for offline runs and as the test double.
#[derive(Default)]
pub struct MemoryRemote {
    user: RwLock<Option<AuthUser>>,
    tables: DashMap<String, Vec<Value>>,
    channels: DashMap<String, Channel>,
    functions: DashMap<String, Value>,
    fail_reads: AtomicBool,
    fail_writes: AtomicBool,
    selects: AtomicUsize,
    writes: Mutex<Vec<(String, Value)>>,
}

impl MemoryRemote {
    pub fn new() -> Self {
        Self::default()
    }

    /// Remote with a signed-in user
    pub fn with_user(user_id: &str) -> Self {
        let remote = Self::new();
        remote.sign_in(user_id);
        remote
    }

    pub fn sign_in(&self, user_id: &str) {
        *self.user.write() = Some(AuthUser {
            id: user_id.to_string(),
            email: None,
        });
    }

    pub fn sign_out(&self) {
        *self.user.write() = None;
    }

    pub fn set_fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Insert a row without emitting a change event
    pub fn seed(&self, table: &str, row: Value) {
        self.tables.entry(table.to_string()).or_default().push(row);
    }

    /// Canned response for [`FunctionInvoker::invoke`]
    pub fn set_function(&self, name: &str, response: Value) {
        self.functions.insert(name.to_string(), response);
    }

    pub fn rows(&self, table: &str) -> Vec<Value> {
        self.tables.get(table).map(|rows| rows.clone()).unwrap_or_default()
    }

    /// Every insert/update/upsert payload, in order
    pub fn writes(&self) -> Vec<(String, Value)> {
        self.writes.lock().clone()
    }

    pub fn select_count(&self) -> usize {
        self.selects.load(Ordering::SeqCst)
    }

    pub fn open_channels(&self) -> usize {
        self.channels.len()
    }

    /// Deliver a change event to every channel watching `table`
    pub fn emit(&self, table: &str, kind: ChangeKind, record: Option<Value>) {
        self.channels.retain(|name, channel| {
            if channel.table != table {
                return true;
            }
            let event = ChangeEvent {
                table: table.to_string(),
                kind,
                record: record.clone(),
            };
            let delivered = channel.sender.send(event).is_ok();
            if !delivered {
                debug!(channel = %name, "dropping closed channel");
            }
            delivered
        });
    }

    /// Drop every channel as a lost connection would; open streams end
    pub fn disconnect_feed(&self) {
        self.channels.clear();
    }

    fn check_write(&self) -> anyhow::Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            bail!("remote write rejected");
        }
        Ok(())
    }
}

#[async_trait]
impl PersistenceClient for MemoryRemote {
    async fn current_user(&self) -> anyhow::Result<Option<AuthUser>> {
        Ok(self.user.read().clone())
    }

    async fn select(&self, table: &str, query: &Query) -> anyhow::Result<Vec<Value>> {
        self.selects.fetch_add(1, Ordering::SeqCst);
        if self.fail_reads.load(Ordering::SeqCst) {
            bail!("remote read failed");
        }
        let mut rows: Vec<Value> = self
            .tables
            .get(table)
            .map(|rows| rows.iter().filter(|row| query.matches(row)).cloned().collect())
            .unwrap_or_default();
        if let Some((column, ascending)) = &query.order {
            rows.sort_by(|a, b| {
                let ordering = a[column].to_string().cmp(&b[column].to_string());
                if *ascending { ordering } else { ordering.reverse() }
            });
        }
        if let Some(limit) = query.limit {
            rows.truncate(limit);
        }
        Ok(rows)
    }

    async fn insert(&self, table: &str, row: Value) -> anyhow::Result<Value> {
        self.check_write()?;
        self.writes.lock().push((table.to_string(), row.clone()));
        self.tables.entry(table.to_string()).or_default().push(row.clone());
        self.emit(table, ChangeKind::Insert, Some(row.clone()));
        Ok(row)
    }

    async fn update(&self, table: &str, query: &Query, patch: Value) -> anyhow::Result<Vec<Value>> {
        self.check_write()?;
        let Value::Object(patch_fields) = patch else {
            bail!("update patch must be an object");
        };
        let mut updated = Vec::new();
        if let Some(mut rows) = self.tables.get_mut(table) {
            for row in rows.iter_mut().filter(|row| query.matches(row)) {
                if let Value::Object(fields) = row {
                    for (column, value) in &patch_fields {
                        fields.insert(column.clone(), value.clone());
                    }
                }
                updated.push(row.clone());
            }
        }
        for row in &updated {
            self.writes.lock().push((table.to_string(), row.clone()));
            self.emit(table, ChangeKind::Update, Some(row.clone()));
        }
        Ok(updated)
    }

    async fn upsert(&self, table: &str, row: Value, on_conflict: &str) -> anyhow::Result<Value> {
        self.check_write()?;
        let mut identity = Query::new();
        for column in on_conflict.split(',').map(str::trim) {
            let value = row
                .get(column)
                .cloned()
                .ok_or_else(|| anyhow!("upsert row missing conflict column '{column}'"))?;
            identity = identity.eq(column, value);
        }
        self.writes.lock().push((table.to_string(), row.clone()));

        let kind = {
            let mut rows = self.tables.entry(table.to_string()).or_default();
            match rows.iter_mut().find(|existing| identity.matches(existing)) {
                Some(existing) => {
                    *existing = row.clone();
                    ChangeKind::Update
                }
                None => {
                    rows.push(row.clone());
                    ChangeKind::Insert
                }
            }
        };
        self.emit(table, kind, Some(row.clone()));
        Ok(row)
    }

    async fn rpc(&self, name: &str, args: Value) -> anyhow::Result<Value> {
        self.invoke(name, args).await
    }
}

#[async_trait]
impl ChangeFeed for MemoryRemote {
    async fn subscribe(&self, channel: &str, table: &str) -> anyhow::Result<ChangeStream> {
        let (sender, receiver) = unbounded_channel();
        self.channels.insert(
            channel.to_string(),
            Channel {
                table: table.to_string(),
                sender,
            },
        );
        Ok(receiver)
    }

    async fn remove_channel(&self, channel: &str) -> anyhow::Result<()> {
        self.channels.remove(channel);
        Ok(())
    }
}

#[async_trait]
impl FunctionInvoker for MemoryRemote {
    async fn invoke(&self, name: &str, _body: Value) -> anyhow::Result<Value> {
        self.functions
            .get(name)
            .map(|response| response.clone())
            .ok_or_else(|| anyhow!("function '{name}' not found"))
    }
}

#[async_trait]
impl LivePriceRefresher for MemoryRemote {
    /// Canned `update-live-prices` response, or nothing refreshed when none is set
    async fn refresh_live_prices(&self) -> anyhow::Result<RefreshSummary> {
        match self.functions.get(UPDATE_LIVE_PRICES).map(|response| response.clone()) {
            Some(response) => parse_refresh_summary(response),
            None => Ok(RefreshSummary::default()),
        }
    }
}
