use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc::UnboundedReceiver;

/// Kind of row mutation reported by the change feed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

/// One remote row mutation
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeEvent {
    pub table: String,
    pub kind: ChangeKind,
    pub record: Option<Value>,
}

/// Events for one subscribed channel; dropping it stops delivery
pub type ChangeStream = UnboundedReceiver<ChangeEvent>;

/// Publish/subscribe feed of remote table mutations
#[async_trait]
pub trait ChangeFeed: Send + Sync {
    /// Join `channel` and receive every insert/update/delete on `table`
    async fn subscribe(&self, channel: &str, table: &str) -> anyhow::Result<ChangeStream>;

    /// Leave `channel`; no further events are sent for it
    async fn remove_channel(&self, channel: &str) -> anyhow::Result<()>;
}
