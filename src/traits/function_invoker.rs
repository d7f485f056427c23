use async_trait::async_trait;
use serde_json::Value;

/// Remote aggregation endpoints, invoked as request/response
#[async_trait]
pub trait FunctionInvoker: Send + Sync {
    async fn invoke(&self, name: &str, body: Value) -> anyhow::Result<Value>;
}
