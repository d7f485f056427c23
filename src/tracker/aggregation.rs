use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tracing::{info, warn};

use crate::error::StateError;
use crate::models::finance::Insight;
use crate::models::keys::StateKey;
use crate::models::value::{typed, StateValue};
use crate::prices::race::with_timeout;
use crate::store::keyed_store::KeyedStore;
use crate::traits::function_invoker::FunctionInvoker;

/// Edge function producing spending/investment insights
pub const GENERATE_INSIGHTS: &str = "generate-insights";
pub const DEFAULT_INSIGHTS_TIMEOUT: Duration = Duration::from_secs(15);

/// Calls remote aggregation endpoints and stores their output under a local-only key
pub struct AggregationService {
    functions: Arc<dyn FunctionInvoker>,
    store: Arc<KeyedStore>,
    timeout: Duration,
}

impl AggregationService {
    pub fn new(functions: Arc<dyn FunctionInvoker>, store: Arc<KeyedStore>) -> Self {
        Self {
            functions,
            store,
            timeout: DEFAULT_INSIGHTS_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Fetch insights for `body`. Failures and timeouts leave an empty list
    /// in the `Insights` key rather than an error.
    pub async fn fetch_insights(&self, body: Value) -> Vec<Insight> {
        match self.fetch_into(StateKey::Insights, GENERATE_INSIGHTS, body).await {
            Ok(_) => self.store.get::<typed::Insights>(),
            Err(err) => {
                warn!("insights unavailable: {}", err);
                Vec::new()
            }
        }
    }

    /// Invoke `function` and write its decoded result to `key` only. On any
    /// failure `key` is reset to its empty value and the error is returned.
    pub async fn fetch_into(&self, key: StateKey, function: &str, body: Value) -> Result<StateValue, StateError> {
        if key.is_persisted() {
            return Err(StateError::sync(
                key,
                &anyhow::anyhow!("aggregation output cannot target a synced key"),
            ));
        }

        let result = match with_timeout(function, self.timeout, self.functions.invoke(function, body)).await {
            Ok(Ok(response)) => StateValue::from_json(key, unwrap_payload(key, response)),
            Ok(Err(e)) => Err(StateError::sync(key, &e)),
            Err(timeout) => Err(timeout),
        };

        match result {
            Ok(value) => {
                info!(key = %key, function, "aggregation result stored");
                self.store.set_local(value.clone());
                Ok(value)
            }
            Err(err) => {
                self.store.set_local(StateValue::default_for(key));
                Err(err)
            }
        }
    }
}

/// Endpoints answer either with the bare value or wrapped as `{ "<key>": value }`
fn unwrap_payload(key: StateKey, response: Value) -> Value {
    match response {
        Value::Object(mut map) if map.contains_key(key.as_str()) => map.remove(key.as_str()).unwrap_or(Value::Null),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::memory_remote::MemoryRemote;
    use async_trait::async_trait;
    use serde_json::json;

    struct Stalled;

    #[async_trait]
    impl FunctionInvoker for Stalled {
        async fn invoke(&self, _name: &str, _body: Value) -> anyhow::Result<Value> {
            std::future::pending().await
        }
    }

    #[tokio::test]
    async fn insights_are_stored_under_their_key() {
        let remote = Arc::new(MemoryRemote::new());
        remote.set_function(
            GENERATE_INSIGHTS,
            json!({ "insights": [{ "title": "Dining up 20%", "body": "Compared to last month" }] }),
        );
        let store = Arc::new(KeyedStore::new());
        let service = AggregationService::new(remote, store.clone());

        let insights = service.fetch_insights(json!({ "month": "2026-09" })).await;

        assert_eq!(insights.len(), 1);
        assert_eq!(store.get::<typed::Insights>()[0].title, "Dining up 20%");
        assert_eq!(store.revision(StateKey::Expenses), 0);
        assert!(!store.is_dirty(StateKey::Insights));
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_leaves_an_empty_list() {
        let store = Arc::new(KeyedStore::new());
        store.set_typed::<typed::Insights>(vec![Insight {
            title: "old".into(),
            body: "stale".into(),
            severity: None,
        }]);
        let service = AggregationService::new(Arc::new(Stalled), store.clone());

        let insights = service.fetch_insights(json!({})).await;

        assert!(insights.is_empty());
        assert!(store.get::<typed::Insights>().is_empty());
    }

    #[tokio::test]
    async fn synced_keys_are_refused() {
        let store = Arc::new(KeyedStore::new());
        let service = AggregationService::new(Arc::new(MemoryRemote::new()), store.clone());

        let err = service.fetch_into(StateKey::Expenses, "anything", json!({})).await.unwrap_err();

        assert!(matches!(err, StateError::SyncFailure { .. }));
        assert_eq!(store.revision(StateKey::Expenses), 0);
    }
}
