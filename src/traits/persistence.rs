use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Identity of the authenticated session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthUser {
    pub id: String,
    #[serde(default)]
    pub email: Option<String>,
}

/// Equality filters, ordering and limit for a table read
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Query {
    pub filters: Vec<(String, Value)>,
    pub order: Option<(String, bool)>,
    pub limit: Option<usize>,
}

impl Query {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn eq(mut self, column: impl Into<String>, value: impl Into<Value>) -> Self {
        self.filters.push((column.into(), value.into()));
        self
    }

    pub fn order_by(mut self, column: impl Into<String>, ascending: bool) -> Self {
        self.order = Some((column.into(), ascending));
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Whether a JSON row satisfies every equality filter
    pub fn matches(&self, row: &Value) -> bool {
        self.filters
            .iter()
            .all(|(column, expected)| row.get(column) == Some(expected))
    }

    /// PostgREST query-string pairs, e.g. `user_id=eq.abc`
    pub fn to_params(&self) -> Vec<(String, String)> {
        let mut params: Vec<(String, String)> = self
            .filters
            .iter()
            .map(|(column, value)| {
                let rendered = match value {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                (column.clone(), format!("eq.{rendered}"))
            })
            .collect();
        if let Some((column, ascending)) = &self.order {
            let direction = if *ascending { "asc" } else { "desc" };
            params.push(("order".to_string(), format!("{column}.{direction}")));
        }
        if let Some(limit) = self.limit {
            params.push(("limit".to_string(), limit.to_string()));
        }
        params
    }
}

/// Remote row store scoped to the authenticated user
#[async_trait]
pub trait PersistenceClient: Send + Sync {
    /// Current session user, `None` when signed out
    async fn current_user(&self) -> anyhow::Result<Option<AuthUser>>;

    async fn select(&self, table: &str, query: &Query) -> anyhow::Result<Vec<Value>>;

    async fn insert(&self, table: &str, row: Value) -> anyhow::Result<Value>;

    /// Patch every row matching `query`, returning the updated rows
    async fn update(&self, table: &str, query: &Query, patch: Value) -> anyhow::Result<Vec<Value>>;

    /// Insert or replace on the `on_conflict` columns (comma separated)
    async fn upsert(&self, table: &str, row: Value, on_conflict: &str) -> anyhow::Result<Value>;

    async fn rpc(&self, name: &str, args: Value) -> anyhow::Result<Value>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn query_renders_postgrest_params() {
        let query = Query::new()
            .eq("user_id", "u1")
            .eq("revision", 3)
            .order_by("updated_at", false)
            .limit(1);
        assert_eq!(
            query.to_params(),
            vec![
                ("user_id".to_string(), "eq.u1".to_string()),
                ("revision".to_string(), "eq.3".to_string()),
                ("order".to_string(), "updated_at.desc".to_string()),
                ("limit".to_string(), "1".to_string()),
            ]
        );
    }

    #[test]
    fn query_matches_on_all_filters() {
        let query = Query::new().eq("user_id", "u1").eq("key", "expenses");
        assert!(query.matches(&json!({ "user_id": "u1", "key": "expenses", "revision": 2 })));
        assert!(!query.matches(&json!({ "user_id": "u2", "key": "expenses" })));
    }
}
