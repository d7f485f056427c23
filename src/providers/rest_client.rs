use anyhow::{bail, Context};
use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde_json::Value;
use tracing::{debug, warn};

use crate::models::price::RefreshSummary;
use crate::traits::function_invoker::FunctionInvoker;
use crate::traits::persistence::{AuthUser, PersistenceClient, Query};
use crate::traits::price_provider::LivePriceRefresher;

/// Edge function that bulk-refreshes every live-tracked position server side
pub const UPDATE_LIVE_PRICES: &str = "update-live-prices";

/// Supabase project client: PostgREST tables, auth session and edge functions
#[derive(Clone)]
pub struct SupabaseClient {
    client: Client,
    base_url: String,
    anon_key: String,
    access_token: Option<String>,
}

impl SupabaseClient {
    pub fn new(base_url: impl Into<String>, anon_key: impl Into<String>, access_token: Option<String>) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            anon_key: anon_key.into(),
            access_token,
        }
    }

    pub fn has_session(&self) -> bool {
        self.access_token.is_some()
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    fn table_url(&self, table: &str) -> String {
        self.url(&format!("rest/v1/{table}"))
    }

    /// Attach the project key and the session bearer (anon key when signed out)
    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        let bearer = self.access_token.as_deref().unwrap_or(&self.anon_key);
        request
            .header("apikey", &self.anon_key)
            .header("Authorization", format!("Bearer {bearer}"))
    }

    async fn read_json(response: Response, what: &str) -> anyhow::Result<Value> {
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            bail!("{what} failed with status {status}: {body}");
        }
        if status == StatusCode::NO_CONTENT {
            return Ok(Value::Null);
        }
        let text = response.text().await.with_context(|| format!("{what}: failed to read body"))?;
        if text.trim().is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_str(&text).with_context(|| format!("{what}: invalid JSON response"))
    }

    /// PostgREST returns representations as arrays even for single-row writes
    fn first_row(value: Value) -> Value {
        match value {
            Value::Array(mut rows) if !rows.is_empty() => rows.swap_remove(0),
            other => other,
        }
    }

    fn into_rows(value: Value) -> Vec<Value> {
        match value {
            Value::Array(rows) => rows,
            Value::Null => Vec::new(),
            other => vec![other],
        }
    }
}

#[async_trait]
impl PersistenceClient for SupabaseClient {
    async fn current_user(&self) -> anyhow::Result<Option<AuthUser>> {
        if self.access_token.is_none() {
            return Ok(None);
        }
        let response = self
            .authorized(self.client.get(self.url("auth/v1/user")))
            .send()
            .await
            .context("auth session request failed")?;
        if matches!(response.status(), StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN) {
            warn!("access token rejected; treating session as signed out");
            return Ok(None);
        }
        let body = Self::read_json(response, "auth session").await?;
        let user: AuthUser = serde_json::from_value(body).context("unexpected auth user payload")?;
        Ok(Some(user))
    }

    async fn select(&self, table: &str, query: &Query) -> anyhow::Result<Vec<Value>> {
        let mut params = vec![("select".to_string(), "*".to_string())];
        params.extend(query.to_params());
        debug!(table, ?params, "select");
        let response = self
            .authorized(self.client.get(self.table_url(table)))
            .query(&params)
            .send()
            .await
            .with_context(|| format!("select from {table} failed"))?;
        Ok(Self::into_rows(Self::read_json(response, &format!("select from {table}")).await?))
    }

    async fn insert(&self, table: &str, row: Value) -> anyhow::Result<Value> {
        let response = self
            .authorized(self.client.post(self.table_url(table)))
            .header("Prefer", "return=representation")
            .json(&row)
            .send()
            .await
            .with_context(|| format!("insert into {table} failed"))?;
        Ok(Self::first_row(Self::read_json(response, &format!("insert into {table}")).await?))
    }

    async fn update(&self, table: &str, query: &Query, patch: Value) -> anyhow::Result<Vec<Value>> {
        if query.filters.is_empty() {
            bail!("refusing unfiltered update of {table}");
        }
        let response = self
            .authorized(self.client.patch(self.table_url(table)))
            .header("Prefer", "return=representation")
            .query(&query.to_params())
            .json(&patch)
            .send()
            .await
            .with_context(|| format!("update of {table} failed"))?;
        Ok(Self::into_rows(Self::read_json(response, &format!("update of {table}")).await?))
    }

    async fn upsert(&self, table: &str, row: Value, on_conflict: &str) -> anyhow::Result<Value> {
        let response = self
            .authorized(self.client.post(self.table_url(table)))
            .header("Prefer", "resolution=merge-duplicates,return=representation")
            .query(&[("on_conflict", on_conflict)])
            .json(&row)
            .send()
            .await
            .with_context(|| format!("upsert into {table} failed"))?;
        Ok(Self::first_row(Self::read_json(response, &format!("upsert into {table}")).await?))
    }

    async fn rpc(&self, name: &str, args: Value) -> anyhow::Result<Value> {
        let response = self
            .authorized(self.client.post(self.url(&format!("rest/v1/rpc/{name}"))))
            .json(&args)
            .send()
            .await
            .with_context(|| format!("rpc {name} failed"))?;
        Self::read_json(response, &format!("rpc {name}")).await
    }
}

#[async_trait]
impl FunctionInvoker for SupabaseClient {
    async fn invoke(&self, name: &str, body: Value) -> anyhow::Result<Value> {
        debug!(function = name, "invoking edge function");
        let response = self
            .authorized(self.client.post(self.url(&format!("functions/v1/{name}"))))
            .json(&body)
            .send()
            .await
            .with_context(|| format!("function {name} failed"))?;
        Self::read_json(response, &format!("function {name}")).await
    }
}

#[async_trait]
impl LivePriceRefresher for SupabaseClient {
    async fn refresh_live_prices(&self) -> anyhow::Result<RefreshSummary> {
        let body = self.invoke(UPDATE_LIVE_PRICES, Value::Object(Default::default())).await?;
        parse_refresh_summary(body)
    }
}

/// `{ "updated": n, "failed": m, "prices": { "AAPL": 191.2 } }`; a null body
/// means nothing was refreshed
pub fn parse_refresh_summary(body: Value) -> anyhow::Result<RefreshSummary> {
    if body.is_null() {
        return Ok(RefreshSummary::default());
    }
    serde_json::from_value(body).context("unexpected live price refresh response")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn urls_are_joined_without_double_slashes() {
        let client = SupabaseClient::new("https://demo.supabase.co/", "anon", None);
        assert_eq!(client.table_url("user_state"), "https://demo.supabase.co/rest/v1/user_state");
        assert_eq!(client.url("/functions/v1/insights"), "https://demo.supabase.co/functions/v1/insights");
    }

    #[test]
    fn single_row_writes_unwrap_the_representation() {
        assert_eq!(SupabaseClient::first_row(json!([{ "id": 1 }])), json!({ "id": 1 }));
        assert_eq!(SupabaseClient::first_row(json!({ "id": 2 })), json!({ "id": 2 }));
        assert!(SupabaseClient::into_rows(Value::Null).is_empty());
    }

    #[test]
    fn refresh_summary_parsing() {
        let summary = parse_refresh_summary(json!({ "updated": 3, "failed": 1 })).unwrap();
        assert_eq!(summary.updated, 3);
        assert_eq!(summary.failed, 1);
        assert!(summary.prices.is_empty());

        let priced = parse_refresh_summary(json!({ "updated": 1, "prices": { "AAPL": 191.2 } })).unwrap();
        assert_eq!(priced.prices["AAPL"], 191.2);
        assert_eq!(parse_refresh_summary(Value::Null).unwrap(), RefreshSummary::default());
        assert!(parse_refresh_summary(json!("nope")).is_err());
    }

    #[tokio::test]
    async fn signed_out_client_has_no_user() {
        let client = SupabaseClient::new("http://127.0.0.1:9", "anon", None);
        assert!(client.current_user().await.unwrap().is_none());
    }
}
