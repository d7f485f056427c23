use std::time::Duration;

use tracing::warn;

use crate::providers::realtime_feed::SupabaseRealtime;
use crate::sync::retry::RetryPolicy;
use crate::utils::helper::{duration_from_millis, parse_or};

pub const DEFAULT_FALLBACK_URL: &str = "https://query1.finance.yahoo.com";

/// Runtime settings, read from the environment (after `.env` is loaded)
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    /// `None` runs against the in-memory remote
    pub supabase_url: Option<String>,
    pub anon_key: String,
    pub access_token: Option<String>,
    pub realtime_url: Option<String>,
    pub price_fallback_url: String,
    pub poll_interval: Duration,
    pub price_debounce: Duration,
    pub price_fetch_timeout: Duration,
    pub insights_timeout: Duration,
    pub sync_max_attempts: u32,
    pub sync_backoff: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            supabase_url: None,
            anon_key: String::new(),
            access_token: None,
            realtime_url: None,
            price_fallback_url: DEFAULT_FALLBACK_URL.to_string(),
            poll_interval: Duration::from_secs(300),
            price_debounce: Duration::from_millis(500),
            price_fetch_timeout: Duration::from_secs(10),
            insights_timeout: Duration::from_secs(15),
            sync_max_attempts: 5,
            sync_backoff: Duration::from_millis(500),
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build from any variable source; unset or empty values keep their default
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let text = |name: &str| lookup(name).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        let defaults = Self::default();

        Self {
            supabase_url: text("SUPABASE_URL"),
            anon_key: text("SUPABASE_ANON_KEY").unwrap_or_default(),
            access_token: text("SUPABASE_ACCESS_TOKEN"),
            realtime_url: text("REALTIME_URL"),
            price_fallback_url: text("PRICE_FALLBACK_URL").unwrap_or(defaults.price_fallback_url),
            poll_interval: Duration::from_secs(number(&text, "PRICE_POLL_INTERVAL_SECS", 300u64).max(1)),
            price_debounce: duration_from_millis(number(&text, "PRICE_DEBOUNCE_MS", 500)),
            price_fetch_timeout: Duration::from_secs(number(&text, "PRICE_FETCH_TIMEOUT_SECS", 10u64).max(1)),
            insights_timeout: Duration::from_secs(number(&text, "INSIGHTS_TIMEOUT_SECS", 15u64).max(1)),
            sync_max_attempts: number(&text, "SYNC_MAX_ATTEMPTS", 5u32).max(1),
            sync_backoff: duration_from_millis(number(&text, "SYNC_BACKOFF_MS", 500)),
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.sync_max_attempts, self.sync_backoff)
    }

    /// Explicit `REALTIME_URL`, else derived from the project url
    pub fn realtime_endpoint(&self) -> Option<String> {
        if let Some(url) = &self.realtime_url {
            return Some(url.clone());
        }
        self.supabase_url
            .as_deref()
            .map(|url| SupabaseRealtime::endpoint_for(url, &self.anon_key))
    }
}

fn number<T, F>(text: &F, name: &str, default: T) -> T
where
    T: std::str::FromStr + Copy + std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    let raw = text(name);
    if let Some(value) = raw.as_deref() {
        if value.parse::<T>().is_err() {
            warn!("invalid {}={:?}, using default {}", name, value, default);
        }
    }
    parse_or(raw.as_deref(), default)
}
