use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use super::price::AssetType;

/// Authenticated user's profile record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserProfile {
    pub id: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default = "default_currency")]
    pub base_currency: String,
}

/// A single expense line
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Expense {
    pub id: String,
    pub amount: f64,
    pub category: String,
    #[serde(default)]
    pub description: Option<String>,
    pub date: NaiveDate,
}

/// A held position; `is_live_tracked` positions are refreshed by the price poller
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Investment {
    pub id: String,
    pub symbol: String,
    pub asset_type: AssetType,
    pub quantity: f64,
    pub buy_price: f64,
    #[serde(default)]
    pub current_price: Option<f64>,
    #[serde(default)]
    pub is_live_tracked: bool,
    #[serde(default)]
    pub last_price_update: Option<DateTime<Utc>>,
}

impl Investment {
    /// Market value at the last known price, falling back to cost basis
    pub fn market_value(&self) -> f64 {
        self.quantity * self.current_price.unwrap_or(self.buy_price)
    }
}

/// Persisted display preferences
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UiPreferences {
    pub currency: String,
    pub theme: String,
    #[serde(default)]
    pub hide_balances: bool,
}

impl Default for UiPreferences {
    fn default() -> Self {
        Self {
            currency: default_currency(),
            theme: "system".to_string(),
            hide_balances: false,
        }
    }
}

/// One item returned by the insights aggregation endpoint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Insight {
    pub title: String,
    pub body: String,
    #[serde(default)]
    pub severity: Option<String>,
}

fn default_currency() -> String {
    "USD".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn market_value_uses_cost_basis_without_quote() {
        let mut position = Investment {
            id: "inv-1".into(),
            symbol: "AAPL".into(),
            asset_type: AssetType::Stock,
            quantity: 2.0,
            buy_price: 100.0,
            current_price: None,
            is_live_tracked: true,
            last_price_update: None,
        };
        assert_eq!(position.market_value(), 200.0);
        position.current_price = Some(150.0);
        assert_eq!(position.market_value(), 300.0);
    }

    #[test]
    fn profile_defaults_currency_when_missing() {
        let profile: UserProfile = serde_json::from_value(serde_json::json!({ "id": "u1" })).unwrap();
        assert_eq!(profile.base_currency, "USD");
        assert_eq!(profile.email, None);
    }
}
