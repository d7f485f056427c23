use std::collections::BTreeMap;

use serde_json::Value;

use super::finance::{Expense, Insight, Investment, UiPreferences, UserProfile};
use super::keys::StateKey;
use super::price::PriceQuote;
use crate::error::StateError;

/// Value held under a key; one variant per [`StateKey`]
#[derive(Debug, Clone, PartialEq)]
pub enum StateValue {
    User(Option<UserProfile>),
    Expenses(Vec<Expense>),
    Investments(Vec<Investment>),
    Ui(UiPreferences),
    Insights(Vec<Insight>),
    Quotes(BTreeMap<String, PriceQuote>),
}

impl StateValue {
    pub fn key(&self) -> StateKey {
        match self {
            Self::User(_) => StateKey::User,
            Self::Expenses(_) => StateKey::Expenses,
            Self::Investments(_) => StateKey::Investments,
            Self::Ui(_) => StateKey::Ui,
            Self::Insights(_) => StateKey::Insights,
            Self::Quotes(_) => StateKey::Quotes,
        }
    }

    /// Value reported for a key that has never been written
    pub fn default_for(key: StateKey) -> Self {
        match key {
            StateKey::User => Self::User(None),
            StateKey::Expenses => Self::Expenses(Vec::new()),
            StateKey::Investments => Self::Investments(Vec::new()),
            StateKey::Ui => Self::Ui(UiPreferences::default()),
            StateKey::Insights => Self::Insights(Vec::new()),
            StateKey::Quotes => Self::Quotes(BTreeMap::new()),
        }
    }

    pub fn to_json(&self) -> serde_json::Result<Value> {
        match self {
            Self::User(v) => serde_json::to_value(v),
            Self::Expenses(v) => serde_json::to_value(v),
            Self::Investments(v) => serde_json::to_value(v),
            Self::Ui(v) => serde_json::to_value(v),
            Self::Insights(v) => serde_json::to_value(v),
            Self::Quotes(v) => serde_json::to_value(v),
        }
    }

    /// Decode a remote payload into the shape `key` expects
    pub fn from_json(key: StateKey, value: Value) -> Result<Self, StateError> {
        let decoded = match key {
            StateKey::User => serde_json::from_value(value).map(Self::User),
            StateKey::Expenses => serde_json::from_value(value).map(Self::Expenses),
            StateKey::Investments => serde_json::from_value(value).map(Self::Investments),
            StateKey::Ui => serde_json::from_value(value).map(Self::Ui),
            StateKey::Insights => serde_json::from_value(value).map(Self::Insights),
            StateKey::Quotes => serde_json::from_value(value).map(Self::Quotes),
        };
        decoded.map_err(|e| StateError::Decode {
            key,
            message: e.to_string(),
        })
    }
}

/// Compile-time binding between a marker type, its key and its value shape
pub trait TypedKey {
    const KEY: StateKey;
    type Value: Clone + Default;

    fn wrap(value: Self::Value) -> StateValue;
    fn unwrap(value: StateValue) -> Option<Self::Value>;
}

macro_rules! typed_keys {
    ($($marker:ident => $ty:ty),* $(,)?) => {
        /// Marker types for typed store access, e.g. `store.get::<typed::Expenses>()`
        pub mod typed {
            use super::*;

            $(
                #[derive(Debug, Clone, Copy)]
                pub struct $marker;

                impl TypedKey for $marker {
                    const KEY: StateKey = StateKey::$marker;
                    type Value = $ty;

                    fn wrap(value: Self::Value) -> StateValue {
                        StateValue::$marker(value)
                    }

                    fn unwrap(value: StateValue) -> Option<Self::Value> {
                        match value {
                            StateValue::$marker(inner) => Some(inner),
                            _ => None,
                        }
                    }
                }
            )*
        }
    };
}

typed_keys! {
    User => Option<UserProfile>,
    Expenses => Vec<Expense>,
    Investments => Vec<Investment>,
    Ui => UiPreferences,
    Insights => Vec<Insight>,
    Quotes => BTreeMap<String, PriceQuote>,
}
