use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::StateError;

/// Closed set of domain keys the store holds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StateKey {
    User,
    Expenses,
    Investments,
    Ui,
    Insights,
    Quotes,
}

impl StateKey {
    pub const ALL: [StateKey; 6] = [
        StateKey::User,
        StateKey::Expenses,
        StateKey::Investments,
        StateKey::Ui,
        StateKey::Insights,
        StateKey::Quotes,
    ];

    /// Keys mirrored to the remote `user_state` table
    pub const PERSISTED: [StateKey; 4] = [
        StateKey::User,
        StateKey::Expenses,
        StateKey::Investments,
        StateKey::Ui,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Expenses => "expenses",
            Self::Investments => "investments",
            Self::Ui => "ui",
            Self::Insights => "insights",
            Self::Quotes => "quotes",
        }
    }

    /// Whether writes to this key are pushed to the remote store
    pub fn is_persisted(&self) -> bool {
        Self::PERSISTED.contains(self)
    }
}

impl fmt::Display for StateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StateKey {
    type Err = StateError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|key| key.as_str() == value)
            .ok_or_else(|| StateError::UnknownKey(value.to_string()))
    }
}

/// What a subscription listens to: one key or every key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    Key(StateKey),
    Any,
}

impl From<StateKey> for Topic {
    fn from(key: StateKey) -> Self {
        Topic::Key(key)
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Topic::Key(key) => key.fmt(f),
            Topic::Any => f.write_str("*"),
        }
    }
}
