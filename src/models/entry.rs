use std::collections::BTreeMap;

use chrono::{DateTime, Utc};

use super::keys::StateKey;
use super::value::StateValue;

/// Current value of one key plus its sync bookkeeping
#[derive(Debug, Clone, PartialEq)]
pub struct StateEntry {
    pub key: StateKey,
    pub value: StateValue,
    /// Bumped on every local write, adopted from the remote on accepted pulls
    pub revision: u64,
    /// Local value not yet confirmed by the remote store
    pub dirty: bool,
    /// Remote known to have changed; a pull is pending
    pub stale: bool,
    pub last_synced_at: Option<DateTime<Utc>>,
}

impl StateEntry {
    pub fn new(key: StateKey) -> Self {
        Self {
            key,
            value: StateValue::default_for(key),
            revision: 0,
            dirty: false,
            stale: false,
            last_synced_at: None,
        }
    }

    /// Last-writer-wins by revision. A dirty entry only yields to a strictly
    /// newer remote revision.
    pub fn accepts_remote(&self, remote_revision: u64) -> bool {
        if self.dirty {
            remote_revision > self.revision
        } else {
            remote_revision >= self.revision
        }
    }
}

/// Owned copy of every entry at one instant
#[derive(Debug, Clone, PartialEq, Default)]
pub struct StateSnapshot {
    pub entries: BTreeMap<StateKey, StateEntry>,
}

impl StateSnapshot {
    pub fn get(&self, key: StateKey) -> Option<&StateEntry> {
        self.entries.get(&key)
    }

    pub fn value(&self, key: StateKey) -> StateValue {
        self.entries
            .get(&key)
            .map(|entry| entry.value.clone())
            .unwrap_or_else(|| StateValue::default_for(key))
    }

    pub fn dirty_keys(&self) -> Vec<StateKey> {
        self.entries
            .values()
            .filter(|entry| entry.dirty)
            .map(|entry| entry.key)
            .collect()
    }
}
