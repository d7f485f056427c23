use std::collections::HashMap;
use std::sync::Weak;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tracing::{debug, trace, warn};

use crate::error::StateError;
use crate::models::entry::{StateEntry, StateSnapshot};
use crate::models::keys::{StateKey, Topic};
use crate::models::value::{StateValue, TypedKey};
use crate::store::registry::{ChangeOrigin, StateChange, Subscription, SubscriptionRegistry};

/// Receives "this key has unsynced local changes" signals from the store
pub trait PushScheduler: Send + Sync {
    /// Must not block; the push itself runs later
    fn schedule_push(&self, key: StateKey);
}

/// Result of offering a remote value to the store
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteApply {
    /// Accepted; `changed` tells whether listeners were notified
    Applied { revision: u64, changed: bool },
    /// Local entry is newer (or dirty and not strictly older); left untouched
    Rejected { local_revision: u64 },
}

/// In-memory key → value map; all writes go through here
pub struct KeyedStore {
    entries: RwLock<HashMap<StateKey, StateEntry>>,
    registry: SubscriptionRegistry,
    push_scheduler: RwLock<Option<Weak<dyn PushScheduler>>>,
}

impl KeyedStore {
    pub fn new() -> Self {
        let entries = StateKey::ALL
            .into_iter()
            .map(|key| (key, StateEntry::new(key)))
            .collect();
        Self {
            entries: RwLock::new(entries),
            registry: SubscriptionRegistry::new(),
            push_scheduler: RwLock::new(None),
        }
    }

    /// Route push signals for persisted keys to `scheduler`
    pub fn attach_push_scheduler(&self, scheduler: Weak<dyn PushScheduler>) {
        *self.push_scheduler.write() = Some(scheduler);
    }

    pub fn registry(&self) -> &SubscriptionRegistry {
        &self.registry
    }

    #[must_use = "dropping the subscription detaches the listener"]
    pub fn subscribe<F>(&self, topic: impl Into<Topic>, callback: F) -> Subscription
    where
        F: Fn(&StateChange) + Send + Sync + 'static,
    {
        self.registry.subscribe(topic, callback)
    }

    /// Owned copy of the whole state
    pub fn snapshot(&self) -> StateSnapshot {
        StateSnapshot {
            entries: self
                .entries
                .read()
                .iter()
                .map(|(key, entry)| (*key, entry.clone()))
                .collect(),
        }
    }

    pub fn get_key(&self, key: StateKey) -> StateValue {
        self.entries
            .read()
            .get(&key)
            .map(|entry| entry.value.clone())
            .unwrap_or_else(|| StateValue::default_for(key))
    }

    /// Lookup by key name, failing for names outside the key set
    pub fn get_named(&self, name: &str) -> Result<StateValue, StateError> {
        let key: StateKey = name.parse()?;
        Ok(self.get_key(key))
    }

    pub fn get<K: TypedKey>(&self) -> K::Value {
        K::unwrap(self.get_key(K::KEY)).unwrap_or_default()
    }

    pub fn entry(&self, key: StateKey) -> StateEntry {
        self.entries
            .read()
            .get(&key)
            .cloned()
            .unwrap_or_else(|| StateEntry::new(key))
    }

    pub fn revision(&self, key: StateKey) -> u64 {
        self.entries.read().get(&key).map_or(0, |entry| entry.revision)
    }

    pub fn is_dirty(&self, key: StateKey) -> bool {
        self.entries.read().get(&key).is_some_and(|entry| entry.dirty)
    }

    pub fn is_stale(&self, key: StateKey) -> bool {
        self.entries.read().get(&key).is_some_and(|entry| entry.stale)
    }

    /// Replace the value of `value.key()`. Listeners have run by the time this
    /// returns; persisted keys get a push scheduled.
    pub fn set(&self, value: StateValue) -> u64 {
        let key = value.key();
        let revision = self.write_local(value, key.is_persisted());
        if key.is_persisted() {
            self.request_push(key);
        }
        revision
    }

    /// Write that is never pushed. Meant for local-only keys; on a synced key
    /// the dirty flag is left as it was and the next accepted pull replaces it.
    pub fn set_local(&self, value: StateValue) -> u64 {
        self.write_local(value, false)
    }

    fn write_local(&self, value: StateValue, mark_dirty: bool) -> u64 {
        let key = value.key();
        let revision = {
            let mut entries = self.entries.write();
            let entry = entries.entry(key).or_insert_with(|| StateEntry::new(key));
            entry.value = value;
            entry.revision += 1;
            entry.dirty |= mark_dirty;
            entry.revision
        };
        trace!(key = %key, revision, "local write");

        self.registry.notify(&StateChange {
            key,
            revision,
            origin: ChangeOrigin::Local,
        });
        revision
    }

    pub fn set_typed<K: TypedKey>(&self, value: K::Value) -> u64 {
        self.set(K::wrap(value))
    }

    /// Read-modify-write under the write lock, then notify like [`set`](Self::set)
    pub fn update<K, F>(&self, mutate: F) -> u64
    where
        K: TypedKey,
        F: FnOnce(&mut K::Value),
    {
        let key = K::KEY;
        let revision = {
            let mut entries = self.entries.write();
            let entry = entries.entry(key).or_insert_with(|| StateEntry::new(key));
            let mut current = K::unwrap(entry.value.clone()).unwrap_or_default();
            mutate(&mut current);
            entry.value = K::wrap(current);
            entry.revision += 1;
            entry.dirty = key.is_persisted();
            entry.revision
        };

        self.registry.notify(&StateChange {
            key,
            revision,
            origin: ChangeOrigin::Local,
        });

        if key.is_persisted() {
            self.request_push(key);
        }
        revision
    }

    /// Flag `key` as needing a re-pull
    pub fn mark_stale(&self, key: StateKey) {
        if let Some(entry) = self.entries.write().get_mut(&key) {
            entry.stale = true;
        }
        debug!(key = %key, "marked stale");
    }

    /// Offer an authoritative remote value. Accepted by last-writer-wins on
    /// revision; see [`StateEntry::accepts_remote`].
    pub fn apply_remote(&self, value: StateValue, remote_revision: u64, synced_at: DateTime<Utc>) -> RemoteApply {
        let key = value.key();
        let outcome = {
            let mut entries = self.entries.write();
            let entry = entries.entry(key).or_insert_with(|| StateEntry::new(key));
            entry.stale = false;
            if !entry.accepts_remote(remote_revision) {
                RemoteApply::Rejected {
                    local_revision: entry.revision,
                }
            } else {
                let changed = entry.value != value || entry.revision != remote_revision;
                entry.value = value;
                entry.revision = entry.revision.max(remote_revision);
                entry.dirty = false;
                entry.last_synced_at = Some(synced_at);
                RemoteApply::Applied {
                    revision: entry.revision,
                    changed,
                }
            }
        };

        if let RemoteApply::Applied { revision, changed: true } = outcome {
            self.registry.notify(&StateChange {
                key,
                revision,
                origin: ChangeOrigin::Remote,
            });
        }
        outcome
    }

    /// Clear the stale flag after a pull that found nothing to apply
    pub fn settle_pull(&self, key: StateKey) {
        if let Some(entry) = self.entries.write().get_mut(&key) {
            entry.stale = false;
        }
    }

    /// Record a confirmed push of `pushed_revision`. Returns false when a newer
    /// local write landed meanwhile, in which case the entry stays dirty.
    pub fn mark_synced(&self, key: StateKey, pushed_revision: u64, synced_at: DateTime<Utc>) -> bool {
        let mut entries = self.entries.write();
        let Some(entry) = entries.get_mut(&key) else {
            return false;
        };
        if entry.revision != pushed_revision {
            return false;
        }
        entry.dirty = false;
        entry.last_synced_at = Some(synced_at);
        true
    }

    fn request_push(&self, key: StateKey) {
        let scheduler = self.push_scheduler.read().as_ref().and_then(Weak::upgrade);
        match scheduler {
            Some(scheduler) => scheduler.schedule_push(key),
            None => warn!(key = %key, "no sync engine attached; change stays local"),
        }
    }
}

impl Default for KeyedStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::finance::{Expense, UiPreferences};
    use crate::models::typed;
    use chrono::NaiveDate;
    use parking_lot::Mutex;
    use pretty_assertions::assert_eq;
    use std::sync::Arc;

    fn expense(id: &str, amount: f64) -> Expense {
        Expense {
            id: id.to_string(),
            amount,
            category: "food".to_string(),
            description: None,
            date: NaiveDate::from_ymd_opt(2026, 1, 15).unwrap(),
        }
    }

    #[derive(Default)]
    struct RecordingScheduler {
        keys: Mutex<Vec<StateKey>>,
    }

    impl PushScheduler for RecordingScheduler {
        fn schedule_push(&self, key: StateKey) {
            self.keys.lock().push(key);
        }
    }

    #[test]
    fn unset_keys_return_defaults() {
        let store = KeyedStore::new();
        assert_eq!(store.get::<typed::Expenses>(), Vec::<Expense>::new());
        assert_eq!(store.get::<typed::Ui>(), UiPreferences::default());
        assert_eq!(store.revision(StateKey::Expenses), 0);
    }

    #[test]
    fn unknown_key_name_fails() {
        let store = KeyedStore::new();
        assert!(matches!(store.get_named("budgets"), Err(StateError::UnknownKey(_))));
        assert!(store.get_named("expenses").is_ok());
    }

    #[test]
    fn two_sets_notify_in_order_and_keep_last_value() {
        let store = Arc::new(KeyedStore::new());
        let key_log = Arc::new(Mutex::new(Vec::new()));
        let any_log = Arc::new(Mutex::new(Vec::new()));

        let sink = key_log.clone();
        let _key_sub = store.subscribe(StateKey::Expenses, move |c: &StateChange| sink.lock().push(c.revision));
        let sink = any_log.clone();
        let reader = store.clone();
        let _any_sub = store.subscribe(Topic::Any, move |c: &StateChange| {
            // wildcard readers observe the value written by this set
            let seen = reader.get::<typed::Expenses>().len();
            sink.lock().push((c.revision, seen));
        });

        store.set_typed::<typed::Expenses>(vec![expense("e1", 10.0)]);
        store.set_typed::<typed::Expenses>(vec![expense("e1", 10.0), expense("e2", 5.0)]);

        assert_eq!(store.get::<typed::Expenses>().len(), 2);
        assert_eq!(*key_log.lock(), vec![1, 2]);
        assert_eq!(*any_log.lock(), vec![(1, 1), (2, 2)]);
        assert!(store.is_dirty(StateKey::Expenses));
    }

    #[test]
    fn unsubscribed_listener_is_not_called() {
        let store = KeyedStore::new();
        let calls = Arc::new(Mutex::new(0));
        let sink = calls.clone();
        let sub = store.subscribe(StateKey::Ui, move |_: &StateChange| *sink.lock() += 1);
        sub.unsubscribe();

        store.set_typed::<typed::Ui>(UiPreferences::default());

        assert_eq!(*calls.lock(), 0);
    }

    #[test]
    fn persisted_writes_schedule_pushes_local_only_do_not() {
        let store = KeyedStore::new();
        let scheduler = Arc::new(RecordingScheduler::default());
        let weak: Weak<dyn PushScheduler> = Arc::downgrade(&(scheduler.clone() as Arc<dyn PushScheduler>));
        store.attach_push_scheduler(weak);

        store.set_typed::<typed::Expenses>(vec![expense("e1", 1.0)]);
        store.set_typed::<typed::Insights>(vec![]);
        store.update::<typed::Quotes, _>(|quotes| quotes.clear());

        assert_eq!(*scheduler.keys.lock(), vec![StateKey::Expenses]);
        assert!(!store.is_dirty(StateKey::Insights));
    }

    #[test]
    fn remote_value_with_lower_revision_does_not_replace_dirty_edit() {
        let store = KeyedStore::new();
        for i in 0..5 {
            store.set_typed::<typed::Expenses>(vec![expense("local", i as f64)]);
        }
        assert_eq!(store.revision(StateKey::Expenses), 5);

        let outcome = store.apply_remote(StateValue::Expenses(vec![expense("remote", 1.0)]), 4, Utc::now());

        assert_eq!(outcome, RemoteApply::Rejected { local_revision: 5 });
        assert_eq!(store.get::<typed::Expenses>()[0].id, "local");
        assert!(store.is_dirty(StateKey::Expenses));
    }

    #[test]
    fn accepted_remote_clears_dirty_and_stale() {
        let store = KeyedStore::new();
        store.set_typed::<typed::Expenses>(vec![expense("local", 1.0)]);
        store.mark_stale(StateKey::Expenses);

        let outcome = store.apply_remote(StateValue::Expenses(vec![expense("remote", 2.0)]), 7, Utc::now());

        assert_eq!(outcome, RemoteApply::Applied { revision: 7, changed: true });
        let entry = store.entry(StateKey::Expenses);
        assert!(!entry.dirty);
        assert!(!entry.stale);
        assert!(entry.last_synced_at.is_some());
    }

    #[test]
    fn identical_remote_value_is_not_renotified() {
        let store = KeyedStore::new();
        store.apply_remote(StateValue::Expenses(vec![expense("e", 1.0)]), 3, Utc::now());
        let calls = Arc::new(Mutex::new(0));
        let sink = calls.clone();
        let _sub = store.subscribe(StateKey::Expenses, move |_: &StateChange| *sink.lock() += 1);

        let outcome = store.apply_remote(StateValue::Expenses(vec![expense("e", 1.0)]), 3, Utc::now());

        assert_eq!(outcome, RemoteApply::Applied { revision: 3, changed: false });
        assert_eq!(*calls.lock(), 0);
    }

    #[test]
    fn mark_synced_ignores_superseded_revision() {
        let store = KeyedStore::new();
        let first = store.set_typed::<typed::Expenses>(vec![expense("a", 1.0)]);
        store.set_typed::<typed::Expenses>(vec![expense("b", 1.0)]);

        assert!(!store.mark_synced(StateKey::Expenses, first, Utc::now()));
        assert!(store.is_dirty(StateKey::Expenses));
        assert!(store.mark_synced(StateKey::Expenses, first + 1, Utc::now()));
        assert!(!store.is_dirty(StateKey::Expenses));
    }

    #[test]
    fn listener_may_write_another_key_without_deadlock() {
        let store = Arc::new(KeyedStore::new());
        let writer = store.clone();
        let _sub = store.subscribe(StateKey::Expenses, move |_: &StateChange| {
            writer.set_typed::<typed::Insights>(vec![]);
        });

        store.set_typed::<typed::Expenses>(vec![]);

        assert_eq!(store.revision(StateKey::Insights), 1);
    }

    #[test]
    fn set_local_never_schedules_a_push() {
        let store = KeyedStore::new();
        let scheduler = Arc::new(RecordingScheduler::default());
        let weak: Weak<dyn PushScheduler> = Arc::downgrade(&(scheduler.clone() as Arc<dyn PushScheduler>));
        store.attach_push_scheduler(weak);

        store.set_local(StateValue::Insights(vec![]));
        store.set_local(StateValue::Ui(UiPreferences::default()));

        assert!(scheduler.keys.lock().is_empty());
        assert!(!store.is_dirty(StateKey::Ui));
        assert_eq!(store.revision(StateKey::Ui), 1);
    }
}
