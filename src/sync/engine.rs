use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::runtime::Handle;
use tokio::sync::watch;
use tracing::{debug, error, info, trace, warn};

use crate::error::StateError;
use crate::models::keys::StateKey;
use crate::models::value::StateValue;
use crate::store::keyed_store::{KeyedStore, PushScheduler, RemoteApply};
use crate::sync::retry::{RetryPolicy, SyncTask};
use crate::traits::persistence::{AuthUser, PersistenceClient, Query};

/// Remote table holding one row per `(user_id, key)`
pub const STATE_TABLE: &str = "user_state";
const STATE_CONFLICT_COLUMNS: &str = "user_id,key";

#[derive(Debug, Deserialize)]
struct StateRow {
    key: String,
    value: Value,
    revision: u64,
}

/// What a pull did to the local entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PullOutcome {
    Applied { revision: u64, changed: bool },
    /// Local entry newer or holding unsynced edits; untouched
    Kept { local_revision: u64, remote_revision: u64 },
    /// No remote row for this key yet
    Missing,
    /// A pull of this key was already running; it will run once more
    Coalesced,
}

/// What a push did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    Confirmed { revision: u64 },
    /// Nothing unsynced to send
    Clean,
    /// A push of this key was already in flight and will pick up the latest value
    Coalesced,
}

/// Per-key results of a full pull or push
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub applied: Vec<StateKey>,
    pub kept: Vec<StateKey>,
    pub pushed: Vec<StateKey>,
    pub failed: Vec<(StateKey, String)>,
}

impl SyncReport {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Moves state between the [`KeyedStore`] and the remote store
pub struct SyncEngine {
    store: Arc<KeyedStore>,
    remote: Arc<dyn PersistenceClient>,
    retry: RetryPolicy,
    /// Keys with a push in flight (at most one per key)
    pushes: Mutex<HashSet<StateKey>>,
    /// Keys with a pull in flight, and whether another run was requested
    pulls: Mutex<HashMap<StateKey, bool>>,
    pushes_in_flight: watch::Sender<usize>,
    this: Weak<SyncEngine>,
}

impl SyncEngine {
    /// Create the engine and register it as the store's push scheduler
    pub fn new(store: Arc<KeyedStore>, remote: Arc<dyn PersistenceClient>, retry: RetryPolicy) -> Arc<Self> {
        let engine = Arc::new_cyclic(|this: &Weak<SyncEngine>| Self {
            store: store.clone(),
            remote,
            retry,
            pushes: Mutex::new(HashSet::new()),
            pulls: Mutex::new(HashMap::new()),
            pushes_in_flight: watch::channel(0).0,
            this: this.clone(),
        });
        let scheduler: Weak<dyn PushScheduler> = engine.this.clone();
        store.attach_push_scheduler(scheduler);
        engine
    }

    pub fn store(&self) -> &Arc<KeyedStore> {
        &self.store
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry
    }

    /// Fetch the authoritative value of `key` and apply it by last-writer-wins.
    /// A concurrent call for the same key is folded into one extra run.
    pub async fn pull_key(&self, key: StateKey) -> Result<PullOutcome, StateError> {
        let Some(_claim) = PullClaim::acquire(self, key) else {
            trace!(key = %key, "pull already running; coalesced");
            return Ok(PullOutcome::Coalesced);
        };

        loop {
            let result = self.pull_once(key).await;
            if !self.take_pull_rerun(key) {
                return result;
            }
            debug!(key = %key, "re-running pull requested while in flight");
        }
    }

    /// [`pull_key`](Self::pull_key) with the retry policy applied to transient failures
    pub async fn refresh_key(&self, key: StateKey) -> Result<PullOutcome, StateError> {
        let mut task = SyncTask::pull(key);
        loop {
            task.attempt += 1;
            match self.pull_key(key).await {
                Err(err) if err.is_retryable() => match self.retry.delay_for(task.attempt) {
                    Some(delay) => {
                        warn!(key = %key, attempt = task.attempt, ?delay, "pull failed, retrying: {}", err);
                        tokio::time::sleep(delay).await;
                    }
                    None => {
                        error!(key = %key, attempt = task.attempt, "pull failed, giving up: {}", err);
                        return Err(err);
                    }
                },
                other => return other,
            }
        }
    }

    /// Send the local value of `key` now. On a transient failure the key stays
    /// dirty and a background retry takes over.
    pub async fn push_key(&self, key: StateKey) -> Result<PushOutcome, StateError> {
        if !key.is_persisted() {
            return Ok(PushOutcome::Clean);
        }
        if !self.claim_push(key) {
            return Ok(PushOutcome::Coalesced);
        }

        match self.push_once(key).await {
            Ok(PushOutcome::Confirmed { revision }) => {
                if !self.release_push_if_current(key, revision) {
                    self.spawn_push(SyncTask::push(key));
                }
                Ok(PushOutcome::Confirmed { revision })
            }
            Ok(outcome) => {
                self.release_push(key);
                Ok(outcome)
            }
            Err(err) if err.is_retryable() && self.retry.delay_for(1).is_some() => {
                warn!(key = %key, "push failed, scheduling retry: {}", err);
                let mut task = SyncTask::push(key);
                task.attempt = 1;
                self.spawn_push(task);
                Err(err)
            }
            Err(err) => {
                self.release_push(key);
                Err(err)
            }
        }
    }

    /// Pull every persisted key in one query. Dirty local entries are only
    /// replaced by strictly newer remote revisions.
    pub async fn sync_from_remote(&self) -> Result<SyncReport, StateError> {
        let user = self.require_user().await.map_err(|err| match err {
            Some(err) => StateError::sync_all(&err),
            None => StateError::AuthRequired,
        })?;
        let query = Query::new().eq("user_id", user.id.as_str());
        let rows = self
            .remote
            .select(STATE_TABLE, &query)
            .await
            .map_err(|e| StateError::sync_all(&e))?;

        let synced_at = Utc::now();
        let mut report = SyncReport::default();
        for row in rows {
            let row: StateRow = match serde_json::from_value(row) {
                Ok(row) => row,
                Err(e) => {
                    warn!("skipping malformed state row: {}", e);
                    continue;
                }
            };
            let key = match row.key.parse::<StateKey>() {
                Ok(key) if key.is_persisted() => key,
                _ => {
                    warn!(key = %row.key, "skipping remote row for unknown key");
                    continue;
                }
            };
            match self.apply_row(key, row, synced_at) {
                Ok(PullOutcome::Applied { .. }) => report.applied.push(key),
                Ok(_) => report.kept.push(key),
                Err(err) => report.failed.push((key, err.to_string())),
            }
        }
        for key in StateKey::PERSISTED {
            self.store.settle_pull(key);
        }

        info!(
            applied = report.applied.len(),
            kept = report.kept.len(),
            failed = report.failed.len(),
            "full pull complete"
        );
        Ok(report)
    }

    /// [`sync_from_remote`](Self::sync_from_remote) with the retry policy applied
    /// to transient failures
    pub async fn refresh_all(&self) -> Result<SyncReport, StateError> {
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            match self.sync_from_remote().await {
                Err(err) if err.is_retryable() => match self.retry.delay_for(attempt) {
                    Some(delay) => {
                        warn!(attempt, ?delay, "full pull failed, retrying: {}", err);
                        tokio::time::sleep(delay).await;
                    }
                    None => {
                        error!(attempt, "full pull failed, giving up: {}", err);
                        return Err(err);
                    }
                },
                other => return other,
            }
        }
    }

    /// Push every dirty persisted key. A key whose push was already in flight
    /// counts as pushed only once that push has landed.
    pub async fn sync_to_remote(&self) -> Result<SyncReport, StateError> {
        let mut report = SyncReport::default();
        let mut joined = Vec::new();
        for key in StateKey::PERSISTED {
            if !self.store.is_dirty(key) {
                continue;
            }
            match self.push_key(key).await {
                Ok(PushOutcome::Confirmed { .. }) => report.pushed.push(key),
                Ok(PushOutcome::Coalesced) => joined.push(key),
                Ok(PushOutcome::Clean) => {}
                Err(StateError::AuthRequired) => return Err(StateError::AuthRequired),
                Err(err) => report.failed.push((key, err.to_string())),
            }
        }
        if !joined.is_empty() {
            self.wait_idle().await;
            for key in joined {
                if self.store.is_dirty(key) {
                    report.failed.push((key, "in-flight push did not land".to_string()));
                } else {
                    report.pushed.push(key);
                }
            }
        }
        info!(pushed = report.pushed.len(), failed = report.failed.len(), "full push complete");
        Ok(report)
    }

    /// Resolve once no push is in flight
    pub async fn wait_idle(&self) {
        let mut rx = self.pushes_in_flight.subscribe();
        // the sender lives as long as self
        let _ = rx.wait_for(|count| *count == 0).await;
    }

    pub fn pushes_in_flight(&self) -> usize {
        *self.pushes_in_flight.borrow()
    }

    async fn pull_once(&self, key: StateKey) -> Result<PullOutcome, StateError> {
        let user = self.require_user().await.map_err(|err| match err {
            Some(err) => StateError::sync(key, &err),
            None => StateError::AuthRequired,
        })?;
        let query = Query::new()
            .eq("user_id", user.id.as_str())
            .eq("key", key.as_str())
            .limit(1);
        let rows = self
            .remote
            .select(STATE_TABLE, &query)
            .await
            .map_err(|e| StateError::sync(key, &e))?;

        let Some(row) = rows.into_iter().next() else {
            self.store.settle_pull(key);
            debug!(key = %key, "no remote row");
            return Ok(PullOutcome::Missing);
        };
        let row: StateRow = serde_json::from_value(row).map_err(|e| StateError::Decode {
            key,
            message: e.to_string(),
        })?;
        self.apply_row(key, row, Utc::now())
    }

    fn apply_row(&self, key: StateKey, row: StateRow, synced_at: DateTime<Utc>) -> Result<PullOutcome, StateError> {
        let remote_revision = row.revision;
        let value = StateValue::from_json(key, row.value)?;
        let outcome = match self.store.apply_remote(value, remote_revision, synced_at) {
            RemoteApply::Applied { revision, changed } => PullOutcome::Applied { revision, changed },
            RemoteApply::Rejected { local_revision } => {
                debug!(key = %key, local_revision, remote_revision, "kept newer local value");
                PullOutcome::Kept {
                    local_revision,
                    remote_revision,
                }
            }
        };
        Ok(outcome)
    }

    async fn push_once(&self, key: StateKey) -> Result<PushOutcome, StateError> {
        let user = self.require_user().await.map_err(|err| match err {
            Some(err) => StateError::sync(key, &err),
            None => StateError::AuthRequired,
        })?;
        // read at send time so writes coalesced into this push go out together
        let entry = self.store.entry(key);
        if !entry.dirty {
            return Ok(PushOutcome::Clean);
        }
        let value = entry.value.to_json().map_err(|e| StateError::Decode {
            key,
            message: e.to_string(),
        })?;
        let row = json!({
            "user_id": user.id,
            "key": key.as_str(),
            "value": value,
            "revision": entry.revision,
            "updated_at": Utc::now(),
        });
        self.remote
            .upsert(STATE_TABLE, row, STATE_CONFLICT_COLUMNS)
            .await
            .map_err(|e| StateError::sync(key, &e))?;

        self.store.mark_synced(key, entry.revision, Utc::now());
        debug!(key = %key, revision = entry.revision, "push confirmed");
        Ok(PushOutcome::Confirmed {
            revision: entry.revision,
        })
    }

    /// `Err(None)` means no session
    async fn require_user(&self) -> Result<AuthUser, Option<anyhow::Error>> {
        match self.remote.current_user().await {
            Ok(Some(user)) => Ok(user),
            Ok(None) => Err(None),
            Err(err) => Err(Some(err)),
        }
    }

    async fn drive_push(self: Arc<Self>, mut task: SyncTask) {
        let key = task.key;
        loop {
            if task.attempt > 0 {
                let Some(delay) = self.retry.delay_for(task.attempt) else {
                    error!(key = %key, attempt = task.attempt, "push retries exhausted; key stays dirty");
                    self.release_push(key);
                    return;
                };
                tokio::time::sleep(delay).await;
            }
            task.attempt += 1;

            match self.push_once(key).await {
                Ok(PushOutcome::Confirmed { revision }) => {
                    if self.release_push_if_current(key, revision) {
                        return;
                    }
                    debug!(key = %key, "changed while pushing; pushing again");
                    task.attempt = 0;
                }
                Ok(_) => {
                    self.release_push(key);
                    return;
                }
                Err(err) if err.is_retryable() => {
                    warn!(key = %key, attempt = task.attempt, "push failed: {}", err);
                }
                Err(err) => {
                    warn!(key = %key, "push abandoned: {}", err);
                    self.release_push(key);
                    return;
                }
            }
        }
    }

    fn spawn_push(&self, task: SyncTask) {
        let Some(engine) = self.this.upgrade() else {
            self.release_push(task.key);
            return;
        };
        match Handle::try_current() {
            Ok(handle) => {
                handle.spawn(engine.drive_push(task));
            }
            Err(_) => {
                warn!(key = %task.key, "no async runtime; push deferred to next full sync");
                self.release_push(task.key);
            }
        }
    }

    fn claim_push(&self, key: StateKey) -> bool {
        let claimed = self.pushes.lock().insert(key);
        if claimed {
            self.pushes_in_flight.send_modify(|count| *count += 1);
        }
        claimed
    }

    fn release_push(&self, key: StateKey) {
        if self.pushes.lock().remove(&key) {
            self.pushes_in_flight.send_modify(|count| *count = count.saturating_sub(1));
        }
    }

    /// Release the push slot unless a write newer than `pushed` landed. Checked
    /// under the slot lock so a concurrent `schedule_push` cannot be lost.
    fn release_push_if_current(&self, key: StateKey, pushed: u64) -> bool {
        let released = {
            let mut pushes = self.pushes.lock();
            if self.store.revision(key) > pushed {
                false
            } else {
                pushes.remove(&key)
            }
        };
        if released {
            self.pushes_in_flight.send_modify(|count| *count = count.saturating_sub(1));
        }
        released
    }

    fn take_pull_rerun(&self, key: StateKey) -> bool {
        match self.pulls.lock().get_mut(&key) {
            Some(rerun) if *rerun => {
                *rerun = false;
                true
            }
            _ => false,
        }
    }
}

impl PushScheduler for SyncEngine {
    fn schedule_push(&self, key: StateKey) {
        if !key.is_persisted() {
            return;
        }
        if self.claim_push(key) {
            self.spawn_push(SyncTask::push(key));
        } else {
            trace!(key = %key, "push in flight; coalesced");
        }
    }
}

/// Marks a pull of one key in flight; released on drop, including when the
/// pulling task is aborted
struct PullClaim<'a> {
    engine: &'a SyncEngine,
    key: StateKey,
}

impl<'a> PullClaim<'a> {
    fn acquire(engine: &'a SyncEngine, key: StateKey) -> Option<Self> {
        let mut pulls = engine.pulls.lock();
        match pulls.get_mut(&key) {
            Some(rerun) => {
                *rerun = true;
                None
            }
            None => {
                pulls.insert(key, false);
                Some(Self { engine, key })
            }
        }
    }
}

impl Drop for PullClaim<'_> {
    fn drop(&mut self) {
        self.engine.pulls.lock().remove(&self.key);
    }
}
