use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::{debug, error};

use crate::models::keys::{StateKey, Topic};

/// Where a write came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeOrigin {
    Local,
    Remote,
}

/// Payload handed to listeners after a key changed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateChange {
    pub key: StateKey,
    pub revision: u64,
    pub origin: ChangeOrigin,
}

pub type SubscriptionId = u64;

type Listener = Arc<dyn Fn(&StateChange) + Send + Sync>;

#[derive(Clone)]
struct ListenerSlot {
    id: SubscriptionId,
    callback: Listener,
    active: Arc<AtomicBool>,
}

#[derive(Default)]
struct RegistryInner {
    next_id: SubscriptionId,
    topics: HashMap<Topic, Vec<ListenerSlot>>,
}

impl RegistryInner {
    fn remove(&mut self, topic: Topic, id: SubscriptionId) {
        if let Some(slots) = self.topics.get_mut(&topic) {
            slots.retain(|slot| slot.id != id);
            if slots.is_empty() {
                self.topics.remove(&topic);
            }
        }
    }

    fn listeners(&self, topic: Topic) -> Vec<ListenerSlot> {
        self.topics.get(&topic).cloned().unwrap_or_default()
    }
}

/// Per-key and wildcard listener sets, dispatched synchronously in subscription order
#[derive(Clone, Default)]
pub struct SubscriptionRegistry {
    inner: Arc<Mutex<RegistryInner>>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach `callback` to `topic`. The listener lives until the returned
    /// handle is dropped or unsubscribed.
    #[must_use = "dropping the subscription detaches the listener"]
    pub fn subscribe<F>(&self, topic: impl Into<Topic>, callback: F) -> Subscription
    where
        F: Fn(&StateChange) + Send + Sync + 'static,
    {
        let topic = topic.into();
        let active = Arc::new(AtomicBool::new(true));
        let mut inner = self.inner.lock();
        inner.next_id += 1;
        let id = inner.next_id;
        inner.topics.entry(topic).or_default().push(ListenerSlot {
            id,
            callback: Arc::new(callback),
            active: active.clone(),
        });
        debug!(topic = %topic, id, "listener subscribed");

        Subscription {
            id,
            topic,
            active,
            registry: Arc::downgrade(&self.inner),
        }
    }

    /// Run every listener of `change.key`, then every wildcard listener.
    /// No lock is held while callbacks run, so they may re-enter the store.
    pub fn notify(&self, change: &StateChange) {
        let (keyed, wildcard) = {
            let inner = self.inner.lock();
            (inner.listeners(Topic::Key(change.key)), inner.listeners(Topic::Any))
        };

        for slot in keyed.iter().chain(wildcard.iter()) {
            // detached while an earlier callback of this dispatch ran
            if !slot.active.load(Ordering::Acquire) {
                continue;
            }
            let outcome = catch_unwind(AssertUnwindSafe(|| (slot.callback)(change)));
            if let Err(panic) = outcome {
                error!(
                    key = %change.key,
                    listener = slot.id,
                    "state listener panicked: {}",
                    panic_message(panic.as_ref())
                );
            }
        }
    }

    pub fn listener_count(&self, topic: impl Into<Topic>) -> usize {
        self.inner
            .lock()
            .topics
            .get(&topic.into())
            .map(Vec::len)
            .unwrap_or(0)
    }
}

/// Handle for an attached listener; detaches on drop
pub struct Subscription {
    id: SubscriptionId,
    topic: Topic,
    active: Arc<AtomicBool>,
    registry: Weak<Mutex<RegistryInner>>,
}

impl Subscription {
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    pub fn topic(&self) -> Topic {
        self.topic
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Detach the listener. Calling it again is a no-op.
    pub fn unsubscribe(&self) {
        if !self.active.swap(false, Ordering::AcqRel) {
            return;
        }
        if let Some(inner) = self.registry.upgrade() {
            inner.lock().remove(self.topic, self.id);
            debug!(topic = %self.topic, id = self.id, "listener unsubscribed");
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("topic", &self.topic)
            .field("active", &self.is_active())
            .finish()
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
