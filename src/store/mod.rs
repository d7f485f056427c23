//! Keyed state store and its listener registry

pub mod keyed_store;
pub mod registry;

// Re-export for convenience
pub use keyed_store::{KeyedStore, PushScheduler, RemoteApply};
pub use registry::{ChangeOrigin, StateChange, Subscription, SubscriptionId, SubscriptionRegistry};
