//! Push-based invalidation from the remote change feed

pub mod bridge;

pub use bridge::{KeyRoute, RealtimeInvalidationBridge, TableBinding};
