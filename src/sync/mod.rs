//! Pull/push synchronization with the remote store

pub mod engine;
pub mod retry;

// Re-export for convenience
pub use engine::{PullOutcome, PushOutcome, SyncEngine, SyncReport, STATE_TABLE};
pub use retry::{RetryPolicy, SyncDirection, SyncTask};
