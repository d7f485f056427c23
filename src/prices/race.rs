use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::error::StateError;

/// Monotonic request counter; results tagged with an older value are dropped
#[derive(Debug, Clone, Default)]
pub struct Generation {
    current: Arc<AtomicU64>,
}

impl Generation {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a new generation, invalidating every earlier one
    pub fn advance(&self) -> u64 {
        self.current.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub fn current(&self) -> u64 {
        self.current.load(Ordering::Acquire)
    }

    pub fn is_current(&self, generation: u64) -> bool {
        self.current() == generation
    }
}

/// Drive both futures together and return the first `Some`. The other future
/// is dropped as soon as a winner exists; `None` only when both came back empty.
pub async fn first_some<T, A, B>(a: A, b: B) -> Option<T>
where
    A: Future<Output = Option<T>>,
    B: Future<Output = Option<T>>,
{
    tokio::pin!(a);
    tokio::pin!(b);
    let mut a_done = false;
    let mut b_done = false;

    loop {
        tokio::select! {
            result = &mut a, if !a_done => {
                a_done = true;
                if result.is_some() {
                    return result;
                }
            }
            result = &mut b, if !b_done => {
                b_done = true;
                if result.is_some() {
                    return result;
                }
            }
            else => return None,
        }
    }
}

/// Race `future` against a deadline; the late result is discarded
pub async fn with_timeout<T, F>(operation: &str, limit: Duration, future: F) -> Result<T, StateError>
where
    F: Future<Output = T>,
{
    tokio::time::timeout(limit, future)
        .await
        .map_err(|_| StateError::Timeout {
            operation: operation.to_string(),
            seconds: limit.as_secs(),
        })
}
