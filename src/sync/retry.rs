use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::models::keys::StateKey;

/// Exponential backoff for transient sync failures
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            max_delay: Duration::from_secs(30),
        }
    }

    /// Fail once, never retry
    pub fn none() -> Self {
        Self::new(1, Duration::ZERO)
    }

    /// Delay before the next try after `attempts` failed tries, `None` once
    /// the budget is spent
    pub fn delay_for(&self, attempts: u32) -> Option<Duration> {
        if attempts == 0 || attempts >= self.max_attempts {
            return None;
        }
        let factor = 2u32.saturating_pow(attempts - 1);
        Some(self.base_delay.saturating_mul(factor).min(self.max_delay))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(5, Duration::from_millis(500))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncDirection {
    Push,
    Pull,
}

/// One unit of sync work and how many times it has been tried
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncTask {
    pub direction: SyncDirection,
    pub key: StateKey,
    pub attempt: u32,
}

impl SyncTask {
    pub fn push(key: StateKey) -> Self {
        Self { direction: SyncDirection::Push, key, attempt: 0 }
    }

    pub fn pull(key: StateKey) -> Self {
        Self { direction: SyncDirection::Pull, key, attempt: 0 }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_until_cap_and_budget() {
        let policy = RetryPolicy {
            max_attempts: 8,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(3),
        };
        assert_eq!(policy.delay_for(0), None);
        assert_eq!(policy.delay_for(1), Some(Duration::from_millis(500)));
        assert_eq!(policy.delay_for(2), Some(Duration::from_millis(1000)));
        assert_eq!(policy.delay_for(3), Some(Duration::from_millis(2000)));
        assert_eq!(policy.delay_for(4), Some(Duration::from_secs(3)));
        assert_eq!(policy.delay_for(8), None);
    }

    #[test]
    fn none_policy_never_retries() {
        assert_eq!(RetryPolicy::none().delay_for(1), None);
    }
}
