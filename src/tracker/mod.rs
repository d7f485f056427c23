//! Session context and aggregation endpoints

pub mod aggregation;
pub mod finance_tracker;

// Re-export for convenience
pub use aggregation::{AggregationService, GENERATE_INSIGHTS};
pub use finance_tracker::{Collaborators, FinanceTracker, SHUTDOWN_GRACE};
