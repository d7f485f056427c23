//! Notice handlers

pub mod console;
pub mod composite;

// Re-export for convenience
pub use console::{log_state_changes, ConsoleNoticeHandler};
pub use composite::CompositeNoticeHandler;
