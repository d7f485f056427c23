//! Small shared helpers

pub mod helper;

pub use helper::{normalize_symbol, parse_or, truncate_string};
