//! Data models for the state store

pub mod keys;
pub mod value;
pub mod entry;
pub mod finance;
pub mod price;

// Re-export for convenience
pub use keys::{StateKey, Topic};
pub use value::{typed, StateValue, TypedKey};
pub use entry::{StateEntry, StateSnapshot};
pub use finance::{Expense, Insight, Investment, UiPreferences, UserProfile};
pub use price::{AssetType, PriceQuote, PriceRequest, PriceSource, PriceStatus, RefreshSummary};
