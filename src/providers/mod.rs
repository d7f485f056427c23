//! Concrete remote collaborators

pub mod memory_remote;
pub mod price_provider;
pub mod realtime_feed;
pub mod rest_client;

// Re-export for convenience
pub use memory_remote::MemoryRemote;
pub use price_provider::{FunctionMarketData, HttpAssetPriceProvider, GET_MARKET_DATA};
pub use realtime_feed::SupabaseRealtime;
pub use rest_client::{SupabaseClient, UPDATE_LIVE_PRICES};
