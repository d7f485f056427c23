//! Finance Tracker State Library
//!
//! A keyed client-side state store for personal finance data, kept in step
//! with a remote Supabase project: last-writer-wins sync with push coalescing,
//! realtime invalidation, and debounced live price lookups.

// Public modules - these are the API surface
pub mod config;
pub mod error;
pub mod models;
pub mod traits;
pub mod store;
pub mod sync;
pub mod realtime;
pub mod prices;
pub mod providers;
pub mod handlers;
pub mod notifications;
pub mod tracker;
pub mod utils;

// Re-export commonly used items for easier access
pub use config::Config;
pub use error::StateError;
pub use models::{typed, StateEntry, StateKey, StateSnapshot, StateValue, Topic, TypedKey};
pub use traits::{
    change_feed::ChangeFeed,
    function_invoker::FunctionInvoker,
    notice_handler::{Notice, NoticeHandler},
    persistence::PersistenceClient,
    price_provider::{AssetPriceProvider, LivePriceRefresher, MarketDataProvider},
};
pub use store::{KeyedStore, Subscription, SubscriptionRegistry};
pub use sync::{RetryPolicy, SyncEngine};
pub use realtime::{KeyRoute, RealtimeInvalidationBridge, TableBinding};
pub use prices::{LivePriceAcquisition, PricePoller};
pub use providers::{FunctionMarketData, HttpAssetPriceProvider, MemoryRemote, SupabaseClient, SupabaseRealtime};
pub use handlers::{CompositeNoticeHandler, ConsoleNoticeHandler};
pub use notifications::NoticeQueue;
pub use tracker::{AggregationService, Collaborators, FinanceTracker};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Result type alias for library functions
pub type Result<T> = std::result::Result<T, anyhow::Error>;
