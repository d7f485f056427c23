//! Seams to the external collaborators

pub mod persistence;
pub mod change_feed;
pub mod function_invoker;
pub mod price_provider;
pub mod notice_handler;

// Re-export for convenience
pub use persistence::{AuthUser, PersistenceClient, Query};
pub use change_feed::{ChangeEvent, ChangeFeed, ChangeKind, ChangeStream};
pub use function_invoker::FunctionInvoker;
pub use price_provider::{AssetPriceProvider, LivePriceRefresher, MarketDataProvider};
pub use notice_handler::{Notice, NoticeHandler, NoticeLevel};
