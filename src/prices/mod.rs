//! Live price acquisition and background refresh

pub mod acquisition;
pub mod poller;
pub mod race;

// Re-export for convenience
pub use acquisition::{LivePriceAcquisition, DEFAULT_DEBOUNCE, DEFAULT_FETCH_TIMEOUT};
pub use poller::{PricePoller, DEFAULT_POLL_INTERVAL};
pub use race::{first_some, with_timeout, Generation};
