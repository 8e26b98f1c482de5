pub mod config;
pub mod engine;
pub mod market_data;
pub mod telemetry;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

pub use engine::{Accumulator, SymbolRegistry, Vwap, VwapError, VwapSnapshot};
pub use market_data::adapters::coinbase::{CoinbaseFeed, FeedConfig};
pub use market_data::adapters::{FeedConnector, FeedError, Feeds};
pub use market_data::router::{RunState, ServiceConfig, ServiceError, VwapService};
