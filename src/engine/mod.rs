// Numeric core: accumulators and the symbol registry
pub mod types;     // data points, errors, Accumulator trait
pub mod vwap;      // bounded-window incremental VWAP
pub mod registry;  // symbol -> accumulator map

pub use registry::{normalize_symbol, SymbolRegistry};
pub use types::{Accumulator, DataPoint, VwapError, VwapSnapshot, DEFAULT_MAX_DATA_POINTS};
pub use vwap::Vwap;
