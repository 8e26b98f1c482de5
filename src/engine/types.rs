use thiserror::Error;

/// Window size used when a non-positive size is requested.
pub const DEFAULT_MAX_DATA_POINTS: usize = 200;

// Single trade contribution held by the window
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DataPoint {
    pub price: f64,
    pub volume: f64,
}

impl DataPoint {
    pub fn new(price: f64, volume: f64) -> Self {
        Self { price, volume }
    }

    pub fn notional(&self) -> f64 {
        self.price * self.volume
    }
}

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum VwapError {
    #[error("error calculating vwap: sum of volumes equals to 0")]
    DivideByZero,
}

/// Value and window length committed together by one push.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VwapSnapshot {
    pub value: f64,
    pub n_points: usize,
}

/// Capability of a running volume-weighted average.
///
/// Implementations synchronize internally: `push` calls are serialized and
/// readers never observe a half-applied update.
pub trait Accumulator: Send + Sync {
    /// Returns the state committed by this push.
    fn push(&self, price: f64, volume: f64) -> Result<VwapSnapshot, VwapError>;
    fn value(&self) -> f64;
    fn n_points(&self) -> usize;
    /// Value and length read as one pair.
    fn snapshot(&self) -> VwapSnapshot;
}
