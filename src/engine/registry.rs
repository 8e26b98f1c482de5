use std::sync::Arc;

use ahash::AHashMap;
use itertools::Itertools;
use tracing::{debug, warn};

use crate::engine::types::Accumulator;
use crate::engine::vwap::Vwap;

/// Normalised form of a trading pair, e.g. `"btc-usd"` -> `"BTC-USD"`.
pub fn normalize_symbol(symbol: &str) -> String {
    symbol.trim().to_uppercase()
}

/// Symbol -> accumulator map.
///
/// Written during registration only; lookups take `&self` and need no lock.
pub struct SymbolRegistry {
    max_points: usize,
    entries: AHashMap<String, Arc<dyn Accumulator>>,
}

impl SymbolRegistry {
    pub fn new(max_points: usize) -> Self {
        Self { max_points, entries: AHashMap::new() }
    }

    /// Registers `symbol` with a fresh [`Vwap`]. Returns `false` when the
    /// symbol was already present (its state is kept) or is blank.
    pub fn register(&mut self, symbol: &str) -> bool {
        let max_points = self.max_points;
        self.register_with(symbol, || Arc::new(Vwap::new(max_points)) as Arc<dyn Accumulator>)
    }

    /// Same as [`register`](Self::register) with a caller-built accumulator.
    pub fn register_with<F>(&mut self, symbol: &str, make: F) -> bool
    where
        F: FnOnce() -> Arc<dyn Accumulator>,
    {
        let symbol = normalize_symbol(symbol);
        if symbol.is_empty() {
            warn!("Ignoring blank trading pair");
            return false;
        }
        if self.entries.contains_key(&symbol) {
            debug!(%symbol, "Trading pair already registered");
            return false;
        }
        debug!(%symbol, max_points = self.max_points, "Registered trading pair");
        self.entries.insert(symbol, make());
        true
    }

    pub fn get(&self, symbol: &str) -> Option<&Arc<dyn Accumulator>> {
        self.entries.get(symbol)
    }

    // Sorted so subscriptions and listings are deterministic
    pub fn symbols(&self) -> Vec<String> {
        self.entries.keys().cloned().sorted().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn max_points(&self) -> usize {
        self.max_points
    }
}

impl std::fmt::Debug for SymbolRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SymbolRegistry")
            .field("max_points", &self.max_points)
            .field("symbols", &self.symbols())
            .finish()
    }
}
