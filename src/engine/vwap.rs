use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use parking_lot::Mutex;
use tracing::{instrument, trace};

use crate::engine::types::{Accumulator, DataPoint, VwapError, VwapSnapshot, DEFAULT_MAX_DATA_POINTS};

#[derive(Debug, Default)]
struct Window {
    points: VecDeque<DataPoint>,
    sum_pq: f64,
    sum_q: f64,
}

/// Bounded sliding-window VWAP.
///
/// Sums are maintained incrementally: pushing into a full window subtracts
/// the oldest point's contribution instead of re-summing the window.
/// The last committed value and the window length are mirrored in atomics so
/// that single-field readers never wait on the push lock. Use
/// [`snapshot`](Accumulator::snapshot) when both must agree.
#[derive(Debug)]
pub struct Vwap {
    max_points: usize,
    window: Mutex<Window>,
    value: AtomicU64,
    n_points: AtomicUsize,
}

impl Vwap {
    pub fn new(max_points: usize) -> Self {
        let max_points = if max_points == 0 { DEFAULT_MAX_DATA_POINTS } else { max_points };
        Self {
            max_points,
            window: Mutex::new(Window {
                points: VecDeque::with_capacity(max_points),
                sum_pq: 0.0,
                sum_q: 0.0,
            }),
            value: AtomicU64::new(0f64.to_bits()),
            n_points: AtomicUsize::new(0),
        }
    }

    pub fn max_points(&self) -> usize {
        self.max_points
    }

    // Window sums as (Σ p·q, Σ q)
    pub fn sums(&self) -> (f64, f64) {
        let window = self.window.lock();
        (window.sum_pq, window.sum_q)
    }

    pub fn points(&self) -> Vec<DataPoint> {
        self.window.lock().points.iter().copied().collect()
    }
}

impl Default for Vwap {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_DATA_POINTS)
    }
}

impl Accumulator for Vwap {
    #[instrument(level = "trace", skip(self))]
    fn push(&self, price: f64, volume: f64) -> Result<VwapSnapshot, VwapError> {
        let mut window = self.window.lock();
        let point = DataPoint::new(price, volume);

        let mut sum_pq = window.sum_pq + point.notional();
        let mut sum_q = window.sum_q + point.volume;

        // eviction is applied to the candidate sums before admission
        let evicted = if window.points.len() == self.max_points {
            window.points.front().copied()
        } else {
            None
        };
        if let Some(oldest) = evicted {
            sum_pq -= oldest.notional();
            sum_q -= oldest.volume;
        }

        if sum_q == 0.0 {
            trace!(price, volume, "Rejecting push with zero volume sum");
            return Err(VwapError::DivideByZero);
        }

        if evicted.is_some() {
            window.points.pop_front();
        }
        window.points.push_back(point);
        window.sum_pq = sum_pq;
        window.sum_q = sum_q;

        let committed = VwapSnapshot { value: sum_pq / sum_q, n_points: window.points.len() };
        self.value.store(committed.value.to_bits(), Ordering::Release);
        self.n_points.store(committed.n_points, Ordering::Release);
        trace!(value = committed.value, n_points = committed.n_points, "Committed push");
        Ok(committed)
    }

    fn value(&self) -> f64 {
        f64::from_bits(self.value.load(Ordering::Acquire))
    }

    fn n_points(&self) -> usize {
        self.n_points.load(Ordering::Acquire)
    }

    // Both atomics are only stored under the window lock
    fn snapshot(&self) -> VwapSnapshot {
        let _window = self.window.lock();
        VwapSnapshot { value: self.value(), n_points: self.n_points() }
    }
}
