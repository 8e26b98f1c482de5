// Soft rate-limit telemetry for inbound feed traffic.
// Purely observational: nothing is throttled or dropped because of it.
use tracing::{debug, warn};

/// Coinbase rate limits a connection at 100 messages / second.
pub const DEFAULT_RATE_LIMIT_PER_SEC: u64 = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateSample {
    pub per_sec: u64,
    pub exceeded: bool,
}

#[derive(Debug)]
pub struct RateMeter {
    threshold: u64,
    count: u64,
    total: u64,
}

impl RateMeter {
    pub fn new(threshold: u64) -> Self {
        Self { threshold, count: 0, total: 0 }
    }

    pub fn record(&mut self) {
        self.count += 1;
        self.total += 1;
        metrics::counter!("vwap_feed_messages_total").increment(1);
    }

    /// Closes the current one-second window and starts a new one.
    pub fn roll(&mut self) -> RateSample {
        let sample = RateSample { per_sec: self.count, exceeded: self.count > self.threshold };
        debug!(per_sec = sample.per_sec, "websocket RPS");
        if sample.exceeded {
            warn!(per_sec = sample.per_sec, threshold = self.threshold, "websocket rate limit reached");
        }
        metrics::gauge!("vwap_feed_messages_per_sec").set(sample.per_sec as f64);
        self.count = 0;
        sample
    }

    pub fn total(&self) -> u64 {
        self.total
    }

    pub fn threshold(&self) -> u64 {
        self.threshold
    }
}

impl Default for RateMeter {
    fn default() -> Self {
        Self::new(DEFAULT_RATE_LIMIT_PER_SEC)
    }
}
