// Router orchestrates registry + feed + output: the VWAP service state machine
use std::io::{self, Write};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument, Span};

use crate::engine::{Accumulator, SymbolRegistry, DEFAULT_MAX_DATA_POINTS};
use crate::market_data::adapters::coinbase_types::CHANNEL_MATCHES;
use crate::market_data::adapters::{FeedConnector, FeedError, Feeds};
use crate::market_data::dispatcher;

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("service is already running")]
    AlreadyRunning,
    #[error("service terminated after a feed failure")]
    Terminated,
    #[error("no trading pairs were provided")]
    NoSymbols,
    #[error("subscribe to {channel} channel: {source}")]
    Subscribe {
        channel: &'static str,
        #[source]
        source: FeedError,
    },
    #[error("feeds: {0}")]
    Feed(#[source] FeedError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RunState {
    Idle = 0,
    Running = 1,
    Terminated = 2,
}

impl RunState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            1 => RunState::Running,
            2 => RunState::Terminated,
            _ => RunState::Idle,
        }
    }
}

/// Construction options for [`VwapService`].
pub struct ServiceConfig {
    /// Span the dispatch loop runs in; all service events are emitted under it.
    pub span: Span,
    /// Window size for each registered pair. `0` selects the default of 200.
    pub max_data_points: usize,
    /// Sink for `"<SYMBOL>: <value>"` lines.
    pub output: Box<dyn Write + Send>,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            span: info_span!("vwap_service"),
            max_data_points: DEFAULT_MAX_DATA_POINTS,
            output: Box::new(io::stdout()),
        }
    }
}

/// Computes VWAPs for registered trading pairs from a feed connector.
///
/// Pairs are registered through `&mut self` before the service is shared, so
/// the registry is read-only (and lock-free) once [`run`](Self::run) starts.
pub struct VwapService<F: FeedConnector> {
    feed: F,
    registry: SymbolRegistry,
    output: Mutex<Box<dyn Write + Send>>,
    span: Span,
    state: AtomicU8,
    cancel: CancellationToken,
    stop: Mutex<Option<CancellationToken>>,
    // kept across runs: connectors hand their streams out once
    feeds: tokio::sync::Mutex<Option<Feeds>>,
}

// Resets the run state even if the run future is dropped mid-flight.
struct RunGuard<'a> {
    state: &'a AtomicU8,
    stop: &'a Mutex<Option<CancellationToken>>,
    next: RunState,
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        let mut stop = self.stop.lock();
        stop.take();
        self.state.store(self.next as u8, Ordering::Release);
    }
}

impl<F: FeedConnector> VwapService<F> {
    /// `cancel` is the external cancellation signal (e.g. process shutdown).
    pub fn new(feed: F, cancel: CancellationToken, config: ServiceConfig) -> Self {
        let max_points = if config.max_data_points == 0 {
            DEFAULT_MAX_DATA_POINTS
        } else {
            config.max_data_points
        };
        Self {
            feed,
            registry: SymbolRegistry::new(max_points),
            output: Mutex::new(config.output),
            span: config.span,
            state: AtomicU8::new(RunState::Idle as u8),
            cancel,
            stop: Mutex::new(None),
            feeds: tokio::sync::Mutex::new(None),
        }
    }

    /// Registers trading pairs (upper-cased). Pairs already present keep
    /// their accumulated state.
    pub fn add_trading_pairs<I, S>(&mut self, pairs: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        for pair in pairs {
            self.registry.register(pair.as_ref());
        }
    }

    pub fn registry_mut(&mut self) -> &mut SymbolRegistry {
        &mut self.registry
    }

    pub fn trading_pairs(&self) -> Vec<String> {
        self.registry.symbols()
    }

    // Monitoring handle; safe to read while the service is running
    pub fn accumulator(&self, symbol: &str) -> Option<Arc<dyn Accumulator>> {
        self.registry.get(symbol).cloned()
    }

    pub fn state(&self) -> RunState {
        RunState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn feed(&self) -> &F {
        &self.feed
    }

    /// Subscribes to the matches channel for every registered pair and
    /// dispatches feed messages until stopped, cancelled, or the feed fails.
    pub async fn run(&self) -> Result<(), ServiceError> {
        if self.registry.is_empty() {
            return Err(ServiceError::NoSymbols);
        }
        // state and stop token change together under the stop lock, so a
        // stop() that observes Running always finds the token
        let stop = CancellationToken::new();
        {
            let mut slot = self.stop.lock();
            if let Err(current) = self.state.compare_exchange(
                RunState::Idle as u8,
                RunState::Running as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                return Err(match RunState::from_u8(current) {
                    RunState::Terminated => ServiceError::Terminated,
                    _ => ServiceError::AlreadyRunning,
                });
            }
            *slot = Some(stop.clone());
        }
        let mut guard = RunGuard { state: &self.state, stop: &self.stop, next: RunState::Idle };

        let result = self.run_loop(stop).instrument(self.span.clone()).await;
        if matches!(result, Err(ServiceError::Feed(_))) {
            guard.next = RunState::Terminated;
        }
        result
    }

    /// Asks a running dispatch loop to exit once the message in flight is
    /// done. No-op unless the service is running.
    pub fn stop(&self) {
        let slot = self.stop.lock();
        if self.state() != RunState::Running {
            return;
        }
        if let Some(stop) = slot.as_ref() {
            stop.cancel();
        }
    }

    async fn run_loop(&self, stop: CancellationToken) -> Result<(), ServiceError> {
        let symbols = self.registry.symbols();
        self.feed
            .subscribe(CHANNEL_MATCHES, &symbols)
            .await
            .map_err(|source| ServiceError::Subscribe { channel: CHANNEL_MATCHES, source })?;
        info!(?symbols, "Subscribed to trading pairs");

        let mut feeds = self.feeds.lock().await;
        if feeds.is_none() {
            *feeds = Some(self.feed.feeds().map_err(ServiceError::Feed)?);
        }
        let Some(Feeds { messages, errors }) = feeds.as_mut() else {
            return Err(ServiceError::Feed(FeedError::FeedsTaken));
        };

        loop {
            tokio::select! {
                biased;
                _ = stop.cancelled() => {
                    info!("Stop requested, leaving dispatch loop");
                    break;
                }
                _ = self.cancel.cancelled() => {
                    info!("Cancelled, leaving dispatch loop");
                    break;
                }
                msg = messages.recv() => match msg {
                    Some(raw) => self.handle(&raw),
                    None => {
                        // the feed reports its fatal error before closing the stream
                        let err = errors.try_recv().unwrap_or(FeedError::Closed(None));
                        error!(error = %err, "Feed stream ended");
                        return Err(ServiceError::Feed(err));
                    }
                },
                Some(err) = errors.recv() => {
                    error!(error = %err, "Feed failed");
                    return Err(ServiceError::Feed(err));
                }
            }
        }

        if let Err(e) = self.feed.unsubscribe(CHANNEL_MATCHES, &symbols).await {
            warn!(error = %e, "Failed to unsubscribe from trading pairs");
        }
        Ok(())
    }

    fn handle(&self, raw: &[u8]) {
        let mut output = self.output.lock();
        if let Some(update) = dispatcher::process(&self.registry, raw, &mut **output) {
            debug!(line = %update, "Dispatched trade");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{RecordingAccumulator, SharedBuffer, TestFeed};
    use std::time::Duration;

    fn service(feed: TestFeed, output: SharedBuffer) -> VwapService<TestFeed> {
        let config = ServiceConfig { output: Box::new(output), ..ServiceConfig::default() };
        VwapService::new(feed, CancellationToken::new(), config)
    }

    async fn wait_for_state(service: &VwapService<TestFeed>, state: RunState) {
        tokio::time::timeout(Duration::from_secs(2), async {
            while service.state() != state {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("service never reached the expected state");
    }

    #[test]
    fn test_new_service() {
        let config = ServiceConfig { max_data_points: 50, ..ServiceConfig::default() };
        let (feed, _handle) = TestFeed::new();
        let service = VwapService::new(feed, CancellationToken::new(), config);
        assert_eq!(service.state(), RunState::Idle);
        assert!(service.trading_pairs().is_empty());
        assert_eq!(service.registry.max_points(), 50);
    }

    #[test]
    fn test_zero_max_points_falls_back() {
        let config = ServiceConfig { max_data_points: 0, ..ServiceConfig::default() };
        let (feed, _handle) = TestFeed::new();
        let service = VwapService::new(feed, CancellationToken::new(), config);
        assert_eq!(service.registry.max_points(), DEFAULT_MAX_DATA_POINTS);
    }

    #[test]
    fn test_add_trading_pairs() {
        let (feed, _handle) = TestFeed::new();
        let mut service = service(feed, SharedBuffer::default());
        service.add_trading_pairs(["eth-btc"]);
        service.accumulator("ETH-BTC").unwrap().push(5.0, 2.0).unwrap();

        service.add_trading_pairs(["ETH-BTC", "BTC-USD"]);
        assert_eq!(service.trading_pairs(), vec!["BTC-USD", "ETH-BTC"]);
        assert_eq!(service.accumulator("ETH-BTC").unwrap().n_points(), 1);
    }

    #[tokio::test]
    async fn test_run_without_pairs() {
        let (feed, handle) = TestFeed::new();
        let service = service(feed, SharedBuffer::default());
        let err = service.run().await.unwrap_err();
        assert_eq!(err.to_string(), "no trading pairs were provided");
        assert_eq!(service.state(), RunState::Idle);
        assert!(handle.subscriptions().is_empty());
    }

    #[tokio::test]
    async fn test_run_subscribe_failure() {
        let (feed, handle) = TestFeed::new();
        handle.fail_subscribe("server error");
        let mut service = service(feed, SharedBuffer::default());
        service.add_trading_pairs(["ETH-BTC"]);

        let err = service.run().await.unwrap_err();
        assert_eq!(err.to_string(), "subscribe to matches channel: connection closed: server error");
        assert_eq!(service.state(), RunState::Idle);
    }

    #[tokio::test]
    async fn test_second_run_is_rejected() {
        let (feed, handle) = TestFeed::new();
        let output = SharedBuffer::default();
        let mut service = service(feed, output.clone());
        service.add_trading_pairs(["ETH-BTC"]);
        let service = Arc::new(service);

        let first = tokio::spawn({
            let service = Arc::clone(&service);
            async move { service.run().await }
        });
        wait_for_state(&service, RunState::Running).await;

        assert!(matches!(service.run().await, Err(ServiceError::AlreadyRunning)));

        // the first run keeps dispatching
        handle.send(r#"{"type":"match","product_id":"ETH-BTC","price":"5.0","size":"2"}"#).await;
        handle.send(r#"{"type":"match","product_id":"ETH-BTC","price":"4.0","size":"5"}"#).await;
        tokio::time::timeout(Duration::from_secs(2), async {
            while service.accumulator("ETH-BTC").unwrap().n_points() < 2 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();

        service.stop();
        first.await.unwrap().unwrap();
        assert_eq!(service.state(), RunState::Idle);
        assert_eq!(output.contents(), "ETH-BTC: 5.000000\nETH-BTC: 4.285714\n");
    }

    #[tokio::test]
    async fn test_pushes_reach_accumulator_in_feed_order() {
        let (feed, handle) = TestFeed::new();
        let output = SharedBuffer::default();
        let mut service = service(feed, output.clone());
        let recorder = Arc::new(RecordingAccumulator::default());
        service.registry_mut().register_with("ETH-BTC", {
            let recorder = Arc::clone(&recorder);
            move || recorder as Arc<dyn Accumulator>
        });
        let service = Arc::new(service);

        let run = tokio::spawn({
            let service = Arc::clone(&service);
            async move { service.run().await }
        });
        for (price, size) in [("1.5", "2"), ("0.5555", "0.6666"), ("3", "4")] {
            let raw = format!(r#"{{"type":"match","product_id":"ETH-BTC","price":"{price}","size":"{size}"}}"#);
            handle.send(&raw).await;
        }
        tokio::time::timeout(Duration::from_secs(2), async {
            while output.lines().len() < 3 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();

        assert_eq!(recorder.pushes(), vec![(1.5, 2.0), (0.5555, 0.6666), (3.0, 4.0)]);
        service.stop();
        run.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_failed_push_produces_no_output() {
        let (feed, handle) = TestFeed::new();
        let output = SharedBuffer::default();
        let mut service = service(feed, output.clone());
        let recorder = Arc::new(RecordingAccumulator::failing());
        service.registry_mut().register_with("ETH-BTC", {
            let recorder = Arc::clone(&recorder);
            move || recorder as Arc<dyn Accumulator>
        });

        handle.send(r#"{"type":"match","product_id":"ETH-BTC","price":"1","size":"1"}"#).await;
        handle.fail(FeedError::Closed(None)).await;
        assert!(matches!(service.run().await, Err(ServiceError::Feed(_))));

        assert_eq!(recorder.pushes(), vec![(1.0, 1.0)]);
        assert!(output.contents().is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_stop_right_after_start_is_honoured() {
        let (feed, _handle) = TestFeed::new();
        let mut service = service(feed, SharedBuffer::default());
        service.add_trading_pairs(["ETH-BTC"]);
        let service = Arc::new(service);

        for _ in 0..200 {
            let stopper = std::thread::spawn({
                let service = Arc::clone(&service);
                move || {
                    while service.state() != RunState::Running {
                        std::hint::spin_loop();
                    }
                    service.stop();
                }
            });

            let result = tokio::time::timeout(Duration::from_secs(2), service.run())
                .await
                .expect("stop request was lost");
            assert!(result.is_ok());
            stopper.join().unwrap();
            assert_eq!(service.state(), RunState::Idle);
        }
    }

    #[tokio::test]
    async fn test_stop_when_idle_is_noop() {
        let (feed, _handle) = TestFeed::new();
        let service = service(feed, SharedBuffer::default());
        service.stop();
        assert_eq!(service.state(), RunState::Idle);
    }

    #[tokio::test]
    async fn test_cancellation_ends_run_and_unsubscribes() {
        let (feed, handle) = TestFeed::new();
        let cancel = CancellationToken::new();
        let config = ServiceConfig { output: Box::new(SharedBuffer::default()), ..ServiceConfig::default() };
        let mut service = VwapService::new(feed, cancel.clone(), config);
        service.add_trading_pairs(["BTC-USD", "ETH-USD"]);

        cancel.cancel();
        service.run().await.unwrap();

        let expected = vec!["BTC-USD".to_string(), "ETH-USD".to_string()];
        assert_eq!(handle.subscriptions(), vec![(CHANNEL_MATCHES.to_string(), expected.clone())]);
        assert_eq!(handle.unsubscriptions(), vec![(CHANNEL_MATCHES.to_string(), expected)]);
        assert_eq!(service.state(), RunState::Idle);
    }

    #[tokio::test]
    async fn test_feed_error_terminates() {
        let (feed, handle) = TestFeed::new();
        let mut service = service(feed, SharedBuffer::default());
        service.add_trading_pairs(["ETH-BTC"]);

        handle.fail(FeedError::Closed(Some("boom".into()))).await;
        let err = service.run().await.unwrap_err();
        assert_eq!(err.to_string(), "feeds: connection closed: boom");
        assert_eq!(service.state(), RunState::Terminated);
        assert!(matches!(service.run().await, Err(ServiceError::Terminated)));
    }
}
