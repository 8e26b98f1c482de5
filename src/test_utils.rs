// In-process doubles for the feed connector and output sink.
use std::io::{self, Write};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::engine::{Accumulator, VwapError, VwapSnapshot};
use crate::market_data::adapters::{FeedConnector, FeedError, Feeds};

type Requests = Arc<Mutex<Vec<(String, Vec<String>)>>>;

/// Feed connector whose messages and errors are injected through a
/// [`TestFeedHandle`].
pub struct TestFeed {
    feeds: Mutex<Option<Feeds>>,
    subscribe_error: Arc<Mutex<Option<String>>>,
    subscriptions: Requests,
    unsubscriptions: Requests,
}

#[derive(Clone)]
pub struct TestFeedHandle {
    msg_tx: mpsc::Sender<Vec<u8>>,
    err_tx: mpsc::Sender<FeedError>,
    subscribe_error: Arc<Mutex<Option<String>>>,
    subscriptions: Requests,
    unsubscriptions: Requests,
}

impl TestFeed {
    pub fn new() -> (Self, TestFeedHandle) {
        let (msg_tx, messages) = mpsc::channel(64);
        let (err_tx, errors) = mpsc::channel(1);
        let subscribe_error = Arc::new(Mutex::new(None));
        let subscriptions = Requests::default();
        let unsubscriptions = Requests::default();

        let feed = Self {
            feeds: Mutex::new(Some(Feeds { messages, errors })),
            subscribe_error: Arc::clone(&subscribe_error),
            subscriptions: Arc::clone(&subscriptions),
            unsubscriptions: Arc::clone(&unsubscriptions),
        };
        let handle = TestFeedHandle { msg_tx, err_tx, subscribe_error, subscriptions, unsubscriptions };
        (feed, handle)
    }
}

#[async_trait::async_trait]
impl FeedConnector for TestFeed {
    async fn subscribe(&self, channel: &str, symbols: &[String]) -> Result<(), FeedError> {
        if let Some(reason) = self.subscribe_error.lock().clone() {
            return Err(FeedError::Closed(Some(reason)));
        }
        self.subscriptions.lock().push((channel.to_string(), symbols.to_vec()));
        Ok(())
    }

    async fn unsubscribe(&self, channel: &str, symbols: &[String]) -> Result<(), FeedError> {
        self.unsubscriptions.lock().push((channel.to_string(), symbols.to_vec()));
        Ok(())
    }

    fn feeds(&self) -> Result<Feeds, FeedError> {
        self.feeds.lock().take().ok_or(FeedError::FeedsTaken)
    }

    async fn close(&self) -> Result<(), FeedError> {
        Ok(())
    }
}

impl TestFeedHandle {
    pub async fn send(&self, raw: &str) {
        self.msg_tx.send(raw.as_bytes().to_vec()).await.expect("test feed consumer dropped");
    }

    pub async fn fail(&self, err: FeedError) {
        self.err_tx.send(err).await.expect("test feed consumer dropped");
    }

    pub fn fail_subscribe(&self, reason: &str) {
        *self.subscribe_error.lock() = Some(reason.to_string());
    }

    pub fn subscriptions(&self) -> Vec<(String, Vec<String>)> {
        self.subscriptions.lock().clone()
    }

    pub fn unsubscriptions(&self) -> Vec<(String, Vec<String>)> {
        self.unsubscriptions.lock().clone()
    }
}

/// Cloneable in-memory output sink.
#[derive(Clone, Default)]
pub struct SharedBuffer(Arc<Mutex<Vec<u8>>>);

impl SharedBuffer {
    pub fn contents(&self) -> String {
        String::from_utf8_lossy(&self.0.lock()).into_owned()
    }

    pub fn lines(&self) -> Vec<String> {
        self.contents().lines().map(str::to_string).collect()
    }
}

impl Write for SharedBuffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Output sink that rejects every write.
pub struct FailingWriter;

impl Write for FailingWriter {
    fn write(&mut self, _buf: &[u8]) -> io::Result<usize> {
        Err(io::Error::new(io::ErrorKind::BrokenPipe, "sink closed"))
    }

    fn flush(&mut self) -> io::Result<()> {
        Err(io::Error::new(io::ErrorKind::BrokenPipe, "sink closed"))
    }
}

/// Accumulator double that records every push in order.
#[derive(Default)]
pub struct RecordingAccumulator {
    pushes: Mutex<Vec<(f64, f64)>>,
    fail: bool,
}

impl RecordingAccumulator {
    // Records pushes but rejects each one as a zero-volume window
    pub fn failing() -> Self {
        Self { pushes: Mutex::default(), fail: true }
    }

    pub fn pushes(&self) -> Vec<(f64, f64)> {
        self.pushes.lock().clone()
    }
}

impl Accumulator for RecordingAccumulator {
    fn push(&self, price: f64, volume: f64) -> Result<VwapSnapshot, VwapError> {
        let mut pushes = self.pushes.lock();
        pushes.push((price, volume));
        if self.fail {
            return Err(VwapError::DivideByZero);
        }
        Ok(VwapSnapshot { value: price, n_points: pushes.len() })
    }

    fn value(&self) -> f64 {
        self.pushes.lock().last().map(|(price, _)| *price).unwrap_or_default()
    }

    fn n_points(&self) -> usize {
        self.pushes.lock().len()
    }

    fn snapshot(&self) -> VwapSnapshot {
        VwapSnapshot { value: self.value(), n_points: self.n_points() }
    }
}
