// Coinbase Exchange websocket connector (matches channel)
use std::time::Duration;

use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use super::coinbase_types::{
    describe_channels, Channel, ExchangeMessage, MessageType, Request, RequestType, SUPPORTED_CHANNELS,
};
use super::{FeedConnector, FeedError, Feeds};
use crate::market_data::rate_meter::{RateMeter, DEFAULT_RATE_LIMIT_PER_SEC};

pub const DEFAULT_WS_URL: &str = "wss://ws-feed.exchange.coinbase.com";
pub const DEFAULT_FEED_BUFFER: usize = 1024;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Debug, Clone)]
pub struct FeedConfig {
    pub ws_url: String,
    // warn when more messages than this arrive within one second
    pub rate_limit_per_sec: u64,
    // inbound queue depth between the receive loop and the consumer
    pub buffer: usize,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            ws_url: DEFAULT_WS_URL.to_string(),
            rate_limit_per_sec: DEFAULT_RATE_LIMIT_PER_SEC,
            buffer: DEFAULT_FEED_BUFFER,
        }
    }
}

pub struct CoinbaseFeed {
    config: FeedConfig,
    sink: tokio::sync::Mutex<SplitSink<WsStream, Message>>,
    stream: Mutex<Option<SplitStream<WsStream>>>,
    cancel: CancellationToken,
}

impl CoinbaseFeed {
    /// Dials the websocket server. The receive loop stops when `cancel` (or
    /// [`close`](FeedConnector::close)) fires.
    #[instrument(skip(cancel), fields(url = %config.ws_url))]
    pub async fn connect(config: FeedConfig, cancel: CancellationToken) -> Result<Self, FeedError> {
        let (ws, response) = tokio_tungstenite::connect_async(config.ws_url.as_str())
            .await
            .map_err(|source| FeedError::Connect { url: config.ws_url.clone(), source })?;
        info!(status = %response.status(), "Connected to websocket feed");

        let (sink, stream) = ws.split();
        Ok(Self {
            config,
            sink: tokio::sync::Mutex::new(sink),
            stream: Mutex::new(Some(stream)),
            cancel: cancel.child_token(),
        })
    }

    async fn send_request(&self, kind: RequestType, channel: &str, symbols: &[String]) -> Result<(), FeedError> {
        validate_request(channel, symbols)?;
        let request = Request { kind, channels: vec![Channel::new(channel, symbols)] };
        let payload = serde_json::to_string(&request)?;
        debug!(%payload, "Sending feed request");

        self.sink
            .lock()
            .await
            .send(Message::Text(payload))
            .await
            .map_err(FeedError::Write)
    }
}

#[async_trait::async_trait]
impl FeedConnector for CoinbaseFeed {
    async fn subscribe(&self, channel: &str, symbols: &[String]) -> Result<(), FeedError> {
        self.send_request(RequestType::Subscribe, channel, symbols).await
    }

    async fn unsubscribe(&self, channel: &str, symbols: &[String]) -> Result<(), FeedError> {
        self.send_request(RequestType::Unsubscribe, channel, symbols).await
    }

    fn feeds(&self) -> Result<Feeds, FeedError> {
        let stream = self.stream.lock().take().ok_or(FeedError::FeedsTaken)?;
        let (msg_tx, messages) = mpsc::channel(self.config.buffer.max(1));
        let (err_tx, errors) = mpsc::channel(1);
        let meter = RateMeter::new(self.config.rate_limit_per_sec);

        tokio::spawn(receive_loop(stream, msg_tx, err_tx, meter, self.cancel.clone()));
        Ok(Feeds { messages, errors })
    }

    async fn close(&self) -> Result<(), FeedError> {
        self.cancel.cancel();
        let mut sink = self.sink.lock().await;
        if let Err(e) = sink.send(Message::Close(None)).await {
            if !is_closed(&e) {
                return Err(FeedError::Write(e));
            }
        }
        match sink.close().await {
            Err(e) if !is_closed(&e) => Err(FeedError::Write(e)),
            _ => Ok(()),
        }
    }
}

// Errors meaning the connection is already gone
fn is_closed(err: &tungstenite::Error) -> bool {
    matches!(
        err,
        tungstenite::Error::ConnectionClosed
            | tungstenite::Error::AlreadyClosed
            | tungstenite::Error::Protocol(tungstenite::error::ProtocolError::SendAfterClosing)
    )
}

fn validate_request(channel: &str, symbols: &[String]) -> Result<(), FeedError> {
    if !SUPPORTED_CHANNELS.contains(&channel) {
        return Err(FeedError::UnsupportedChannel(channel.to_string()));
    }
    if symbols.is_empty() {
        return Err(FeedError::NoProductIds);
    }
    Ok(())
}

// Pumps websocket frames into `msg_tx` in arrival order and accounts for the
// per-second message rate. A fatal transport error is pushed on `err_tx`
// before both streams close.
async fn receive_loop(
    mut stream: SplitStream<WsStream>,
    msg_tx: mpsc::Sender<Vec<u8>>,
    err_tx: mpsc::Sender<FeedError>,
    mut meter: RateMeter,
    cancel: CancellationToken,
) {
    let period = Duration::from_secs(1);
    let mut tick = interval_at(Instant::now() + period, period);
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        let frame = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                debug!("Receive loop cancelled");
                return;
            }
            _ = tick.tick() => {
                meter.roll();
                continue;
            }
            frame = stream.next() => frame,
        };

        let payload = match frame {
            Some(Ok(Message::Text(text))) => text.into_bytes(),
            Some(Ok(Message::Binary(bytes))) => bytes,
            Some(Ok(Message::Close(frame))) => {
                let reason = frame.map(|f| f.reason.into_owned()).filter(|r| !r.is_empty());
                warn!(?reason, "Websocket closed by server");
                let _ = err_tx.send(FeedError::Closed(reason)).await;
                return;
            }
            // ping / pong are answered by tungstenite itself
            Some(Ok(_)) => continue,
            Some(Err(e)) => {
                error!(error = %e, "Failed to read from websocket");
                let _ = err_tx.send(FeedError::Read(e)).await;
                return;
            }
            None => {
                let _ = err_tx.send(FeedError::Closed(None)).await;
                return;
            }
        };

        log_control_message(&payload);
        meter.record();

        tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            sent = msg_tx.send(payload) => {
                if sent.is_err() {
                    debug!("Feed consumer dropped, stopping receive loop");
                    return;
                }
            }
        }
    }
}

fn log_control_message(payload: &[u8]) {
    match serde_json::from_slice::<ExchangeMessage>(payload) {
        Ok(msg) if msg.kind == MessageType::Subscriptions => {
            let channels = msg.channels.unwrap_or_default();
            info!(channels = %describe_channels(&channels), "subscription updated");
        }
        Ok(_) => {}
        Err(e) => debug!(error = %e, "Feed message is not a known envelope"),
    }
}
