// Shared trait + error for feed connectors
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite;

#[derive(Debug, Error)]
pub enum FeedError {
    #[error("dial ws server {url}: {source}")]
    Connect {
        url: String,
        #[source]
        source: tungstenite::Error,
    },
    #[error("write message: {0}")]
    Write(#[source] tungstenite::Error),
    #[error("read message: {0}")]
    Read(#[source] tungstenite::Error),
    #[error("connection closed: {}", .0.as_deref().unwrap_or("no reason given"))]
    Closed(Option<String>),
    #[error("encode request: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("channel '{0}' is not supported")]
    UnsupportedChannel(String),
    #[error("no product id's provided")]
    NoProductIds,
    #[error("feeds were already taken")]
    FeedsTaken,
}

/// Streams handed out by a connector: raw inbound messages in arrival order,
/// and the fatal transport error (at most one) that ends them.
#[derive(Debug)]
pub struct Feeds {
    pub messages: mpsc::Receiver<Vec<u8>>,
    pub errors: mpsc::Receiver<FeedError>,
}

/// Capability of an exchange market-data connection.
#[async_trait::async_trait]
pub trait FeedConnector: Send + Sync {
    async fn subscribe(&self, channel: &str, symbols: &[String]) -> Result<(), FeedError>;

    async fn unsubscribe(&self, channel: &str, symbols: &[String]) -> Result<(), FeedError>;

    // Starts delivery; connectors may hand the streams out only once.
    fn feeds(&self) -> Result<Feeds, FeedError>;

    async fn close(&self) -> Result<(), FeedError>;
}

pub mod coinbase;
pub mod coinbase_types;
