// Source: https://docs.cloud.coinbase.com/exchange/docs/websocket-overview
use serde::{Deserialize, Serialize};

pub const CHANNEL_MATCHES: &str = "matches";
pub const CHANNEL_HEARTBEAT: &str = "heartbeat";

pub const SUPPORTED_CHANNELS: [&str; 2] = [CHANNEL_MATCHES, CHANNEL_HEARTBEAT];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    Match,
    Error,
    Subscriptions,
    // sent after a (re)subscribe when trades were missed
    LastMatch,
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestType {
    Subscribe,
    Unsubscribe,
}

/// Inbound feed envelope. Every field except `type` is optional; unknown
/// fields are ignored.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ExchangeMessage {
    #[serde(rename = "type")]
    pub kind: MessageType,
    pub product_id: Option<String>,
    pub price: Option<String>,
    pub size: Option<String>,
    pub side: Option<String>,
    pub message: Option<String>,
    pub reason: Option<String>,
    pub sequence: Option<i64>,
    pub trade_id: Option<i64>,
    pub channels: Option<Vec<Channel>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Channel {
    pub name: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub product_ids: Vec<String>,
}

impl Channel {
    pub fn new(name: &str, product_ids: &[String]) -> Self {
        Self { name: name.to_string(), product_ids: product_ids.to_vec() }
    }
}

// Outbound subscribe / unsubscribe envelope
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Request {
    #[serde(rename = "type")]
    pub kind: RequestType,
    pub channels: Vec<Channel>,
}

/// Human readable channel list: `matches[BTC-USD,ETH-USD] / heartbeat[BTC-USD]`.
pub fn describe_channels(channels: &[Channel]) -> String {
    channels
        .iter()
        .map(|ch| format!("{}[{}]", ch.name, ch.product_ids.join(",")))
        .collect::<Vec<_>>()
        .join(" / ")
}
