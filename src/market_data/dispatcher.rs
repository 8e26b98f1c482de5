// Classifies raw feed messages and routes trades into their accumulator.
// Every failure here is per-message: it is logged and the caller moves on.
use std::fmt;
use std::io::{self, Write};
use std::num::ParseFloatError;

use thiserror::Error;
use tracing::{debug, error, instrument, trace, warn};

use crate::engine::{SymbolRegistry, VwapError};
use crate::market_data::adapters::coinbase_types::{ExchangeMessage, MessageType};

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("failed to unmarshal message: {0}")]
    Protocol(#[from] serde_json::Error),
    #[error("received an error message from the server: {0}")]
    Exchange(String),
    #[error("check trading pair: {0} is out of scope")]
    UnknownSymbol(String),
    #[error("parse {field} '{value}': {reason}")]
    NumericParse {
        field: &'static str,
        value: String,
        reason: NumericReason,
    },
    #[error("push {symbol} to VWAP: {source}")]
    Vwap {
        symbol: String,
        #[source]
        source: VwapError,
    },
    #[error("write {symbol} VWAP to output: {source}")]
    Output {
        symbol: String,
        #[source]
        source: io::Error,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NumericReason {
    Invalid(ParseFloatError),
    NonFinite,
}

impl fmt::Display for NumericReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NumericReason::Invalid(e) => write!(f, "{e}"),
            NumericReason::NonFinite => write!(f, "value is not finite"),
        }
    }
}

impl DispatchError {
    /// Short label used for logs and the skipped-message metric.
    pub fn kind(&self) -> &'static str {
        match self {
            DispatchError::Protocol(_) => "protocol",
            DispatchError::Exchange(_) => "exchange",
            DispatchError::UnknownSymbol(_) => "unknown_symbol",
            DispatchError::NumericParse { .. } => "numeric_parse",
            DispatchError::Vwap { .. } => "divide_by_zero",
            DispatchError::Output { .. } => "output",
        }
    }
}

/// Trade fields lifted from a `match` message, still in wire form.
#[derive(Debug, Clone, PartialEq)]
pub struct Trade {
    pub product_id: String,
    pub price: String,
    pub size: String,
    pub side: Option<String>,
    pub sequence: Option<i64>,
    pub trade_id: Option<i64>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Classified {
    Trade(Trade),
    Ignored(MessageType),
}

/// Successful routing of a trade; `Display` renders the output line.
#[derive(Debug, Clone, PartialEq)]
pub struct VwapUpdate {
    pub symbol: String,
    pub value: f64,
    pub n_points: usize,
}

impl fmt::Display for VwapUpdate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {:.6}", self.symbol, self.value)
    }
}

pub fn classify(raw: &[u8]) -> Result<Classified, DispatchError> {
    let msg: ExchangeMessage = serde_json::from_slice(raw)?;
    match msg.kind {
        MessageType::Match => Ok(Classified::Trade(Trade {
            product_id: msg.product_id.unwrap_or_default(),
            price: msg.price.unwrap_or_default(),
            size: msg.size.unwrap_or_default(),
            side: msg.side,
            sequence: msg.sequence,
            trade_id: msg.trade_id,
        })),
        MessageType::Error => {
            let text = match (msg.message, msg.reason) {
                (Some(message), Some(reason)) => format!("{message} ({reason})"),
                (Some(message), None) => message,
                (None, Some(reason)) => reason,
                (None, None) => String::new(),
            };
            Err(DispatchError::Exchange(text))
        }
        other => Ok(Classified::Ignored(other)),
    }
}

fn parse_decimal(field: &'static str, value: &str) -> Result<f64, DispatchError> {
    let parsed = value.trim().parse::<f64>().map_err(|e| DispatchError::NumericParse {
        field,
        value: value.to_string(),
        reason: NumericReason::Invalid(e),
    })?;
    if !parsed.is_finite() {
        return Err(DispatchError::NumericParse {
            field,
            value: value.to_string(),
            reason: NumericReason::NonFinite,
        });
    }
    Ok(parsed)
}

pub fn route(registry: &SymbolRegistry, trade: &Trade) -> Result<VwapUpdate, DispatchError> {
    let accumulator = registry
        .get(&trade.product_id)
        .ok_or_else(|| DispatchError::UnknownSymbol(trade.product_id.clone()))?;

    let price = parse_decimal("price", &trade.price)?;
    let size = parse_decimal("size", &trade.size)?;

    let committed = accumulator
        .push(price, size)
        .map_err(|source| DispatchError::Vwap { symbol: trade.product_id.clone(), source })?;

    Ok(VwapUpdate {
        symbol: trade.product_id.clone(),
        value: committed.value,
        n_points: committed.n_points,
    })
}

/// Runs one raw message through classification, routing and output.
/// `Ok(None)` means the message was not a trade and was skipped silently.
#[instrument(level = "trace", skip_all)]
pub fn dispatch(
    registry: &SymbolRegistry,
    raw: &[u8],
    output: &mut dyn Write,
) -> Result<Option<VwapUpdate>, DispatchError> {
    let trade = match classify(raw)? {
        Classified::Trade(trade) => trade,
        Classified::Ignored(kind) => {
            trace!(?kind, "Ignoring non-trade message");
            return Ok(None);
        }
    };

    let update = route(registry, &trade)?;
    metrics::gauge!("vwap_value", "symbol" => update.symbol.clone()).set(update.value);
    metrics::gauge!("vwap_points", "symbol" => update.symbol.clone()).set(update.n_points as f64);

    writeln!(output, "{update}")
        .and_then(|()| output.flush())
        .map_err(|source| DispatchError::Output { symbol: update.symbol.clone(), source })?;

    debug!(
        symbol = %update.symbol,
        value = update.value,
        n_points = update.n_points,
        side = ?trade.side,
        trade_id = ?trade.trade_id,
        sequence = ?trade.sequence,
        "VWAP updated"
    );
    Ok(Some(update))
}

/// [`dispatch`] with every failure logged and swallowed.
pub fn process(registry: &SymbolRegistry, raw: &[u8], output: &mut dyn Write) -> Option<VwapUpdate> {
    match dispatch(registry, raw, output) {
        Ok(update) => update,
        Err(err) => {
            metrics::counter!("vwap_dispatch_skipped_total", "kind" => err.kind()).increment(1);
            let msg = String::from_utf8_lossy(raw);
            match &err {
                DispatchError::UnknownSymbol(_) | DispatchError::NumericParse { .. } => {
                    warn!(kind = err.kind(), error = %err, %msg, "Skipping feed message")
                }
                _ => error!(kind = err.kind(), error = %err, %msg, "Skipping feed message"),
            }
            None
        }
    }
}
