// Process configuration: defaults -> optional TOML file -> VWAP_* env -> CLI / plain env
use std::fs::File;
use std::io::{self, Write};
use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use serde::Deserialize;

use crate::engine::DEFAULT_MAX_DATA_POINTS;
use crate::market_data::adapters::coinbase::{FeedConfig, DEFAULT_FEED_BUFFER, DEFAULT_WS_URL};
use crate::market_data::rate_meter::DEFAULT_RATE_LIMIT_PER_SEC;

pub const ENV_DEVELOPMENT: &str = "dev";
pub const DEFAULT_TRADING_PAIRS: [&str; 3] = ["BTC-USD", "ETH-USD", "ETH-BTC"];
// output value selecting standard output
pub const STDOUT_OUTPUT: &str = "-";

#[derive(Debug, Default, Parser)]
#[command(name = "vwap-rs", about = "Streams a bounded-window VWAP per trading pair")]
pub struct Cli {
    /// Optional TOML configuration file
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Runtime environment; anything but "dev" switches to JSON logs
    #[arg(long, env = "ENV")]
    pub env: Option<String>,

    /// Output file for VWAP lines ("-" for stdout)
    #[arg(long, env = "OUTPUT_PATH")]
    pub output: Option<String>,

    /// Comma separated trading pairs, e.g. BTC-USD,ETH-USD
    #[arg(long, env = "TRADING_PAIRS", value_delimiter = ',')]
    pub trading_pairs: Option<Vec<String>>,

    /// Data points kept per trading pair
    #[arg(long, env = "MAX_DATA_POINTS")]
    pub max_data_points: Option<usize>,

    /// Websocket feed URL
    #[arg(long, env = "WS_URL")]
    pub ws_url: Option<String>,

    /// Inbound messages per second above which a warning is logged
    #[arg(long, env = "RATE_LIMIT_PER_SEC")]
    pub rate_limit_per_sec: Option<u64>,

    /// Log filter, overridden by RUST_LOG
    #[arg(long, env = "LOG_FILTER")]
    pub log_filter: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct AppConfig {
    pub env: String,
    pub output: String,
    pub trading_pairs: Vec<String>,
    pub max_data_points: usize,
    pub ws_url: String,
    pub rate_limit_per_sec: u64,
    pub feed_buffer: usize,
    pub log_filter: Option<String>,
}

impl AppConfig {
    pub fn load(cli: &Cli) -> anyhow::Result<Self> {
        let mut builder = config::Config::builder()
            .set_default("env", ENV_DEVELOPMENT)?
            .set_default("output", STDOUT_OUTPUT)?
            .set_default("trading_pairs", DEFAULT_TRADING_PAIRS.to_vec())?
            .set_default("max_data_points", DEFAULT_MAX_DATA_POINTS as i64)?
            .set_default("ws_url", DEFAULT_WS_URL)?
            .set_default("rate_limit_per_sec", DEFAULT_RATE_LIMIT_PER_SEC as i64)?
            .set_default("feed_buffer", DEFAULT_FEED_BUFFER as i64)?;

        if let Some(path) = &cli.config {
            builder = builder.add_source(config::File::from(path.as_path()).required(true));
        }

        let settings = builder
            .add_source(
                config::Environment::with_prefix("VWAP")
                    .try_parsing(true)
                    .list_separator(",")
                    .with_list_parse_key("trading_pairs"),
            )
            .set_override_option("env", cli.env.clone())?
            .set_override_option("output", cli.output.clone())?
            .set_override_option("trading_pairs", cli.trading_pairs.clone())?
            .set_override_option("max_data_points", cli.max_data_points.map(|n| n as i64))?
            .set_override_option("ws_url", cli.ws_url.clone())?
            .set_override_option("rate_limit_per_sec", cli.rate_limit_per_sec.map(|n| n as i64))?
            .set_override_option("log_filter", cli.log_filter.clone())?
            .build()
            .context("build configuration")?;

        let mut cfg: AppConfig = settings.try_deserialize().context("deserialize configuration")?;
        cfg.trading_pairs = clean_pairs(&cfg.trading_pairs);
        Ok(cfg)
    }

    pub fn is_dev(&self) -> bool {
        self.env == ENV_DEVELOPMENT
    }

    pub fn feed_config(&self) -> FeedConfig {
        FeedConfig {
            ws_url: self.ws_url.clone(),
            rate_limit_per_sec: self.rate_limit_per_sec,
            buffer: self.feed_buffer,
        }
    }

    /// Opens the VWAP output target: stdout for `-` / empty, else a file
    /// created (or truncated) at the configured path.
    pub fn open_output(&self) -> anyhow::Result<Box<dyn Write + Send>> {
        let target = self.output.trim();
        if target.is_empty() || target == STDOUT_OUTPUT {
            return Ok(Box::new(io::stdout()));
        }
        let file = File::create(target).with_context(|| format!("create output file {target}"))?;
        Ok(Box::new(io::LineWriter::new(file)))
    }
}

// Trims entries and drops blanks left by stray commas
fn clean_pairs(pairs: &[String]) -> Vec<String> {
    pairs
        .iter()
        .map(|p| p.trim())
        .filter(|p| !p.is_empty())
        .map(str::to_string)
        .collect()
}
