use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, info_span};

use vwap_rs::config::{AppConfig, Cli};
use vwap_rs::telemetry;
use vwap_rs::{CoinbaseFeed, FeedConnector, ServiceConfig, VwapService};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok(); // load .env

    let cli = Cli::parse();
    let cfg = AppConfig::load(&cli)?;

    let filter = cfg
        .log_filter
        .clone()
        .unwrap_or_else(|| telemetry::default_filter(cfg.is_dev()).to_string());
    telemetry::init_tracing(&filter, cfg.is_dev());
    telemetry::init_metrics()?;

    let output = cfg.open_output()?;
    let cancel = CancellationToken::new();

    let feed = CoinbaseFeed::connect(cfg.feed_config(), cancel.clone())
        .await
        .context("connect to exchange feed")?;

    let service_config = ServiceConfig {
        span: info_span!("vwap_service", env = %cfg.env),
        max_data_points: cfg.max_data_points,
        output,
    };
    let mut service = VwapService::new(feed, cancel.clone(), service_config);
    service.add_trading_pairs(&cfg.trading_pairs);
    info!(pairs = ?service.trading_pairs(), window = cfg.max_data_points, "Starting VWAP service");

    let service = Arc::new(service);
    let mut run_task = tokio::spawn({
        let service = Arc::clone(&service);
        async move { service.run().await }
    });

    let outcome = tokio::select! {
        res = &mut run_task => res,
        _ = shutdown_signal() => {
            info!("Shutdown signal received");
            cancel.cancel();
            run_task.await
        }
    };

    if let Err(e) = service.feed().close().await {
        error!(error = %e, "Failed to close feed connection");
    }

    outcome.context("VWAP service task panicked")?.context("VWAP service failed")?;
    info!("VWAP service stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
