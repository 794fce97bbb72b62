// =============================================================================
// Sentinel Core — Main Entry Point
// =============================================================================
//
// The engine starts Paused in Paper account mode for safety. An operator must
// explicitly switch to Live trading state (or live account mode, which is
// never actually configured in this build) via the control API.
// =============================================================================

mod aggregator;
mod api;
mod broker;
mod bus;
mod config;
mod connector;
mod control;
mod indicators;
mod risk;
mod router;
mod strategy;
mod types;
mod writer;

use std::sync::Arc;
use std::time::Duration;

use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::aggregator::{OhlcvAggregator, MINUTE_1, MINUTE_5, SECOND_1};
use crate::broker::{FeeSchedule, PaperBroker, SlippageModel};
use crate::bus::StreamBus;
use crate::config::RuntimeConfig;
use crate::connector::ExchangeConnector;
use crate::control::Engine;
use crate::risk::RiskGuard;
use crate::router::OrderRouter;
use crate::strategy::grid::GridStrategy;
use crate::strategy::trend::TrendStrategy;
use crate::types::{AccountMode, TradingMode};
use crate::writer::{InMemoryStore, TimeSeriesWriter};

fn dec(x: f64) -> Decimal {
    Decimal::from_f64(x).unwrap_or_default()
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!("sentinel-core starting up");

    let mut cfg = RuntimeConfig::load("runtime_config.json").unwrap_or_else(|e| {
        warn!(error = %e, "failed to load runtime config, using defaults");
        RuntimeConfig::default()
    });

    // SAFETY: always start Paused + Paper regardless of what was persisted.
    cfg.trading_mode = TradingMode::Paused;
    cfg.account_mode = AccountMode::Paper;

    if let Ok(syms) = std::env::var("SENTINEL_SYMBOLS") {
        cfg.symbols = syms.split(',').map(|s| s.trim().to_uppercase()).filter(|s| !s.is_empty()).collect();
    }
    if cfg.symbols.is_empty() {
        cfg.symbols = vec!["BTCUSDT".into(), "ETHUSDT".into()];
    }

    info!(symbols = ?cfg.symbols, trading_mode = %cfg.trading_mode, account_mode = %cfg.account_mode, "engine starting in safe mode");

    // ── Build the C1–C9 pipeline ─────────────────────────────────────────
    // time_series_store
    let primary_store = Box::new(InMemoryStore::default());
    let fallback_store = Box::new(InMemoryStore::default());

    // bus
    let bus = Arc::new(StreamBus::new(Duration::from_secs(30), Duration::from_secs(3600)));

    // writer
    let writer = Arc::new(TimeSeriesWriter::new(
        primary_store,
        fallback_store,
        cfg.batch_size,
        Duration::from_secs(cfg.flush_interval_seconds),
        cfg.max_queue_size,
    ));

    // risk guard
    let risk = Arc::new(RiskGuard::new(
        dec(cfg.initial_paper_balance),
        dec(cfg.daily_loss_limit_pct),
        cfg.position_limit,
        dec(cfg.max_position_size_pct),
        dec(cfg.notional_cap),
        dec(cfg.total_exposure_pct),
    ));

    // broker
    let broker = Arc::new(PaperBroker::new(
        dec(cfg.initial_paper_balance),
        FeeSchedule { maker_bps: dec(cfg.maker_fee_bps), taker_bps: dec(cfg.taker_fee_bps) },
        SlippageModel { base_bps: dec(cfg.base_slippage_bps), max_bps: dec(cfg.max_slippage_bps), assumed_book_depth: dec(1_000_000.0) },
    ));

    // router
    let router = Arc::new(OrderRouter::new(broker.clone(), risk.clone()));

    let engine = Arc::new(Engine::new(cfg.clone(), bus.clone(), risk, broker, router, writer.clone()));

    // aggregators — one per symbol, at the timeframes the strategies consume.
    for symbol in &cfg.symbols {
        engine.register_aggregator(
            format!("binance:{symbol}"),
            OhlcvAggregator::new("binance", symbol, &[SECOND_1, MINUTE_1, MINUTE_5]),
        );
    }

    // strategy_engine — alternate grid/trend across the configured symbols so
    // both variants are exercised without a dedicated per-symbol config knob.
    for (i, symbol) in cfg.symbols.iter().enumerate() {
        if i % 2 == 0 {
            engine.register_strategy(symbol.clone(), Box::new(GridStrategy::new(cfg.grid.clone())));
        } else {
            engine.register_strategy(symbol.clone(), Box::new(TrendStrategy::new(cfg.trend.clone())));
        }
    }

    // connectors — one ExchangeConnector per configured exchange feed.
    let exchange_url = std::env::var("SENTINEL_EXCHANGE_WS_URL").unwrap_or_else(|_| "wss://stream.binance.com:9443/ws".to_string());
    let connector = ExchangeConnector::new("binance", exchange_url, cfg.symbols.clone());
    engine.register_connector_stats(connector.stats());

    let connector_engine = engine.clone();
    let shutdown = engine.shutdown_token();
    tokio::spawn(async move {
        connector.run(shutdown, move |tick| connector_engine.ingest_tick(tick)).await;
    });

    // writer flush loop — drains batches on the configured interval regardless
    // of whether the size trigger has fired.
    let flush_writer = writer.clone();
    let flush_shutdown = engine.shutdown_token();
    let flush_interval = Duration::from_secs(cfg.flush_interval_seconds.max(1));
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(flush_interval);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if flush_writer.should_flush() {
                        flush_writer.flush();
                    }
                }
                _ = flush_shutdown.cancelled() => {
                    flush_writer.flush();
                    return;
                }
            }
        }
    });

    // ── Control API ───────────────────────────────────────────────────────
    let api_engine = engine.clone();
    let bind_addr = std::env::var("SENTINEL_BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:8080".into());
    tokio::spawn(async move {
        let app = api::rest::router(api_engine);
        let listener = tokio::net::TcpListener::bind(&bind_addr).await.expect("failed to bind control API");
        info!(addr = %bind_addr, "control API listening");
        if let Err(e) = axum::serve(listener, app).await {
            error!(error = %e, "control API server failed");
        }
    });

    info!("all subsystems running, press Ctrl+C to stop");

    tokio::signal::ctrl_c().await?;
    warn!("shutdown signal received, stopping gracefully");
    engine.shutdown();

    // Deadline-then-force: give in-flight tasks a window to observe the
    // cancellation token before the process exits regardless.
    tokio::time::sleep(Duration::from_secs(2)).await;

    if let Err(e) = cfg.save("runtime_config.json") {
        error!(error = %e, "failed to save runtime config on shutdown");
    }

    info!("sentinel-core shut down complete");
    Ok(())
}
