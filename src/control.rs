// =============================================================================
// Control Plane (C9) — central engine state, pipeline glue, lifecycle, health
// =============================================================================
//
// The single `Arc<Engine>` tying every subsystem together. It is also where
// a tick's journey through the pipeline is wired end to end: bus publish,
// time-series enqueue, aggregation into bars, strategy dispatch, signal
// routing, and the fill feedback loop back into the risk guard — the part no
// single component owns by itself.
// =============================================================================

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use parking_lot::RwLock;
use rust_decimal::Decimal;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use crate::aggregator::OhlcvAggregator;
use crate::broker::PaperBroker;
use crate::bus::StreamBus;
use crate::config::RuntimeConfig;
use crate::connector::ConnectorStats;
use crate::risk::{RiskGuard, RiskLimits};
use crate::router::{OrderRouter, PlaceResult};
use crate::strategy::StrategyRegistry;
use crate::types::{AccountMode, Order, Position, Side, Signal, Tick, TradingMode};
use crate::writer::TimeSeriesWriter;
use uuid::Uuid;

/// Startup order. Shutdown proceeds in reverse over whichever components the
/// caller actually started, cascading through a shared `CancellationToken`.
pub const START_ORDER: &[&str] = &[
    "time_series_store",
    "bus",
    "writer",
    "aggregators",
    "connectors",
    "strategy_engine",
    "router",
    "broker",
];

const MAX_RECENT_ERRORS: usize = 50;

#[derive(Debug, Clone, Serialize)]
pub struct ErrorRecord {
    pub message: String,
    pub at: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ComponentHealth {
    pub name: String,
    pub up: bool,
    pub detail: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthSnapshot {
    pub uptime_seconds: u64,
    pub state_version: u64,
    pub trading_mode: String,
    pub account_mode: String,
    pub components: Vec<ComponentHealth>,
    pub bus_lag: HashMap<String, u64>,
    pub writer_queue_ticks: usize,
    pub writer_queue_bars: usize,
    pub ts_write_errors: u64,
    pub ts_dropped: u64,
    pub connector_reconnects: u64,
    pub connector_ticks_dropped: u64,
    pub recent_errors: Vec<ErrorRecord>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatsSnapshot {
    pub balance: Decimal,
    pub positions: Vec<Position>,
    pub orders_placed: u64,
    pub orders_rejected: u64,
    pub orders_cancelled: u64,
    pub killed: bool,
    pub daily_realized_pnl: f64,
}

/// Last known realized PnL per symbol, kept so the fill feedback loop can
/// compute the delta to report to the risk guard.
struct FeedbackState {
    last_realized_pnl: HashMap<String, Decimal>,
}

/// The engine's central shared state. One instance per running process.
pub struct Engine {
    state_version: AtomicU64,
    config: RwLock<RuntimeConfig>,
    trading_mode: RwLock<TradingMode>,
    bus: Arc<StreamBus>,
    risk: Arc<RiskGuard>,
    broker: Arc<PaperBroker>,
    router: Arc<OrderRouter>,
    writer: Arc<TimeSeriesWriter>,
    strategies: RwLock<StrategyRegistry>,
    aggregators: RwLock<HashMap<String, OhlcvAggregator>>,
    connector_stats: RwLock<Vec<Arc<ConnectorStats>>>,
    feedback: RwLock<FeedbackState>,
    recent_errors: RwLock<VecDeque<ErrorRecord>>,
    start_time: Instant,
    shutdown: CancellationToken,
}

impl Engine {
    pub fn new(
        config: RuntimeConfig,
        bus: Arc<StreamBus>,
        risk: Arc<RiskGuard>,
        broker: Arc<PaperBroker>,
        router: Arc<OrderRouter>,
        writer: Arc<TimeSeriesWriter>,
    ) -> Self {
        let trading_mode = config.trading_mode;
        Self {
            state_version: AtomicU64::new(1),
            config: RwLock::new(config),
            trading_mode: RwLock::new(trading_mode),
            bus,
            risk,
            broker,
            router,
            writer,
            strategies: RwLock::new(StrategyRegistry::new()),
            aggregators: RwLock::new(HashMap::new()),
            connector_stats: RwLock::new(Vec::new()),
            feedback: RwLock::new(FeedbackState { last_realized_pnl: HashMap::new() }),
            recent_errors: RwLock::new(VecDeque::new()),
            start_time: Instant::now(),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Begin cascading shutdown. Each task observes this via its own clone
    /// of the token at its next yield point; callers join task handles in
    /// the reverse of `START_ORDER` after calling this.
    pub fn shutdown(&self) {
        info!("control plane initiating graceful shutdown");
        self.shutdown.cancel();
    }

    pub fn register_strategy(&self, symbol: impl Into<String>, strategy: Box<dyn crate::strategy::Strategy>) {
        self.strategies.write().register(symbol, strategy);
    }

    pub fn register_aggregator(&self, key: impl Into<String>, aggregator: OhlcvAggregator) {
        self.aggregators.write().insert(key.into(), aggregator);
    }

    pub fn register_connector_stats(&self, stats: Arc<ConnectorStats>) {
        self.connector_stats.write().push(stats);
    }

    fn increment_version(&self) -> u64 {
        self.state_version.fetch_add(1, Ordering::SeqCst)
    }

    pub fn push_error(&self, message: impl Into<String>) {
        let record = ErrorRecord { message: message.into(), at: Utc::now().to_rfc3339() };
        let mut errors = self.recent_errors.write();
        errors.push_back(record);
        while errors.len() > MAX_RECENT_ERRORS {
            errors.pop_front();
        }
        self.increment_version();
    }

    pub fn trading_mode(&self) -> TradingMode {
        *self.trading_mode.read()
    }

    pub fn set_trading_mode(&self, mode: TradingMode) {
        *self.trading_mode.write() = mode;
        self.increment_version();
    }

    /// Drive one tick through the full pipeline: publish, persist, aggregate,
    /// dispatch to strategies, route resulting signals, and feed fills back
    /// into the risk guard. Pure strategy logic never performs I/O; this
    /// function is the only place that does (§5's suspension-point rule).
    #[instrument(skip(self, tick), fields(symbol = %tick.symbol, exchange = %tick.exchange))]
    pub fn ingest_tick(&self, tick: Tick) {
        if self.trading_mode() == TradingMode::Killed {
            return;
        }

        if let Err(e) = self.bus.publish(tick.clone()) {
            self.push_error(format!("bus publish failed: {e}"));
            return;
        }
        self.writer.enqueue_tick(tick.clone());

        let agg_key = format!("{}:{}", tick.exchange, tick.symbol);
        let bars = {
            let mut aggs = self.aggregators.write();
            aggs.get_mut(&agg_key).map(|a| a.on_tick(&tick)).unwrap_or_default()
        };

        let mut signals = Vec::new();
        {
            let mut strategies = self.strategies.write();
            signals.extend(strategies.dispatch_tick(&tick.symbol, &tick));
            for bar in &bars {
                self.writer.enqueue_bar(bar.clone());
                signals.extend(strategies.dispatch_bar(&tick.symbol, bar));
            }
        }

        self.broker.on_tick(&tick.symbol, tick.price);

        let all_positions = self.broker.positions();
        let position = all_positions.iter().find(|p| p.symbol == tick.symbol);
        for signal in &signals {
            self.route_and_record(signal, position);
        }

        self.reconcile_risk_and_strategies(&tick.symbol, &all_positions);
    }

    fn route_and_record(&self, signal: &Signal, position: Option<&Position>) {
        if let Some((result, fill)) = self.router.route_signal(signal, position) {
            match result {
                PlaceResult::Rejected { reason } => {
                    warn!(symbol = %signal.symbol, reason, "signal did not result in a placed order");
                }
                PlaceResult::Accepted { .. } => {
                    if let Some(fill) = fill {
                        self.notify_fill(&fill.trade.symbol, fill.trade.side, fill.trade.quantity, fill.trade.price);
                    }
                }
            }
        }
    }

    /// After routing, diff the broker's position book against what the risk
    /// guard last saw and push the delta through. The paper broker owns fill
    /// matching; this is the narrow update interface §5 requires between the
    /// two (neither the broker nor the router calls the guard directly).
    fn reconcile_risk_and_strategies(&self, symbol: &str, all_positions: &[Position]) {
        let Some(position) = all_positions.iter().find(|p| p.symbol == symbol) else {
            return;
        };

        let mut feedback = self.feedback.write();
        let previous = feedback.last_realized_pnl.get(symbol).copied().unwrap_or(Decimal::ZERO);
        let delta = position.realized_pnl - previous;
        feedback.last_realized_pnl.insert(symbol.to_string(), position.realized_pnl);
        drop(feedback);

        if delta != Decimal::ZERO {
            self.risk.record_trade_result(delta);
        }

        let gross_exposure: Decimal = all_positions.iter().map(|p| p.avg_entry_price * p.quantity).sum();
        let still_open_long = !position.is_flat() && position.side == crate::types::PositionSide::Long;
        self.risk.record_fill(symbol, still_open_long, still_open_long, gross_exposure);
    }

    pub fn notify_fill(&self, symbol: &str, side: Side, quantity: Decimal, price: Decimal) {
        use rust_decimal::prelude::ToPrimitive;
        self.strategies.write().notify_fill(
            symbol,
            side,
            quantity.to_f64().unwrap_or(0.0),
            price.to_f64().unwrap_or(0.0),
        );
    }

    pub fn health(&self) -> HealthSnapshot {
        let writer_stats = self.writer.stats();
        let (queue_ticks, queue_bars) = self.writer.queue_depth();
        let connector_stats = self.connector_stats.read();
        let connector_reconnects: u64 = connector_stats.iter().map(|s| s.reconnects.load(Ordering::Relaxed)).sum();
        let connector_ticks_dropped: u64 =
            connector_stats.iter().map(|s| s.ticks_dropped.load(Ordering::Relaxed)).sum();

        let components = START_ORDER
            .iter()
            .map(|name| ComponentHealth { name: name.to_string(), up: true, detail: None })
            .collect();

        let config = self.config.read();
        let bus_lag = config
            .symbols
            .iter()
            .map(|s| (s.clone(), self.bus.lag(s)))
            .collect();

        HealthSnapshot {
            uptime_seconds: self.start_time.elapsed().as_secs(),
            state_version: self.state_version.load(Ordering::SeqCst),
            trading_mode: self.trading_mode().to_string(),
            account_mode: self.router.mode().to_string(),
            components,
            bus_lag,
            writer_queue_ticks: queue_ticks,
            writer_queue_bars: queue_bars,
            ts_write_errors: writer_stats.write_errors,
            ts_dropped: writer_stats.ts_dropped,
            connector_reconnects,
            connector_ticks_dropped,
            recent_errors: self.recent_errors.read().iter().cloned().collect(),
        }
    }

    pub fn stats(&self) -> StatsSnapshot {
        let (placed, rejected, cancelled) = self.router.stats();
        let risk_state = self.risk.snapshot();
        StatsSnapshot {
            balance: self.broker.balance(),
            positions: self.broker.positions(),
            orders_placed: placed,
            orders_rejected: rejected,
            orders_cancelled: cancelled,
            killed: risk_state.killed,
            daily_realized_pnl: risk_state.daily_realized_pnl,
        }
    }

    pub fn switch_account_mode(&self, mode: AccountMode) -> Result<(), String> {
        self.router.switch_mode(mode)?;
        self.increment_version();
        Ok(())
    }

    pub fn reset_kill_switch(&self) {
        self.risk.reset_kill_switch();
        self.increment_version();
    }

    pub fn risk_limits(&self) -> RiskLimits {
        self.risk.limits()
    }

    pub fn update_risk_limits(&self, limits: RiskLimits) {
        self.risk.update_limits(limits);
        self.increment_version();
    }

    /// Place an order directly (outside the tick pipeline), e.g. from the
    /// control API. Goes through the same risk gate as strategy-originated
    /// orders.
    pub fn place_order(&self, order: Order) -> PlaceResult {
        let (result, fill) = self.router.place_with_fill(order);
        if let Some(fill) = &fill {
            self.notify_fill(&fill.trade.symbol, fill.trade.side, fill.trade.quantity, fill.trade.price);
        }
        self.increment_version();
        result
    }

    pub fn cancel_order(&self, order_id: Uuid) -> bool {
        let ok = self.router.cancel(order_id);
        if ok {
            self.increment_version();
        }
        ok
    }

    pub fn positions(&self) -> Vec<Position> {
        self.broker.positions()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregator::SECOND_1;
    use crate::broker::{FeeSchedule, SlippageModel};
    use crate::config::GridParams;
    use crate::strategy::grid::GridStrategy;
    use rust_decimal_macros::dec;

    fn engine() -> Engine {
        let config = RuntimeConfig::default();
        let bus = Arc::new(StreamBus::new(std::time::Duration::from_secs(30), std::time::Duration::from_secs(3600)));
        let risk = Arc::new(RiskGuard::new(dec!(10000), dec!(2), 10, dec!(20), dec!(50000), dec!(80)));
        let broker = Arc::new(PaperBroker::new(
            dec!(10000),
            FeeSchedule { maker_bps: dec!(10), taker_bps: dec!(20) },
            SlippageModel { base_bps: dec!(5), max_bps: dec!(50), assumed_book_depth: dec!(1_000_000) },
        ));
        let router = Arc::new(OrderRouter::new(broker.clone(), risk.clone()));
        let writer = Arc::new(TimeSeriesWriter::new(
            Box::new(crate::writer::InMemoryStore::default()),
            Box::new(crate::writer::InMemoryStore::default()),
            200,
            std::time::Duration::from_secs(2),
            10_000,
        ));
        Engine::new(config, bus, risk, broker, router, writer)
    }

    fn tick(price: rust_decimal::Decimal) -> Tick {
        Tick {
            exchange: "binance".into(),
            symbol: "BTCUSDT".into(),
            price,
            volume: dec!(1),
            bid: None,
            ask: None,
            source_ts_us: 0,
            ingest_ts_us: 0,
        }
    }

    #[test]
    fn health_reports_every_start_order_component() {
        let e = engine();
        let h = e.health();
        assert_eq!(h.components.len(), START_ORDER.len());
    }

    #[test]
    fn push_error_caps_at_max_recent() {
        let e = engine();
        for i in 0..(MAX_RECENT_ERRORS + 10) {
            e.push_error(format!("err {i}"));
        }
        assert_eq!(e.health().recent_errors.len(), MAX_RECENT_ERRORS);
    }

    #[test]
    fn killed_mode_drops_ticks_before_publish() {
        let e = engine();
        e.set_trading_mode(TradingMode::Killed);
        e.register_aggregator("binance:BTCUSDT", OhlcvAggregator::new("binance", "BTCUSDT", &[SECOND_1]));
        e.ingest_tick(tick(dec!(50000)));
        assert_eq!(e.bus.lag("nonexistent-group"), 0);
    }

    #[test]
    fn ingest_tick_routes_grid_signals_and_updates_risk() {
        let e = engine();
        e.register_aggregator("binance:BTCUSDT", OhlcvAggregator::new("binance", "BTCUSDT", &[SECOND_1]));
        e.register_strategy("BTCUSDT", Box::new(GridStrategy::new(GridParams::default())));

        e.ingest_tick(tick(dec!(50000)));

        let stats = e.stats();
        assert!(stats.orders_placed + stats.orders_rejected > 0, "grid strategy should have emitted at least one order attempt");
    }

    #[test]
    fn update_risk_limits_is_visible_on_read() {
        let e = engine();
        let mut limits = e.risk_limits();
        limits.position_limit = 1;
        e.update_risk_limits(limits);
        assert_eq!(e.risk_limits().position_limit, 1);
    }

    #[test]
    fn place_order_direct_goes_through_risk_gate() {
        let e = engine();
        e.broker.on_tick("BTCUSDT", dec!(50000));
        let order = crate::types::Order::pending("BTCUSDT", Side::Buy, crate::types::OrderKind::Market, dec!(0.01), None);
        let result = e.place_order(order);
        assert!(matches!(result, PlaceResult::Accepted { .. }));
    }

    #[test]
    fn shutdown_cancels_token() {
        let e = engine();
        let token = e.shutdown_token();
        assert!(!token.is_cancelled());
        e.shutdown();
        assert!(token.is_cancelled());
    }
}
