// =============================================================================
// Paper Broker (C7) — simulated matching engine with fees, slippage, and a
// position book
// =============================================================================
//
// Thread-safety: all mutable state is behind `parking_lot::RwLock`. Readers
// get cloned snapshots so the router and risk guard never block behind a
// broker write.
// =============================================================================

use std::collections::HashMap;

use chrono::Utc;
use parking_lot::RwLock;
use rust_decimal::Decimal;
use tracing::info;
use uuid::Uuid;

use crate::types::{Order, OrderKind, OrderState, Position, Side, Trade};

/// Stable rejection reason for a market order submitted before any tick has
/// established a price for its symbol (§9 Open Questions).
pub const NO_MARKET_DATA: &str = "no market data";

#[derive(Debug, Clone, Copy)]
pub struct FeeSchedule {
    pub maker_bps: Decimal,
    pub taker_bps: Decimal,
}

#[derive(Debug, Clone, Copy)]
pub struct SlippageModel {
    pub base_bps: Decimal,
    pub max_bps: Decimal,
    /// Assumed book depth (quote currency) used to scale order-impact.
    pub assumed_book_depth: Decimal,
}

impl SlippageModel {
    fn slippage_bps(&self, notional: Decimal) -> Decimal {
        if self.assumed_book_depth <= Decimal::ZERO {
            return self.base_bps;
        }
        let order_impact = notional / self.assumed_book_depth;
        let impact_bps = (order_impact * Decimal::from(10_000)).clamp(Decimal::ZERO, self.max_bps);
        (self.base_bps + impact_bps).min(self.max_bps + self.base_bps)
    }
}

struct RestingOrder {
    order: Order,
}

/// A fill record plus the order it belongs to, for the router/writer to
/// persist.
pub struct FillEvent {
    pub order: Order,
    pub trade: Trade,
}

struct Inner {
    balance: Decimal,
    positions: HashMap<String, Position>,
    /// Resting limit orders keyed by order id, per symbol.
    open_orders: HashMap<String, Vec<RestingOrder>>,
    last_price: HashMap<String, Decimal>,
    stats_fills: u64,
}

/// Simulated exchange: accepts orders, matches limit orders against tick
/// updates, fills market orders immediately with a slippage model (§4.7).
pub struct PaperBroker {
    fees: FeeSchedule,
    slippage: SlippageModel,
    inner: RwLock<Inner>,
}

impl PaperBroker {
    pub fn new(initial_balance: Decimal, fees: FeeSchedule, slippage: SlippageModel) -> Self {
        Self {
            fees,
            slippage,
            inner: RwLock::new(Inner {
                balance: initial_balance,
                positions: HashMap::new(),
                open_orders: HashMap::new(),
                last_price: HashMap::new(),
                stats_fills: 0,
            }),
        }
    }

    /// Submit an order. Market orders fill immediately against the last known
    /// price; limit orders rest until a tick makes them eligible.
    pub fn submit(&self, mut order: Order) -> (Order, Option<FillEvent>) {
        let mut inner = self.inner.write();
        let last_price = inner.last_price.get(&order.symbol).copied();

        match order.kind {
            OrderKind::Market => {
                let Some(market) = last_price else {
                    order.state = OrderState::Rejected;
                    return (order, None);
                };
                let fill = Self::fill_market(&mut inner, &self.fees, &self.slippage, &mut order, market);
                (order, fill)
            }
            OrderKind::Limit => {
                order.state = OrderState::Open;
                let eligible = order.limit_price.is_some_and(|limit| {
                    last_price.is_some_and(|market| Self::limit_eligible(order.side, market, limit))
                });
                if eligible {
                    let market = last_price.unwrap();
                    let limit = order.limit_price.unwrap();
                    let fill = Self::fill_limit(&mut inner, &self.fees, &mut order, limit, market);
                    (order, fill)
                } else {
                    inner
                        .open_orders
                        .entry(order.symbol.clone())
                        .or_default()
                        .push(RestingOrder { order: order.clone() });
                    (order, None)
                }
            }
            OrderKind::Stop | OrderKind::StopLimit => {
                order.state = OrderState::Open;
                inner
                    .open_orders
                    .entry(order.symbol.clone())
                    .or_default()
                    .push(RestingOrder { order: order.clone() });
                (order, None)
            }
        }
    }

    pub fn cancel(&self, order_id: Uuid) -> bool {
        let mut inner = self.inner.write();
        for resting in inner.open_orders.values_mut() {
            if let Some(pos) = resting.iter().position(|r| r.order.id == order_id) {
                if !resting[pos].order.state.is_terminal() {
                    let mut removed = resting.remove(pos).order;
                    removed.state = OrderState::Cancelled;
                    removed.updated_at = Utc::now();
                    return true;
                }
            }
        }
        false
    }

    /// Feed one market tick: reprices positions and walks the resting book
    /// for the symbol, filling any orders that have become eligible.
    pub fn on_tick(&self, symbol: &str, price: Decimal) -> Vec<FillEvent> {
        let mut inner = self.inner.write();
        inner.last_price.insert(symbol.to_string(), price);

        if let Some(pos) = inner.positions.get_mut(symbol) {
            pos.mark_to_market(price);
        }

        let Some(resting) = inner.open_orders.remove(symbol) else {
            return Vec::new();
        };

        let mut still_open = Vec::new();
        let mut fills = Vec::new();
        for mut r in resting {
            let eligible = r
                .order
                .limit_price
                .is_some_and(|limit| Self::limit_eligible(r.order.side, price, limit));
            if eligible {
                let limit = r.order.limit_price.unwrap();
                if let Some(fill) = Self::fill_limit(&mut inner, &self.fees, &mut r.order, limit, price) {
                    fills.push(fill);
                }
            } else {
                still_open.push(r);
            }
        }
        if !still_open.is_empty() {
            inner.open_orders.insert(symbol.to_string(), still_open);
        }
        fills
    }

    pub fn positions(&self) -> Vec<Position> {
        self.inner.read().positions.values().cloned().collect()
    }

    /// The last tick price seen for `symbol`, or `None` before the first
    /// tick arrives. Used by the router to notional-gate market orders,
    /// which carry no `limit_price` of their own.
    pub fn last_price(&self, symbol: &str) -> Option<Decimal> {
        self.inner.read().last_price.get(symbol).copied()
    }

    pub fn balance(&self) -> Decimal {
        self.inner.read().balance
    }

    pub fn fill_count(&self) -> u64 {
        self.inner.read().stats_fills
    }

    fn limit_eligible(side: Side, market_price: Decimal, limit_price: Decimal) -> bool {
        match side {
            Side::Buy => market_price <= limit_price,
            Side::Sell => market_price >= limit_price,
        }
    }

    fn fill_market(
        inner: &mut Inner,
        fees: &FeeSchedule,
        slippage: &SlippageModel,
        order: &mut Order,
        market_price: Decimal,
    ) -> Option<FillEvent> {
        let notional = market_price * order.quantity;
        let slip_bps = slippage.slippage_bps(notional);
        let fill_price = match order.side {
            Side::Buy => market_price * (Decimal::ONE + slip_bps / Decimal::from(10_000)),
            Side::Sell => market_price * (Decimal::ONE - slip_bps / Decimal::from(10_000)),
        };
        Self::apply_fill(inner, fees.taker_bps, order, fill_price, order.quantity)
    }

    fn fill_limit(
        inner: &mut Inner,
        fees: &FeeSchedule,
        order: &mut Order,
        limit_price: Decimal,
        _market_price: Decimal,
    ) -> Option<FillEvent> {
        Self::apply_fill(inner, fees.maker_bps, order, limit_price, order.quantity)
    }

    /// All-or-nothing fill: this implementation does not model order book
    /// depth, so partial fills never occur (§4.7).
    fn apply_fill(
        inner: &mut Inner,
        fee_bps: Decimal,
        order: &mut Order,
        fill_price: Decimal,
        fill_qty: Decimal,
    ) -> Option<FillEvent> {
        if fill_qty <= Decimal::ZERO {
            return None;
        }
        let notional = fill_price * fill_qty;
        let fee = notional * fee_bps / Decimal::from(10_000);

        match order.side {
            Side::Buy => inner.balance -= notional + fee,
            Side::Sell => inner.balance += notional - fee,
        }

        let position = inner
            .positions
            .entry(order.symbol.clone())
            .or_insert_with(|| Position::flat(order.symbol.clone()));
        position.apply_fill(order.side, fill_qty, fill_price, fee);

        order.filled_qty += fill_qty;
        order.avg_fill_price = fill_price;
        order.fees_paid += fee;
        order.state = OrderState::Filled;
        order.updated_at = Utc::now();
        inner.stats_fills += 1;

        let trade = Trade {
            id: Uuid::new_v4(),
            order_id: order.id,
            symbol: order.symbol.clone(),
            side: order.side,
            quantity: fill_qty,
            price: fill_price,
            fees: fee,
            timestamp: order.updated_at,
        };

        info!(
            order_id = %order.id,
            symbol = %order.symbol,
            side = ?order.side,
            fill_price = %fill_price,
            fill_qty = %fill_qty,
            fee = %fee,
            "paper order filled"
        );

        Some(FillEvent { order: order.clone(), trade })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn broker() -> PaperBroker {
        PaperBroker::new(
            dec!(10000),
            FeeSchedule { maker_bps: dec!(10), taker_bps: dec!(20) },
            SlippageModel { base_bps: dec!(5), max_bps: dec!(50), assumed_book_depth: dec!(1000000) },
        )
    }

    #[test]
    fn market_order_rejected_without_prior_tick() {
        let b = broker();
        let order = Order::pending("BTCUSDT", Side::Buy, OrderKind::Market, dec!(0.1), None);
        let (order, fill) = b.submit(order);
        assert_eq!(order.state, OrderState::Rejected);
        assert!(fill.is_none());
    }

    #[test]
    fn market_order_fills_with_slippage_and_taker_fee() {
        let b = broker();
        b.on_tick("BTCUSDT", dec!(50000));
        let order = Order::pending("BTCUSDT", Side::Buy, OrderKind::Market, dec!(0.1), None);
        let (order, fill) = b.submit(order);
        assert_eq!(order.state, OrderState::Filled);
        let fill = fill.unwrap();
        assert!(fill.trade.price > dec!(50000)); // buy slips up
        assert!(fill.trade.fees > Decimal::ZERO);
    }

    #[test]
    fn limit_order_rests_until_eligible() {
        let b = broker();
        b.on_tick("BTCUSDT", dec!(50000));
        let order = Order::pending("BTCUSDT", Side::Buy, OrderKind::Limit, dec!(0.1), Some(dec!(49000)));
        let (order, fill) = b.submit(order);
        assert_eq!(order.state, OrderState::Open);
        assert!(fill.is_none());

        let fills = b.on_tick("BTCUSDT", dec!(48900));
        assert_eq!(fills.len(), 1);
        assert_eq!(fills[0].trade.price, dec!(49000)); // fills at limit price
    }

    #[test]
    fn opposite_fill_realizes_pnl_scenario_4() {
        let b = broker();
        b.on_tick("BTCUSDT", dec!(50000));
        let buy = Order::pending("BTCUSDT", Side::Buy, OrderKind::Market, dec!(1.0), None);
        b.submit(buy);

        b.on_tick("BTCUSDT", dec!(51000));
        let sell = Order::pending("BTCUSDT", Side::Sell, OrderKind::Limit, dec!(0.5), Some(dec!(51000)));
        let (_, fill) = b.submit(sell);
        assert!(fill.is_some());

        let positions = b.positions();
        let pos = positions.iter().find(|p| p.symbol == "BTCUSDT").unwrap();
        assert_eq!(pos.quantity, dec!(0.5));
        assert!(pos.realized_pnl > Decimal::ZERO);
    }

    #[test]
    fn last_price_reflects_most_recent_tick() {
        let b = broker();
        assert_eq!(b.last_price("BTCUSDT"), None);
        b.on_tick("BTCUSDT", dec!(50000));
        assert_eq!(b.last_price("BTCUSDT"), Some(dec!(50000)));
    }

    #[test]
    fn cancel_removes_resting_limit_order() {
        let b = broker();
        b.on_tick("BTCUSDT", dec!(50000));
        let order = Order::pending("BTCUSDT", Side::Buy, OrderKind::Limit, dec!(0.1), Some(dec!(40000)));
        let (order, _) = b.submit(order);
        assert!(b.cancel(order.id));
        assert!(!b.cancel(order.id)); // already removed
    }
}
