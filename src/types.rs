// =============================================================================
// Shared data model for the Sentinel trading core
// =============================================================================

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Whether the engine is actively trading, paused, or killed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TradingMode {
    Live,
    Paused,
    Killed,
}

impl Default for TradingMode {
    fn default() -> Self {
        Self::Paused
    }
}

impl std::fmt::Display for TradingMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Live => write!(f, "Live"),
            Self::Paused => write!(f, "Paused"),
            Self::Killed => write!(f, "Killed"),
        }
    }
}

/// Whether the router dispatches to the paper broker or a live adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AccountMode {
    Paper,
    Live,
}

impl Default for AccountMode {
    fn default() -> Self {
        Self::Paper
    }
}

impl std::fmt::Display for AccountMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Paper => write!(f, "Paper"),
            Self::Live => write!(f, "Live"),
        }
    }
}

/// An immutable normalized market-data observation from one exchange.
///
/// Source timestamps are monotone non-decreasing per (exchange, symbol)
/// within a single connector session; gaps are permitted across reconnects.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tick {
    pub exchange: String,
    pub symbol: String,
    pub price: Decimal,
    pub volume: Decimal,
    pub bid: Option<Decimal>,
    pub ask: Option<Decimal>,
    pub source_ts_us: i64,
    pub ingest_ts_us: i64,
}

impl Tick {
    pub fn mid(&self) -> Decimal {
        match (self.bid, self.ask) {
            (Some(bid), Some(ask)) => (bid + ask) / Decimal::from(2),
            _ => self.price,
        }
    }
}

/// A closed or in-progress OHLCV bar for one (exchange, symbol, timeframe).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bar {
    pub exchange: String,
    pub symbol: String,
    pub timeframe: String,
    pub start_ts_us: i64,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub volume: Decimal,
    pub count: u64,
    pub vwap: Decimal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn opposite(self) -> Side {
        match self {
            Side::Buy => Side::Sell,
            Side::Sell => Side::Buy,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderKind {
    Market,
    Limit,
    Stop,
    StopLimit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderState {
    Pending,
    Open,
    PartiallyFilled,
    Filled,
    Cancelled,
    Rejected,
}

impl OrderState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Filled | Self::Cancelled | Self::Rejected)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    pub id: Uuid,
    pub symbol: String,
    pub side: Side,
    pub kind: OrderKind,
    pub quantity: Decimal,
    pub limit_price: Option<Decimal>,
    pub stop_price: Option<Decimal>,
    pub state: OrderState,
    pub filled_qty: Decimal,
    pub avg_fill_price: Decimal,
    pub fees_paid: Decimal,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub client_id: Option<String>,
    pub strategy_tag: Option<String>,
}

impl Order {
    /// A new order, not yet gated by risk or routed anywhere.
    pub fn pending(
        symbol: impl Into<String>,
        side: Side,
        kind: OrderKind,
        quantity: Decimal,
        limit_price: Option<Decimal>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            symbol: symbol.into(),
            side,
            kind,
            quantity,
            limit_price,
            stop_price: None,
            state: OrderState::Pending,
            filled_qty: Decimal::ZERO,
            avg_fill_price: Decimal::ZERO,
            fees_paid: Decimal::ZERO,
            created_at: now,
            updated_at: now,
            client_id: None,
            strategy_tag: None,
        }
    }

    pub fn remaining(&self) -> Decimal {
        self.quantity - self.filled_qty
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PositionSide {
    Long,
    Short,
    Flat,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub symbol: String,
    pub side: PositionSide,
    pub quantity: Decimal,
    pub avg_entry_price: Decimal,
    pub realized_pnl: Decimal,
    pub unrealized_pnl: Decimal,
    pub fees_paid: Decimal,
    pub opened_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Position {
    pub fn flat(symbol: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            symbol: symbol.into(),
            side: PositionSide::Flat,
            quantity: Decimal::ZERO,
            avg_entry_price: Decimal::ZERO,
            realized_pnl: Decimal::ZERO,
            unrealized_pnl: Decimal::ZERO,
            fees_paid: Decimal::ZERO,
            opened_at: now,
            updated_at: now,
        }
    }

    pub fn is_flat(&self) -> bool {
        self.side == PositionSide::Flat
    }

    /// Signed quantity: positive when long, negative when short.
    pub fn signed_quantity(&self) -> Decimal {
        match self.side {
            PositionSide::Long => self.quantity,
            PositionSide::Short => -self.quantity,
            PositionSide::Flat => Decimal::ZERO,
        }
    }

    pub fn mark_to_market(&mut self, mark: Decimal) {
        if self.is_flat() {
            self.unrealized_pnl = Decimal::ZERO;
            return;
        }
        let diff = mark - self.avg_entry_price;
        self.unrealized_pnl = match self.side {
            PositionSide::Long => diff * self.quantity,
            PositionSide::Short => -diff * self.quantity,
            PositionSide::Flat => Decimal::ZERO,
        };
        self.updated_at = Utc::now();
    }

    /// Apply a fill of `side`/`quantity` at `price`, realizing PnL against the
    /// average entry price on opposite-side fills and reopening on the
    /// opposite side when the fill crosses through flat.
    pub fn apply_fill(&mut self, side: Side, quantity: Decimal, price: Decimal, fee: Decimal) {
        self.fees_paid += fee;
        self.updated_at = Utc::now();

        let fill_signed = match side {
            Side::Buy => quantity,
            Side::Sell => -quantity,
        };
        let current_signed = self.signed_quantity();
        let new_signed = current_signed + fill_signed;

        let same_direction = current_signed == Decimal::ZERO
            || (current_signed > Decimal::ZERO) == (fill_signed > Decimal::ZERO);

        if same_direction {
            // Extend or open: weighted-mean average entry price.
            let total_qty = current_signed.abs() + quantity;
            if total_qty > Decimal::ZERO {
                self.avg_entry_price = if current_signed == Decimal::ZERO {
                    price
                } else {
                    (self.avg_entry_price * current_signed.abs() + price * quantity) / total_qty
                };
            }
        } else {
            // Opposite-side fill: realize PnL on the covered portion.
            let covered = quantity.min(current_signed.abs());
            let pnl_per_unit = match self.side {
                PositionSide::Long => price - self.avg_entry_price,
                PositionSide::Short => self.avg_entry_price - price,
                PositionSide::Flat => Decimal::ZERO,
            };
            self.realized_pnl += pnl_per_unit * covered;

            if quantity > current_signed.abs() {
                // Position flips sign: remainder reopens at the fill price.
                let remainder = quantity - current_signed.abs();
                self.avg_entry_price = price;
                self.quantity = remainder;
                self.side = if new_signed > Decimal::ZERO {
                    PositionSide::Long
                } else {
                    PositionSide::Short
                };
                self.mark_to_market(price);
                return;
            }
        }

        self.quantity = new_signed.abs();
        self.side = if new_signed > Decimal::ZERO {
            PositionSide::Long
        } else if new_signed < Decimal::ZERO {
            PositionSide::Short
        } else {
            PositionSide::Flat
        };
        self.mark_to_market(price);
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trade {
    pub id: Uuid,
    pub order_id: Uuid,
    pub symbol: String,
    pub side: Side,
    pub quantity: Decimal,
    pub price: Decimal,
    pub fees: Decimal,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SignalKind {
    Buy,
    Sell,
    Hold,
    Cancel,
    Close,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Signal {
    pub id: Uuid,
    pub symbol: String,
    pub kind: SignalKind,
    pub quantity: Decimal,
    pub price: Option<Decimal>,
    pub strength: f64,
    pub reason: String,
    pub metadata: serde_json::Value,
    pub strategy_name: String,
    pub params_digest: String,
    pub created_at: DateTime<Utc>,
}

impl Signal {
    pub fn new(
        symbol: impl Into<String>,
        kind: SignalKind,
        quantity: Decimal,
        price: Option<Decimal>,
        strength: f64,
        reason: impl Into<String>,
        strategy_name: impl Into<String>,
        params_digest: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            symbol: symbol.into(),
            kind,
            quantity,
            price,
            strength: strength.clamp(0.0, 1.0),
            reason: reason.into(),
            metadata: serde_json::Value::Null,
            strategy_name: strategy_name.into(),
            params_digest: params_digest.into(),
            created_at: Utc::now(),
        }
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn position_opens_long_on_first_buy() {
        let mut p = Position::flat("BTCUSDT");
        p.apply_fill(Side::Buy, dec!(1.0), dec!(50000), dec!(5));
        assert_eq!(p.side, PositionSide::Long);
        assert_eq!(p.quantity, dec!(1.0));
        assert_eq!(p.avg_entry_price, dec!(50000));
        assert_eq!(p.fees_paid, dec!(5));
    }

    #[test]
    fn position_weighted_average_on_same_side_add() {
        let mut p = Position::flat("BTCUSDT");
        p.apply_fill(Side::Buy, dec!(1.0), dec!(50000), dec!(0));
        p.apply_fill(Side::Buy, dec!(1.0), dec!(52000), dec!(0));
        assert_eq!(p.quantity, dec!(2.0));
        assert_eq!(p.avg_entry_price, dec!(51000));
    }

    #[test]
    fn position_partial_close_realizes_pnl() {
        // Scenario 4: buy 1.0 at 50000, sell 0.5 at 51000.
        let mut p = Position::flat("BTCUSDT");
        p.apply_fill(Side::Buy, dec!(1.0), dec!(50000), dec!(0));
        p.apply_fill(Side::Sell, dec!(0.5), dec!(51000), dec!(0));
        assert_eq!(p.realized_pnl, dec!(500));
        assert_eq!(p.quantity, dec!(0.5));
        assert_eq!(p.avg_entry_price, dec!(50000));
        assert_eq!(p.side, PositionSide::Long);
    }

    #[test]
    fn position_flips_side_on_oversized_opposite_fill() {
        let mut p = Position::flat("BTCUSDT");
        p.apply_fill(Side::Buy, dec!(1.0), dec!(50000), dec!(0));
        p.apply_fill(Side::Sell, dec!(1.5), dec!(49000), dec!(0));
        // realized pnl on the covered 1.0: (49000-50000)*1.0 = -1000
        assert_eq!(p.realized_pnl, dec!(-1000));
        assert_eq!(p.side, PositionSide::Short);
        assert_eq!(p.quantity, dec!(0.5));
        assert_eq!(p.avg_entry_price, dec!(49000));
    }

    #[test]
    fn position_flat_iff_zero_quantity() {
        let mut p = Position::flat("ETHUSDT");
        assert!(p.is_flat());
        p.apply_fill(Side::Buy, dec!(1.0), dec!(2000), dec!(0));
        assert!(!p.is_flat());
        p.apply_fill(Side::Sell, dec!(1.0), dec!(2000), dec!(0));
        assert!(p.is_flat());
    }

    #[test]
    fn tick_mid_prefers_bid_ask_midpoint() {
        let t = Tick {
            exchange: "binance".into(),
            symbol: "BTCUSDT".into(),
            price: dec!(100),
            volume: dec!(1),
            bid: Some(dec!(99)),
            ask: Some(dec!(101)),
            source_ts_us: 0,
            ingest_ts_us: 0,
        };
        assert_eq!(t.mid(), dec!(100));
    }

    #[test]
    fn tick_mid_falls_back_to_price_without_quotes() {
        let t = Tick {
            exchange: "binance".into(),
            symbol: "BTCUSDT".into(),
            price: dec!(100),
            volume: dec!(1),
            bid: None,
            ask: None,
            source_ts_us: 0,
            ingest_ts_us: 0,
        };
        assert_eq!(t.mid(), dec!(100));
    }

    #[test]
    fn order_remaining_quantity() {
        let mut o = Order::pending("BTCUSDT", Side::Buy, OrderKind::Market, dec!(1.0), None);
        o.filled_qty = dec!(0.4);
        assert_eq!(o.remaining(), dec!(0.6));
    }
}
