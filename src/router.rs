// =============================================================================
// Order Router (C6) — risk-gates Signals/Orders and dispatches to the paper
// broker or a live adapter
// =============================================================================

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use crate::broker::{FillEvent, PaperBroker, NO_MARKET_DATA};
use crate::risk::{OrderIntent, RiskGuard};
use crate::types::{AccountMode, Order, OrderKind, OrderState, Position, Side, Signal, SignalKind};

/// Rejection reason for an order that fails the zero-quantity invariant
/// before it ever reaches the risk guard or the broker.
pub const ZERO_QUANTITY: &str = "order quantity must be positive";

/// How long a `Signal.id` is remembered for replay dedup.
const SIGNAL_DEDUP_WINDOW: Duration = Duration::from_secs(5);

/// Outcome of a `place` call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum PlaceResult {
    Accepted { order_id: Uuid },
    Rejected { reason: String },
}

impl std::fmt::Display for PlaceResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Accepted { order_id } => write!(f, "accepted({order_id})"),
            Self::Rejected { reason } => write!(f, "rejected({reason})"),
        }
    }
}

/// A live execution backend. No concrete adapter ships in this build;
/// `switch_mode(Live)` always rejects (§4.6).
pub trait LiveAdapter: Send + Sync {
    fn place(&self, order: &Order) -> Result<(), String>;
    fn cancel(&self, order_id: Uuid) -> Result<(), String>;
}

pub struct RouterStats {
    pub orders_placed: u64,
    pub orders_rejected: u64,
    pub orders_cancelled: u64,
}

struct Inner {
    mode: AccountMode,
    stats: RouterStats,
    recent_signal_ids: VecDeque<(Uuid, Instant)>,
}

/// Accepts Signals/Orders, enforces risk, dispatches to the paper broker or a
/// live adapter, and tracks open-order state.
pub struct OrderRouter {
    broker: Arc<PaperBroker>,
    risk: Arc<RiskGuard>,
    live: Option<Arc<dyn LiveAdapter>>,
    inner: parking_lot::RwLock<Inner>,
}

impl OrderRouter {
    pub fn new(broker: Arc<PaperBroker>, risk: Arc<RiskGuard>) -> Self {
        Self {
            broker,
            risk,
            live: None,
            inner: parking_lot::RwLock::new(Inner {
                mode: AccountMode::Paper,
                stats: RouterStats { orders_placed: 0, orders_rejected: 0, orders_cancelled: 0 },
                recent_signal_ids: VecDeque::new(),
            }),
        }
    }

    pub fn mode(&self) -> AccountMode {
        self.inner.read().mode
    }

    /// Atomic mode transition. Live is never configured in this build, so it
    /// always rejects (§4.6's "Live adapter" note).
    pub fn switch_mode(&self, mode: AccountMode) -> Result<(), String> {
        if mode == AccountMode::Live && self.live.is_none() {
            return Err("live trading not configured".to_string());
        }
        self.inner.write().mode = mode;
        Ok(())
    }

    pub fn place(&self, order: Order) -> PlaceResult {
        self.place_with_fill(order).0
    }

    /// Same contract as [`place`](Self::place), but also surfaces the fill
    /// produced by an immediately-executed paper order so callers (the
    /// per-tick pipeline) can forward it to `Strategy::on_fill`.
    pub fn place_with_fill(&self, order: Order) -> (PlaceResult, Option<FillEvent>) {
        if order.quantity <= Decimal::ZERO {
            let mut inner = self.inner.write();
            inner.stats.orders_rejected += 1;
            warn!(symbol = %order.symbol, "order rejected: zero or negative quantity");
            return (PlaceResult::Rejected { reason: ZERO_QUANTITY.to_string() }, None);
        }

        // Market orders carry no limit_price of their own; notional-gate them
        // against the broker's last known mark instead of treating them as
        // free (§4.8 checks 4-6 would otherwise never fire for a Market
        // order).
        let reference_price = order.limit_price.or_else(|| self.broker.last_price(&order.symbol));
        let notional = reference_price.unwrap_or(Decimal::ZERO) * order.quantity;
        let intent = OrderIntent {
            symbol: &order.symbol,
            is_buy: order.side == Side::Buy,
            notional,
        };

        if let Err(reason) = self.risk.check(&intent) {
            let mut inner = self.inner.write();
            inner.stats.orders_rejected += 1;
            warn!(symbol = %order.symbol, reason, "order rejected by risk guard");
            return (PlaceResult::Rejected { reason: reason.to_string() }, None);
        }

        let mode = self.mode();
        let (result, fill) = match mode {
            AccountMode::Paper => {
                let (placed, fill) = self.broker.submit(order.clone());
                info!(order_id = %placed.id, symbol = %placed.symbol, state = ?placed.state, "order submitted to paper broker");
                match placed.state {
                    OrderState::Rejected => (PlaceResult::Rejected { reason: NO_MARKET_DATA.to_string() }, None),
                    _ => (PlaceResult::Accepted { order_id: placed.id }, fill),
                }
            }
            AccountMode::Live => match &self.live {
                Some(adapter) => match adapter.place(&order) {
                    Ok(()) => (PlaceResult::Accepted { order_id: order.id }, None),
                    Err(reason) => (PlaceResult::Rejected { reason }, None),
                },
                None => (PlaceResult::Rejected { reason: "live trading not configured".to_string() }, None),
            },
        };

        let mut inner = self.inner.write();
        match &result {
            PlaceResult::Accepted { .. } => inner.stats.orders_placed += 1,
            PlaceResult::Rejected { .. } => inner.stats.orders_rejected += 1,
        }
        (result, fill)
    }

    /// `true` if `id` was placed within the dedup window (and records it for
    /// future checks); `false` the first time it is seen. Prunes entries
    /// older than the window on every call so the buffer stays bounded.
    fn seen_recently(&self, id: Uuid) -> bool {
        let now = Instant::now();
        let mut inner = self.inner.write();
        while let Some(&(_, seen_at)) = inner.recent_signal_ids.front() {
            if now.duration_since(seen_at) > SIGNAL_DEDUP_WINDOW {
                inner.recent_signal_ids.pop_front();
            } else {
                break;
            }
        }
        if inner.recent_signal_ids.iter().any(|&(seen_id, _)| seen_id == id) {
            return true;
        }
        inner.recent_signal_ids.push_back((id, now));
        false
    }

    pub fn cancel(&self, order_id: Uuid) -> bool {
        let ok = match self.mode() {
            AccountMode::Paper => self.broker.cancel(order_id),
            AccountMode::Live => self.live.as_ref().is_some_and(|a| a.cancel(order_id).is_ok()),
        };
        if ok {
            self.inner.write().stats.orders_cancelled += 1;
        }
        ok
    }

    pub fn positions(&self) -> Vec<Position> {
        self.broker.positions()
    }

    pub fn stats(&self) -> (u64, u64, u64) {
        let s = &self.inner.read().stats;
        (s.orders_placed, s.orders_rejected, s.orders_cancelled)
    }

    /// Translate a Signal into an Order and place it, per §4.6's
    /// signal-to-order translation rules. `current_position` is supplied by
    /// the caller for close sizing.
    pub fn route_signal(
        &self,
        signal: &Signal,
        current_position: Option<&Position>,
    ) -> Option<(PlaceResult, Option<FillEvent>)> {
        if !matches!(signal.kind, SignalKind::Hold) && self.seen_recently(signal.id) {
            warn!(signal_id = %signal.id, symbol = %signal.symbol, "duplicate signal within dedup window, dropped");
            return None;
        }

        match signal.kind {
            SignalKind::Hold => None,
            SignalKind::Cancel => {
                let order_id = signal
                    .metadata
                    .get("order_id")
                    .and_then(|v| v.as_str())
                    .and_then(|s| Uuid::parse_str(s).ok())?;
                self.cancel(order_id);
                None
            }
            SignalKind::Buy | SignalKind::Sell => {
                let side = if signal.kind == SignalKind::Buy { Side::Buy } else { Side::Sell };
                let kind = if signal.price.is_some() { OrderKind::Limit } else { OrderKind::Market };
                let mut order = Order::pending(signal.symbol.clone(), side, kind, signal.quantity, signal.price);
                order.strategy_tag = Some(signal.strategy_name.clone());
                Some(self.place_with_fill(order))
            }
            SignalKind::Close => {
                let position = current_position?;
                if position.is_flat() {
                    return None;
                }
                let side = match position.side {
                    crate::types::PositionSide::Long => Side::Sell,
                    crate::types::PositionSide::Short => Side::Buy,
                    crate::types::PositionSide::Flat => return None,
                };
                let quantity = if signal.quantity > Decimal::ZERO {
                    signal.quantity.min(position.quantity)
                } else {
                    position.quantity
                };
                let mut order = Order::pending(signal.symbol.clone(), side, OrderKind::Market, quantity, None);
                order.strategy_tag = Some(signal.strategy_name.clone());
                Some(self.place_with_fill(order))
            }
        }
    }
}
