// =============================================================================
// Risk Guard (C8) — ordered pre-trade checks plus a process-wide kill switch
// =============================================================================
//
// Checks run in a fixed order and the first failure short-circuits the rest:
//   1. Kill switch active
//   2. Daily loss breach (also activates the kill switch)
//   3. Position count (distinct open long symbols)
//   4. Per-order notional cap (pct of equity)
//   5. Absolute notional cap
//   6. Total exposure
//
// Counters update on fill, not on place, via `record_fill`/`record_trade_result`.
// Daily PnL resets automatically at UTC midnight.
// =============================================================================

use std::collections::HashSet;

use chrono::Utc;
use parking_lot::RwLock;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

/// The stable, user-visible rejection reasons. Exact wording is part of the
/// contract: tests and UI both match on these strings.
pub mod reasons {
    pub const KILL_SWITCH: &str = "kill switch active";
    pub const DAILY_LOSS: &str = "daily loss limit exceeded";
    pub const POSITION_LIMIT: &str = "position limit exceeded";
    pub const MAX_POSITION_SIZE: &str = "order exceeds max position size";
    pub const NOTIONAL_CAP: &str = "order exceeds notional cap";
    pub const TOTAL_EXPOSURE: &str = "total exposure limit exceeded";
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskState {
    pub killed: bool,
    pub daily_realized_pnl: f64,
    pub account_equity: f64,
    pub gross_exposure: f64,
    pub open_long_symbols: usize,
    pub current_date: String,
}

struct Inner {
    killed: bool,
    daily_realized_pnl: Decimal,
    gross_exposure: Decimal,
    open_long_symbols: HashSet<String>,
    current_date: String,
}

/// A would-be order, described in the minimal terms the guard needs.
pub struct OrderIntent<'a> {
    pub symbol: &'a str,
    pub is_buy: bool,
    pub notional: Decimal,
}

/// The tunable half of the guard's configuration. Held separately from
/// `Inner` so a limits update (control-plane `POST /risk/limits`) never
/// contends with the hot fill-recording path.
#[derive(Debug, Clone, Copy)]
pub struct RiskLimits {
    pub daily_loss_limit_pct: Decimal,
    pub position_limit: u32,
    pub max_position_size_pct: Decimal,
    pub notional_cap: Decimal,
    pub total_exposure_pct: Decimal,
}

pub struct RiskGuard {
    state: RwLock<Inner>,
    account_equity: Decimal,
    limits: RwLock<RiskLimits>,
}

impl RiskGuard {
    pub fn new(
        account_equity: Decimal,
        daily_loss_limit_pct: Decimal,
        position_limit: u32,
        max_position_size_pct: Decimal,
        notional_cap: Decimal,
        total_exposure_pct: Decimal,
    ) -> Self {
        let today = Utc::now().format("%Y-%m-%d").to_string();
        info!(
            %account_equity,
            %daily_loss_limit_pct,
            position_limit,
            "risk guard initialised"
        );
        Self {
            state: RwLock::new(Inner {
                killed: false,
                daily_realized_pnl: Decimal::ZERO,
                gross_exposure: Decimal::ZERO,
                open_long_symbols: HashSet::new(),
                current_date: today,
            }),
            account_equity,
            limits: RwLock::new(RiskLimits {
                daily_loss_limit_pct,
                position_limit,
                max_position_size_pct,
                notional_cap,
                total_exposure_pct,
            }),
        }
    }

    /// Apply a control-plane limits update. Fields left at their current
    /// value are passed back unchanged by the caller (no partial-update
    /// semantics at this layer).
    pub fn update_limits(&self, limits: RiskLimits) {
        info!(?limits, "risk limits updated");
        *self.limits.write() = limits;
    }

    pub fn limits(&self) -> RiskLimits {
        *self.limits.read()
    }

    /// Run the ordered check list against `order`. Returns `Ok(())` if the
    /// order passes every check, or `Err(reason)` on the first failure.
    pub fn check(&self, order: &OrderIntent) -> Result<(), &'static str> {
        self.maybe_reset_daily();
        let limits = *self.limits.read();
        let mut s = self.state.write();

        // 1. Kill switch.
        if s.killed {
            return Err(reasons::KILL_SWITCH);
        }

        // 2. Daily loss breach.
        let loss_limit = -limits.daily_loss_limit_pct / Decimal::from(100) * self.account_equity;
        if s.daily_realized_pnl < loss_limit {
            s.killed = true;
            warn!(daily_pnl = %s.daily_realized_pnl, "daily loss limit breached — kill switch activated");
            return Err(reasons::DAILY_LOSS);
        }

        // 3. Position count (only a new long on a symbol not already open counts).
        if order.is_buy
            && !s.open_long_symbols.contains(order.symbol)
            && s.open_long_symbols.len() as u32 >= limits.position_limit
        {
            return Err(reasons::POSITION_LIMIT);
        }

        // 4. Per-order notional cap.
        let max_order_notional = limits.max_position_size_pct / Decimal::from(100) * self.account_equity;
        if order.notional > max_order_notional {
            return Err(reasons::MAX_POSITION_SIZE);
        }

        // 5. Absolute notional cap.
        if order.notional > limits.notional_cap {
            return Err(reasons::NOTIONAL_CAP);
        }

        // 6. Total exposure.
        let max_exposure = limits.total_exposure_pct / Decimal::from(100) * self.account_equity;
        if s.gross_exposure + order.notional > max_exposure {
            return Err(reasons::TOTAL_EXPOSURE);
        }

        Ok(())
    }

    /// Update counters on a fill. Called by the paper broker (or live
    /// adapter) after execution, never on mere placement.
    pub fn record_fill(&self, symbol: &str, is_buy: bool, still_open_long: bool, gross_exposure: Decimal) {
        self.maybe_reset_daily();
        let mut s = self.state.write();
        if is_buy && still_open_long {
            s.open_long_symbols.insert(symbol.to_string());
        } else if !still_open_long {
            s.open_long_symbols.remove(symbol);
        }
        s.gross_exposure = gross_exposure;
    }

    /// Record the realized PnL of a closed trade against the daily counter.
    pub fn record_trade_result(&self, realized_pnl: Decimal) {
        self.maybe_reset_daily();
        let mut s = self.state.write();
        s.daily_realized_pnl += realized_pnl;
    }

    pub fn kill(&self) {
        let mut s = self.state.write();
        s.killed = true;
        warn!("kill switch activated manually");
    }

    /// Reset the kill switch. Does not touch daily PnL — a loss that
    /// triggered the switch stays on the books until the date rolls over.
    pub fn reset_kill_switch(&self) {
        let mut s = self.state.write();
        s.killed = false;
        info!("kill switch reset");
    }

    pub fn is_killed(&self) -> bool {
        self.state.read().killed
    }

    pub fn snapshot(&self) -> RiskState {
        self.maybe_reset_daily();
        let s = self.state.read();
        RiskState {
            killed: s.killed,
            daily_realized_pnl: s.daily_realized_pnl.to_f64().unwrap_or(0.0),
            account_equity: self.account_equity.to_f64().unwrap_or(0.0),
            gross_exposure: s.gross_exposure.to_f64().unwrap_or(0.0),
            open_long_symbols: s.open_long_symbols.len(),
            current_date: s.current_date.clone(),
        }
    }

    fn maybe_reset_daily(&self) {
        let today = Utc::now().format("%Y-%m-%d").to_string();
        {
            let s = self.state.read();
            if s.current_date == today {
                return;
            }
        }
        let mut s = self.state.write();
        if s.current_date != today {
            info!(old_date = %s.current_date, new_date = %today, "date rolled — resetting daily risk counters");
            s.daily_realized_pnl = Decimal::ZERO;
            s.current_date = today;
            // The kill switch is NOT auto-cleared by a date roll; only an
            // explicit reset_kill_switch call may clear it.
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn guard() -> RiskGuard {
        RiskGuard::new(dec!(10000), dec!(2), 10, dec!(20), dec!(50000), dec!(80))
    }

    #[test]
    fn passes_when_all_checks_clear() {
        let g = guard();
        let order = OrderIntent { symbol: "BTCUSDT", is_buy: true, notional: dec!(500) };
        assert!(g.check(&order).is_ok());
    }

    #[test]
    fn kill_switch_rejects_everything() {
        let g = guard();
        g.kill();
        let order = OrderIntent { symbol: "BTCUSDT", is_buy: true, notional: dec!(1) };
        assert_eq!(g.check(&order), Err(reasons::KILL_SWITCH));
    }

    #[test]
    fn daily_loss_breach_activates_kill_switch() {
        // Scenario 3: daily_loss_limit_pct=2, account=10000, realized pnl -250.
        let g = guard();
        g.record_trade_result(dec!(-250));
        let order = OrderIntent { symbol: "BTCUSDT", is_buy: true, notional: dec!(500) };
        assert_eq!(g.check(&order), Err(reasons::DAILY_LOSS));
        assert!(g.is_killed());

        g.reset_kill_switch();
        assert!(g.check(&order).is_ok());
    }

    #[test]
    fn position_limit_blocks_new_symbol_past_cap() {
        let g = RiskGuard::new(dec!(10000), dec!(2), 1, dec!(100), dec!(50000), dec!(100));
        g.record_fill("BTCUSDT", true, true, dec!(0));
        let order = OrderIntent { symbol: "ETHUSDT", is_buy: true, notional: dec!(10) };
        assert_eq!(g.check(&order), Err(reasons::POSITION_LIMIT));
        // Adding to an already-open symbol is fine.
        let same = OrderIntent { symbol: "BTCUSDT", is_buy: true, notional: dec!(10) };
        assert!(g.check(&same).is_ok());
    }

    #[test]
    fn per_order_notional_cap_rejects_oversized_order() {
        let g = guard();
        // max_position_size_pct=20% of 10000 = 2000.
        let order = OrderIntent { symbol: "BTCUSDT", is_buy: true, notional: dec!(2500) };
        assert_eq!(g.check(&order), Err(reasons::MAX_POSITION_SIZE));
    }

    #[test]
    fn absolute_notional_cap_rejects_even_within_pct() {
        let g = RiskGuard::new(dec!(1_000_000), dec!(2), 10, dec!(50), dec!(50000), dec!(80));
        // 50% of 1,000,000 = 500,000 passes the pct check but exceeds the flat cap.
        let order = OrderIntent { symbol: "BTCUSDT", is_buy: true, notional: dec!(60000) };
        assert_eq!(g.check(&order), Err(reasons::NOTIONAL_CAP));
    }

    #[test]
    fn total_exposure_check_accounts_for_existing_exposure() {
        let g = guard();
        g.record_fill("BTCUSDT", true, true, dec!(7900));
        // total_exposure_pct=80% of 10000 = 8000; existing 7900 + 200 > 8000.
        let order = OrderIntent { symbol: "ETHUSDT", is_buy: true, notional: dec!(200) };
        assert_eq!(g.check(&order), Err(reasons::TOTAL_EXPOSURE));
    }

    #[test]
    fn check_order_short_circuits_on_first_failure() {
        // Kill switch active AND daily loss breached: must report kill switch first.
        let g = guard();
        g.record_trade_result(dec!(-1000));
        g.kill();
        let order = OrderIntent { symbol: "BTCUSDT", is_buy: true, notional: dec!(1) };
        assert_eq!(g.check(&order), Err(reasons::KILL_SWITCH));
    }
}
