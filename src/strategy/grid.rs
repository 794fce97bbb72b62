// =============================================================================
// Grid Strategy — layered limit orders around mid-price with inventory
// management (§4.5.1)
// =============================================================================

use std::collections::HashMap;

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;

use crate::config::GridParams;
use crate::types::{Bar, Side, Signal, SignalKind, Tick};

use super::Strategy;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum GridSide {
    Buy,
    Sell,
}

pub struct GridStrategy {
    params: GridParams,
    symbol: String,
    mid_price: f64,
    price_history: Vec<f64>,
    volatility: f64,
    inventory: f64,
    /// level price (rounded to avoid float-key churn) -> side of the
    /// outstanding order resting there.
    open_levels: HashMap<i64, GridSide>,
    last_signal_at: Option<std::time::Instant>,
    last_rebalance_at: Option<std::time::Instant>,
}

impl GridStrategy {
    pub fn new(params: GridParams) -> Self {
        Self {
            params,
            symbol: String::new(),
            mid_price: 0.0,
            price_history: Vec::new(),
            volatility: 0.0,
            inventory: 0.0,
            open_levels: HashMap::new(),
            last_signal_at: None,
            last_rebalance_at: None,
        }
    }

    fn level_key(price: f64) -> i64 {
        (price * 1e6).round() as i64
    }

    fn push_price_history(&mut self, price: f64) {
        self.price_history.push(price);
        if self.price_history.len() > 100 {
            self.price_history.remove(0);
        }
        if self.price_history.len() >= 20 {
            let window = &self.price_history[self.price_history.len() - 20..];
            let log_returns: Vec<f64> = window
                .windows(2)
                .map(|w| (w[1] / w[0]).ln())
                .filter(|r| r.is_finite())
                .collect();
            if !log_returns.is_empty() {
                let mean = log_returns.iter().sum::<f64>() / log_returns.len() as f64;
                let var = log_returns.iter().map(|r| (r - mean).powi(2)).sum::<f64>()
                    / log_returns.len() as f64;
                self.volatility = var.sqrt() * (252f64).sqrt();
            }
        }
    }

    fn in_cooldown(&self, now: std::time::Instant) -> bool {
        match self.last_signal_at {
            Some(t) => now.duration_since(t).as_secs_f64() < self.params.cooldown_seconds as f64,
            None => false,
        }
    }

    fn should_rebalance(&self) -> bool {
        self.inventory.abs() > self.params.max_inventory * self.params.rebalance_threshold
    }

    fn rebalance_signal(&self) -> Option<Signal> {
        if self.mid_price <= 0.0 {
            return None;
        }
        let min_threshold = self.params.base_quantity_usd / self.mid_price;
        if self.inventory.abs() < min_threshold {
            return None;
        }
        let cap = min_threshold * 2.0;
        let reduce_qty = (self.inventory.abs() * 0.3).min(cap);
        let (kind, reason) = if self.inventory > 0.0 {
            (SignalKind::Sell, format!("rebalancing: reducing long inventory {:.4}", self.inventory))
        } else {
            (SignalKind::Buy, format!("rebalancing: reducing short inventory {:.4}", self.inventory))
        };
        Some(Signal::new(
            self.symbol.clone(),
            kind,
            Decimal::try_from(reduce_qty).unwrap_or_default(),
            None,
            0.7,
            reason,
            "grid",
            "grid-v1",
        ))
    }

    fn order_size(&self, level_price: f64, side: GridSide) -> f64 {
        let base_size = self.params.base_quantity_usd / level_price;

        let inventory_factor = match side {
            GridSide::Buy if self.inventory > 0.0 => {
                (1.0 - self.inventory / self.params.max_inventory).max(0.5)
            }
            GridSide::Sell if self.inventory < 0.0 => {
                (1.0 + self.inventory / self.params.max_inventory).max(0.5)
            }
            _ => 1.0,
        };

        let vol_factor = if self.volatility > 0.0 {
            (0.02 / self.volatility).clamp(0.5, 1.5)
        } else {
            1.0
        };

        base_size * inventory_factor * vol_factor
    }

    fn grid_levels(&self) -> (Vec<f64>, Vec<f64>) {
        if self.mid_price <= 0.0 {
            return (Vec::new(), Vec::new());
        }
        let step = self.params.grid_step_pct / 100.0;
        let mut buys = Vec::with_capacity(self.params.grid_levels as usize);
        let mut sells = Vec::with_capacity(self.params.grid_levels as usize);
        for i in 1..=self.params.grid_levels {
            let i = i as f64;
            buys.push(self.mid_price * (1.0 - i * step));
            sells.push(self.mid_price * (1.0 + i * step));
        }
        (buys, sells)
    }

    /// Backward-looking take-profit reference: mean of price_history[-20:-10],
    /// falling back to price_history[0] under twenty samples. Preserved
    /// verbatim from the original source, not the position's entry price.
    fn take_profit_reference(&self) -> Option<f64> {
        if self.price_history.len() < 2 {
            return None;
        }
        if self.price_history.len() > 20 {
            let n = self.price_history.len();
            let window = &self.price_history[n - 20..n - 10];
            Some(window.iter().sum::<f64>() / window.len() as f64)
        } else {
            Some(self.price_history[0])
        }
    }

    fn check_take_profit(&self) -> Option<Signal> {
        if self.inventory == 0.0 {
            return None;
        }
        let entry_ref = self.take_profit_reference()?;
        if entry_ref == 0.0 {
            return None;
        }
        let pnl_pct = (self.mid_price - entry_ref) / entry_ref * 100.0;

        if self.inventory > 0.0 && pnl_pct > self.params.take_profit_pct {
            let qty = self.inventory * 0.5;
            return Some(Signal::new(
                self.symbol.clone(),
                SignalKind::Sell,
                Decimal::try_from(qty).unwrap_or_default(),
                None,
                0.8,
                format!("take profit: {pnl_pct:.2}% gain"),
                "grid",
                "grid-v1",
            ));
        }
        if self.inventory < 0.0 && pnl_pct < -self.params.take_profit_pct {
            let qty = self.inventory.abs() * 0.5;
            return Some(Signal::new(
                self.symbol.clone(),
                SignalKind::Buy,
                Decimal::try_from(qty).unwrap_or_default(),
                None,
                0.8,
                format!("take profit: {:.2}% gain on short", pnl_pct.abs()),
                "grid",
                "grid-v1",
            ));
        }
        None
    }
}

impl Strategy for GridStrategy {
    fn name(&self) -> &'static str {
        "grid"
    }

    fn initialize(&mut self, symbol: &str, historical_bars: &[Bar]) {
        self.symbol = symbol.to_string();
        if let Some(last) = historical_bars.last() {
            self.mid_price = last.close.to_f64().unwrap_or(0.0);
        }
        for bar in historical_bars.iter().rev().take(100).rev() {
            self.price_history.push(bar.close.to_f64().unwrap_or(0.0));
        }
    }

    fn on_tick(&mut self, tick: &Tick) -> Vec<Signal> {
        self.mid_price = tick.mid().to_f64().unwrap_or(self.mid_price);
        self.push_price_history(self.mid_price);

        let now = std::time::Instant::now();
        if self.in_cooldown(now) {
            return Vec::new();
        }

        if self.should_rebalance() {
            if let Some(sig) = self.rebalance_signal() {
                self.last_rebalance_at = Some(now);
                self.last_signal_at = Some(now);
                return vec![sig];
            }
        }

        let mut signals = Vec::new();
        let (buys, sells) = self.grid_levels();

        for (i, &price) in buys.iter().enumerate() {
            let key = Self::level_key(price);
            if self.open_levels.contains_key(&key) || self.inventory >= self.params.max_inventory {
                continue;
            }
            let qty = self.order_size(price, GridSide::Buy);
            let mut sig = Signal::new(
                self.symbol.clone(),
                SignalKind::Buy,
                Decimal::try_from(qty).unwrap_or_default(),
                Decimal::try_from(price).ok(),
                0.5,
                format!("grid buy level at {price:.2}"),
                "grid",
                "grid-v1",
            );
            sig = sig.with_metadata(serde_json::json!({
                "grid_level": i + 1,
                "inventory": self.inventory,
                "volatility": self.volatility,
            }));
            signals.push(sig);
            self.open_levels.insert(key, GridSide::Buy);
        }

        for (i, &price) in sells.iter().enumerate() {
            let key = Self::level_key(price);
            if self.open_levels.contains_key(&key) || self.inventory <= -self.params.max_inventory {
                continue;
            }
            let qty = self.order_size(price, GridSide::Sell);
            let mut sig = Signal::new(
                self.symbol.clone(),
                SignalKind::Sell,
                Decimal::try_from(qty).unwrap_or_default(),
                Decimal::try_from(price).ok(),
                0.5,
                format!("grid sell level at {price:.2}"),
                "grid",
                "grid-v1",
            );
            sig = sig.with_metadata(serde_json::json!({
                "grid_level": i + 1,
                "inventory": self.inventory,
                "volatility": self.volatility,
            }));
            signals.push(sig);
            self.open_levels.insert(key, GridSide::Sell);
        }

        if self.inventory != 0.0 {
            if let Some(sig) = self.check_take_profit() {
                signals.push(sig);
            }
        }

        if !signals.is_empty() {
            self.last_signal_at = Some(now);
        }
        signals
    }

    fn on_bar(&mut self, bar: &Bar) -> Vec<Signal> {
        let close = bar.close.to_f64().unwrap_or(self.mid_price);
        self.mid_price = close;
        self.push_price_history(close);
        Vec::new()
    }

    fn on_fill(&mut self, side: Side, quantity: f64, price: f64) {
        match side {
            Side::Buy => self.inventory += quantity,
            Side::Sell => self.inventory -= quantity,
        }
        let key = Self::level_key(price);
        self.open_levels.remove(&key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Tick;

    fn tick(bid: f64, ask: f64) -> Tick {
        Tick {
            exchange: "binance".into(),
            symbol: "BTCUSDT".into(),
            price: Decimal::try_from((bid + ask) / 2.0).unwrap(),
            volume: Decimal::ONE,
            bid: Decimal::try_from(bid).ok(),
            ask: Decimal::try_from(ask).ok(),
            source_ts_us: 0,
            ingest_ts_us: 0,
        }
    }

    fn new_grid(mid: f64) -> GridStrategy {
        let mut g = GridStrategy::new(GridParams {
            base_quantity_usd: 20.0,
            grid_step_pct: 0.5,
            grid_levels: 3,
            take_profit_pct: 1.0,
            max_inventory: 1.0,
            cooldown_seconds: 5,
            rebalance_threshold: 0.8,
        });
        g.initialize("BTCUSDT", &[]);
        g.mid_price = mid;
        g
    }

    #[test]
    fn scenario_grid_fill_after_drop() {
        // Scenario 1: base=20, step=0.5%, levels=3, cooldown=5s, mid=50000.
        let mut g = new_grid(50000.0);
        let signals = g.on_tick(&tick(49900.0, 49910.0));

        let buys: Vec<&Signal> = signals.iter().filter(|s| s.kind == SignalKind::Buy).collect();
        let sells: Vec<&Signal> = signals.iter().filter(|s| s.kind == SignalKind::Sell).collect();
        assert_eq!(buys.len(), 3);
        assert_eq!(sells.len(), 3);

        let buy_prices: Vec<f64> = buys.iter().map(|s| s.price.unwrap().to_f64().unwrap()).collect();
        assert!((buy_prices[0] - 49750.0).abs() < 1.0);
        assert!((buy_prices[1] - 49500.0).abs() < 1.0);
        assert!((buy_prices[2] - 49250.0).abs() < 1.0);
    }

    #[test]
    fn cooldown_suppresses_immediate_next_tick() {
        let mut g = new_grid(50000.0);
        let first = g.on_tick(&tick(49900.0, 49910.0));
        assert!(!first.is_empty());
        let second = g.on_tick(&tick(49900.0, 49910.0));
        assert!(second.is_empty());
    }

    #[test]
    fn take_profit_uses_backward_looking_window_not_entry_price() {
        let mut g = new_grid(100.0);
        g.inventory = 1.0;
        // 25 prices: history[-20:-10] average should drive the reference,
        // not the most recent price nor any notion of entry price.
        for i in 0..25 {
            g.price_history.push(90.0 + i as f64);
        }
        g.mid_price = 130.0;
        let sig = g.check_take_profit();
        assert!(sig.is_some());
        assert_eq!(sig.unwrap().kind, SignalKind::Sell);
    }

    #[test]
    fn take_profit_falls_back_to_first_sample_under_twenty() {
        let mut g = new_grid(100.0);
        g.inventory = 1.0;
        g.price_history = vec![100.0, 101.0];
        g.mid_price = 150.0;
        let sig = g.check_take_profit();
        assert!(sig.is_some());
    }

    #[test]
    fn rebalance_triggers_above_threshold() {
        let mut g = new_grid(50000.0);
        g.inventory = 0.9; // > max_inventory(1.0) * rebalance_threshold(0.8)
        assert!(g.should_rebalance());
        let sig = g.rebalance_signal().unwrap();
        assert_eq!(sig.kind, SignalKind::Sell);
    }

    #[test]
    fn fill_updates_inventory_and_clears_level() {
        let mut g = new_grid(50000.0);
        g.open_levels.insert(GridStrategy::level_key(49750.0), GridSide::Buy);
        g.on_fill(Side::Buy, 0.0004, 49750.0);
        assert!((g.inventory - 0.0004).abs() < 1e-9);
        assert!(!g.open_levels.contains_key(&GridStrategy::level_key(49750.0)));
    }
}
