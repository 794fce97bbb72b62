// =============================================================================
// Strategy Engine (C5) — hosts stateful strategies that turn ticks/bars into
// Signals
// =============================================================================
//
// One `Box<dyn Strategy>` instance per (symbol, strategy-name) pair. Within
// one instance, invocations are strictly serial; the engine never inspects
// private strategy state directly.

pub mod grid;
pub mod trend;

use crate::types::{Bar, Signal, Tick};

/// Shared interface every trading strategy implements.
pub trait Strategy: Send + Sync {
    fn name(&self) -> &'static str;

    /// Seed the strategy with historical bars before live dispatch begins.
    fn initialize(&mut self, symbol: &str, historical_bars: &[Bar]);

    /// React to a single tick. Most strategies only check stops here.
    fn on_tick(&mut self, tick: &Tick) -> Vec<Signal>;

    /// React to a closed bar. Most of a strategy's decision logic lives here.
    fn on_bar(&mut self, bar: &Bar) -> Vec<Signal>;

    /// Feedback hook: a Signal this strategy emitted resulted in a fill.
    fn on_fill(&mut self, side: crate::types::Side, quantity: f64, price: f64);
}

/// Registry of strategy instances keyed by symbol, dispatching ticks/bars in
/// arrival order. Concurrent dispatch across different symbols is the
/// caller's responsibility (one registry per symbol is also valid); this
/// type only guarantees serial delivery within a single symbol's instance.
pub struct StrategyRegistry {
    instances: std::collections::HashMap<String, Box<dyn Strategy>>,
}

impl Default for StrategyRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl StrategyRegistry {
    pub fn new() -> Self {
        Self {
            instances: std::collections::HashMap::new(),
        }
    }

    pub fn register(&mut self, symbol: impl Into<String>, mut strategy: Box<dyn Strategy>) {
        let symbol = symbol.into();
        strategy.initialize(&symbol, &[]);
        self.instances.insert(symbol, strategy);
    }

    pub fn dispatch_tick(&mut self, symbol: &str, tick: &Tick) -> Vec<Signal> {
        self.instances
            .get_mut(symbol)
            .map(|s| s.on_tick(tick))
            .unwrap_or_default()
    }

    pub fn dispatch_bar(&mut self, symbol: &str, bar: &Bar) -> Vec<Signal> {
        self.instances
            .get_mut(symbol)
            .map(|s| s.on_bar(bar))
            .unwrap_or_default()
    }

    pub fn notify_fill(&mut self, symbol: &str, side: crate::types::Side, quantity: f64, price: f64) {
        if let Some(s) = self.instances.get_mut(symbol) {
            s.on_fill(side, quantity, price);
        }
    }
}
