// =============================================================================
// OHLCV Aggregator (C3) — tick-to-bar construction across configured timeframes
// =============================================================================
//
// One instance owns a single (exchange, symbol) pair and runs single-threaded:
// every tick it sees produces at most one closed bar per configured timeframe.
// Timeframes are independent: a tick may close the 1s bar while leaving the
// 1m bar open.
// =============================================================================

use rust_decimal::Decimal;
use tracing::warn;

use crate::types::{Bar, Tick};

/// A configured aggregation interval, e.g. 1 second or 5 minutes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeframe {
    pub label: &'static str,
    pub seconds: i64,
}

impl Timeframe {
    pub const fn new(label: &'static str, seconds: i64) -> Self {
        Self { label, seconds }
    }
}

pub const SECOND_1: Timeframe = Timeframe::new("1s", 1);
pub const MINUTE_1: Timeframe = Timeframe::new("1m", 60);
pub const MINUTE_5: Timeframe = Timeframe::new("5m", 300);
pub const MINUTE_15: Timeframe = Timeframe::new("15m", 900);
pub const HOUR_1: Timeframe = Timeframe::new("1h", 3600);
pub const HOUR_4: Timeframe = Timeframe::new("4h", 14400);
pub const DAY_1: Timeframe = Timeframe::new("1d", 86400);

struct OpenBar {
    start_us: i64,
    open: Decimal,
    high: Decimal,
    low: Decimal,
    close: Decimal,
    volume: Decimal,
    pv_sum: Decimal,
    count: u64,
}

impl OpenBar {
    fn from_tick(tick: &Tick, start_us: i64) -> Self {
        Self {
            start_us,
            open: tick.price,
            high: tick.price,
            low: tick.price,
            close: tick.price,
            volume: tick.volume,
            pv_sum: tick.price * tick.volume,
            count: 1,
        }
    }

    fn update(&mut self, tick: &Tick) {
        self.high = self.high.max(tick.price);
        self.low = self.low.min(tick.price);
        self.close = tick.price;
        self.volume += tick.volume;
        self.pv_sum += tick.price * tick.volume;
        self.count += 1;
    }

    fn close(&self, exchange: &str, symbol: &str, timeframe: &str) -> Bar {
        let vwap = if self.volume > Decimal::ZERO {
            self.pv_sum / self.volume
        } else {
            self.close
        };
        Bar {
            exchange: exchange.to_string(),
            symbol: symbol.to_string(),
            timeframe: timeframe.to_string(),
            start_ts_us: self.start_us,
            open: self.open,
            high: self.high,
            low: self.low,
            close: self.close,
            volume: self.volume,
            count: self.count,
            vwap,
        }
    }
}

struct TimeframeState {
    timeframe: Timeframe,
    open: Option<OpenBar>,
}

/// Floor-align a timestamp (microseconds) to the start of its interval
/// (seconds), also in microseconds.
fn bar_start_us(ts_us: i64, interval_seconds: i64) -> i64 {
    let interval_us = interval_seconds * 1_000_000;
    (ts_us.div_euclid(interval_us)) * interval_us
}

/// Converts a tick stream into bar streams at configured timeframes for a
/// single (exchange, symbol) pair (§4.3).
pub struct OhlcvAggregator {
    exchange: String,
    symbol: String,
    timeframes: Vec<TimeframeState>,
    pub late_ticks: u64,
}

impl OhlcvAggregator {
    pub fn new(exchange: impl Into<String>, symbol: impl Into<String>, timeframes: &[Timeframe]) -> Self {
        Self {
            exchange: exchange.into(),
            symbol: symbol.into(),
            timeframes: timeframes
                .iter()
                .map(|tf| TimeframeState {
                    timeframe: *tf,
                    open: None,
                })
                .collect(),
            late_ticks: 0,
        }
    }

    /// Feed one tick. Returns any bars that closed as a result (one per
    /// timeframe whose open bar the tick rolled past). Order matches the
    /// timeframe configuration order.
    pub fn on_tick(&mut self, tick: &Tick) -> Vec<Bar> {
        let mut closed = Vec::new();
        for state in &mut self.timeframes {
            let this_start = bar_start_us(tick.source_ts_us, state.timeframe.seconds);

            match &mut state.open {
                None => {
                    state.open = Some(OpenBar::from_tick(tick, this_start));
                }
                Some(open) if this_start == open.start_us => {
                    open.update(tick);
                }
                Some(open) if this_start > open.start_us => {
                    closed.push(open.close(&self.exchange, &self.symbol, state.timeframe.label));
                    state.open = Some(OpenBar::from_tick(tick, this_start));
                }
                Some(open) => {
                    // Out-of-order tick: still belongs to the currently open
                    // bar's interval only if it falls within it; otherwise
                    // the bar it belongs to has already closed — drop it.
                    if this_start == open.start_us {
                        open.update(tick);
                    } else {
                        self.late_ticks += 1;
                        warn!(
                            symbol = %self.symbol,
                            timeframe = state.timeframe.label,
                            tick_ts = tick.source_ts_us,
                            "dropped late tick for already-closed bar"
                        );
                    }
                }
            }
        }
        closed
    }

    /// Force-close any open bars, e.g. on shutdown. Returns the closed bars.
    pub fn flush(&mut self) -> Vec<Bar> {
        self.timeframes
            .iter_mut()
            .filter_map(|state| {
                state
                    .open
                    .take()
                    .map(|open| open.close(&self.exchange, &self.symbol, state.timeframe.label))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn tick_at(ts_seconds: i64, price: Decimal, volume: Decimal) -> Tick {
        Tick {
            exchange: "binance".into(),
            symbol: "BTCUSDT".into(),
            price,
            volume,
            bid: None,
            ask: None,
            source_ts_us: ts_seconds * 1_000_000,
            ingest_ts_us: ts_seconds * 1_000_000,
        }
    }

    #[test]
    fn bar_start_alignment_floors_to_interval() {
        assert_eq!(bar_start_us(1_500_000, 1), 1_000_000);
        assert_eq!(bar_start_us(999_999, 1), 0);
        assert_eq!(bar_start_us(1_000_000, 1), 1_000_000);
    }

    #[test]
    fn single_tick_opens_bar_without_closing_it() {
        let mut agg = OhlcvAggregator::new("binance", "BTCUSDT", &[SECOND_1]);
        let closed = agg.on_tick(&tick_at(0, dec!(100), dec!(1)));
        assert!(closed.is_empty());
    }

    #[test]
    fn tick_crossing_interval_closes_prior_bar() {
        let mut agg = OhlcvAggregator::new("binance", "BTCUSDT", &[SECOND_1]);
        agg.on_tick(&tick_at(0, dec!(100), dec!(1)));
        agg.on_tick(&tick_at(0, dec!(102), dec!(1)));
        let closed = agg.on_tick(&tick_at(1, dec!(105), dec!(2)));
        assert_eq!(closed.len(), 1);
        let bar = &closed[0];
        assert_eq!(bar.start_ts_us, 0);
        assert_eq!(bar.open, dec!(100));
        assert_eq!(bar.high, dec!(102));
        assert_eq!(bar.low, dec!(100));
        assert_eq!(bar.close, dec!(102));
        assert_eq!(bar.volume, dec!(2));
        assert_eq!(bar.count, 2);
        // vwap = (100*1 + 102*1) / 2 = 101
        assert_eq!(bar.vwap, dec!(101));
    }

    #[test]
    fn invariants_hold_low_le_open_close_le_high() {
        let mut agg = OhlcvAggregator::new("binance", "BTCUSDT", &[SECOND_1]);
        agg.on_tick(&tick_at(0, dec!(100), dec!(1)));
        agg.on_tick(&tick_at(0, dec!(90), dec!(1)));
        agg.on_tick(&tick_at(0, dec!(110), dec!(1)));
        let closed = agg.on_tick(&tick_at(1, dec!(50), dec!(1)));
        let bar = &closed[0];
        assert!(bar.low <= bar.open);
        assert!(bar.close <= bar.high);
        assert!(bar.count >= 1);
    }

    #[test]
    fn gap_produces_no_empty_bars() {
        // Scenario 5: ticks at t=0,1,5,6s, timeframe=1s -> bars at 0,1,5,6 only.
        let mut agg = OhlcvAggregator::new("binance", "BTCUSDT", &[SECOND_1]);
        let mut all_closed = Vec::new();
        for t in [0, 1, 5, 6] {
            all_closed.extend(agg.on_tick(&tick_at(t, dec!(100), dec!(1))));
        }
        all_closed.extend(agg.flush());
        let starts: Vec<i64> = all_closed.iter().map(|b| b.start_ts_us / 1_000_000).collect();
        assert_eq!(starts, vec![0, 1, 5]);
        // The last bar (start=6) is only closed by flush.
    }

    #[test]
    fn late_tick_for_already_closed_bar_is_dropped_not_rewritten() {
        let mut agg = OhlcvAggregator::new("binance", "BTCUSDT", &[SECOND_1]);
        agg.on_tick(&tick_at(0, dec!(100), dec!(1)));
        let closed = agg.on_tick(&tick_at(2, dec!(200), dec!(1))); // closes bar 0, opens bar 2
        assert_eq!(closed[0].close, dec!(100));

        // A tick that arrives late for bar start=0 (already closed) is dropped.
        let late = agg.on_tick(&tick_at(0, dec!(999), dec!(1)));
        assert!(late.is_empty());
        assert_eq!(agg.late_ticks, 1);
    }

    #[test]
    fn tick_exactly_on_boundary_belongs_to_new_bar() {
        let mut agg = OhlcvAggregator::new("binance", "BTCUSDT", &[SECOND_1]);
        agg.on_tick(&tick_at(0, dec!(100), dec!(1)));
        let closed = agg.on_tick(&tick_at(1, dec!(200), dec!(1)));
        assert_eq!(closed.len(), 1);
        assert_eq!(closed[0].close, dec!(100));
        // bar starting at 1 is now open with the boundary tick as its opener.
        let closed2 = agg.flush();
        assert_eq!(closed2[0].open, dec!(200));
    }

    #[test]
    fn independent_timeframes_close_on_their_own_schedule() {
        let mut agg = OhlcvAggregator::new("binance", "BTCUSDT", &[SECOND_1, MINUTE_1]);
        agg.on_tick(&tick_at(0, dec!(100), dec!(1)));
        let closed = agg.on_tick(&tick_at(1, dec!(101), dec!(1)));
        // Only the 1s timeframe should have closed a bar; the 1m bar is still open.
        assert_eq!(closed.len(), 1);
        assert_eq!(closed[0].timeframe, "1s");
    }

    #[test]
    fn deterministic_replay_produces_identical_bars() {
        let ticks: Vec<Tick> = (0..10).map(|t| tick_at(t, Decimal::from(100 + t), dec!(1))).collect();

        let run = |ticks: &[Tick]| {
            let mut agg = OhlcvAggregator::new("binance", "BTCUSDT", &[SECOND_1]);
            let mut out = Vec::new();
            for t in ticks {
                out.extend(agg.on_tick(t));
            }
            out.extend(agg.flush());
            out
        };

        assert_eq!(run(&ticks), run(&ticks));
    }
}
