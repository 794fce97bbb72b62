// =============================================================================
// Trend Strategy — fast/slow EMA crossover with regime filter, Kelly sizing
// and ATR-based trailing stops (§4.5.2)
// =============================================================================

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;

use crate::config::TrendParams;
use crate::indicators::atr::{calculate_atr, Hlc};
use crate::indicators::ema::latest_ema;
use crate::types::{Bar, Side, Signal, SignalKind, Tick};

use super::Strategy;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Regime {
    Bullish,
    Bearish,
    Neutral,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PositionSide {
    Flat,
    Long,
    Short,
}

struct Stops {
    stop_loss: f64,
    trailing_stop: f64,
    extremum: f64,
}

pub struct TrendStrategy {
    params: TrendParams,
    symbol: String,

    closes: Vec<f64>,
    highs: Vec<f64>,
    lows: Vec<f64>,
    volumes: Vec<f64>,

    fast_ema: Option<f64>,
    slow_ema: Option<f64>,
    prev_fast_ema: Option<f64>,
    prev_slow_ema: Option<f64>,
    atr: Option<f64>,

    regime: Regime,
    signal_strength: f64,

    position_side: PositionSide,
    position_quantity: f64,
    entry_price: f64,
    stops: Option<Stops>,

    wins: Vec<f64>,
    losses: Vec<f64>,
}

impl TrendStrategy {
    pub fn new(params: TrendParams) -> Self {
        Self {
            params,
            symbol: String::new(),
            closes: Vec::new(),
            highs: Vec::new(),
            lows: Vec::new(),
            volumes: Vec::new(),
            fast_ema: None,
            slow_ema: None,
            prev_fast_ema: None,
            prev_slow_ema: None,
            atr: None,
            regime: Regime::Neutral,
            signal_strength: 0.0,
            position_side: PositionSide::Flat,
            position_quantity: 0.0,
            entry_price: 0.0,
            stops: None,
            wins: Vec::new(),
            losses: Vec::new(),
        }
    }

    fn push_window(&mut self, bar: &Bar) {
        let cap = self.params.slow_ma * 2;
        let vol_cap = self.params.vol_filter_period * 2;

        self.closes.push(bar.close.to_f64().unwrap_or(0.0));
        self.highs.push(bar.high.to_f64().unwrap_or(0.0));
        self.lows.push(bar.low.to_f64().unwrap_or(0.0));
        self.volumes.push(bar.volume.to_f64().unwrap_or(0.0));

        if self.closes.len() > cap {
            self.closes.remove(0);
            self.highs.remove(0);
            self.lows.remove(0);
        }
        if self.volumes.len() > vol_cap.max(20) {
            self.volumes.remove(0);
        }
    }

    fn update_indicators(&mut self) {
        self.prev_fast_ema = self.fast_ema;
        self.prev_slow_ema = self.slow_ema;

        if self.closes.len() >= self.params.fast_ma {
            self.fast_ema = latest_ema(&self.closes, self.params.fast_ma);
        }
        if self.closes.len() >= self.params.slow_ma {
            self.slow_ema = latest_ema(&self.closes, self.params.slow_ma);
        }
        if self.closes.len() >= self.params.vol_filter_period + 1 {
            let hlc: Vec<Hlc> = self
                .highs
                .iter()
                .zip(self.lows.iter())
                .zip(self.closes.iter())
                .map(|((h, l), c)| Hlc { high: *h, low: *l, close: *c })
                .collect();
            self.atr = calculate_atr(&hlc, self.params.vol_filter_period);
        }
    }

    fn volume_confirms(&self) -> bool {
        if self.volumes.len() < 20 {
            return false;
        }
        let n = self.volumes.len();
        let recent: f64 = self.volumes[n - 5..].iter().sum::<f64>() / 5.0;
        let baseline: f64 = self.volumes[n - 20..].iter().sum::<f64>() / 20.0;
        recent > baseline * 1.2
    }

    fn detect_regime(&mut self) {
        let (fast, slow) = match (self.fast_ema, self.slow_ema) {
            (Some(f), Some(s)) if s != 0.0 => (f, s),
            _ => {
                self.regime = Regime::Neutral;
                self.signal_strength = 0.0;
                return;
            }
        };

        let delta = (fast - slow) / slow;
        let confirmed = self.volume_confirms();

        self.regime = if delta > self.params.regime_threshold && confirmed {
            Regime::Bullish
        } else if delta < -self.params.regime_threshold && confirmed {
            Regime::Bearish
        } else {
            Regime::Neutral
        };

        self.signal_strength = (delta.abs() / 0.05).min(1.0);
    }

    /// Empirical win rate, trusted only once there's enough trade history to
    /// be meaningful; below that sample size a neutral 0.5 is used instead.
    fn win_probability(&self) -> f64 {
        let total = self.wins.len() + self.losses.len();
        if total > 10 {
            self.wins.len() as f64 / total as f64
        } else {
            0.5
        }
    }

    /// Ratio of average win to average loss, with ATR-scaled defaults before
    /// either side of the trade history has any samples.
    fn win_loss_ratio(&self) -> f64 {
        let atr = self.atr.unwrap_or(0.0);
        let avg_win = if self.wins.is_empty() { atr * 2.0 } else { self.wins.iter().sum::<f64>() / self.wins.len() as f64 };
        let avg_loss = if self.losses.is_empty() { atr } else { self.losses.iter().sum::<f64>() / self.losses.len() as f64 };
        if avg_loss.abs() < 1e-9 {
            1.5
        } else {
            avg_win / avg_loss.abs()
        }
    }

    fn kelly_position_value(&self) -> f64 {
        let win_prob = self.win_probability();
        if win_prob < self.params.min_win_probability {
            return 0.0;
        }
        let ratio = self.win_loss_ratio().max(1e-6);
        let f = (win_prob * ratio - (1.0 - win_prob)) / ratio;
        let f = f.clamp(0.0, self.params.kelly_fraction);
        (self.params.max_position_usd * f * self.signal_strength).min(self.params.max_position_usd)
    }

    /// `trailing_pct / stop_pct`, falling back to 1.0 (trailing tracks the
    /// stop 1:1) if `stop_pct` is non-positive rather than dividing by zero.
    fn trailing_ratio(&self) -> f64 {
        if self.params.stop_pct > 0.0 {
            self.params.trailing_pct / self.params.stop_pct
        } else {
            1.0
        }
    }

    fn open_stops(&self, price: f64, side: PositionSide) -> Stops {
        let distance = self.atr.map(|a| a * self.params.atr_multiplier).unwrap_or(price * self.params.stop_pct / 100.0);
        let trailing_distance = distance * self.trailing_ratio();
        match side {
            PositionSide::Long => Stops {
                stop_loss: price - distance,
                trailing_stop: price - trailing_distance,
                extremum: price,
            },
            _ => Stops {
                stop_loss: price + distance,
                trailing_stop: price + trailing_distance,
                extremum: price,
            },
        }
    }

    fn ratchet_stops(&mut self, price: f64) {
        let distance_ratio = self.trailing_ratio();
        if let Some(stops) = &mut self.stops {
            match self.position_side {
                PositionSide::Long => {
                    if price > stops.extremum {
                        stops.extremum = price;
                        let distance = self.atr.map(|a| a * self.params.atr_multiplier).unwrap_or(price * self.params.stop_pct / 100.0);
                        let candidate = price - distance * distance_ratio;
                        if candidate > stops.trailing_stop {
                            stops.trailing_stop = candidate;
                        }
                    }
                }
                PositionSide::Short => {
                    if price < stops.extremum {
                        stops.extremum = price;
                        let distance = self.atr.map(|a| a * self.params.atr_multiplier).unwrap_or(price * self.params.stop_pct / 100.0);
                        let candidate = price + distance * distance_ratio;
                        if candidate < stops.trailing_stop {
                            stops.trailing_stop = candidate;
                        }
                    }
                }
                PositionSide::Flat => {}
            }
        }
    }

    fn check_stops(&mut self, price: f64) -> Option<Signal> {
        let stops = self.stops.as_ref()?;
        let breached = match self.position_side {
            PositionSide::Long => price <= stops.stop_loss || price <= stops.trailing_stop,
            PositionSide::Short => price >= stops.stop_loss || price >= stops.trailing_stop,
            PositionSide::Flat => false,
        };
        if !breached {
            return None;
        }
        let kind = match self.position_side {
            PositionSide::Long => SignalKind::Sell,
            PositionSide::Short => SignalKind::Buy,
            PositionSide::Flat => return None,
        };
        let qty = self.position_quantity.abs();
        self.record_trade_result(price);
        self.position_side = PositionSide::Flat;
        self.position_quantity = 0.0;
        self.stops = None;
        Some(Signal::new(
            self.symbol.clone(),
            kind,
            Decimal::try_from(qty).unwrap_or_default(),
            None,
            1.0,
            "stop loss or trailing stop breached",
            "trend",
            "trend-v1",
        ))
    }

    fn record_trade_result(&mut self, exit_price: f64) {
        if self.entry_price <= 0.0 {
            return;
        }
        let pnl = match self.position_side {
            PositionSide::Long => exit_price - self.entry_price,
            PositionSide::Short => self.entry_price - exit_price,
            PositionSide::Flat => return,
        };
        if pnl >= 0.0 {
            self.wins.push(pnl);
        } else {
            self.losses.push(pnl);
        }
    }

    fn open_position(&mut self, side: PositionSide, price: f64) -> Option<Signal> {
        let position_value = self.kelly_position_value();
        if position_value <= 0.0 || price <= 0.0 {
            return None;
        }
        let quantity = position_value / price;
        self.position_side = side;
        self.position_quantity = quantity;
        self.entry_price = price;
        self.stops = Some(self.open_stops(price, side));

        let kind = match side {
            PositionSide::Long => SignalKind::Buy,
            _ => SignalKind::Sell,
        };
        Some(Signal::new(
            self.symbol.clone(),
            kind,
            Decimal::try_from(quantity).unwrap_or_default(),
            None,
            self.signal_strength,
            format!("trend crossover, regime {:?}", self.regime),
            "trend",
            "trend-v1",
        ))
    }

    fn regime_flipped_against_position(&self) -> bool {
        match self.position_side {
            PositionSide::Long => self.regime == Regime::Bearish,
            PositionSide::Short => self.regime == Regime::Bullish,
            PositionSide::Flat => false,
        }
    }
}

impl Strategy for TrendStrategy {
    fn name(&self) -> &'static str {
        "trend"
    }

    fn initialize(&mut self, symbol: &str, historical_bars: &[Bar]) {
        self.symbol = symbol.to_string();
        for bar in historical_bars {
            self.push_window(bar);
        }
        self.update_indicators();
        self.detect_regime();
    }

    fn on_tick(&mut self, tick: &Tick) -> Vec<Signal> {
        let price = tick.price.to_f64().unwrap_or(0.0);
        if price <= 0.0 || self.position_side == PositionSide::Flat {
            return Vec::new();
        }
        self.check_stops(price).into_iter().collect()
    }

    fn on_bar(&mut self, bar: &Bar) -> Vec<Signal> {
        let price = bar.close.to_f64().unwrap_or(0.0);
        self.push_window(bar);
        self.update_indicators();
        self.detect_regime();

        let mut signals = Vec::new();

        let crossed_up = matches!((self.prev_fast_ema, self.prev_slow_ema), (Some(pf), Some(ps)) if pf <= ps)
            && matches!((self.fast_ema, self.slow_ema), (Some(f), Some(s)) if f > s);
        let crossed_down = matches!((self.prev_fast_ema, self.prev_slow_ema), (Some(pf), Some(ps)) if pf >= ps)
            && matches!((self.fast_ema, self.slow_ema), (Some(f), Some(s)) if f < s);

        if self.position_side == PositionSide::Flat {
            if crossed_up && self.regime == Regime::Bullish {
                if let Some(sig) = self.open_position(PositionSide::Long, price) {
                    signals.push(sig);
                }
            } else if crossed_down && self.regime == Regime::Bearish {
                if let Some(sig) = self.open_position(PositionSide::Short, price) {
                    signals.push(sig);
                }
            }
        } else {
            self.ratchet_stops(price);
            if self.regime_flipped_against_position() {
                let qty = self.position_quantity.abs();
                let kind = match self.position_side {
                    PositionSide::Long => SignalKind::Sell,
                    PositionSide::Short => SignalKind::Buy,
                    PositionSide::Flat => unreachable!(),
                };
                self.record_trade_result(price);
                self.position_side = PositionSide::Flat;
                self.position_quantity = 0.0;
                self.stops = None;
                signals.push(Signal::new(
                    self.symbol.clone(),
                    kind,
                    Decimal::try_from(qty).unwrap_or_default(),
                    None,
                    1.0,
                    "regime flipped against open position",
                    "trend",
                    "trend-v1",
                ));
            } else if let Some(sig) = self.check_stops(price) {
                signals.push(sig);
            }
        }

        signals
    }

    fn on_fill(&mut self, _side: Side, _quantity: f64, _price: f64) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn params() -> TrendParams {
        TrendParams {
            fast_ma: 3,
            slow_ma: 5,
            vol_filter_period: 3,
            stop_pct: 2.0,
            trailing_pct: 1.5,
            atr_multiplier: 2.0,
            regime_threshold: 0.01,
            kelly_fraction: 0.25,
            min_win_probability: 0.0,
            max_position_usd: 1000.0,
        }
    }

    fn bar(close: f64, high: f64, low: f64, volume: f64) -> Bar {
        Bar {
            exchange: "binance".into(),
            symbol: "BTCUSDT".into(),
            timeframe: "1m".into(),
            start_ts_us: 0,
            open: dec!(0),
            high: Decimal::try_from(high).unwrap(),
            low: Decimal::try_from(low).unwrap(),
            close: Decimal::try_from(close).unwrap(),
            volume: Decimal::try_from(volume).unwrap(),
            count: 1,
            vwap: Decimal::try_from(close).unwrap(),
        }
    }

    #[test]
    fn volume_confirmation_requires_twenty_samples() {
        let mut t = TrendStrategy::new(params());
        t.symbol = "BTCUSDT".into();
        for _ in 0..10 {
            t.volumes.push(100.0);
        }
        assert!(!t.volume_confirms());
    }

    #[test]
    fn volume_confirmation_compares_recent_five_to_baseline_twenty() {
        let mut t = TrendStrategy::new(params());
        for _ in 0..15 {
            t.volumes.push(10.0);
        }
        for _ in 0..5 {
            t.volumes.push(20.0); // recent mean 20 > baseline mean 12.5 * 1.2=15
        }
        assert!(t.volume_confirms());
    }

    #[test]
    fn trailing_stop_never_loosens_on_long() {
        let mut t = TrendStrategy::new(params());
        t.symbol = "BTCUSDT".into();
        t.position_side = PositionSide::Long;
        t.position_quantity = 1.0;
        t.entry_price = 100.0;
        t.atr = Some(1.0);
        t.stops = Some(t.open_stops(100.0, PositionSide::Long));
        let initial_trailing = t.stops.as_ref().unwrap().trailing_stop;

        t.ratchet_stops(110.0);
        let after_rise = t.stops.as_ref().unwrap().trailing_stop;
        assert!(after_rise > initial_trailing);

        t.ratchet_stops(105.0); // price pulls back, trailing stop must not loosen
        let after_pullback = t.stops.as_ref().unwrap().trailing_stop;
        assert_eq!(after_pullback, after_rise);
    }

    #[test]
    fn kelly_sizing_gated_below_min_win_probability() {
        let mut p = params();
        p.min_win_probability = 0.9;
        let t = TrendStrategy::new(p);
        assert_eq!(t.kelly_position_value(), 0.0);
    }

    #[test]
    fn stop_breach_emits_close_signal_with_null_price() {
        let mut t = TrendStrategy::new(params());
        t.symbol = "BTCUSDT".into();
        t.position_side = PositionSide::Long;
        t.position_quantity = 1.0;
        t.entry_price = 100.0;
        t.stops = Some(Stops { stop_loss: 95.0, trailing_stop: 96.0, extremum: 100.0 });

        let tick = Tick {
            exchange: "binance".into(),
            symbol: "BTCUSDT".into(),
            price: dec!(94),
            volume: dec!(1),
            bid: None,
            ask: None,
            source_ts_us: 0,
            ingest_ts_us: 0,
        };
        let signals = t.on_tick(&tick);
        assert_eq!(signals.len(), 1);
        assert_eq!(signals[0].kind, SignalKind::Sell);
        assert!(signals[0].price.is_none());
        assert_eq!(t.position_side, PositionSide::Flat);
    }

    #[test]
    fn crossover_with_confirmed_bullish_regime_opens_long() {
        let mut t = TrendStrategy::new(params());
        t.symbol = "BTCUSDT".into();
        // Feed a rising series so fast EMA eventually exceeds slow EMA with
        // confirmed rising volume.
        for i in 0..30 {
            let price = 100.0 + i as f64 * 0.5;
            let vol = if i >= 25 { 30.0 } else { 10.0 };
            t.on_bar(&bar(price, price + 1.0, price - 1.0, vol));
        }
        // Either a position is open or regime never confirmed bullish soon
        // enough; assert internal consistency rather than a brittle exact bar.
        if t.position_side == PositionSide::Long {
            assert!(t.position_quantity > 0.0);
            assert!(t.stops.is_some());
        }
    }

    #[test]
    fn tiny_crossover_opens_long_with_atr_stop_then_closes_on_stop_touch() {
        let mut p = params();
        p.fast_ma = 2;
        p.slow_ma = 3;
        p.vol_filter_period = 2;
        p.atr_multiplier = 2.0;
        p.stop_pct = 2.0;
        p.regime_threshold = 0.001;

        let mut t = TrendStrategy::new(p);
        // Seed the window with flat history so volume confirmation has its
        // twenty samples and the close/high/low window starts full of 100s —
        // the closing window is capped at slow_ma * 2 = 6, so by the time the
        // live closes below are all pushed the tracked window is exactly
        // that sequence.
        let history: Vec<Bar> = (0..20).map(|_| bar(100.0, 101.0, 99.0, 100.0)).collect();
        t.initialize("BTCUSDT", &history);

        let closes = [100.0, 100.0, 100.0, 101.0, 103.0, 104.0];
        let mut opened = false;
        let mut opened_at = 0;
        for (i, &close) in closes.iter().enumerate() {
            let signals = t.on_bar(&bar(close, close + 1.0, close - 1.0, 300.0));
            if !opened && !signals.is_empty() {
                assert_eq!(signals.len(), 1);
                assert_eq!(signals[0].kind, SignalKind::Buy);
                assert!(signals[0].quantity > Decimal::ZERO);
                assert_eq!(i, 4, "expected the crossover to fire at bar 5 (index 4)");
                opened = true;
                opened_at = i;
                break;
            }
        }
        assert!(opened, "expected a buy signal once the fast EMA crossed above the slow EMA");
        assert_eq!(t.position_side, PositionSide::Long);

        let entry_close = closes[opened_at];
        let stop_loss = t.stops.as_ref().unwrap().stop_loss;
        let atr = t.atr.unwrap();
        assert!((stop_loss - (entry_close - atr * 2.0)).abs() < 1e-9);

        let tick = Tick {
            exchange: "binance".into(),
            symbol: "BTCUSDT".into(),
            price: Decimal::try_from(stop_loss - 1.0).unwrap(),
            volume: dec!(1),
            bid: None,
            ask: None,
            source_ts_us: 0,
            ingest_ts_us: 0,
        };
        let signals = t.on_tick(&tick);
        assert_eq!(signals.len(), 1);
        assert_eq!(signals[0].kind, SignalKind::Sell);
        assert_eq!(t.position_side, PositionSide::Flat);
    }
}
