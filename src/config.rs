// =============================================================================
// Runtime Configuration — Hot-reloadable engine settings with atomic save
// =============================================================================
//
// Every tunable the core pipeline needs lives here so the control plane can
// reconfigure the engine without a restart. Persistence uses an atomic
// tmp + rename pattern to avoid corrupting the file on crash. All fields
// carry `#[serde(default = "...")]` so that adding a field never breaks
// loading an older config file.
//
// =============================================================================

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::types::{AccountMode, TradingMode};

fn default_symbols() -> Vec<String> {
    vec!["BTCUSDT".to_string(), "ETHUSDT".to_string()]
}

fn default_daily_loss_limit_pct() -> f64 {
    2.0
}

fn default_position_limit() -> u32 {
    10
}

fn default_max_position_size_pct() -> f64 {
    20.0
}

fn default_notional_cap() -> f64 {
    50_000.0
}

fn default_total_exposure_pct() -> f64 {
    80.0
}

fn default_initial_paper_balance() -> f64 {
    10_000.0
}

fn default_maker_fee_bps() -> f64 {
    10.0
}

fn default_taker_fee_bps() -> f64 {
    20.0
}

fn default_base_slippage_bps() -> f64 {
    5.0
}

fn default_max_slippage_bps() -> f64 {
    50.0
}

fn default_batch_size() -> usize {
    200
}

fn default_flush_interval_seconds() -> u64 {
    2
}

fn default_max_queue_size() -> usize {
    10_000
}

fn default_stale_threshold_seconds() -> u64 {
    30
}

/// Tunable parameters for the grid strategy (§4.5.1).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GridParams {
    #[serde(default = "default_base_quantity_usd")]
    pub base_quantity_usd: f64,
    #[serde(default = "default_grid_step_pct")]
    pub grid_step_pct: f64,
    #[serde(default = "default_grid_levels")]
    pub grid_levels: u32,
    #[serde(default = "default_take_profit_pct")]
    pub take_profit_pct: f64,
    #[serde(default = "default_max_inventory")]
    pub max_inventory: f64,
    #[serde(default = "default_cooldown_seconds")]
    pub cooldown_seconds: i64,
    #[serde(default = "default_rebalance_threshold")]
    pub rebalance_threshold: f64,
}

fn default_base_quantity_usd() -> f64 {
    20.0
}
fn default_grid_step_pct() -> f64 {
    0.5
}
fn default_grid_levels() -> u32 {
    3
}
fn default_take_profit_pct() -> f64 {
    1.0
}
fn default_max_inventory() -> f64 {
    1.0
}
fn default_cooldown_seconds() -> i64 {
    5
}
fn default_rebalance_threshold() -> f64 {
    0.8
}

impl Default for GridParams {
    fn default() -> Self {
        Self {
            base_quantity_usd: default_base_quantity_usd(),
            grid_step_pct: default_grid_step_pct(),
            grid_levels: default_grid_levels(),
            take_profit_pct: default_take_profit_pct(),
            max_inventory: default_max_inventory(),
            cooldown_seconds: default_cooldown_seconds(),
            rebalance_threshold: default_rebalance_threshold(),
        }
    }
}

/// Tunable parameters for the trend strategy (§4.5.2).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrendParams {
    #[serde(default = "default_fast_ma")]
    pub fast_ma: usize,
    #[serde(default = "default_slow_ma")]
    pub slow_ma: usize,
    #[serde(default = "default_vol_filter_period")]
    pub vol_filter_period: usize,
    #[serde(default = "default_stop_pct")]
    pub stop_pct: f64,
    #[serde(default = "default_trailing_pct")]
    pub trailing_pct: f64,
    #[serde(default = "default_atr_multiplier")]
    pub atr_multiplier: f64,
    #[serde(default = "default_regime_threshold")]
    pub regime_threshold: f64,
    #[serde(default = "default_kelly_fraction")]
    pub kelly_fraction: f64,
    #[serde(default = "default_min_win_probability")]
    pub min_win_probability: f64,
    #[serde(default = "default_max_position_usd")]
    pub max_position_usd: f64,
}

fn default_fast_ma() -> usize {
    20
}
fn default_slow_ma() -> usize {
    60
}
fn default_vol_filter_period() -> usize {
    14
}
fn default_stop_pct() -> f64 {
    2.0
}
fn default_trailing_pct() -> f64 {
    1.5
}
fn default_atr_multiplier() -> f64 {
    2.0
}
fn default_regime_threshold() -> f64 {
    0.02
}
fn default_kelly_fraction() -> f64 {
    0.25
}
fn default_min_win_probability() -> f64 {
    0.45
}
fn default_max_position_usd() -> f64 {
    100.0
}

impl Default for TrendParams {
    fn default() -> Self {
        Self {
            fast_ma: default_fast_ma(),
            slow_ma: default_slow_ma(),
            vol_filter_period: default_vol_filter_period(),
            stop_pct: default_stop_pct(),
            trailing_pct: default_trailing_pct(),
            atr_multiplier: default_atr_multiplier(),
            regime_threshold: default_regime_threshold(),
            kelly_fraction: default_kelly_fraction(),
            min_win_probability: default_min_win_probability(),
            max_position_usd: default_max_position_usd(),
        }
    }
}

/// Top-level runtime configuration for the Sentinel core pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default)]
    pub trading_mode: TradingMode,
    #[serde(default)]
    pub account_mode: AccountMode,

    #[serde(default = "default_symbols")]
    pub symbols: Vec<String>,

    #[serde(default = "default_daily_loss_limit_pct")]
    pub daily_loss_limit_pct: f64,
    #[serde(default = "default_position_limit")]
    pub position_limit: u32,
    #[serde(default = "default_max_position_size_pct")]
    pub max_position_size_pct: f64,
    #[serde(default = "default_notional_cap")]
    pub notional_cap: f64,
    #[serde(default = "default_total_exposure_pct")]
    pub total_exposure_pct: f64,

    #[serde(default = "default_initial_paper_balance")]
    pub initial_paper_balance: f64,
    #[serde(default = "default_maker_fee_bps")]
    pub maker_fee_bps: f64,
    #[serde(default = "default_taker_fee_bps")]
    pub taker_fee_bps: f64,
    #[serde(default = "default_base_slippage_bps")]
    pub base_slippage_bps: f64,
    #[serde(default = "default_max_slippage_bps")]
    pub max_slippage_bps: f64,

    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_flush_interval_seconds")]
    pub flush_interval_seconds: u64,
    #[serde(default = "default_max_queue_size")]
    pub max_queue_size: usize,
    #[serde(default = "default_stale_threshold_seconds")]
    pub stale_threshold_seconds: u64,

    #[serde(default)]
    pub grid: GridParams,
    #[serde(default)]
    pub trend: TrendParams,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            trading_mode: TradingMode::Paused,
            account_mode: AccountMode::Paper,
            symbols: default_symbols(),
            daily_loss_limit_pct: default_daily_loss_limit_pct(),
            position_limit: default_position_limit(),
            max_position_size_pct: default_max_position_size_pct(),
            notional_cap: default_notional_cap(),
            total_exposure_pct: default_total_exposure_pct(),
            initial_paper_balance: default_initial_paper_balance(),
            maker_fee_bps: default_maker_fee_bps(),
            taker_fee_bps: default_taker_fee_bps(),
            base_slippage_bps: default_base_slippage_bps(),
            max_slippage_bps: default_max_slippage_bps(),
            batch_size: default_batch_size(),
            flush_interval_seconds: default_flush_interval_seconds(),
            max_queue_size: default_max_queue_size(),
            stale_threshold_seconds: default_stale_threshold_seconds(),
            grid: GridParams::default(),
            trend: TrendParams::default(),
        }
    }
}

impl RuntimeConfig {
    /// Load configuration from a JSON file at `path`.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read runtime config from {}", path.display()))?;
        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse runtime config from {}", path.display()))?;
        info!(path = %path.display(), symbols = ?config.symbols, "runtime config loaded");
        Ok(config)
    }

    /// Persist the current configuration to `path` using an atomic write
    /// (write to `.tmp`, then rename) so a crash mid-write cannot corrupt it.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let content = serde_json::to_string_pretty(self)
            .context("failed to serialise runtime config to JSON")?;

        let tmp_path = path.with_extension("json.tmp");
        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write tmp config to {}", tmp_path.display()))?;
        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("failed to rename tmp config to {}", path.display()))?;

        info!(path = %path.display(), "runtime config saved (atomic)");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_expected_values() {
        let cfg = RuntimeConfig::default();
        assert_eq!(cfg.trading_mode, TradingMode::Paused);
        assert_eq!(cfg.account_mode, AccountMode::Paper);
        assert_eq!(cfg.position_limit, 10);
        assert!((cfg.daily_loss_limit_pct - 2.0).abs() < f64::EPSILON);
        assert_eq!(cfg.grid.grid_levels, 3);
        assert_eq!(cfg.trend.fast_ma, 20);
    }

    #[test]
    fn deserialise_empty_json_uses_defaults() {
        let cfg: RuntimeConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(cfg.trading_mode, TradingMode::Paused);
        assert_eq!(cfg.position_limit, 10);
        assert_eq!(cfg.grid.grid_levels, 3);
    }

    #[test]
    fn deserialise_partial_json_fills_defaults() {
        let json = r#"{ "trading_mode": "Live", "symbols": ["ETHUSDT"] }"#;
        let cfg: RuntimeConfig = serde_json::from_str(json).unwrap();
        assert_eq!(cfg.trading_mode, TradingMode::Live);
        assert_eq!(cfg.symbols, vec!["ETHUSDT"]);
        assert_eq!(cfg.position_limit, 10);
    }

    #[test]
    fn roundtrip_serialisation() {
        let cfg = RuntimeConfig::default();
        let json = serde_json::to_string(&cfg).unwrap();
        let cfg2: RuntimeConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(cfg.symbols, cfg2.symbols);
        assert_eq!(cfg.notional_cap, cfg2.notional_cap);
    }

    #[test]
    fn atomic_save_and_load_roundtrip() {
        let dir = std::env::temp_dir().join(format!("sentinel-cfg-test-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("config.json");

        let mut cfg = RuntimeConfig::default();
        cfg.symbols = vec!["SOLUSDT".into()];
        cfg.save(&path).unwrap();

        let loaded = RuntimeConfig::load(&path).unwrap();
        assert_eq!(loaded.symbols, vec!["SOLUSDT".to_string()]);

        std::fs::remove_dir_all(&dir).ok();
    }
}
