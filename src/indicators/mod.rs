// =============================================================================
// Technical Indicators
// =============================================================================
//
// Pure, side-effect-free implementations of the indicators the strategy
// engine needs. Every function operates on plain `f64` slices so strategies
// stay free of I/O and of the Decimal money type used elsewhere in the
// crate — indicator math tolerates float rounding (§9 decimal-vs-float note).

pub mod atr;
pub mod ema;
