//! Strategy module
//!
//! Signal generators and the registry that builds them by name.
//!
//! ## Architecture
//!
//! - `traits` - `StrategyUnit`, `Signal`, and the pending-signal slot
//! - `indicators` - streaming SMA/EMA/RSI/ATR/MACD state
//! - `patterns` - candlestick pattern detection
//! - `sma`, `rsi`, `murphy` - built-in strategies
//! - `registry` - name -> constructor with parameter schema

// =============================================================================
// Strategy trait and core types
// =============================================================================

pub mod traits;

pub use traits::{Direction, Signal, SignalSlot, StrategyContext, StrategyUnit};

// =============================================================================
// Built-in strategies
// =============================================================================

pub mod indicators;
pub mod murphy;
pub mod patterns;
pub mod registry;
pub mod rsi;
pub mod sma;

pub use murphy::{MurphyCandles, MurphyCandlesConfig, TradeSides};
pub use patterns::{PatternBias, PatternKind, PatternMatch};
pub use registry::{ParamSpec, StrategyDescriptor, StrategyParams, StrategyRegistry};
pub use rsi::{RsiMeanRevert, RsiMeanRevertConfig};
pub use sma::{SmaCrossover, SmaCrossoverConfig};
