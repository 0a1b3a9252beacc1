//! Strategy registry: name -> constructor plus parameter schema

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use super::murphy::{MurphyCandles, MurphyCandlesConfig};
use super::rsi::{RsiMeanRevert, RsiMeanRevertConfig};
use super::sma::{SmaCrossover, SmaCrossoverConfig};
use super::traits::StrategyUnit;
use crate::error::{FxError, Result};

/// Free-form strategy parameters as submitted by a caller
pub type StrategyParams = BTreeMap<String, Value>;

type Constructor = fn(&StrategyParams) -> Result<Box<dyn StrategyUnit>>;

/// One tunable parameter
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParamSpec {
    pub name: String,
    /// "integer", "decimal" or "text"
    pub kind: String,
    pub default: Value,
}

impl ParamSpec {
    fn integer(name: &str, default: u64) -> Self {
        Self {
            name: name.to_string(),
            kind: "integer".to_string(),
            default: Value::from(default),
        }
    }

    fn decimal(name: &str, default: &str) -> Self {
        Self {
            name: name.to_string(),
            kind: "decimal".to_string(),
            default: Value::from(default),
        }
    }

    fn text(name: &str, default: &str) -> Self {
        Self {
            name: name.to_string(),
            kind: "text".to_string(),
            default: Value::from(default),
        }
    }
}

/// Information about an available strategy type
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StrategyDescriptor {
    pub name: String,
    pub description: String,
    pub params: Vec<ParamSpec>,
}

struct RegistryEntry {
    descriptor: StrategyDescriptor,
    constructor: Constructor,
}

pub struct StrategyRegistry {
    entries: BTreeMap<String, RegistryEntry>,
}

impl StrategyRegistry {
    pub fn empty() -> Self {
        Self {
            entries: BTreeMap::new(),
        }
    }

    /// Registry with the built-in strategies
    pub fn builtin() -> Self {
        let mut registry = Self::empty();
        registry.register(
            StrategyDescriptor {
                name: SmaCrossover::NAME.to_string(),
                description: "Fast/slow simple moving average crossover".to_string(),
                params: vec![
                    ParamSpec::integer("fast", 10),
                    ParamSpec::integer("slow", 30),
                    ParamSpec::decimal("max_spread_pips", "5"),
                ],
            },
            |params| {
                let config: SmaCrossoverConfig = parse_params(SmaCrossover::NAME, params)?;
                Ok(Box::new(SmaCrossover::new(config)?))
            },
        );
        registry.register(
            StrategyDescriptor {
                name: RsiMeanRevert::NAME.to_string(),
                description: "RSI mean reversion with ATR-based stops".to_string(),
                params: vec![
                    ParamSpec::integer("period", 14),
                    ParamSpec::decimal("oversold", "30"),
                    ParamSpec::decimal("overbought", "70"),
                    ParamSpec::integer("atr_period", 14),
                    ParamSpec::decimal("atr_multiplier", "1.5"),
                ],
            },
            |params| {
                let config: RsiMeanRevertConfig = parse_params(RsiMeanRevert::NAME, params)?;
                Ok(Box::new(RsiMeanRevert::new(config)?))
            },
        );
        registry.register(
            StrategyDescriptor {
                name: MurphyCandles::NAME.to_string(),
                description: "Candle patterns filtered by EMA trend, RSI and MACD; ATR stops and targets"
                    .to_string(),
                params: vec![
                    ParamSpec::integer("atr_period", 14),
                    ParamSpec::decimal("atr_mult_sl", "1.5"),
                    ParamSpec::decimal("atr_mult_tp", "2.0"),
                    ParamSpec::text(
                        "patterns",
                        "engulfing,hammer,shooting_star,harami,morning_star,evening_star,pin_bar",
                    ),
                    ParamSpec::integer("fast_ma", 9),
                    ParamSpec::integer("slow_ma", 21),
                    ParamSpec::integer("rsi_period", 14),
                    ParamSpec::decimal("rsi_overbought", "70"),
                    ParamSpec::decimal("rsi_oversold", "30"),
                    ParamSpec::integer("macd_fast", 12),
                    ParamSpec::integer("macd_slow", 26),
                    ParamSpec::integer("macd_signal", 9),
                    ParamSpec::integer("cooldown_bars", 3),
                    ParamSpec::integer("max_trades_per_day", 10),
                    ParamSpec::text("trade_sides", "both"),
                ],
            },
            |params| {
                let config: MurphyCandlesConfig = parse_params(MurphyCandles::NAME, params)?;
                Ok(Box::new(MurphyCandles::new(config)?))
            },
        );
        registry
    }

    /// Add or replace a strategy type
    pub fn register(&mut self, descriptor: StrategyDescriptor, constructor: Constructor) {
        self.entries.insert(
            descriptor.name.clone(),
            RegistryEntry {
                descriptor,
                constructor,
            },
        );
    }

    /// Descriptors sorted by name
    pub fn list_strategies(&self) -> Vec<StrategyDescriptor> {
        self.entries.values().map(|e| e.descriptor.clone()).collect()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    pub fn create_strategy(&self, name: &str, params: &StrategyParams) -> Result<Box<dyn StrategyUnit>> {
        let entry = self
            .entries
            .get(name)
            .ok_or_else(|| FxError::UnknownStrategy(name.to_string()))?;
        (entry.constructor)(params)
    }
}

impl Default for StrategyRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}

fn parse_params<T: serde::de::DeserializeOwned>(name: &str, params: &StrategyParams) -> Result<T> {
    let object: serde_json::Map<String, Value> = params.clone().into_iter().collect();
    serde_json::from_value(Value::Object(object))
        .map_err(|e| FxError::InvalidParams(format!("{name}: {e}")))
}
