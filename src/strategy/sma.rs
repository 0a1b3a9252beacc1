//! Moving-average crossover
//!
//! Goes long when the fast SMA is above the slow SMA and short when below.
//! A direction is emitted once; it must flip before another signal appears.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::indicators::SmaState;
use super::traits::{Direction, Signal, SignalSlot, StrategyContext, StrategyUnit};
use crate::domain::{pip_size, PriceBar, Quote};
use crate::error::{FxError, Result};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SmaCrossoverConfig {
    pub fast: usize,
    pub slow: usize,
    /// Bars whose quoted spread exceeds this are ignored
    pub max_spread_pips: Decimal,
}

impl Default for SmaCrossoverConfig {
    fn default() -> Self {
        Self {
            fast: 10,
            slow: 30,
            max_spread_pips: dec!(5),
        }
    }
}

impl SmaCrossoverConfig {
    pub fn validate(&self) -> Result<()> {
        if self.fast == 0 || self.slow == 0 {
            return Err(FxError::InvalidParams("sma periods must be positive".into()));
        }
        if self.fast >= self.slow {
            return Err(FxError::InvalidParams(format!(
                "sma fast ({}) must be shorter than slow ({})",
                self.fast, self.slow
            )));
        }
        Ok(())
    }
}

pub struct SmaCrossover {
    config: SmaCrossoverConfig,
    fast: SmaState,
    slow: SmaState,
    pip: Decimal,
    last_spread: Option<Decimal>,
    slot: SignalSlot,
}

impl SmaCrossover {
    pub const NAME: &'static str = "sma";

    pub fn new(config: SmaCrossoverConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            fast: SmaState::new(config.fast),
            slow: SmaState::new(config.slow),
            config,
            pip: dec!(0.0001),
            last_spread: None,
            slot: SignalSlot::default(),
        })
    }
}

impl StrategyUnit for SmaCrossover {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn on_startup(&mut self, ctx: &StrategyContext) {
        self.fast.reset();
        self.slow.reset();
        self.slot.reset();
        self.last_spread = None;
        self.pip = pip_size(&ctx.instrument);
    }

    fn on_price_tick(&mut self, quote: &Quote) {
        self.last_spread = Some(quote.spread());
    }

    fn on_bar_close(&mut self, bar: &PriceBar) {
        let fast = self.fast.update(bar.close);
        let slow = self.slow.update(bar.close);

        if let Some(spread) = self.last_spread.take() {
            if spread > self.config.max_spread_pips * self.pip {
                debug!("sma: spread {} too wide on {}, skipping", spread, bar.open_time);
                return;
            }
        }

        let (Some(fast), Some(slow)) = (fast, slow) else {
            return;
        };

        let direction = if fast > slow {
            Direction::Long
        } else if fast < slow {
            Direction::Short
        } else {
            return;
        };

        // Ten pips of separation counts as full conviction
        let gap_pips = (fast - slow).abs() / self.pip;
        let confidence = gap_pips / dec!(10);
        let reason = match direction {
            Direction::Long => "fast_above_slow",
            _ => "fast_below_slow",
        };

        let signal = Signal::new(direction, confidence, reason, bar.close_time())
            .with_meta("fast", serde_json::json!(fast.round_dp(6).to_string()))
            .with_meta("slow", serde_json::json!(slow.round_dp(6).to_string()));
        if self.slot.emit(signal) {
            debug!("sma: {} signal at {}", direction, bar.open_time);
        }
    }

    fn get_signal(&self) -> Option<&Signal> {
        self.slot.pending()
    }

    fn take_signal(&mut self) -> Option<Signal> {
        self.slot.take()
    }

    fn on_stop(&mut self) {
        self.fast.reset();
        self.slow.reset();
        self.slot.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RiskConfig;
    use crate::domain::Granularity;
    use chrono::{Duration, TimeZone, Utc};
    use uuid::Uuid;

    fn ctx() -> StrategyContext {
        StrategyContext::new(
            Uuid::nil(),
            "EUR_USD",
            Granularity::H1,
            RiskConfig::default().to_parameters(),
        )
    }

    fn bars(closes: &[Decimal]) -> Vec<PriceBar> {
        let start = Utc.with_ymd_and_hms(2024, 2, 1, 0, 0, 0).unwrap();
        closes
            .iter()
            .enumerate()
            .map(|(i, c)| PriceBar {
                instrument: "EUR_USD".into(),
                granularity: Granularity::H1,
                open_time: start + Duration::hours(i as i64),
                open: *c,
                high: *c,
                low: *c,
                close: *c,
                volume: dec!(1),
            })
            .collect()
    }

    #[test]
    fn test_rising_series_emits_single_long() {
        let mut strategy = SmaCrossover::new(SmaCrossoverConfig {
            fast: 5,
            slow: 20,
            ..Default::default()
        })
        .unwrap();
        strategy.on_startup(&ctx());

        let closes: Vec<Decimal> = (0..30).map(|i| dec!(1.1000) + Decimal::from(i) * dec!(0.0010)).collect();
        let mut emitted = Vec::new();
        for bar in bars(&closes) {
            strategy.on_bar_close(&bar);
            if let Some(signal) = strategy.take_signal() {
                emitted.push(signal);
            }
        }

        assert_eq!(emitted.len(), 1);
        assert_eq!(emitted[0].direction, Direction::Long);
        assert_eq!(emitted[0].confidence, Decimal::ONE);
    }

    #[test]
    fn test_reversal_emits_short() {
        let mut strategy = SmaCrossover::new(SmaCrossoverConfig {
            fast: 2,
            slow: 4,
            ..Default::default()
        })
        .unwrap();
        strategy.on_startup(&ctx());

        let closes = [dec!(1.0), dec!(1.1), dec!(1.2), dec!(1.3), dec!(1.0), dec!(0.8)];
        let mut directions = Vec::new();
        for bar in bars(&closes) {
            strategy.on_bar_close(&bar);
            if let Some(signal) = strategy.take_signal() {
                directions.push(signal.direction);
            }
        }
        assert_eq!(directions, vec![Direction::Long, Direction::Short]);
    }

    #[test]
    fn test_wide_spread_suppresses_signal() {
        let mut strategy = SmaCrossover::new(SmaCrossoverConfig {
            fast: 1,
            slow: 2,
            max_spread_pips: dec!(2),
        })
        .unwrap();
        strategy.on_startup(&ctx());

        for bar in bars(&[dec!(1.0), dec!(1.1)]) {
            strategy.on_price_tick(&bar.to_quote(dec!(0.0005)));
            strategy.on_bar_close(&bar);
        }
        assert!(strategy.get_signal().is_none());
    }

    #[test]
    fn test_invalid_periods_rejected() {
        let result = SmaCrossover::new(SmaCrossoverConfig {
            fast: 30,
            slow: 10,
            ..Default::default()
        });
        assert!(matches!(result, Err(FxError::InvalidParams(_))));
    }
}
