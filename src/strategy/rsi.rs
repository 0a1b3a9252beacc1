//! RSI mean reversion
//!
//! Buys oversold and sells overbought conditions. When enough bars exist the
//! stop distance is derived from ATR, otherwise the session default applies.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::indicators::{AtrState, RsiState};
use super::traits::{Direction, Signal, SignalSlot, StrategyContext, StrategyUnit};
use crate::domain::{pip_size, PriceBar};
use crate::error::{FxError, Result};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RsiMeanRevertConfig {
    pub period: usize,
    pub oversold: Decimal,
    pub overbought: Decimal,
    pub atr_period: usize,
    pub atr_multiplier: Decimal,
}

impl Default for RsiMeanRevertConfig {
    fn default() -> Self {
        Self {
            period: 14,
            oversold: dec!(30),
            overbought: dec!(70),
            atr_period: 14,
            atr_multiplier: dec!(1.5),
        }
    }
}

impl RsiMeanRevertConfig {
    pub fn validate(&self) -> Result<()> {
        if self.period < 2 || self.atr_period == 0 {
            return Err(FxError::InvalidParams("rsi periods too short".into()));
        }
        if self.oversold <= Decimal::ZERO
            || self.overbought >= Decimal::ONE_HUNDRED
            || self.oversold >= self.overbought
        {
            return Err(FxError::InvalidParams(format!(
                "rsi thresholds must satisfy 0 < oversold ({}) < overbought ({}) < 100",
                self.oversold, self.overbought
            )));
        }
        if self.atr_multiplier <= Decimal::ZERO {
            return Err(FxError::InvalidParams("atr_multiplier must be positive".into()));
        }
        Ok(())
    }
}

pub struct RsiMeanRevert {
    config: RsiMeanRevertConfig,
    rsi: RsiState,
    atr: AtrState,
    pip: Decimal,
    slot: SignalSlot,
}

impl RsiMeanRevert {
    pub const NAME: &'static str = "rsi";

    pub fn new(config: RsiMeanRevertConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            rsi: RsiState::new(config.period),
            atr: AtrState::new(config.atr_period),
            config,
            pip: dec!(0.0001),
            slot: SignalSlot::default(),
        })
    }
}

impl StrategyUnit for RsiMeanRevert {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn on_startup(&mut self, ctx: &StrategyContext) {
        self.rsi.reset();
        self.atr.reset();
        self.slot.reset();
        self.pip = pip_size(&ctx.instrument);
    }

    fn on_bar_close(&mut self, bar: &PriceBar) {
        let volatility = self.atr.update(bar.high, bar.low, bar.close);
        let Some(value) = self.rsi.update(bar.close) else {
            return;
        };

        let (direction, distance, reason) = if value < self.config.oversold {
            (Direction::Long, self.config.oversold - value, "rsi_oversold")
        } else if value > self.config.overbought {
            (Direction::Short, value - self.config.overbought, "rsi_overbought")
        } else {
            return;
        };

        let stop_pips = volatility
            .map(|atr| (atr * self.config.atr_multiplier / self.pip).round_dp(1))
            .filter(|pips| *pips > Decimal::ZERO);
        let confidence = distance / self.config.oversold.min(Decimal::ONE_HUNDRED - self.config.overbought);

        let signal = Signal::new(direction, confidence, reason, bar.close_time())
            .with_stop(stop_pips)
            .with_meta("rsi", serde_json::json!(value.round_dp(2).to_string()));
        if self.slot.emit(signal) {
            debug!("rsi: {} signal at {} (rsi {})", direction, bar.open_time, value.round_dp(2));
        }
    }

    fn get_signal(&self) -> Option<&Signal> {
        self.slot.pending()
    }

    fn take_signal(&mut self) -> Option<Signal> {
        self.slot.take()
    }

    fn on_stop(&mut self) {
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

    fn feed(strategy: &mut RsiMeanRevert, closes: impl IntoIterator<Item = Decimal>) -> Vec<Signal> {
        let start = Utc.with_ymd_and_hms(2024, 4, 1, 0, 0, 0).unwrap();
        let mut out = Vec::new();
        for (i, close) in closes.into_iter().enumerate() {
            let bar = PriceBar {
                instrument: "EUR_USD".into(),
                granularity: Granularity::M15,
                open_time: start + Duration::minutes(15 * i as i64),
                open: close,
                high: close + dec!(0.0005),
                low: close - dec!(0.0005),
                close,
                volume: dec!(1),
            };
            strategy.on_bar_close(&bar);
            if let Some(signal) = strategy.take_signal() {
                out.push(signal);
            }
        }
        out
    }

    fn started() -> RsiMeanRevert {
        let mut s = RsiMeanRevert::new(RsiMeanRevertConfig {
            period: 5,
            atr_period: 3,
            ..Default::default()
        })
        .unwrap();
        s.on_startup(&StrategyContext::new(
            Uuid::nil(),
            "EUR_USD",
            Granularity::M15,
            RiskConfig::default().to_parameters(),
        ));
        s
    }

    #[test]
    fn test_falling_prices_signal_long_once_with_atr_stop() {
        let mut strategy = started();
        let signals = feed(&mut strategy, (0..20).map(|i| dec!(1.2000) - Decimal::from(i) * dec!(0.0010)));

        assert_eq!(signals.len(), 1);
        assert_eq!(signals[0].direction, Direction::Long);
        assert_eq!(signals[0].reason, "rsi_oversold");
        // True range never exceeds 15 pips on this series
        let stop = signals[0].stop_distance_pips.unwrap();
        assert!(stop > Decimal::ZERO && stop <= dec!(22.5), "stop {stop}");
    }

    #[test]
    fn test_rising_prices_signal_short() {
        let mut strategy = started();
        let signals = feed(&mut strategy, (0..20).map(|i| dec!(1.2000) + Decimal::from(i) * dec!(0.0010)));
        assert_eq!(signals.len(), 1);
        assert_eq!(signals[0].direction, Direction::Short);
    }

    #[test]
    fn test_thresholds_validated() {
        let bad = RsiMeanRevertConfig {
            oversold: dec!(80),
            ..Default::default()
        };
        assert!(RsiMeanRevert::new(bad).is_err());
    }
}
