//! Candlestick patterns confirmed by trend and momentum
//!
//! A signal needs three things on the same closed bar:
//! 1. Trend: fast EMA above slow EMA with the close above the slow EMA (long),
//!    or the mirror image (short).
//! 2. Momentum: RSI not stretched in the trade direction and MACD above its
//!    signal line with a positive histogram (long), or the mirror image.
//! 3. A candle pattern whose bias agrees with the trend, or a neutral one.
//!
//! Stops and targets are ATR multiples. After a signal the strategy sits out
//! `cooldown_bars - 1` bars, and it emits at most `max_trades_per_day` signals
//! per UTC day (0 disables the cap). Repeated directions are allowed.

use chrono::NaiveDate;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::VecDeque;
use tracing::debug;

use super::indicators::{AtrState, EmaState, MacdState, RsiState};
use super::patterns::{detect_patterns, PatternBias, PatternKind, PatternMatch};
use super::traits::{Direction, Signal, SignalSlot, StrategyContext, StrategyUnit};
use crate::domain::{pip_size, PriceBar, Quote};
use crate::error::{FxError, Result};

/// Longest lookback any pattern needs
const PATTERN_WINDOW: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TradeSides {
    #[default]
    Both,
    Long,
    Short,
}

impl TradeSides {
    fn allows(&self, direction: Direction) -> bool {
        match self {
            TradeSides::Both => true,
            TradeSides::Long => direction == Direction::Long,
            TradeSides::Short => direction == Direction::Short,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MurphyCandlesConfig {
    pub atr_period: usize,
    pub atr_mult_sl: Decimal,
    pub atr_mult_tp: Decimal,
    /// Bars whose quoted spread exceeds this are ignored
    pub max_spread_pips: Option<Decimal>,
    /// List of names or a comma-separated string
    #[serde(deserialize_with = "pattern_list")]
    pub patterns: Vec<PatternKind>,
    pub fast_ma: usize,
    pub slow_ma: usize,
    pub rsi_period: usize,
    pub rsi_overbought: Decimal,
    pub rsi_oversold: Decimal,
    pub macd_fast: usize,
    pub macd_slow: usize,
    pub macd_signal: usize,
    pub cooldown_bars: u32,
    pub max_trades_per_day: u32,
    pub trade_sides: TradeSides,
}

impl Default for MurphyCandlesConfig {
    fn default() -> Self {
        Self {
            atr_period: 14,
            atr_mult_sl: dec!(1.5),
            atr_mult_tp: dec!(2.0),
            max_spread_pips: None,
            patterns: vec![
                PatternKind::Engulfing,
                PatternKind::Hammer,
                PatternKind::ShootingStar,
                PatternKind::Harami,
                PatternKind::MorningStar,
                PatternKind::EveningStar,
                PatternKind::PinBar,
            ],
            fast_ma: 9,
            slow_ma: 21,
            rsi_period: 14,
            rsi_overbought: dec!(70),
            rsi_oversold: dec!(30),
            macd_fast: 12,
            macd_slow: 26,
            macd_signal: 9,
            cooldown_bars: 3,
            max_trades_per_day: 10,
            trade_sides: TradeSides::Both,
        }
    }
}

fn pattern_list<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Vec<PatternKind>, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Names(Vec<PatternKind>),
        Csv(String),
    }

    match Raw::deserialize(deserializer)? {
        Raw::Names(names) => Ok(names),
        Raw::Csv(csv) => csv
            .split(',')
            .filter(|s| !s.trim().is_empty())
            .map(|s| s.parse().map_err(serde::de::Error::custom))
            .collect(),
    }
}

impl MurphyCandlesConfig {
    pub fn validate(&self) -> Result<()> {
        if self.atr_period == 0 || self.rsi_period < 2 || self.macd_signal == 0 {
            return Err(FxError::InvalidParams("murphy periods too short".into()));
        }
        if self.fast_ma == 0 || self.fast_ma >= self.slow_ma {
            return Err(FxError::InvalidParams(format!(
                "fast_ma ({}) must be positive and shorter than slow_ma ({})",
                self.fast_ma, self.slow_ma
            )));
        }
        if self.macd_fast == 0 || self.macd_fast >= self.macd_slow {
            return Err(FxError::InvalidParams(format!(
                "macd_fast ({}) must be positive and shorter than macd_slow ({})",
                self.macd_fast, self.macd_slow
            )));
        }
        if self.rsi_oversold <= Decimal::ZERO
            || self.rsi_overbought >= Decimal::ONE_HUNDRED
            || self.rsi_oversold >= self.rsi_overbought
        {
            return Err(FxError::InvalidParams(format!(
                "rsi thresholds must satisfy 0 < oversold ({}) < overbought ({}) < 100",
                self.rsi_oversold, self.rsi_overbought
            )));
        }
        if self.atr_mult_sl <= Decimal::ZERO || self.atr_mult_tp <= Decimal::ZERO {
            return Err(FxError::InvalidParams("atr multipliers must be positive".into()));
        }
        if self.patterns.is_empty() {
            return Err(FxError::InvalidParams("at least one candle pattern is required".into()));
        }
        Ok(())
    }
}

pub struct MurphyCandles {
    config: MurphyCandlesConfig,
    atr: AtrState,
    fast: EmaState,
    slow: EmaState,
    rsi: RsiState,
    macd: MacdState,
    recent: VecDeque<PriceBar>,
    pip: Decimal,
    last_spread: Option<Decimal>,
    cooldown: u32,
    trades_today: u32,
    day: Option<NaiveDate>,
    slot: SignalSlot,
}

impl MurphyCandles {
    pub const NAME: &'static str = "murphy_candles_v1";

    pub fn new(config: MurphyCandlesConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            atr: AtrState::new(config.atr_period),
            fast: EmaState::new(config.fast_ma),
            slow: EmaState::new(config.slow_ma),
            rsi: RsiState::new(config.rsi_period),
            macd: MacdState::new(config.macd_fast, config.macd_slow, config.macd_signal),
            config,
            recent: VecDeque::with_capacity(PATTERN_WINDOW + 1),
            pip: dec!(0.0001),
            last_spread: None,
            cooldown: 0,
            trades_today: 0,
            day: None,
            slot: SignalSlot::default(),
        })
    }

    fn reset_state(&mut self) {
        self.atr.reset();
        self.fast.reset();
        self.slow.reset();
        self.rsi.reset();
        self.macd.reset();
        self.recent.clear();
        self.last_spread = None;
        self.cooldown = 0;
        self.trades_today = 0;
        self.day = None;
    }

    /// Latest pattern agreeing with `direction`
    fn confirming_pattern(&mut self, direction: Direction) -> Option<PatternMatch> {
        let wanted = match direction {
            Direction::Long => PatternBias::Bull,
            _ => PatternBias::Bear,
        };
        detect_patterns(self.recent.make_contiguous(), &self.config.patterns)
            .into_iter()
            .rev()
            .find(|m| m.bias == wanted || m.bias == PatternBias::Neutral)
    }
}

impl StrategyUnit for MurphyCandles {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn on_startup(&mut self, ctx: &StrategyContext) {
        self.reset_state();
        self.slot.reset();
        self.pip = pip_size(&ctx.instrument);
    }

    fn on_price_tick(&mut self, quote: &Quote) {
        self.last_spread = Some(quote.spread());
    }

    fn on_bar_close(&mut self, bar: &PriceBar) {
        self.recent.push_back(bar.clone());
        while self.recent.len() > PATTERN_WINDOW {
            self.recent.pop_front();
        }

        self.cooldown = self.cooldown.saturating_sub(1);
        let day = bar.close_time().date_naive();
        if self.day != Some(day) {
            self.day = Some(day);
            self.trades_today = 0;
            self.cooldown = 0;
        }

        let atr = self.atr.update(bar.high, bar.low, bar.close);
        let fast = self.fast.update(bar.close);
        let slow = self.slow.update(bar.close);
        let rsi = self.rsi.update(bar.close);
        let macd = self.macd.update(bar.close);

        if let (Some(spread), Some(max)) = (self.last_spread.take(), self.config.max_spread_pips) {
            if spread > max * self.pip {
                debug!("murphy: spread {} too wide on {}, skipping", spread, bar.open_time);
                return;
            }
        }

        let (Some(atr), Some(rsi)) = (atr, rsi) else {
            return;
        };
        if self.cooldown > 0 {
            return;
        }
        if self.config.max_trades_per_day > 0 && self.trades_today >= self.config.max_trades_per_day {
            return;
        }

        let direction = if fast > slow && bar.close > slow {
            Direction::Long
        } else if fast < slow && bar.close < slow {
            Direction::Short
        } else {
            return;
        };
        if !self.config.trade_sides.allows(direction) {
            return;
        }

        let momentum_ok = match direction {
            Direction::Long => {
                rsi < self.config.rsi_overbought && macd.macd > macd.signal && macd.histogram > Decimal::ZERO
            }
            _ => rsi > self.config.rsi_oversold && macd.macd < macd.signal && macd.histogram < Decimal::ZERO,
        };
        if !momentum_ok {
            return;
        }

        let Some(pattern) = self.confirming_pattern(direction) else {
            return;
        };

        let stop_pips = (atr * self.config.atr_mult_sl / self.pip).round_dp(1);
        let target_pips = (atr * self.config.atr_mult_tp / self.pip).round_dp(1);
        if stop_pips <= Decimal::ZERO {
            return;
        }

        let signal = Signal::new(
            direction,
            pattern.confidence,
            format!("{}_{}", pattern.kind, direction),
            bar.close_time(),
        )
        .with_stop(Some(stop_pips))
        .with_target(Some(target_pips))
        .with_meta("pattern", serde_json::json!(pattern.kind.as_str()))
        .with_meta("rsi", serde_json::json!(rsi.round_dp(2).to_string()))
        .with_meta("macd_gap", serde_json::json!((macd.macd - macd.signal).round_dp(8).to_string()));
        self.slot.replace(signal);

        self.cooldown = self.config.cooldown_bars;
        self.trades_today += 1;
        debug!(
            "murphy: {} {} at {} ({} today)",
            pattern.kind, direction, bar.open_time, self.trades_today
        );
    }

    fn get_signal(&self) -> Option<&Signal> {
        self.slot.pending()
    }

    fn take_signal(&mut self) -> Option<Signal> {
        self.slot.take()
    }

    fn on_stop(&mut self) {
        self.reset_state();
        self.slot.clear();
    }
}
