//! Candlestick pattern detection over the most recent closed bars

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

use crate::domain::PriceBar;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PatternKind {
    Engulfing,
    Hammer,
    ShootingStar,
    Doji,
    Harami,
    MorningStar,
    EveningStar,
    PinBar,
}

impl PatternKind {
    pub const ALL: [PatternKind; 8] = [
        PatternKind::Engulfing,
        PatternKind::Hammer,
        PatternKind::ShootingStar,
        PatternKind::Doji,
        PatternKind::Harami,
        PatternKind::MorningStar,
        PatternKind::EveningStar,
        PatternKind::PinBar,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            PatternKind::Engulfing => "engulfing",
            PatternKind::Hammer => "hammer",
            PatternKind::ShootingStar => "shooting_star",
            PatternKind::Doji => "doji",
            PatternKind::Harami => "harami",
            PatternKind::MorningStar => "morning_star",
            PatternKind::EveningStar => "evening_star",
            PatternKind::PinBar => "pin_bar",
        }
    }

    fn detect(&self, bars: &[PriceBar]) -> Option<PatternMatch> {
        match self {
            PatternKind::Engulfing => engulfing(bars),
            PatternKind::Hammer => hammer(bars),
            PatternKind::ShootingStar => shooting_star(bars),
            PatternKind::Doji => doji(bars),
            PatternKind::Harami => harami(bars),
            PatternKind::MorningStar => morning_star(bars),
            PatternKind::EveningStar => evening_star(bars),
            PatternKind::PinBar => pin_bar(bars),
        }
    }
}

impl std::fmt::Display for PatternKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PatternKind {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let wanted = raw.trim().to_ascii_lowercase();
        PatternKind::ALL
            .into_iter()
            .find(|k| k.as_str() == wanted)
            .ok_or_else(|| format!("unknown candle pattern '{raw}'"))
    }
}

/// Direction a pattern points to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PatternBias {
    Bull,
    Bear,
    Neutral,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatternMatch {
    pub kind: PatternKind,
    pub bias: PatternBias,
    /// In [0, 1]
    pub confidence: Decimal,
}

impl PatternMatch {
    fn new(kind: PatternKind, bias: PatternBias, confidence: Decimal) -> Self {
        Self { kind, bias, confidence }
    }
}

fn body(bar: &PriceBar) -> Decimal {
    (bar.close - bar.open).abs()
}

/// Flat candles count as bullish
fn bias_of(bar: &PriceBar) -> PatternBias {
    if bar.close >= bar.open {
        PatternBias::Bull
    } else {
        PatternBias::Bear
    }
}

fn upper_wick(bar: &PriceBar) -> Decimal {
    bar.high - bar.open.max(bar.close)
}

fn lower_wick(bar: &PriceBar) -> Decimal {
    bar.open.min(bar.close) - bar.low
}

fn last_n(bars: &[PriceBar], n: usize) -> Option<&[PriceBar]> {
    bars.len().checked_sub(n).map(|start| &bars[start..])
}

pub fn engulfing(bars: &[PriceBar]) -> Option<PatternMatch> {
    let [prev, current] = last_n(bars, 2)? else {
        return None;
    };
    if bias_of(current) == bias_of(prev) || body(current) <= body(prev) {
        return None;
    }
    let ratio = if body(prev).is_zero() {
        dec!(3)
    } else {
        (body(current) / body(prev)).min(dec!(3))
    };
    Some(PatternMatch::new(PatternKind::Engulfing, bias_of(current), ratio / dec!(3)))
}

pub fn hammer(bars: &[PriceBar]) -> Option<PatternMatch> {
    let [c] = last_n(bars, 1)? else {
        return None;
    };
    if lower_wick(c) < body(c) * dec!(2) || upper_wick(c) > body(c) {
        return None;
    }
    Some(PatternMatch::new(PatternKind::Hammer, PatternBias::Bull, dec!(0.6)))
}

pub fn shooting_star(bars: &[PriceBar]) -> Option<PatternMatch> {
    let [c] = last_n(bars, 1)? else {
        return None;
    };
    if upper_wick(c) < body(c) * dec!(2) {
        return None;
    }
    if lower_wick(c) > (body(c) * dec!(2)).max(c.range() * dec!(0.35)) {
        return None;
    }
    Some(PatternMatch::new(PatternKind::ShootingStar, PatternBias::Bear, dec!(0.6)))
}

pub fn doji(bars: &[PriceBar]) -> Option<PatternMatch> {
    let [c] = last_n(bars, 1)? else {
        return None;
    };
    if body(c) > c.range() * dec!(0.1) {
        return None;
    }
    Some(PatternMatch::new(PatternKind::Doji, PatternBias::Neutral, dec!(0.4)))
}

pub fn harami(bars: &[PriceBar]) -> Option<PatternMatch> {
    let [prev, current] = last_n(bars, 2)? else {
        return None;
    };
    if bias_of(prev) == bias_of(current) {
        return None;
    }
    let lo = prev.open.min(prev.close);
    let hi = prev.open.max(prev.close);
    let inside = |p: Decimal| lo <= p && p <= hi;
    if !inside(current.open) || !inside(current.close) {
        return None;
    }
    Some(PatternMatch::new(PatternKind::Harami, bias_of(prev), dec!(0.5)))
}

fn star(bars: &[PriceBar], first_bias: PatternBias) -> Option<()> {
    let [first, second, third] = last_n(bars, 3)? else {
        return None;
    };
    let third_bias = match first_bias {
        PatternBias::Bear => PatternBias::Bull,
        _ => PatternBias::Bear,
    };
    if bias_of(first) != first_bias || bias_of(third) != third_bias {
        return None;
    }
    if body(second) > body(first) * dec!(0.6) {
        return None;
    }
    let midpoint = (first.open + first.close) / dec!(2);
    let recovers = match third_bias {
        PatternBias::Bull => third.close > midpoint,
        _ => third.close < midpoint,
    };
    recovers.then_some(())
}

pub fn morning_star(bars: &[PriceBar]) -> Option<PatternMatch> {
    star(bars, PatternBias::Bear)?;
    Some(PatternMatch::new(PatternKind::MorningStar, PatternBias::Bull, dec!(0.7)))
}

pub fn evening_star(bars: &[PriceBar]) -> Option<PatternMatch> {
    star(bars, PatternBias::Bull)?;
    Some(PatternMatch::new(PatternKind::EveningStar, PatternBias::Bear, dec!(0.7)))
}

pub fn pin_bar(bars: &[PriceBar]) -> Option<PatternMatch> {
    let [c] = last_n(bars, 1)? else {
        return None;
    };
    let range = c.range();
    if range.is_zero() {
        return None;
    }
    let bias = bias_of(c);
    if bias == PatternBias::Bear && upper_wick(c) / range > dec!(0.66) {
        return Some(PatternMatch::new(PatternKind::PinBar, PatternBias::Bear, dec!(0.6)));
    }
    if bias == PatternBias::Bull && lower_wick(c) / range > dec!(0.66) {
        return Some(PatternMatch::new(PatternKind::PinBar, PatternBias::Bull, dec!(0.6)));
    }
    None
}

/// Matches of the `enabled` patterns on the latest bars, in `enabled` order
pub fn detect_patterns(bars: &[PriceBar], enabled: &[PatternKind]) -> Vec<PatternMatch> {
    enabled.iter().filter_map(|kind| kind.detect(bars)).collect()
}
