//! Streaming technical indicators

use rust_decimal::Decimal;
use std::collections::VecDeque;

/// Simple moving average over a fixed window
#[derive(Debug, Clone)]
pub struct SmaState {
    period: usize,
    window: VecDeque<Decimal>,
    sum: Decimal,
}

impl SmaState {
    pub fn new(period: usize) -> Self {
        Self {
            period: period.max(1),
            window: VecDeque::with_capacity(period.max(1)),
            sum: Decimal::ZERO,
        }
    }

    pub fn update(&mut self, value: Decimal) -> Option<Decimal> {
        self.window.push_back(value);
        self.sum += value;
        if self.window.len() > self.period {
            if let Some(old) = self.window.pop_front() {
                self.sum -= old;
            }
        }
        self.value()
    }

    pub fn value(&self) -> Option<Decimal> {
        if self.window.len() < self.period {
            return None;
        }
        Some(self.sum / Decimal::from(self.period as u64))
    }

    pub fn reset(&mut self) {
        self.window.clear();
        self.sum = Decimal::ZERO;
    }
}

/// Exponential moving average seeded with the first value
#[derive(Debug, Clone)]
pub struct EmaState {
    period: usize,
    alpha: Decimal,
    value: Option<Decimal>,
}

impl EmaState {
    pub fn new(period: usize) -> Self {
        let period = period.max(1);
        Self {
            period,
            alpha: Decimal::TWO / Decimal::from(period as u64 + 1),
            value: None,
        }
    }

    pub fn update(&mut self, price: Decimal) -> Decimal {
        let next = match self.value {
            None => price,
            Some(prev) => prev + self.alpha * (price - prev),
        };
        self.value = Some(next);
        next
    }

    pub fn value(&self) -> Option<Decimal> {
        self.value
    }

    pub fn reset(&mut self) {
        *self = Self::new(self.period);
    }
}

/// MACD line, signal line and histogram for one bar
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MacdValue {
    pub macd: Decimal,
    pub signal: Decimal,
    pub histogram: Decimal,
}

#[derive(Debug, Clone)]
pub struct MacdState {
    fast: EmaState,
    slow: EmaState,
    signal: EmaState,
}

impl MacdState {
    pub fn new(fast: usize, slow: usize, signal: usize) -> Self {
        Self {
            fast: EmaState::new(fast),
            slow: EmaState::new(slow),
            signal: EmaState::new(signal),
        }
    }

    pub fn update(&mut self, price: Decimal) -> MacdValue {
        let macd = self.fast.update(price) - self.slow.update(price);
        let signal = self.signal.update(macd);
        MacdValue {
            macd,
            signal,
            histogram: macd - signal,
        }
    }

    pub fn reset(&mut self) {
        self.fast.reset();
        self.slow.reset();
        self.signal.reset();
    }
}

/// Wilder RSI; needs `period` price changes before producing a value
#[derive(Debug, Clone)]
pub struct RsiState {
    period: usize,
    avg_gain: Decimal,
    avg_loss: Decimal,
    changes: usize,
    last: Option<Decimal>,
}

impl RsiState {
    pub fn new(period: usize) -> Self {
        Self {
            period: period.max(1),
            avg_gain: Decimal::ZERO,
            avg_loss: Decimal::ZERO,
            changes: 0,
            last: None,
        }
    }

    pub fn update(&mut self, price: Decimal) -> Option<Decimal> {
        let last = self.last.replace(price)?;
        let change = price - last;
        let gain = change.max(Decimal::ZERO);
        let loss = (-change).max(Decimal::ZERO);
        let n = Decimal::from(self.period as u64);

        self.changes += 1;
        if self.changes <= self.period {
            // Seed with the simple mean of the first `period` changes
            self.avg_gain += gain / n;
            self.avg_loss += loss / n;
        } else {
            self.avg_gain = (self.avg_gain * (n - Decimal::ONE) + gain) / n;
            self.avg_loss = (self.avg_loss * (n - Decimal::ONE) + loss) / n;
        }

        if self.changes < self.period {
            return None;
        }
        Some(self.value_unchecked())
    }

    fn value_unchecked(&self) -> Decimal {
        if self.avg_loss.is_zero() {
            return Decimal::ONE_HUNDRED;
        }
        let rs = self.avg_gain / self.avg_loss;
        Decimal::ONE_HUNDRED - Decimal::ONE_HUNDRED / (Decimal::ONE + rs)
    }

    pub fn reset(&mut self) {
        *self = Self::new(self.period);
    }
}

/// Wilder-smoothed average true range
#[derive(Debug, Clone)]
pub struct AtrState {
    period: usize,
    value: Option<Decimal>,
    last_close: Option<Decimal>,
    samples: usize,
}

impl AtrState {
    pub fn new(period: usize) -> Self {
        Self {
            period: period.max(1),
            value: None,
            last_close: None,
            samples: 0,
        }
    }

    pub fn update(&mut self, high: Decimal, low: Decimal, close: Decimal) -> Option<Decimal> {
        let mut true_range = high - low;
        if let Some(prev) = self.last_close {
            true_range = true_range.max((high - prev).abs()).max((low - prev).abs());
        }
        self.last_close = Some(close);
        self.samples += 1;

        let n = Decimal::from(self.period as u64);
        self.value = Some(match self.value {
            None => true_range,
            Some(prev) => (prev * (n - Decimal::ONE) + true_range) / n,
        });
        self.value()
    }

    /// Available once `period` bars have been seen
    pub fn value(&self) -> Option<Decimal> {
        if self.samples < self.period {
            return None;
        }
        self.value
    }

    pub fn reset(&mut self) {
        *self = Self::new(self.period);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_sma_window() {
        let mut sma = SmaState::new(3);
        assert_eq!(sma.update(dec!(1)), None);
        assert_eq!(sma.update(dec!(2)), None);
        assert_eq!(sma.update(dec!(3)), Some(dec!(2)));
        assert_eq!(sma.update(dec!(6)), Some(dec!(11) / dec!(3)));
    }

    #[test]
    fn test_ema_seeds_then_smooths() {
        let mut ema = EmaState::new(3);
        assert_eq!(ema.value(), None);
        assert_eq!(ema.update(dec!(10)), dec!(10));
        // alpha = 2 / 4
        assert_eq!(ema.update(dec!(20)), dec!(15));
        ema.reset();
        assert_eq!(ema.update(dec!(4)), dec!(4));
    }

    #[test]
    fn test_macd_turns_positive_on_rally() {
        let mut macd = MacdState::new(3, 6, 3);
        let flat = macd.update(dec!(1.1000));
        assert_eq!(flat.macd, Decimal::ZERO);

        let mut last = flat;
        for i in 1..=10 {
            last = macd.update(dec!(1.1000) + Decimal::from(i) * dec!(0.0010));
        }
        assert!(last.macd > Decimal::ZERO);
        assert!(last.histogram > Decimal::ZERO);
        assert_eq!(last.histogram, last.macd - last.signal);
    }

    #[test]
    fn test_rsi_extremes() {
        let mut rising = RsiState::new(5);
        let mut last = None;
        for i in 0..10 {
            last = rising.update(Decimal::from(100 + i));
        }
        assert_eq!(last, Some(dec!(100)));

        let mut falling = RsiState::new(5);
        for i in 0..10 {
            last = falling.update(Decimal::from(100 - i));
        }
        assert_eq!(last, Some(Decimal::ZERO));
    }

    #[test]
    fn test_rsi_needs_period_changes() {
        let mut rsi = RsiState::new(3);
        assert_eq!(rsi.update(dec!(1)), None);
        assert_eq!(rsi.update(dec!(2)), None);
        assert_eq!(rsi.update(dec!(1)), None);
        assert!(rsi.update(dec!(2)).is_some());
    }

    #[test]
    fn test_atr_uses_previous_close() {
        let mut atr = AtrState::new(2);
        assert_eq!(atr.update(dec!(1.10), dec!(1.00), dec!(1.05)), None);
        // Gap up: true range = 1.30 - 1.05
        let v = atr.update(dec!(1.30), dec!(1.20), dec!(1.25)).unwrap();
        assert_eq!(v, (dec!(0.10) + dec!(0.25)) / dec!(2));
    }
}
