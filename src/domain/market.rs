use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

use crate::error::FxError;

/// Candle granularity, named the way OANDA names them
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Granularity {
    S5,
    M1,
    M5,
    M15,
    M30,
    H1,
    H4,
    D,
}

impl Granularity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Granularity::S5 => "S5",
            Granularity::M1 => "M1",
            Granularity::M5 => "M5",
            Granularity::M15 => "M15",
            Granularity::M30 => "M30",
            Granularity::H1 => "H1",
            Granularity::H4 => "H4",
            Granularity::D => "D",
        }
    }

    /// Length of one bar
    pub fn duration(&self) -> Duration {
        match self {
            Granularity::S5 => Duration::seconds(5),
            Granularity::M1 => Duration::minutes(1),
            Granularity::M5 => Duration::minutes(5),
            Granularity::M15 => Duration::minutes(15),
            Granularity::M30 => Duration::minutes(30),
            Granularity::H1 => Duration::hours(1),
            Granularity::H4 => Duration::hours(4),
            Granularity::D => Duration::days(1),
        }
    }
}

impl std::fmt::Display for Granularity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Granularity {
    type Err = FxError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "S5" => Ok(Granularity::S5),
            "M1" => Ok(Granularity::M1),
            "M5" => Ok(Granularity::M5),
            "M15" => Ok(Granularity::M15),
            "M30" => Ok(Granularity::M30),
            "H1" => Ok(Granularity::H1),
            "H4" => Ok(Granularity::H4),
            "D" | "D1" => Ok(Granularity::D),
            other => Err(FxError::Validation(format!("unknown granularity: {other}"))),
        }
    }
}

/// Identity of a bar: at most one bar exists per key
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BarKey {
    pub instrument: String,
    pub granularity: Granularity,
    pub open_time: DateTime<Utc>,
}

/// A closed OHLCV candle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceBar {
    pub instrument: String,
    pub granularity: Granularity,
    pub open_time: DateTime<Utc>,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub volume: Decimal,
}

impl PriceBar {
    pub fn key(&self) -> BarKey {
        BarKey {
            instrument: self.instrument.clone(),
            granularity: self.granularity,
            open_time: self.open_time,
        }
    }

    pub fn close_time(&self) -> DateTime<Utc> {
        self.open_time + self.granularity.duration()
    }

    /// High minus low
    pub fn range(&self) -> Decimal {
        self.high - self.low
    }

    /// Quote centred on the close with the given full spread
    pub fn to_quote(&self, spread: Decimal) -> Quote {
        let half = spread / Decimal::TWO;
        Quote {
            instrument: self.instrument.clone(),
            time: self.close_time(),
            bid: self.close - half,
            ask: self.close + half,
        }
    }

    /// Check OHLC consistency
    pub fn validate(&self) -> Result<(), FxError> {
        if self.high < self.low {
            return Err(FxError::MarketData(format!(
                "{} {} high {} below low {}",
                self.instrument, self.open_time, self.high, self.low
            )));
        }
        if self.open > self.high || self.open < self.low || self.close > self.high || self.close < self.low {
            return Err(FxError::MarketData(format!(
                "{} {} open/close outside high-low range",
                self.instrument, self.open_time
            )));
        }
        if self.volume < Decimal::ZERO {
            return Err(FxError::MarketData(format!(
                "{} {} negative volume",
                self.instrument, self.open_time
            )));
        }
        Ok(())
    }
}

/// Two-sided price
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Quote {
    pub instrument: String,
    pub time: DateTime<Utc>,
    pub bid: Decimal,
    pub ask: Decimal,
}

impl Quote {
    pub fn mid(&self) -> Decimal {
        (self.bid + self.ask) / Decimal::TWO
    }

    pub fn spread(&self) -> Decimal {
        self.ask - self.bid
    }
}

/// Size of one pip: 0.01 for JPY-quoted pairs, 0.0001 otherwise
pub fn pip_size(instrument: &str) -> Decimal {
    if instrument.to_ascii_uppercase().ends_with("JPY") {
        Decimal::new(1, 2)
    } else {
        Decimal::new(1, 4)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rust_decimal_macros::dec;

    fn bar(close: Decimal) -> PriceBar {
        PriceBar {
            instrument: "EUR_USD".into(),
            granularity: Granularity::M5,
            open_time: Utc.with_ymd_and_hms(2024, 3, 1, 10, 0, 0).unwrap(),
            open: close,
            high: close + dec!(0.0005),
            low: close - dec!(0.0005),
            close,
            volume: dec!(120),
        }
    }

    #[test]
    fn test_pip_size() {
        assert_eq!(pip_size("EUR_USD"), dec!(0.0001));
        assert_eq!(pip_size("USD_JPY"), dec!(0.01));
        assert_eq!(pip_size("GBPJPY"), dec!(0.01));
    }

    #[test]
    fn test_granularity_round_trip_names() {
        for g in [Granularity::M1, Granularity::H4, Granularity::D] {
            assert_eq!(g.as_str().parse::<Granularity>().unwrap(), g);
        }
        assert!("M2".parse::<Granularity>().is_err());
    }

    #[test]
    fn test_to_quote_centres_spread() {
        let q = bar(dec!(1.1000)).to_quote(dec!(0.0002));
        assert_eq!(q.bid, dec!(1.0999));
        assert_eq!(q.ask, dec!(1.1001));
        assert_eq!(q.mid(), dec!(1.1000));
        assert_eq!(q.time, Utc.with_ymd_and_hms(2024, 3, 1, 10, 5, 0).unwrap());
    }

    #[test]
    fn test_validate_rejects_inverted_range() {
        let mut b = bar(dec!(1.1));
        assert!(b.validate().is_ok());
        b.high = dec!(1.0);
        assert!(b.validate().is_err());
    }
}
