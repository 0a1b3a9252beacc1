use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Position direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Long,
    Short,
}

impl Side {
    /// +1 for long, -1 for short
    pub fn sign(&self) -> Decimal {
        match self {
            Side::Long => Decimal::ONE,
            Side::Short => Decimal::NEGATIVE_ONE,
        }
    }

    pub fn opposite(&self) -> Side {
        match self {
            Side::Long => Side::Short,
            Side::Short => Side::Long,
        }
    }

    /// Units with the sign of this side
    pub fn signed(&self, units: u64) -> i64 {
        let magnitude = i64::try_from(units).unwrap_or(i64::MAX);
        match self {
            Side::Long => magnitude,
            Side::Short => -magnitude,
        }
    }

    pub fn from_units(units: i64) -> Option<Side> {
        match units {
            u if u > 0 => Some(Side::Long),
            u if u < 0 => Some(Side::Short),
            _ => None,
        }
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Side::Long => write!(f, "LONG"),
            Side::Short => write!(f, "SHORT"),
        }
    }
}

/// Market order to submit to a broker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderRequest {
    pub instrument: String,
    /// Signed: positive buys, negative sells
    pub units: i64,
    pub stop_price: Option<Decimal>,
    pub take_profit_price: Option<Decimal>,
    /// Idempotency key; brokers return the original fill for a repeated reference
    pub client_reference: String,
}

impl OrderRequest {
    pub fn market(instrument: &str, side: Side, units: u64, client_reference: String) -> Self {
        Self {
            instrument: instrument.to_string(),
            units: side.signed(units),
            stop_price: None,
            take_profit_price: None,
            client_reference,
        }
    }

    pub fn with_protection(mut self, stop: Option<Decimal>, take_profit: Option<Decimal>) -> Self {
        self.stop_price = stop;
        self.take_profit_price = take_profit;
        self
    }

    pub fn side(&self) -> Side {
        Side::from_units(self.units).unwrap_or(Side::Long)
    }

    pub fn abs_units(&self) -> u64 {
        self.units.unsigned_abs()
    }
}

/// Broker confirmation of an executed order
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderFill {
    pub order_id: String,
    pub client_reference: String,
    pub instrument: String,
    pub units: i64,
    pub price: Decimal,
    pub time: DateTime<Utc>,
}

/// Result of a bar that led to a submitted order
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutedOrder {
    pub request: OrderRequest,
    pub fill: OrderFill,
}

/// Net position as reported by the broker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BrokerPosition {
    pub id: String,
    pub instrument: String,
    pub units: i64,
    pub average_price: Decimal,
    pub unrealized_pnl: Decimal,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_market_order_sign_encodes_side() {
        let long = OrderRequest::market("EUR_USD", Side::Long, 1500, "r1".into());
        let short = OrderRequest::market("EUR_USD", Side::Short, 1500, "r2".into());
        assert_eq!(long.units, 1500);
        assert_eq!(short.units, -1500);
        assert_eq!(short.side(), Side::Short);
        assert_eq!(short.abs_units(), 1500);
    }

    #[test]
    fn test_side_helpers() {
        assert_eq!(Side::Long.opposite(), Side::Short);
        assert_eq!(Side::from_units(0), None);
        assert_eq!(Side::Short.to_string(), "SHORT");
    }
}
