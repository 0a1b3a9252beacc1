use async_trait::async_trait;
use futures::stream::BoxStream;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

use crate::domain::{BrokerPosition, Granularity, OrderFill, OrderRequest, PriceBar, Quote};
use crate::error::BrokerError;

pub type BrokerResult<T> = std::result::Result<T, BrokerError>;

/// Stream of closed bars; an `Err` item means the feed broke and should be reopened
pub type BarStream = BoxStream<'static, BrokerResult<PriceBar>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BrokerKind {
    Paper,
    Simulated,
    Oanda,
}

impl Default for BrokerKind {
    fn default() -> Self {
        Self::Paper
    }
}

impl BrokerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Paper => "paper",
            Self::Simulated => "simulated",
            Self::Oanda => "oanda",
        }
    }
}

impl std::fmt::Display for BrokerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for BrokerKind {
    type Err = &'static str;

    fn from_str(raw: &str) -> std::result::Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "paper" => Ok(Self::Paper),
            "simulated" | "sim" => Ok(Self::Simulated),
            "oanda" => Ok(Self::Oanda),
            _ => Err("invalid broker; expected paper|simulated|oanda"),
        }
    }
}

/// Account and order operations of a broker
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Broker: Send + Sync {
    fn kind(&self) -> BrokerKind;

    /// Balance plus unrealized PnL
    async fn account_equity(&self) -> BrokerResult<Decimal>;

    async fn current_price(&self, instrument: &str) -> BrokerResult<Quote>;

    /// Submit a market order. Repeating a `client_reference` returns the original fill.
    async fn submit_order(&self, order: &OrderRequest) -> BrokerResult<OrderFill>;

    async fn open_positions(&self, instrument: &str) -> BrokerResult<Vec<BrokerPosition>>;

    /// Close one open position at market
    async fn close_position(&self, position_id: &str) -> BrokerResult<OrderFill>;
}

/// Producer of live or replayed bars
#[async_trait]
pub trait PriceSource: Send + Sync {
    /// Open a bar stream. Finite sources end the stream after their last bar.
    async fn stream_prices(&self, instrument: &str, granularity: Granularity) -> BrokerResult<BarStream>;
}
