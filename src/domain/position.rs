//! Position ledger shared by the replay and live paths

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::{OrderFill, PriceBar, Side};

/// Why a position was closed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitReason {
    StopLoss,
    TakeProfit,
    Manual,
    EndOfData,
}

impl std::fmt::Display for ExitReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExitReason::StopLoss => write!(f, "stop_loss"),
            ExitReason::TakeProfit => write!(f, "take_profit"),
            ExitReason::Manual => write!(f, "manual"),
            ExitReason::EndOfData => write!(f, "end_of_data"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    /// The opening order's client reference
    pub id: String,
    pub instrument: String,
    pub side: Side,
    pub units: u64,
    pub entry_price: Decimal,
    pub entry_time: DateTime<Utc>,
    pub stop_price: Option<Decimal>,
    pub take_profit_price: Option<Decimal>,
    pub unrealized_pnl: Decimal,
}

impl Position {
    /// PnL if the position were closed at `price`
    pub fn pnl_at(&self, price: Decimal) -> Decimal {
        (price - self.entry_price) * Decimal::from(self.units) * self.side.sign()
    }

    /// Stop/target hit inside the bar's range. When both are touched the stop wins.
    pub fn exit_hit(&self, bar: &PriceBar) -> Option<(ExitReason, Decimal)> {
        let (stop_hit, target_hit) = match self.side {
            Side::Long => (
                self.stop_price.filter(|s| bar.low <= *s),
                self.take_profit_price.filter(|t| bar.high >= *t),
            ),
            Side::Short => (
                self.stop_price.filter(|s| bar.high >= *s),
                self.take_profit_price.filter(|t| bar.low <= *t),
            ),
        };
        if let Some(stop) = stop_hit {
            return Some((ExitReason::StopLoss, stop));
        }
        target_hit.map(|target| (ExitReason::TakeProfit, target))
    }
}

/// Closed position with realized PnL
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trade {
    pub position_id: String,
    pub instrument: String,
    pub side: Side,
    pub units: u64,
    pub entry_price: Decimal,
    pub entry_time: DateTime<Utc>,
    pub exit_price: Decimal,
    pub exit_time: DateTime<Utc>,
    pub exit_reason: ExitReason,
    pub pnl: Decimal,
}

/// Open positions plus the closed-trade history of one run
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PositionBook {
    open: Vec<Position>,
    closed: Vec<Trade>,
    realized_pnl: Decimal,
}

impl PositionBook {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a new position from a fill
    pub fn open(
        &mut self,
        fill: &OrderFill,
        stop_price: Option<Decimal>,
        take_profit_price: Option<Decimal>,
    ) -> Option<&Position> {
        let side = Side::from_units(fill.units)?;
        if self.open.iter().any(|p| p.id == fill.client_reference) {
            return None;
        }
        self.open.push(Position {
            id: fill.client_reference.clone(),
            instrument: fill.instrument.clone(),
            side,
            units: fill.units.unsigned_abs(),
            entry_price: fill.price,
            entry_time: fill.time,
            stop_price,
            take_profit_price,
            unrealized_pnl: Decimal::ZERO,
        });
        self.open.last()
    }

    /// Recompute unrealized PnL from a mid price; returns the instrument's total
    pub fn mark_to_market(&mut self, instrument: &str, mid: Decimal) -> Decimal {
        let mut total = Decimal::ZERO;
        for position in self.open.iter_mut().filter(|p| p.instrument == instrument) {
            position.unrealized_pnl = position.pnl_at(mid);
            total += position.unrealized_pnl;
        }
        total
    }

    /// Close every position whose stop or target lies inside the bar
    pub fn evaluate_exits(&mut self, bar: &PriceBar) -> Vec<Trade> {
        let mut hits = Vec::new();
        for (idx, position) in self.open.iter().enumerate() {
            if position.instrument != bar.instrument {
                continue;
            }
            if let Some((reason, price)) = position.exit_hit(bar) {
                hits.push((idx, reason, price));
            }
        }

        let exit_time = bar.close_time();
        let mut removed = Vec::with_capacity(hits.len());
        // Remove from the back so earlier indices stay valid
        for (idx, reason, price) in hits.into_iter().rev() {
            removed.push((self.open.remove(idx), reason, price));
        }
        removed.reverse();
        removed
            .into_iter()
            .map(|(position, reason, price)| self.record_close(position, price, exit_time, reason))
            .collect()
    }

    /// Close one position by id
    pub fn close(
        &mut self,
        id: &str,
        price: Decimal,
        time: DateTime<Utc>,
        reason: ExitReason,
    ) -> Option<Trade> {
        let idx = self.open.iter().position(|p| p.id == id)?;
        let position = self.open.remove(idx);
        Some(self.record_close(position, price, time, reason))
    }

    /// Close everything at one price, in opening order
    pub fn close_all(&mut self, price: Decimal, time: DateTime<Utc>, reason: ExitReason) -> Vec<Trade> {
        let positions = std::mem::take(&mut self.open);
        positions
            .into_iter()
            .map(|p| self.record_close(p, price, time, reason))
            .collect()
    }

    fn record_close(
        &mut self,
        position: Position,
        exit_price: Decimal,
        exit_time: DateTime<Utc>,
        exit_reason: ExitReason,
    ) -> Trade {
        let pnl = position.pnl_at(exit_price);
        self.realized_pnl += pnl;
        let trade = Trade {
            position_id: position.id,
            instrument: position.instrument,
            side: position.side,
            units: position.units,
            entry_price: position.entry_price,
            entry_time: position.entry_time,
            exit_price,
            exit_time,
            exit_reason,
            pnl,
        };
        self.closed.push(trade.clone());
        trade
    }

    pub fn open_positions(&self) -> &[Position] {
        &self.open
    }

    pub fn open_count(&self, instrument: &str) -> usize {
        self.open.iter().filter(|p| p.instrument == instrument).count()
    }

    pub fn trades(&self) -> &[Trade] {
        &self.closed
    }

    pub fn realized_pnl(&self) -> Decimal {
        self.realized_pnl
    }

    pub fn unrealized_pnl(&self) -> Decimal {
        self.open.iter().map(|p| p.unrealized_pnl).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Granularity;
    use chrono::TimeZone;
    use rust_decimal_macros::dec;

    fn fill(reference: &str, units: i64, price: Decimal) -> OrderFill {
        OrderFill {
            order_id: format!("o-{reference}"),
            client_reference: reference.to_string(),
            instrument: "EUR_USD".into(),
            units,
            price,
            time: Utc.with_ymd_and_hms(2024, 1, 2, 9, 0, 0).unwrap(),
        }
    }

    fn bar(high: Decimal, low: Decimal, close: Decimal) -> PriceBar {
        PriceBar {
            instrument: "EUR_USD".into(),
            granularity: Granularity::M15,
            open_time: Utc.with_ymd_and_hms(2024, 1, 2, 9, 15, 0).unwrap(),
            open: close,
            high,
            low,
            close,
            volume: dec!(10),
        }
    }

    #[test]
    fn test_mark_to_market_long_and_short() {
        let mut book = PositionBook::new();
        book.open(&fill("a", 10_000, dec!(1.1000)), None, None);
        book.open(&fill("b", -5_000, dec!(1.1000)), None, None);

        let total = book.mark_to_market("EUR_USD", dec!(1.1010));
        // +10 on the long, -5 on the short
        assert_eq!(total, dec!(5));
        assert_eq!(book.unrealized_pnl(), dec!(5));
    }

    #[test]
    fn test_stop_checked_before_target() {
        let mut book = PositionBook::new();
        book.open(&fill("a", 10_000, dec!(1.1000)), Some(dec!(1.0980)), Some(dec!(1.1040)));

        // Range spans both levels
        let trades = book.evaluate_exits(&bar(dec!(1.1050), dec!(1.0970), dec!(1.1000)));
        assert_eq!(trades.len(), 1);
        assert_eq!(trades[0].exit_reason, ExitReason::StopLoss);
        assert_eq!(trades[0].exit_price, dec!(1.0980));
        assert_eq!(trades[0].pnl, dec!(-20));
        assert_eq!(book.open_count("EUR_USD"), 0);
        assert_eq!(book.realized_pnl(), dec!(-20));
    }

    #[test]
    fn test_short_take_profit() {
        let mut book = PositionBook::new();
        book.open(&fill("s", -1_000, dec!(1.2000)), Some(dec!(1.2020)), Some(dec!(1.1950)));

        let trades = book.evaluate_exits(&bar(dec!(1.2010), dec!(1.1940), dec!(1.1960)));
        assert_eq!(trades[0].exit_reason, ExitReason::TakeProfit);
        assert_eq!(trades[0].pnl, dec!(5));
    }

    #[test]
    fn test_duplicate_reference_not_reopened() {
        let mut book = PositionBook::new();
        assert!(book.open(&fill("a", 100, dec!(1.1)), None, None).is_some());
        assert!(book.open(&fill("a", 100, dec!(1.1)), None, None).is_none());
        assert_eq!(book.open_positions().len(), 1);
    }

    #[test]
    fn test_close_all_keeps_opening_order() {
        let mut book = PositionBook::new();
        book.open(&fill("a", 100, dec!(1.1)), None, None);
        book.open(&fill("b", 200, dec!(1.2)), None, None);
        let t = Utc.with_ymd_and_hms(2024, 1, 3, 0, 0, 0).unwrap();

        let trades = book.close_all(dec!(1.3), t, ExitReason::EndOfData);
        assert_eq!(trades.iter().map(|t| t.position_id.as_str()).collect::<Vec<_>>(), ["a", "b"]);
        assert_eq!(book.trades().len(), 2);
        assert!(book.open_positions().is_empty());
    }
}
