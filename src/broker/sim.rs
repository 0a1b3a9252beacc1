//! In-process broker backed by a `PositionBook`
//!
//! Fills at the current quote plus adverse slippage and keeps every order as
//! its own position (hedging-style account). None of its futures suspend, so
//! it can be driven with `block_on` by the replay engine.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::Mutex;
use tracing::debug;

use super::traits::{Broker, BrokerKind, BrokerResult};
use crate::domain::{
    pip_size, BrokerPosition, ExitReason, OrderFill, OrderRequest, PositionBook, PriceBar, Quote,
    Side, Trade,
};
use crate::error::BrokerError;

#[derive(Debug)]
struct SimState {
    book: PositionBook,
    quotes: HashMap<String, Quote>,
    fills: HashMap<String, OrderFill>,
    next_order_id: u64,
}

pub struct SimulatedBroker {
    initial_balance: Decimal,
    slippage_pips: Decimal,
    state: Mutex<SimState>,
}

impl SimulatedBroker {
    pub fn new(initial_balance: Decimal, slippage_pips: Decimal) -> Self {
        Self {
            initial_balance,
            slippage_pips,
            state: Mutex::new(SimState {
                book: PositionBook::new(),
                quotes: HashMap::new(),
                fills: HashMap::new(),
                next_order_id: 1,
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Replace the quote for its instrument and mark positions at the new mid
    pub fn set_quote(&self, quote: Quote) {
        let mut state = self.lock();
        state.book.mark_to_market(&quote.instrument, quote.mid());
        state.quotes.insert(quote.instrument.clone(), quote);
    }

    /// Close positions whose stop or target lies inside `bar`
    pub fn evaluate_exits(&self, bar: &PriceBar) -> Vec<Trade> {
        let trades = self.lock().book.evaluate_exits(bar);
        for trade in &trades {
            debug!(
                "sim: {} {} closed by {} at {} (pnl {})",
                trade.instrument, trade.position_id, trade.exit_reason, trade.exit_price, trade.pnl
            );
        }
        trades
    }

    /// Close everything at `price`
    pub fn close_all(&self, price: Decimal, time: DateTime<Utc>, reason: ExitReason) -> Vec<Trade> {
        self.lock().book.close_all(price, time, reason)
    }

    pub fn equity(&self) -> Decimal {
        let state = self.lock();
        self.initial_balance + state.book.realized_pnl() + state.book.unrealized_pnl()
    }

    pub fn book(&self) -> PositionBook {
        self.lock().book.clone()
    }

    fn slippage(&self, instrument: &str) -> Decimal {
        self.slippage_pips * pip_size(instrument)
    }

    fn next_order_id(state: &mut SimState) -> String {
        let id = state.next_order_id;
        state.next_order_id += 1;
        format!("sim-{id}")
    }
}

#[async_trait]
impl Broker for SimulatedBroker {
    fn kind(&self) -> BrokerKind {
        BrokerKind::Simulated
    }

    async fn account_equity(&self) -> BrokerResult<Decimal> {
        Ok(self.equity())
    }

    async fn current_price(&self, instrument: &str) -> BrokerResult<Quote> {
        self.lock()
            .quotes
            .get(instrument)
            .cloned()
            .ok_or_else(|| BrokerError::Validation(format!("no price for {instrument}")))
    }

    async fn submit_order(&self, order: &OrderRequest) -> BrokerResult<OrderFill> {
        if order.units == 0 {
            return Err(BrokerError::Validation("order has zero units".into()));
        }
        let slippage = self.slippage(&order.instrument);
        let mut state = self.lock();

        if let Some(existing) = state.fills.get(&order.client_reference) {
            return Ok(existing.clone());
        }

        let quote = state
            .quotes
            .get(&order.instrument)
            .cloned()
            .ok_or_else(|| BrokerError::Rejected(format!("no price for {}", order.instrument)))?;

        let price = if order.units > 0 {
            quote.ask + slippage
        } else {
            quote.bid - slippage
        };

        let fill = OrderFill {
            order_id: Self::next_order_id(&mut state),
            client_reference: order.client_reference.clone(),
            instrument: order.instrument.clone(),
            units: order.units,
            price,
            time: quote.time,
        };

        state
            .book
            .open(&fill, order.stop_price, order.take_profit_price);
        state.book.mark_to_market(&order.instrument, quote.mid());
        state.fills.insert(order.client_reference.clone(), fill.clone());
        Ok(fill)
    }

    async fn open_positions(&self, instrument: &str) -> BrokerResult<Vec<BrokerPosition>> {
        let state = self.lock();
        Ok(state
            .book
            .open_positions()
            .iter()
            .filter(|p| p.instrument == instrument)
            .map(|p| BrokerPosition {
                id: p.id.clone(),
                instrument: p.instrument.clone(),
                units: p.side.signed(p.units),
                average_price: p.entry_price,
                unrealized_pnl: p.unrealized_pnl,
            })
            .collect())
    }

    async fn close_position(&self, position_id: &str) -> BrokerResult<OrderFill> {
        let mut state = self.lock();
        let position = state
            .book
            .open_positions()
            .iter()
            .find(|p| p.id == position_id)
            .cloned()
            .ok_or_else(|| BrokerError::Validation(format!("unknown position {position_id}")))?;
        let quote = state
            .quotes
            .get(&position.instrument)
            .cloned()
            .ok_or_else(|| BrokerError::Rejected(format!("no price for {}", position.instrument)))?;

        let slippage = self.slippage(&position.instrument);
        // Closing sells a long at the bid and buys a short back at the ask
        let price = match position.side {
            Side::Long => quote.bid - slippage,
            Side::Short => quote.ask + slippage,
        };
        let units = position.side.opposite().signed(position.units);

        state.book.close(position_id, price, quote.time, ExitReason::Manual);
        Ok(OrderFill {
            order_id: Self::next_order_id(&mut state),
            client_reference: format!("close-{position_id}"),
            instrument: position.instrument,
            units,
            price,
            time: quote.time,
        })
    }
}
