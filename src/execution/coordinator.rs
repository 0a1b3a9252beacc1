//! Signal → risk → order pipeline for one bar
//!
//! The coordinator owns the strategy instance and is the only caller of
//! `take_signal`. It has no scheduling of its own: the live runner and the
//! replay engine both call `handle_bar` once per closed bar.

use rust_decimal::Decimal;
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::events::{EventPublisher, LogLevel};
use crate::broker::Broker;
use crate::bus::EventBus;
use crate::domain::{pip_size, ExecutedOrder, OrderRequest, PriceBar, Side};
use crate::error::{BrokerError, FxError, Result, RiskError};
use crate::risk::{protective_levels, size_position, RiskParameters};
use crate::strategy::{Signal, StrategyContext, StrategyUnit};

pub struct ExecutionCoordinator {
    strategy: Box<dyn StrategyUnit>,
    broker: Arc<dyn Broker>,
    risk: RiskParameters,
    ctx: StrategyContext,
    events: EventPublisher,
    order_seq: u64,
    entries_halted: bool,
    bars_processed: u64,
}

impl ExecutionCoordinator {
    /// Validate the context's risk parameters and start the strategy for it
    pub fn new(
        mut strategy: Box<dyn StrategyUnit>,
        broker: Arc<dyn Broker>,
        ctx: StrategyContext,
    ) -> Result<Self> {
        ctx.risk.validate()?;
        strategy.on_startup(&ctx);

        Ok(Self {
            strategy,
            broker,
            risk: ctx.risk.clone(),
            events: EventPublisher::new(None, ctx.run_id),
            ctx,
            order_seq: 0,
            entries_halted: false,
            bars_processed: 0,
        })
    }

    /// Publish events and log lines to `bus`
    pub fn with_bus(mut self, bus: EventBus) -> Self {
        self.events = EventPublisher::new(Some(bus), self.ctx.run_id);
        self
    }

    pub fn run_id(&self) -> Uuid {
        self.ctx.run_id
    }

    pub fn strategy(&self) -> &dyn StrategyUnit {
        self.strategy.as_ref()
    }

    pub fn risk(&self) -> &RiskParameters {
        &self.risk
    }

    pub fn bars_processed(&self) -> u64 {
        self.bars_processed
    }

    /// Block new entries (daily guard); exits are unaffected
    pub fn set_entries_halted(&mut self, halted: bool) {
        self.entries_halted = halted;
    }

    pub fn entries_halted(&self) -> bool {
        self.entries_halted
    }

    /// Feed one closed bar through the strategy and act on its signal.
    ///
    /// The pending signal is consumed whatever happens to it. Only fatal
    /// broker errors are returned; any other failure is reported as an
    /// event and the bar counts as processed.
    pub async fn handle_bar(&mut self, bar: &PriceBar) -> Result<Option<ExecutedOrder>> {
        let pip = pip_size(&bar.instrument);
        let quote = bar.to_quote(self.risk.spread_pips * pip);

        self.strategy.on_price_tick(&quote);
        self.strategy.on_bar_close(bar);
        self.bars_processed += 1;

        let Some(signal) = self.strategy.get_signal().cloned() else {
            return Ok(None);
        };

        let outcome = self.act_on_signal(&signal, bar).await;
        self.strategy.take_signal();

        match outcome {
            Ok(executed) => Ok(executed),
            Err(e) if e.is_fatal() => {
                error!("[{}] fatal broker error: {}", self.ctx.run_id, e);
                self.events.log(LogLevel::Error, bar.close_time(), format!("fatal broker error: {e}"));
                Err(e)
            }
            Err(e) => {
                warn!("[{}] bar {} failed: {}", self.ctx.run_id, bar.open_time, e);
                self.events.event(
                    "bar_failed",
                    bar.close_time(),
                    json!({ "open_time": bar.open_time, "error": e.to_string() }),
                );
                Ok(None)
            }
        }
    }

    /// Tell the strategy the run is over
    pub fn stop(&mut self) {
        self.strategy.on_stop();
    }

    async fn act_on_signal(&mut self, signal: &Signal, bar: &PriceBar) -> Result<Option<ExecutedOrder>> {
        let time = bar.close_time();
        let Some(side) = signal.direction.side() else {
            debug!("[{}] flat signal consumed", self.ctx.run_id);
            return Ok(None);
        };

        if self.entries_halted {
            info!("[{}] {} signal skipped: entries halted for the day", self.ctx.run_id, side);
            self.events.event(
                "entry_skipped",
                time,
                json!({ "reason": "daily_halt", "direction": signal.direction }),
            );
            return Ok(None);
        }

        let pip = pip_size(&bar.instrument);
        let equity = self.broker.account_equity().await?;
        let stop_pips = signal
            .stop_distance_pips
            .unwrap_or(self.risk.stop_distance_pips);
        let half_spread = self.risk.spread_pips * pip / Decimal::TWO;
        let entry = bar.close + side.sign() * half_spread;

        let units = size_position(equity, &self.risk, stop_pips, pip, entry);
        if units == 0 {
            let rejection = RiskError::ZeroUnits {
                equity,
                stop_distance_pips: stop_pips,
            };
            warn!("[{}] {}", self.ctx.run_id, rejection);
            self.events.event(
                "risk_rejected",
                time,
                json!({ "reason": rejection.to_string(), "direction": signal.direction }),
            );
            self.events.log(LogLevel::Warn, time, rejection.to_string());
            return Ok(None);
        }

        let open = self.broker.open_positions(&bar.instrument).await?.len();
        if open >= self.risk.max_positions as usize {
            let rejection = RiskError::MaxPositions {
                instrument: bar.instrument.clone(),
                open,
                max: self.risk.max_positions,
            };
            info!("[{}] {}", self.ctx.run_id, rejection);
            self.events.event(
                "max_positions",
                time,
                json!({ "open": open, "max": self.risk.max_positions }),
            );
            return Ok(None);
        }

        let take_profit_pips = signal.target_distance_pips.or(self.risk.take_profit_pips);
        let (stop, target) = protective_levels(side, entry, stop_pips, take_profit_pips, pip);
        let request = OrderRequest::market(&bar.instrument, side, units, self.next_reference(bar))
            .with_protection(Some(stop), target);

        match self.broker.submit_order(&request).await {
            Ok(fill) => {
                info!(
                    "[{}] {} {} {} filled @ {} (stop {}, target {:?})",
                    self.ctx.run_id, side, units, bar.instrument, fill.price, stop, target
                );
                self.events.event("order_filled", time, json!({ "request": request, "fill": fill }));
                self.events.log(
                    LogLevel::Info,
                    time,
                    format!("{} {} {} @ {}", side, units, bar.instrument, fill.price),
                );
                Ok(Some(ExecutedOrder { request, fill }))
            }
            Err(e) if e.is_fatal() => Err(FxError::Broker(e)),
            Err(e) => {
                self.report_rejection(&request, &e, side, time);
                Ok(None)
            }
        }
    }

    fn report_rejection(&self, request: &OrderRequest, e: &BrokerError, side: Side, time: chrono::DateTime<chrono::Utc>) {
        warn!(
            "[{}] {} order {} rejected ({}): {}",
            self.ctx.run_id,
            side,
            request.client_reference,
            e.kind(),
            e
        );
        self.events.event(
            "order_rejected",
            time,
            json!({ "request": request, "kind": e.kind(), "error": e.to_string() }),
        );
        self.events.log(LogLevel::Warn, time, format!("order rejected: {e}"));
    }

    /// `<run_id>-<bar open millis>-<seq>`; identical inputs give identical references
    fn next_reference(&mut self, bar: &PriceBar) -> String {
        let reference = format!(
            "{}-{}-{}",
            self.ctx.run_id,
            bar.open_time.timestamp_millis(),
            self.order_seq
        );
        self.order_seq += 1;
        reference
    }
}
