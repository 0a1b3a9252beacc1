//! Deterministic replay of historical bars through the execution coordinator
//!
//! The engine drives the same `ExecutionCoordinator` as live sessions, over
//! a `SimulatedBroker` whose futures complete immediately, so each bar is
//! run with `block_on`. Run id and timestamps derive from the input only.

use futures::executor::block_on;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

use super::metrics::compute_metrics;
use crate::broker::SimulatedBroker;
use crate::config::BacktestConfig;
use crate::domain::{
    pip_size, EquityPoint, ExitReason, MetricsSnapshot, PriceBar, RunKind, RunMetadata, RunStatus,
    Trade,
};
use crate::error::{FxError, Result};
use crate::execution::ExecutionCoordinator;
use crate::risk::RiskParameters;
use crate::strategy::{StrategyContext, StrategyParams, StrategyUnit};

/// Ledger, metrics and run record of one replay
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BacktestReport {
    pub run: RunMetadata,
    pub trades: Vec<Trade>,
    pub metrics: MetricsSnapshot,
}

#[derive(Serialize)]
struct RunIdentity<'a> {
    strategy: &'a str,
    params: &'a StrategyParams,
    risk: &'a RiskParameters,
    config: &'a BacktestConfig,
    bars: &'a [PriceBar],
}

pub struct ReplayEngine {
    config: BacktestConfig,
}

impl ReplayEngine {
    pub fn new(config: BacktestConfig) -> Self {
        Self { config }
    }

    /// Replay `bars` for a single instrument.
    ///
    /// Bars are stable-sorted by open time; de-duplication is the caller's job
    /// (see `prepare_bars`). Positions still open after the last bar are
    /// closed at its close.
    pub fn run(
        &self,
        bars: &[PriceBar],
        strategy: Box<dyn StrategyUnit>,
        risk: &RiskParameters,
    ) -> Result<BacktestReport> {
        self.run_with_params(bars, strategy, &StrategyParams::new(), risk)
    }

    /// Same as `run`; `params` are the ones `strategy` was built from and go
    /// into the run id and config snapshot.
    pub fn run_with_params(
        &self,
        bars: &[PriceBar],
        strategy: Box<dyn StrategyUnit>,
        params: &StrategyParams,
        risk: &RiskParameters,
    ) -> Result<BacktestReport> {
        let mut bars = bars.to_vec();
        bars.sort_by(|a, b| a.open_time.cmp(&b.open_time));

        let (first, last) = match (bars.first(), bars.last()) {
            (Some(first), Some(last)) => (first.clone(), last.clone()),
            _ => return Err(FxError::MarketData("no bars to replay".to_string())),
        };
        if let Some(other) = bars
            .iter()
            .find(|b| b.instrument != first.instrument || b.granularity != first.granularity)
        {
            return Err(FxError::Validation(format!(
                "replay needs a single series, found {} {} and {} {}",
                first.instrument, first.granularity, other.instrument, other.granularity
            )));
        }

        let strategy_name = strategy.name().to_string();
        let run_id = Self::run_id(&strategy_name, params, risk, &self.config, &bars)?;
        let mut run = RunMetadata {
            run_id,
            kind: RunKind::Backtest,
            strategy_name: strategy_name.clone(),
            instrument: first.instrument.clone(),
            granularity: first.granularity,
            status: RunStatus::Running,
            started_at: first.open_time,
            ended_at: None,
            config_snapshot: json!({ "risk": risk, "params": params, "backtest": self.config }),
            error: None,
            orphaned_positions: Vec::new(),
        };

        let broker = Arc::new(SimulatedBroker::new(
            self.config.initial_equity,
            self.config.slippage_pips,
        ));
        let ctx = StrategyContext::new(run_id, &first.instrument, first.granularity, risk.clone());
        let mut coordinator = ExecutionCoordinator::new(strategy, broker.clone(), ctx)?;

        let spread = risk.spread_pips * pip_size(&first.instrument);
        let mut curve = Vec::with_capacity(bars.len());
        let mut orders = 0usize;

        for bar in &bars {
            broker.evaluate_exits(bar);
            broker.set_quote(bar.to_quote(spread));
            if block_on(coordinator.handle_bar(bar))?.is_some() {
                orders += 1;
            }
            curve.push(EquityPoint {
                time: bar.close_time(),
                equity: broker.equity(),
            });
        }

        let closed = broker.close_all(last.close, last.close_time(), ExitReason::EndOfData);
        if !closed.is_empty() {
            debug!("Closed {} positions at end of data", closed.len());
            if let Some(point) = curve.last_mut() {
                point.equity = broker.equity();
            }
        }
        coordinator.stop();

        let trades = broker.book().trades().to_vec();
        let metrics = compute_metrics(
            &trades,
            &curve,
            self.config.initial_equity,
            self.config.periods_per_year,
        );
        run.finish(RunStatus::Completed, last.close_time(), None);

        info!(
            "Backtest {} {} {}: {} bars, {} orders, {} trades, pnl {}",
            strategy_name,
            first.instrument,
            first.granularity,
            bars.len(),
            orders,
            trades.len(),
            metrics.total_pnl
        );

        Ok(BacktestReport { run, trades, metrics })
    }

    /// Name-based v5 uuid over everything that determines the outcome
    fn run_id(
        strategy: &str,
        params: &StrategyParams,
        risk: &RiskParameters,
        config: &BacktestConfig,
        bars: &[PriceBar],
    ) -> Result<Uuid> {
        let identity = serde_json::to_vec(&RunIdentity {
            strategy,
            params,
            risk,
            config,
            bars,
        })?;
        Ok(Uuid::new_v5(&Uuid::NAMESPACE_OID, &identity))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Granularity;
    use crate::strategy::{StrategyRegistry, StrategyParams};
    use chrono::{Duration, TimeZone, Utc};
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;

    fn series(closes: &[Decimal]) -> Vec<PriceBar> {
        let t0 = Utc.with_ymd_and_hms(2024, 2, 5, 0, 0, 0).unwrap();
        let mut prev = closes[0];
        closes
            .iter()
            .enumerate()
            .map(|(i, close)| {
                let bar = PriceBar {
                    instrument: "EUR_USD".into(),
                    granularity: Granularity::H1,
                    open_time: t0 + Duration::hours(i as i64),
                    open: prev,
                    high: prev.max(*close) + dec!(0.0002),
                    low: prev.min(*close) - dec!(0.0002),
                    close: *close,
                    volume: dec!(100),
                };
                prev = *close;
                bar
            })
            .collect()
    }

    fn risk() -> RiskParameters {
        RiskParameters {
            risk_fraction: dec!(0.01),
            max_positions: 1,
            spread_pips: dec!(1),
            stop_distance_pips: dec!(20),
            take_profit_pips: Some(dec!(40)),
            max_leverage: dec!(20),
        }
    }

    fn sma(fast: u64, slow: u64) -> Box<dyn StrategyUnit> {
        let mut params = StrategyParams::new();
        params.insert("fast".into(), fast.into());
        params.insert("slow".into(), slow.into());
        StrategyRegistry::builtin().create_strategy("sma", &params).unwrap()
    }

    fn trending_then_falling() -> Vec<PriceBar> {
        let mut closes = Vec::new();
        let mut price = dec!(1.1000);
        for _ in 0..30 {
            price += dec!(0.0010);
            closes.push(price);
        }
        for _ in 0..30 {
            price -= dec!(0.0010);
            closes.push(price);
        }
        series(&closes)
    }

    #[test]
    fn test_empty_input_is_an_error() {
        let engine = ReplayEngine::new(BacktestConfig::default());
        assert!(engine.run(&[], sma(5, 20), &risk()).is_err());
    }

    #[test]
    fn test_replay_is_deterministic() {
        let bars = trending_then_falling();
        let engine = ReplayEngine::new(BacktestConfig::default());

        let a = engine.run(&bars, sma(5, 20), &risk()).unwrap();
        let b = engine.run(&bars, sma(5, 20), &risk()).unwrap();

        assert_eq!(a.run.run_id, b.run.run_id);
        assert_eq!(
            serde_json::to_string(&a).unwrap(),
            serde_json::to_string(&b).unwrap()
        );
        assert_eq!(a.run.status, RunStatus::Completed);
        assert_eq!(a.metrics.equity_curve.len(), bars.len());
    }

    #[test]
    fn test_trend_produces_trades_and_closes_everything() {
        let bars = trending_then_falling();
        let report = ReplayEngine::new(BacktestConfig::default())
            .run(&bars, sma(5, 20), &risk())
            .unwrap();

        assert!(report.metrics.trade_count >= 1);
        let pnl: Decimal = report.trades.iter().map(|t| t.pnl).sum();
        let final_equity = report.metrics.equity_curve.last().unwrap().equity;
        assert_eq!(final_equity, BacktestConfig::default().initial_equity + pnl);
    }

    #[test]
    fn test_unsorted_input_matches_sorted() {
        let bars = trending_then_falling();
        let mut shuffled = bars.clone();
        shuffled.reverse();
        let engine = ReplayEngine::new(BacktestConfig::default());

        let sorted = engine.run(&bars, sma(5, 20), &risk()).unwrap();
        let reversed = engine.run(&shuffled, sma(5, 20), &risk()).unwrap();
        assert_eq!(sorted.trades, reversed.trades);
        assert_eq!(sorted.metrics, reversed.metrics);
    }

    #[test]
    fn test_params_change_run_id() {
        let bars = trending_then_falling();
        let engine = ReplayEngine::new(BacktestConfig::default());
        let mut params = StrategyParams::new();
        params.insert("fast".into(), 5.into());
        params.insert("slow".into(), 20.into());

        let plain = engine.run(&bars, sma(5, 20), &risk()).unwrap();
        let labeled = engine.run_with_params(&bars, sma(5, 20), &params, &risk()).unwrap();
        assert_ne!(plain.run.run_id, labeled.run.run_id);
        assert_eq!(plain.metrics, labeled.metrics);

        // Position ids embed the run id; everything else about the trades matches
        let strip = |trades: &[Trade]| -> Vec<Trade> {
            trades
                .iter()
                .cloned()
                .map(|mut t| {
                    t.position_id.clear();
                    t
                })
                .collect()
        };
        assert!(!plain.trades.is_empty());
        assert_ne!(plain.trades[0].position_id, labeled.trades[0].position_id);
        assert_eq!(strip(&plain.trades), strip(&labeled.trades));
        assert_eq!(labeled.run.config_snapshot["params"]["fast"], 5);
    }

    #[test]
    fn test_mixed_instruments_rejected() {
        let mut bars = trending_then_falling();
        bars[3].instrument = "GBP_USD".into();
        let engine = ReplayEngine::new(BacktestConfig::default());
        assert!(matches!(
            engine.run(&bars, sma(5, 20), &risk()),
            Err(FxError::Validation(_))
        ));
    }
}
