//! End-to-end replay: CSV in, ledger and metrics out

use fxbot::backtest::{prepare_bars, read_csv, write_reports, ReplayEngine};
use fxbot::config::BacktestConfig;
use fxbot::domain::{ExitReason, Granularity, PriceBar};
use fxbot::risk::RiskParameters;
use fxbot::strategy::{StrategyParams, StrategyRegistry};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::io::Cursor;

/// Zig-zag H1 series: 40 bars up, 40 down, 40 up, 10 pips per bar
fn csv_fixture() -> String {
    let mut out = String::from("time,open,high,low,close,volume\n");
    let mut price = dec!(1.1000);
    for i in 0..120i64 {
        let step = if (40..80).contains(&i) { dec!(-0.0010) } else { dec!(0.0010) };
        let open = price;
        let close = price + step;
        let high = open.max(close) + dec!(0.0003);
        let low = open.min(close) - dec!(0.0003);
        let hour = i % 24;
        let day = 1 + i / 24;
        out.push_str(&format!(
            "2024-03-{day:02} {hour:02}:00:00,{open},{high},{low},{close},{}\n",
            100 + i
        ));
        price = close;
    }
    out
}

fn bars() -> Vec<PriceBar> {
    let parsed = read_csv(Cursor::new(csv_fixture()), "EUR_USD", Granularity::H1).unwrap();
    prepare_bars(parsed)
}

fn risk() -> RiskParameters {
    RiskParameters {
        risk_fraction: dec!(0.01),
        max_positions: 1,
        spread_pips: dec!(1.2),
        stop_distance_pips: dec!(25),
        take_profit_pips: None,
        max_leverage: dec!(30),
    }
}

fn sma_params() -> StrategyParams {
    let mut params = StrategyParams::new();
    params.insert("fast".into(), 5.into());
    params.insert("slow".into(), 20.into());
    params
}

fn run_once(bars: &[PriceBar]) -> fxbot::BacktestReport {
    let registry = StrategyRegistry::builtin();
    let params = sma_params();
    let strategy = registry.create_strategy("sma", &params).unwrap();
    ReplayEngine::new(BacktestConfig::default())
        .run_with_params(bars, strategy, &params, &risk())
        .unwrap()
}

#[test]
fn csv_fixture_parses_every_row() {
    let bars = bars();
    assert_eq!(bars.len(), 120);
    assert!(bars.windows(2).all(|w| w[0].open_time < w[1].open_time));
}

#[test]
fn identical_inputs_give_identical_output() {
    let bars = bars();
    let first = run_once(&bars);
    let second = run_once(&bars);

    assert_eq!(
        serde_json::to_string(&first.trades).unwrap(),
        serde_json::to_string(&second.trades).unwrap()
    );
    assert_eq!(
        serde_json::to_string(&first.metrics).unwrap(),
        serde_json::to_string(&second.metrics).unwrap()
    );
    assert_eq!(first.run.run_id, second.run.run_id);
    assert_eq!(first.run.started_at, bars[0].open_time);
}

#[test]
fn zig_zag_trades_and_accounts() {
    let report = run_once(&bars());

    assert!(report.metrics.trade_count >= 1);
    assert_eq!(report.metrics.trade_count, report.trades.len());
    let pnl: Decimal = report.trades.iter().map(|t| t.pnl).sum();
    assert_eq!(report.metrics.total_pnl, pnl);

    let last = report.metrics.equity_curve.last().unwrap();
    assert_eq!(last.equity, BacktestConfig::default().initial_equity + pnl);

    // Everything is closed by the end, by a stop or at end of data
    for trade in &report.trades {
        assert!(matches!(
            trade.exit_reason,
            ExitReason::StopLoss | ExitReason::TakeProfit | ExitReason::EndOfData
        ));
        assert!(trade.exit_time >= trade.entry_time);
    }
}

#[test]
fn reports_are_written() {
    let report = run_once(&bars());
    let dir = std::env::temp_dir().join(format!("fxbot-report-{}", uuid::Uuid::new_v4()));

    write_reports(&report, &dir).unwrap();

    let trades = std::fs::read_to_string(dir.join("trades.csv")).unwrap();
    assert_eq!(trades.lines().count(), report.trades.len() + 1);
    let curve = std::fs::read_to_string(dir.join("equity_curve.csv")).unwrap();
    assert_eq!(curve.lines().count(), 121);
    assert!(dir.join("report.json").exists());

    std::fs::remove_dir_all(&dir).unwrap();
}
