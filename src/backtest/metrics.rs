//! Run performance metrics
//!
//! Statistics are computed in `f64` from per-point equity returns; money
//! amounts (PnL totals) stay in `Decimal`.

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;

use crate::domain::{EquityPoint, MetricsSnapshot, Trade};

fn to_f64(d: Decimal) -> f64 {
    d.to_f64().unwrap_or(0.0)
}

/// Simple returns of each point against the previous one, the first against `initial_equity`
pub fn equity_returns(initial_equity: Decimal, curve: &[EquityPoint]) -> Vec<f64> {
    let mut prev = to_f64(initial_equity);
    curve
        .iter()
        .map(|point| {
            let equity = to_f64(point.equity);
            let r = if prev != 0.0 { (equity - prev) / prev } else { 0.0 };
            prev = equity;
            r
        })
        .collect()
}

/// Annualised compound growth over `returns.len()` periods
pub fn growth_rate(returns: &[f64], periods_per_year: u32) -> f64 {
    if returns.is_empty() || periods_per_year == 0 {
        return 0.0;
    }
    let growth: f64 = returns.iter().map(|r| 1.0 + r).product();
    if growth <= 0.0 {
        return -1.0;
    }
    let years = returns.len() as f64 / periods_per_year as f64;
    finite(growth.powf(1.0 / years) - 1.0)
}

/// Largest peak-to-trough decline of the compounded curve, as a fraction <= 0
pub fn max_drawdown(returns: &[f64]) -> f64 {
    let mut cumulative = 1.0;
    let mut peak = 1.0;
    let mut worst: f64 = 0.0;
    for r in returns {
        cumulative *= 1.0 + r;
        if cumulative > peak {
            peak = cumulative;
        }
        if peak > 0.0 {
            worst = worst.min((cumulative - peak) / peak);
        }
    }
    worst
}

fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

pub fn sharpe(returns: &[f64], periods_per_year: u32) -> f64 {
    let m = mean(returns);
    let variance = mean(&returns.iter().map(|r| (r - m).powi(2)).collect::<Vec<_>>());
    let std = variance.sqrt();
    if std < 1e-12 {
        return 0.0;
    }
    finite((periods_per_year as f64).sqrt() * m / std)
}

/// Like sharpe, with the root-mean-square of negative returns as the denominator
pub fn sortino(returns: &[f64], periods_per_year: u32) -> f64 {
    let downside = mean(&returns.iter().map(|r| r.min(0.0).powi(2)).collect::<Vec<_>>()).sqrt();
    if downside < 1e-12 {
        return 0.0;
    }
    finite((periods_per_year as f64).sqrt() * mean(returns) / downside)
}

fn finite(value: f64) -> f64 {
    if value.is_finite() {
        value
    } else {
        0.0
    }
}

/// Metrics over a closed-trade ledger and an equity curve
pub fn compute_metrics(
    trades: &[Trade],
    curve: &[EquityPoint],
    initial_equity: Decimal,
    periods_per_year: u32,
) -> MetricsSnapshot {
    let returns = equity_returns(initial_equity, curve);
    let final_equity = curve.last().map(|p| p.equity).unwrap_or(initial_equity);
    let total_return = if initial_equity > Decimal::ZERO {
        to_f64((final_equity - initial_equity) / initial_equity)
    } else {
        0.0
    };

    let total_pnl: Decimal = trades.iter().map(|t| t.pnl).sum();
    let gross_profit: Decimal = trades.iter().filter(|t| t.pnl > Decimal::ZERO).map(|t| t.pnl).sum();
    let gross_loss: Decimal = trades.iter().filter(|t| t.pnl <= Decimal::ZERO).map(|t| t.pnl).sum();
    let wins = trades.iter().filter(|t| t.pnl > Decimal::ZERO).count();
    let losses = trades.len() - wins;

    let win_rate = if trades.is_empty() {
        0.0
    } else {
        wins as f64 / trades.len() as f64
    };
    let profit_factor = if losses == 0 || gross_loss.is_zero() {
        None
    } else {
        Some(finite(to_f64(gross_profit / gross_loss.abs())))
    };
    let avg_trade_pnl = if trades.is_empty() {
        Decimal::ZERO
    } else {
        total_pnl / Decimal::from(trades.len())
    };

    MetricsSnapshot {
        total_return,
        growth_rate: growth_rate(&returns, periods_per_year),
        max_drawdown: max_drawdown(&returns),
        sharpe: sharpe(&returns, periods_per_year),
        sortino: sortino(&returns, periods_per_year),
        win_rate,
        profit_factor,
        total_pnl,
        trade_count: trades.len(),
        avg_trade_pnl,
        equity_curve: curve.to_vec(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{ExitReason, Side};
    use chrono::{Duration, TimeZone, Utc};
    use rust_decimal_macros::dec;

    fn curve(values: &[Decimal]) -> Vec<EquityPoint> {
        let t0 = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        values
            .iter()
            .enumerate()
            .map(|(i, v)| EquityPoint {
                time: t0 + Duration::days(i as i64),
                equity: *v,
            })
            .collect()
    }

    fn trade(pnl: Decimal) -> Trade {
        let t0 = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        Trade {
            position_id: "p".into(),
            instrument: "EUR_USD".into(),
            side: Side::Long,
            units: 1000,
            entry_price: dec!(1.1),
            entry_time: t0,
            exit_price: dec!(1.1),
            exit_time: t0,
            exit_reason: ExitReason::Manual,
            pnl,
        }
    }

    #[test]
    fn test_drawdown_from_peak() {
        let points = curve(&[dec!(110), dec!(99), dec!(120)]);
        let returns = equity_returns(dec!(100), &points);
        assert!((max_drawdown(&returns) - (-0.1)).abs() < 1e-9);
    }

    #[test]
    fn test_flat_curve_has_zero_ratios() {
        let points = curve(&[dec!(100), dec!(100), dec!(100)]);
        let m = compute_metrics(&[], &points, dec!(100), 252);
        assert_eq!(m.sharpe, 0.0);
        assert_eq!(m.sortino, 0.0);
        assert_eq!(m.max_drawdown, 0.0);
        assert_eq!(m.total_return, 0.0);
        assert_eq!(m.trade_count, 0);
        assert_eq!(m.profit_factor, None);
    }

    #[test]
    fn test_trade_statistics() {
        let trades = vec![trade(dec!(30)), trade(dec!(-10)), trade(dec!(20)), trade(dec!(-10))];
        let points = curve(&[dec!(1030), dec!(1020), dec!(1040), dec!(1030)]);
        let m = compute_metrics(&trades, &points, dec!(1000), 252);

        assert_eq!(m.win_rate, 0.5);
        assert_eq!(m.profit_factor, Some(2.5));
        assert_eq!(m.total_pnl, dec!(30));
        assert_eq!(m.avg_trade_pnl, dec!(7.5));
        assert!((m.total_return - 0.03).abs() < 1e-12);
        assert!(m.sharpe > 0.0);
        assert!(m.sortino > 0.0);
    }

    #[test]
    fn test_growth_rate_one_year() {
        // 252 periods of identical returns compounding to +10%
        let per_period = 1.1f64.powf(1.0 / 252.0) - 1.0;
        let returns = vec![per_period; 252];
        assert!((growth_rate(&returns, 252) - 0.1).abs() < 1e-9);
    }

    #[test]
    fn test_wiped_out_equity_is_finite() {
        let points = curve(&[dec!(50), dec!(-10)]);
        let m = compute_metrics(&[], &points, dec!(100), 252);
        assert_eq!(m.growth_rate, -1.0);
        assert!(m.sharpe.is_finite());
    }
}
