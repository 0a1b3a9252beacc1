//! Position sizing and session-level risk limits
//!
//! Sizing is a pure function of equity and the session's risk parameters.
//! The daily guard halts new entries once the day's return crosses the
//! configured target or loss limit.

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::domain::Side;
use crate::error::RiskError;

/// Risk settings fixed for the lifetime of a session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskParameters {
    /// Fraction of equity risked per trade, in (0, 1]
    pub risk_fraction: Decimal,
    pub max_positions: u32,
    pub spread_pips: Decimal,
    /// Used when a signal carries no stop distance
    pub stop_distance_pips: Decimal,
    pub take_profit_pips: Option<Decimal>,
    /// Cap on notional / equity
    pub max_leverage: Decimal,
}

impl RiskParameters {
    pub fn validate(&self) -> Result<(), RiskError> {
        if self.risk_fraction <= Decimal::ZERO || self.risk_fraction > Decimal::ONE {
            return Err(RiskError::InvalidParameters(format!(
                "risk_fraction must be in (0, 1], got {}",
                self.risk_fraction
            )));
        }
        if self.max_positions == 0 {
            return Err(RiskError::InvalidParameters(
                "max_positions must be at least 1".to_string(),
            ));
        }
        if self.stop_distance_pips <= Decimal::ZERO {
            return Err(RiskError::InvalidParameters(format!(
                "stop_distance_pips must be positive, got {}",
                self.stop_distance_pips
            )));
        }
        if self.spread_pips < Decimal::ZERO {
            return Err(RiskError::InvalidParameters(
                "spread_pips cannot be negative".to_string(),
            ));
        }
        if self.max_leverage <= Decimal::ZERO {
            return Err(RiskError::InvalidParameters(
                "max_leverage must be positive".to_string(),
            ));
        }
        if let Some(tp) = self.take_profit_pips {
            if tp <= Decimal::ZERO {
                return Err(RiskError::InvalidParameters(
                    "take_profit_pips must be positive when set".to_string(),
                ));
            }
        }
        Ok(())
    }
}

/// Units such that a stop-out loses `equity * risk_fraction`, clamped by leverage.
///
/// Returns 0 when equity is non-positive, the stop distance is non-positive,
/// or the raw size rounds below one unit. A leverage cap that overflows
/// `Decimal` does not bind; a raw size that overflows is clamped to the cap.
/// The result never exceeds `i64::MAX` so it fits a signed order.
pub fn size_position(
    equity: Decimal,
    params: &RiskParameters,
    stop_distance_pips: Decimal,
    pip_value: Decimal,
    price: Decimal,
) -> u64 {
    if equity <= Decimal::ZERO || stop_distance_pips <= Decimal::ZERO || pip_value <= Decimal::ZERO {
        return 0;
    }

    let raw = equity
        .checked_mul(params.risk_fraction)
        .zip(stop_distance_pips.checked_mul(pip_value))
        .and_then(|(risk_amount, loss_per_unit)| risk_amount.checked_div(loss_per_unit))
        .map(|r| r.floor());
    if raw.is_some_and(|r| r < Decimal::ONE) {
        return 0;
    }

    let max_units = if price > Decimal::ZERO {
        equity
            .checked_mul(params.max_leverage)
            .and_then(|notional| notional.checked_div(price))
            .map(|m| m.floor())
    } else {
        None
    };

    let units = match (raw, max_units) {
        (Some(raw), Some(max)) => raw.min(max),
        (Some(raw), None) => raw,
        (None, Some(max)) => max,
        (None, None) => Decimal::MAX,
    };

    units
        .min(Decimal::from(i64::MAX))
        .to_u64()
        .unwrap_or(0)
}

/// Stop and target prices for an entry, `pips` away in the losing/winning direction
pub fn protective_levels(
    side: Side,
    entry: Decimal,
    stop_distance_pips: Decimal,
    take_profit_pips: Option<Decimal>,
    pip: Decimal,
) -> (Decimal, Option<Decimal>) {
    let sign = side.sign();
    let stop = entry - sign * stop_distance_pips * pip;
    let target = take_profit_pips.map(|tp| entry + sign * tp * pip);
    (stop, target)
}

// ============================================================================
// Daily Guard
// ============================================================================

/// Limit crossed by the day's return
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum GuardBreach {
    TargetHit { return_pct: Decimal },
    LossLimitHit { return_pct: Decimal },
}

impl GuardBreach {
    pub fn event_name(&self) -> &'static str {
        match self {
            GuardBreach::TargetHit { .. } => "target_hit",
            GuardBreach::LossLimitHit { .. } => "loss_limit_hit",
        }
    }
}

/// Tracks the day's return against an optional target and loss limit
#[derive(Debug, Clone)]
pub struct DailyGuard {
    target_pct: Option<Decimal>,
    loss_limit_pct: Option<Decimal>,
    date: NaiveDate,
    day_start_equity: Decimal,
    breach: Option<GuardBreach>,
}

impl DailyGuard {
    pub fn new(
        start_equity: Decimal,
        now: DateTime<Utc>,
        target_pct: Option<Decimal>,
        loss_limit_pct: Option<Decimal>,
    ) -> Self {
        Self {
            target_pct,
            loss_limit_pct,
            date: now.date_naive(),
            day_start_equity: start_equity,
            breach: None,
        }
    }

    /// Day's return in percent of the day's opening equity
    pub fn daily_return_pct(&self, equity: Decimal) -> Decimal {
        if self.day_start_equity <= Decimal::ZERO {
            return Decimal::ZERO;
        }
        (equity - self.day_start_equity) / self.day_start_equity * Decimal::ONE_HUNDRED
    }

    /// Feed the latest equity; returns a breach only on the bar that crosses a limit
    pub fn observe(&mut self, now: DateTime<Utc>, equity: Decimal) -> Option<GuardBreach> {
        let today = now.date_naive();
        if today != self.date {
            if self.breach.is_some() {
                info!("New trading day {}, lifting daily halt", today);
            }
            self.date = today;
            self.day_start_equity = equity;
            self.breach = None;
            return None;
        }

        if self.breach.is_some() {
            return None;
        }

        let return_pct = self.daily_return_pct(equity);
        let breach = match (self.target_pct, self.loss_limit_pct) {
            (Some(target), _) if return_pct >= target => Some(GuardBreach::TargetHit { return_pct }),
            (_, Some(limit)) if return_pct <= -limit => Some(GuardBreach::LossLimitHit { return_pct }),
            _ => None,
        };

        if let Some(ref b) = breach {
            warn!("Daily guard {}: return {}%, halting entries for {}", b.event_name(), return_pct.round_dp(3), today);
        }
        self.breach = breach.clone();
        breach
    }

    pub fn entries_halted(&self) -> bool {
        self.breach.is_some()
    }
}
