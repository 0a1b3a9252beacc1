use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use uuid::Uuid;

use super::Granularity;
use crate::error::FxError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunKind {
    Live,
    Backtest,
}

impl RunKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunKind::Live => "live",
            RunKind::Backtest => "backtest",
        }
    }
}

impl FromStr for RunKind {
    type Err = FxError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "live" => Ok(RunKind::Live),
            "backtest" => Ok(RunKind::Backtest),
            other => Err(FxError::Persistence(format!("unknown run kind: {other}"))),
        }
    }
}

/// Persisted lifecycle status of a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Starting,
    Running,
    Completed,
    Failed,
    Stopped,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RunStatus::Completed | RunStatus::Failed | RunStatus::Stopped)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Starting => "starting",
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
            RunStatus::Stopped => "stopped",
        }
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for RunStatus {
    type Err = FxError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "starting" => Ok(RunStatus::Starting),
            "running" => Ok(RunStatus::Running),
            "completed" => Ok(RunStatus::Completed),
            "failed" => Ok(RunStatus::Failed),
            "stopped" => Ok(RunStatus::Stopped),
            other => Err(FxError::Persistence(format!("unknown run status: {other}"))),
        }
    }
}

/// One live session or backtest invocation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunMetadata {
    pub run_id: Uuid,
    pub kind: RunKind,
    pub strategy_name: String,
    pub instrument: String,
    pub granularity: Granularity,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    /// Risk parameters and strategy params as submitted
    pub config_snapshot: serde_json::Value,
    pub error: Option<String>,
    /// Broker position ids left open when the run ended
    #[serde(default)]
    pub orphaned_positions: Vec<String>,
}

impl RunMetadata {
    /// Apply a terminal status; a run already terminal is left untouched
    pub fn finish(&mut self, status: RunStatus, ended_at: DateTime<Utc>, error: Option<String>) -> bool {
        if self.status.is_terminal() {
            return false;
        }
        self.status = status;
        self.ended_at = Some(ended_at);
        self.error = error;
        true
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EquityPoint {
    pub time: DateTime<Utc>,
    pub equity: Decimal,
}

/// Performance summary of a run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub total_return: f64,
    /// Annualised compound growth
    pub growth_rate: f64,
    /// Largest peak-to-trough decline, as a non-positive fraction
    pub max_drawdown: f64,
    pub sharpe: f64,
    pub sortino: f64,
    pub win_rate: f64,
    /// None when there are no losing trades
    pub profit_factor: Option<f64>,
    pub total_pnl: Decimal,
    pub trade_count: usize,
    pub avg_trade_pnl: Decimal,
    pub equity_curve: Vec<EquityPoint>,
}
