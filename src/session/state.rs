//! Session lifecycle state and the read-only snapshot handed to callers

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::{EquityPoint, Granularity, RunStatus};
use crate::risk::RiskParameters;
use crate::strategy::StrategyParams;

/// In-memory lifecycle of the live runner
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    #[default]
    Idle,
    Starting,
    Running,
    Stopping,
    Completed,
    Failed,
}

impl SessionState {
    /// A session occupies the runner in these states
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            SessionState::Starting | SessionState::Running | SessionState::Stopping
        )
    }

    /// `stop()` is accepted only here
    pub fn is_stoppable(&self) -> bool {
        matches!(self, SessionState::Starting | SessionState::Running)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Idle => "idle",
            SessionState::Starting => "starting",
            SessionState::Running => "running",
            SessionState::Stopping => "stopping",
            SessionState::Completed => "completed",
            SessionState::Failed => "failed",
        }
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// What a caller asks `LiveRunner::start` to run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LiveSessionRequest {
    pub strategy: String,
    #[serde(default)]
    pub params: StrategyParams,
    pub instrument: String,
    pub granularity: Granularity,
    pub risk: RiskParameters,
}

/// Counters the background task updates after every bar
#[derive(Debug, Clone, Default)]
pub(crate) struct SessionProgress {
    pub bars_processed: u64,
    pub orders_submitted: u64,
    pub last_bar_time: Option<DateTime<Utc>>,
    pub equity: Option<Decimal>,
    pub open_positions: usize,
    pub entries_halted: bool,
    pub reconnects: u32,
    pub equity_curve: Vec<EquityPoint>,
}

/// Point-in-time copy of the runner's state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub state: SessionState,
    pub run_id: Option<Uuid>,
    pub strategy: Option<String>,
    pub instrument: Option<String>,
    pub granularity: Option<Granularity>,
    pub run_status: Option<RunStatus>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub bars_processed: u64,
    pub orders_submitted: u64,
    pub last_bar_time: Option<DateTime<Utc>>,
    pub equity: Option<Decimal>,
    pub open_positions: usize,
    pub entries_halted: bool,
    pub reconnects: u32,
    pub orphaned_positions: Vec<String>,
    pub error: Option<String>,
}
