use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::domain::{Granularity, MetricsSnapshot, PriceBar, RunKind, RunMetadata, RunStatus};
use crate::error::Result;

/// Storage contract for candles, runs and run metrics
#[async_trait]
pub trait RunRepository: Send + Sync {
    /// Insert or replace bars by (instrument, granularity, open_time). Returns rows written.
    async fn upsert_candles(&self, bars: &[PriceBar]) -> Result<usize>;

    /// Bars in `[from, to)` ordered by open time
    async fn load_candles(
        &self,
        instrument: &str,
        granularity: Granularity,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
    ) -> Result<Vec<PriceBar>>;

    async fn start_run(&self, run: &RunMetadata) -> Result<()>;

    /// Move a non-terminal run to `status`. Terminal runs are left as they are.
    async fn update_run_status(&self, run_id: Uuid, status: RunStatus) -> Result<()>;

    /// Write the terminal state of a run (status, end time, error, orphaned positions)
    async fn finish_run(&self, run: &RunMetadata) -> Result<()>;

    async fn save_metrics(&self, run_id: Uuid, metrics: &MetricsSnapshot) -> Result<()>;

    /// Most recent first
    async fn list_runs(&self, kind: Option<RunKind>, limit: usize) -> Result<Vec<RunMetadata>>;

    async fn get_run(&self, run_id: Uuid) -> Result<Option<RunMetadata>>;

    async fn get_metrics(&self, run_id: Uuid) -> Result<Option<MetricsSnapshot>>;
}
