//! In-memory `RunRepository`, used when no database is configured and in tests

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use tokio::sync::RwLock;
use tracing::debug;
use uuid::Uuid;

use super::RunRepository;
use crate::domain::{BarKey, Granularity, MetricsSnapshot, PriceBar, RunKind, RunMetadata, RunStatus};
use crate::error::{FxError, Result};

#[derive(Default)]
struct MemoryInner {
    candles: BTreeMap<BarKey, PriceBar>,
    runs: HashMap<Uuid, RunMetadata>,
    metrics: HashMap<Uuid, MetricsSnapshot>,
}

#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<MemoryInner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RunRepository for MemoryStore {
    async fn upsert_candles(&self, bars: &[PriceBar]) -> Result<usize> {
        let mut inner = self.inner.write().await;
        for bar in bars {
            inner.candles.insert(bar.key(), bar.clone());
        }
        debug!("memory store: upserted {} candles", bars.len());
        Ok(bars.len())
    }

    async fn load_candles(
        &self,
        instrument: &str,
        granularity: Granularity,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
    ) -> Result<Vec<PriceBar>> {
        let inner = self.inner.read().await;
        // BarKey orders by instrument, granularity, then open time
        Ok(inner
            .candles
            .values()
            .filter(|b| b.instrument == instrument && b.granularity == granularity)
            .filter(|b| from.map_or(true, |f| b.open_time >= f))
            .filter(|b| to.map_or(true, |t| b.open_time < t))
            .cloned()
            .collect())
    }

    async fn start_run(&self, run: &RunMetadata) -> Result<()> {
        let mut inner = self.inner.write().await;
        if inner.runs.contains_key(&run.run_id) {
            return Err(FxError::Persistence(format!("run {} already exists", run.run_id)));
        }
        inner.runs.insert(run.run_id, run.clone());
        Ok(())
    }

    async fn update_run_status(&self, run_id: Uuid, status: RunStatus) -> Result<()> {
        let mut inner = self.inner.write().await;
        let run = inner
            .runs
            .get_mut(&run_id)
            .ok_or_else(|| FxError::Persistence(format!("unknown run {run_id}")))?;
        if !run.status.is_terminal() {
            run.status = status;
        }
        Ok(())
    }

    async fn finish_run(&self, run: &RunMetadata) -> Result<()> {
        let mut inner = self.inner.write().await;
        let stored = inner
            .runs
            .get_mut(&run.run_id)
            .ok_or_else(|| FxError::Persistence(format!("unknown run {}", run.run_id)))?;
        stored.status = run.status;
        stored.ended_at = run.ended_at;
        stored.error = run.error.clone();
        stored.orphaned_positions = run.orphaned_positions.clone();
        Ok(())
    }

    async fn save_metrics(&self, run_id: Uuid, metrics: &MetricsSnapshot) -> Result<()> {
        let mut inner = self.inner.write().await;
        let terminal = match inner.runs.get(&run_id) {
            Some(run) => run.status.is_terminal(),
            None => return Err(FxError::Persistence(format!("unknown run {run_id}"))),
        };
        if terminal && inner.metrics.contains_key(&run_id) {
            return Err(FxError::Persistence(format!(
                "metrics of finished run {run_id} are final"
            )));
        }
        inner.metrics.insert(run_id, metrics.clone());
        Ok(())
    }

    async fn list_runs(&self, kind: Option<RunKind>, limit: usize) -> Result<Vec<RunMetadata>> {
        let inner = self.inner.read().await;
        let mut runs: Vec<RunMetadata> = inner
            .runs
            .values()
            .filter(|r| kind.map_or(true, |k| r.kind == k))
            .cloned()
            .collect();
        runs.sort_by(|a, b| b.started_at.cmp(&a.started_at).then(a.run_id.cmp(&b.run_id)));
        runs.truncate(limit);
        Ok(runs)
    }

    async fn get_run(&self, run_id: Uuid) -> Result<Option<RunMetadata>> {
        Ok(self.inner.read().await.runs.get(&run_id).cloned())
    }

    async fn get_metrics(&self, run_id: Uuid) -> Result<Option<MetricsSnapshot>> {
        Ok(self.inner.read().await.metrics.get(&run_id).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;

    fn bar(minute: u32, volume: Decimal) -> PriceBar {
        PriceBar {
            instrument: "EUR_USD".into(),
            granularity: Granularity::M1,
            open_time: Utc.with_ymd_and_hms(2024, 3, 1, 9, minute, 0).unwrap(),
            open: dec!(1.08),
            high: dec!(1.081),
            low: dec!(1.079),
            close: dec!(1.0805),
            volume,
        }
    }

    fn run(minute: u32, kind: RunKind) -> RunMetadata {
        RunMetadata {
            run_id: Uuid::new_v4(),
            kind,
            strategy_name: "sma".into(),
            instrument: "EUR_USD".into(),
            granularity: Granularity::M1,
            status: RunStatus::Starting,
            started_at: Utc.with_ymd_and_hms(2024, 3, 1, 9, minute, 0).unwrap(),
            ended_at: None,
            config_snapshot: serde_json::json!({}),
            error: None,
            orphaned_positions: vec![],
        }
    }

    fn metrics() -> MetricsSnapshot {
        MetricsSnapshot {
            total_return: 0.01,
            growth_rate: 0.0,
            max_drawdown: 0.0,
            sharpe: 0.0,
            sortino: 0.0,
            win_rate: 1.0,
            profit_factor: None,
            total_pnl: dec!(100),
            trade_count: 1,
            avg_trade_pnl: dec!(100),
            equity_curve: vec![],
        }
    }

    #[tokio::test]
    async fn test_upsert_same_key_keeps_latest() {
        let store = MemoryStore::new();
        store.upsert_candles(&[bar(0, dec!(10))]).await.unwrap();
        store.upsert_candles(&[bar(0, dec!(25))]).await.unwrap();

        let loaded = store
            .load_candles("EUR_USD", Granularity::M1, None, None)
            .await
            .unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].volume, dec!(25));
    }

    #[tokio::test]
    async fn test_load_candles_range_is_half_open() {
        let store = MemoryStore::new();
        store
            .upsert_candles(&[bar(2, dec!(1)), bar(0, dec!(1)), bar(1, dec!(1))])
            .await
            .unwrap();

        let from = Utc.with_ymd_and_hms(2024, 3, 1, 9, 0, 0).unwrap();
        let to = Utc.with_ymd_and_hms(2024, 3, 1, 9, 2, 0).unwrap();
        let loaded = store
            .load_candles("EUR_USD", Granularity::M1, Some(from), Some(to))
            .await
            .unwrap();
        assert_eq!(loaded.len(), 2);
        assert!(loaded[0].open_time < loaded[1].open_time);
    }

    #[tokio::test]
    async fn test_terminal_run_status_is_sticky() {
        let store = MemoryStore::new();
        let mut meta = run(0, RunKind::Live);
        store.start_run(&meta).await.unwrap();

        meta.finish(RunStatus::Stopped, Utc::now(), None);
        store.finish_run(&meta).await.unwrap();
        store
            .update_run_status(meta.run_id, RunStatus::Running)
            .await
            .unwrap();

        let stored = store.get_run(meta.run_id).await.unwrap().unwrap();
        assert_eq!(stored.status, RunStatus::Stopped);
    }

    #[tokio::test]
    async fn test_metrics_frozen_after_terminal() {
        let store = MemoryStore::new();
        let mut meta = run(0, RunKind::Backtest);
        meta.status = RunStatus::Completed;
        store.start_run(&meta).await.unwrap();

        store.save_metrics(meta.run_id, &metrics()).await.unwrap();
        assert!(store.save_metrics(meta.run_id, &metrics()).await.is_err());
        assert_eq!(
            store.get_metrics(meta.run_id).await.unwrap().unwrap().trade_count,
            1
        );
    }

    #[tokio::test]
    async fn test_list_runs_newest_first_with_filter() {
        let store = MemoryStore::new();
        let older = run(0, RunKind::Live);
        let newer = run(5, RunKind::Live);
        let backtest = run(9, RunKind::Backtest);
        for r in [&older, &newer, &backtest] {
            store.start_run(r).await.unwrap();
        }

        let live = store.list_runs(Some(RunKind::Live), 10).await.unwrap();
        assert_eq!(live.len(), 2);
        assert_eq!(live[0].run_id, newer.run_id);

        assert_eq!(store.list_runs(None, 1).await.unwrap()[0].run_id, backtest.run_id);
    }
}
