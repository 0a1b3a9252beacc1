use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use tracing::{debug, info, instrument};
use uuid::Uuid;

use crate::domain::{Granularity, MetricsSnapshot, PriceBar, RunKind, RunMetadata, RunStatus};
use crate::error::{FxError, Result};
use crate::persistence::RunRepository;

/// PostgreSQL storage adapter
#[derive(Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    /// Create a new PostgreSQL store
    pub async fn new(database_url: &str, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await?;

        info!("Connected to PostgreSQL");
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Run migrations
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        info!("Database migrations completed");
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    fn row_to_bar(r: &PgRow) -> Result<PriceBar> {
        Ok(PriceBar {
            instrument: r.get("instrument"),
            granularity: r.get::<String, _>("granularity").parse()?,
            open_time: r.get("open_time"),
            open: r.get("open"),
            high: r.get("high"),
            low: r.get("low"),
            close: r.get("close"),
            volume: r.get("volume"),
        })
    }

    fn row_to_run(r: &PgRow) -> Result<RunMetadata> {
        let orphaned: serde_json::Value = r.get("orphaned_positions");
        Ok(RunMetadata {
            run_id: r.get("run_id"),
            kind: r.get::<String, _>("kind").parse()?,
            strategy_name: r.get("strategy_name"),
            instrument: r.get("instrument"),
            granularity: r.get::<String, _>("granularity").parse()?,
            status: r.get::<String, _>("status").parse()?,
            started_at: r.get("started_at"),
            ended_at: r.get("ended_at"),
            config_snapshot: r.get("config_snapshot"),
            error: r.get("error"),
            orphaned_positions: serde_json::from_value(orphaned)?,
        })
    }
}

#[async_trait]
impl RunRepository for PostgresStore {
    // ==================== Candles ====================

    #[instrument(skip(self, bars), fields(count = bars.len()))]
    async fn upsert_candles(&self, bars: &[PriceBar]) -> Result<usize> {
        let mut tx = self.pool.begin().await?;

        for bar in bars {
            sqlx::query(
                r#"
                INSERT INTO candles (instrument, granularity, open_time, open, high, low, close, volume)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
                ON CONFLICT (instrument, granularity, open_time) DO UPDATE SET
                    open = EXCLUDED.open,
                    high = EXCLUDED.high,
                    low = EXCLUDED.low,
                    close = EXCLUDED.close,
                    volume = EXCLUDED.volume
                "#,
            )
            .bind(&bar.instrument)
            .bind(bar.granularity.as_str())
            .bind(bar.open_time)
            .bind(bar.open)
            .bind(bar.high)
            .bind(bar.low)
            .bind(bar.close)
            .bind(bar.volume)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        debug!("Upserted {} candles", bars.len());
        Ok(bars.len())
    }

    async fn load_candles(
        &self,
        instrument: &str,
        granularity: Granularity,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
    ) -> Result<Vec<PriceBar>> {
        let rows = sqlx::query(
            r#"
            SELECT instrument, granularity, open_time, open, high, low, close, volume
            FROM candles
            WHERE instrument = $1 AND granularity = $2
              AND ($3::timestamptz IS NULL OR open_time >= $3)
              AND ($4::timestamptz IS NULL OR open_time < $4)
            ORDER BY open_time ASC
            "#,
        )
        .bind(instrument)
        .bind(granularity.as_str())
        .bind(from)
        .bind(to)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(Self::row_to_bar).collect()
    }

    // ==================== Runs ====================

    #[instrument(skip(self, run), fields(run_id = %run.run_id))]
    async fn start_run(&self, run: &RunMetadata) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO runs (
                run_id, kind, strategy_name, instrument, granularity, status,
                started_at, ended_at, config_snapshot, error, orphaned_positions
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            "#,
        )
        .bind(run.run_id)
        .bind(run.kind.as_str())
        .bind(&run.strategy_name)
        .bind(&run.instrument)
        .bind(run.granularity.as_str())
        .bind(run.status.as_str())
        .bind(run.started_at)
        .bind(run.ended_at)
        .bind(&run.config_snapshot)
        .bind(&run.error)
        .bind(serde_json::to_value(&run.orphaned_positions)?)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    #[instrument(skip(self))]
    async fn update_run_status(&self, run_id: Uuid, status: RunStatus) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE runs SET status = $2
            WHERE run_id = $1 AND status NOT IN ('completed', 'failed', 'stopped')
            "#,
        )
        .bind(run_id)
        .bind(status.as_str())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            debug!("Run {} not updated to {} (missing or terminal)", run_id, status);
        }
        Ok(())
    }

    #[instrument(skip(self, run), fields(run_id = %run.run_id, status = %run.status))]
    async fn finish_run(&self, run: &RunMetadata) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE runs SET
                status = $2,
                ended_at = $3,
                error = $4,
                orphaned_positions = $5
            WHERE run_id = $1
            "#,
        )
        .bind(run.run_id)
        .bind(run.status.as_str())
        .bind(run.ended_at)
        .bind(&run.error)
        .bind(serde_json::to_value(&run.orphaned_positions)?)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(FxError::Persistence(format!("unknown run {}", run.run_id)));
        }
        Ok(())
    }

    #[instrument(skip(self, metrics))]
    async fn save_metrics(&self, run_id: Uuid, metrics: &MetricsSnapshot) -> Result<()> {
        // A finished run keeps the first metrics written for it
        let result = sqlx::query(
            r#"
            INSERT INTO run_metrics (run_id, metrics)
            VALUES ($1, $2)
            ON CONFLICT (run_id) DO UPDATE SET metrics = EXCLUDED.metrics, created_at = NOW()
            WHERE NOT EXISTS (
                SELECT 1 FROM runs
                WHERE runs.run_id = $1 AND runs.status IN ('completed', 'failed', 'stopped')
            )
            "#,
        )
        .bind(run_id)
        .bind(serde_json::to_value(metrics)?)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(FxError::Persistence(format!(
                "metrics of finished run {run_id} are final"
            )));
        }
        Ok(())
    }

    async fn list_runs(&self, kind: Option<RunKind>, limit: usize) -> Result<Vec<RunMetadata>> {
        let rows = sqlx::query(
            r#"
            SELECT run_id, kind, strategy_name, instrument, granularity, status,
                   started_at, ended_at, config_snapshot, error, orphaned_positions
            FROM runs
            WHERE ($1::text IS NULL OR kind = $1)
            ORDER BY started_at DESC, run_id ASC
            LIMIT $2
            "#,
        )
        .bind(kind.map(|k| k.as_str()))
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(Self::row_to_run).collect()
    }

    async fn get_run(&self, run_id: Uuid) -> Result<Option<RunMetadata>> {
        let row = sqlx::query(
            r#"
            SELECT run_id, kind, strategy_name, instrument, granularity, status,
                   started_at, ended_at, config_snapshot, error, orphaned_positions
            FROM runs WHERE run_id = $1
            "#,
        )
        .bind(run_id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(Self::row_to_run).transpose()
    }

    async fn get_metrics(&self, run_id: Uuid) -> Result<Option<MetricsSnapshot>> {
        let row = sqlx::query("SELECT metrics FROM run_metrics WHERE run_id = $1")
            .bind(run_id)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(r) => Ok(Some(serde_json::from_value(r.get("metrics"))?)),
            None => Ok(None),
        }
    }
}
