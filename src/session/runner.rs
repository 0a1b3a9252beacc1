//! Live session orchestration
//!
//! A `LiveRunner` owns at most one active session. The session is a tokio
//! task that pulls closed bars from a `PriceSource` and feeds them to the
//! `ExecutionCoordinator`. Cancellation is only observed between bars, so an
//! in-flight broker call always completes. State transitions happen under the
//! runner's mutex; whichever of `stop()` or the task moves the session to
//! `Stopping` first is the one that finishes it.

use chrono::Utc;
use futures::future::{BoxFuture, FutureExt, Shared};
use futures::StreamExt;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::state::{LiveSessionRequest, SessionProgress, SessionSnapshot, SessionState};
use crate::backtest::compute_metrics;
use crate::broker::BrokerHandles;
use crate::bus::{price_topic, EventBus, TOPIC_PRICES};
use crate::config::{OrphanPolicy, SessionConfig};
use crate::domain::{EquityPoint, Granularity, PriceBar, RunKind, RunMetadata, RunStatus};
use crate::error::{FxError, Result};
use crate::execution::{EventPublisher, ExecutionCoordinator, LogLevel};
use crate::persistence::RunRepository;
use crate::risk::DailyGuard;
use crate::strategy::{StrategyContext, StrategyRegistry};

const PERSIST_BASE_DELAY_MS: u64 = 100;

/// Why the session task returned
#[derive(Debug, Clone, PartialEq)]
enum TaskExit {
    Cancelled,
    StreamEnded,
    Failed(String),
}

type SessionTask = Shared<BoxFuture<'static, TaskExit>>;

#[derive(Default)]
struct RunnerInner {
    state: SessionState,
    run: Option<RunMetadata>,
    progress: SessionProgress,
    cancel: Option<watch::Sender<bool>>,
    task: Option<SessionTask>,
}

struct RunnerShared {
    handles: BrokerHandles,
    repo: Arc<dyn RunRepository>,
    bus: EventBus,
    config: SessionConfig,
    inner: Mutex<RunnerInner>,
}

pub struct LiveRunner {
    registry: StrategyRegistry,
    shared: Arc<RunnerShared>,
}

impl LiveRunner {
    pub fn new(
        handles: BrokerHandles,
        repo: Arc<dyn RunRepository>,
        registry: StrategyRegistry,
        bus: EventBus,
        config: SessionConfig,
    ) -> Self {
        Self {
            registry,
            shared: Arc::new(RunnerShared {
                handles,
                repo,
                bus,
                config,
                inner: Mutex::new(RunnerInner::default()),
            }),
        }
    }

    pub fn bus(&self) -> &EventBus {
        &self.shared.bus
    }

    pub fn registry(&self) -> &StrategyRegistry {
        &self.registry
    }

    /// Start a session and return its run id.
    ///
    /// Fails with `SessionConflict` while another session is starting,
    /// running or stopping; that session is not affected.
    pub async fn start(&self, request: LiveSessionRequest) -> Result<Uuid> {
        let mut inner = self.shared.inner.lock().await;
        if inner.state.is_active() {
            let current = inner
                .run
                .as_ref()
                .map(|run| run.run_id.to_string())
                .unwrap_or_default();
            return Err(FxError::SessionConflict(current));
        }

        request
            .risk
            .validate()
            .map_err(|e| FxError::InvalidParams(e.to_string()))?;
        let strategy = self
            .registry
            .create_strategy(&request.strategy, &request.params)?;

        let run_id = Uuid::new_v4();
        let ctx = StrategyContext::new(
            run_id,
            &request.instrument,
            request.granularity,
            request.risk.clone(),
        );
        let coordinator =
            ExecutionCoordinator::new(strategy, self.shared.handles.broker.clone(), ctx)?
                .with_bus(self.shared.bus.clone());

        let run = RunMetadata {
            run_id,
            kind: RunKind::Live,
            strategy_name: request.strategy.clone(),
            instrument: request.instrument.clone(),
            granularity: request.granularity,
            status: RunStatus::Starting,
            started_at: Utc::now(),
            ended_at: None,
            config_snapshot: json!({
                "risk": request.risk,
                "params": request.params,
                "broker": self.shared.handles.broker.kind(),
            }),
            error: None,
            orphaned_positions: Vec::new(),
        };
        self.shared.repo.start_run(&run).await?;

        let (cancel_tx, cancel_rx) = watch::channel(false);
        let task = tokio::spawn(run_session(self.shared.clone(), coordinator, cancel_rx))
            .map(|joined| {
                joined.unwrap_or_else(|e| TaskExit::Failed(format!("session task aborted: {e}")))
            })
            .boxed()
            .shared();

        info!(
            "Live session {} started: {} on {} {}",
            run_id, request.strategy, request.instrument, request.granularity
        );
        EventPublisher::new(Some(self.shared.bus.clone()), run_id).event(
            "session_started",
            run.started_at,
            json!({
                "strategy": request.strategy,
                "instrument": request.instrument,
                "granularity": request.granularity,
            }),
        );

        *inner = RunnerInner {
            state: SessionState::Starting,
            run: Some(run),
            progress: SessionProgress::default(),
            cancel: Some(cancel_tx),
            task: Some(task),
        };
        Ok(run_id)
    }

    /// Stop the active session and return its final snapshot.
    ///
    /// Valid only while the session is starting or running.
    pub async fn stop(&self) -> Result<SessionSnapshot> {
        let (cancel, task) = {
            let mut inner = self.shared.inner.lock().await;
            if !inner.state.is_stoppable() {
                return Err(FxError::NoActiveSession);
            }
            inner.state = SessionState::Stopping;
            (inner.cancel.take(), inner.task.clone())
        };

        info!("Stopping live session");
        if let Some(cancel) = cancel {
            let _ = cancel.send(true);
        }
        let exit = match task {
            Some(task) => task.await,
            None => TaskExit::Cancelled,
        };
        finalize(&self.shared, exit, true).await;
        Ok(self.snapshot().await)
    }

    /// Wait for the session task to return, then report the runner's state.
    ///
    /// Returns immediately when no session was ever started. A session that
    /// ends on its own (finite stream, fatal error) is finished by its task.
    pub async fn wait(&self) -> SessionSnapshot {
        let task = self.shared.inner.lock().await.task.clone();
        if let Some(task) = task {
            task.await;
        }
        self.snapshot().await
    }

    pub async fn state(&self) -> SessionState {
        self.shared.inner.lock().await.state
    }

    pub async fn snapshot(&self) -> SessionSnapshot {
        let inner = self.shared.inner.lock().await;
        let run = inner.run.as_ref();
        let progress = &inner.progress;
        SessionSnapshot {
            state: inner.state,
            run_id: run.map(|r| r.run_id),
            strategy: run.map(|r| r.strategy_name.clone()),
            instrument: run.map(|r| r.instrument.clone()),
            granularity: run.map(|r| r.granularity),
            run_status: run.map(|r| r.status),
            started_at: run.map(|r| r.started_at),
            ended_at: run.and_then(|r| r.ended_at),
            bars_processed: progress.bars_processed,
            orders_submitted: progress.orders_submitted,
            last_bar_time: progress.last_bar_time,
            equity: progress.equity,
            open_positions: progress.open_positions,
            entries_halted: progress.entries_halted,
            reconnects: progress.reconnects,
            orphaned_positions: run.map(|r| r.orphaned_positions.clone()).unwrap_or_default(),
            error: run.and_then(|r| r.error.clone()),
        }
    }
}

// =============================================================================
// Session task
// =============================================================================

async fn run_session(
    shared: Arc<RunnerShared>,
    mut coordinator: ExecutionCoordinator,
    mut cancel: watch::Receiver<bool>,
) -> TaskExit {
    let run_id = coordinator.run_id();
    let (instrument, granularity) = {
        let inner = shared.inner.lock().await;
        match inner.run.as_ref() {
            Some(run) => (run.instrument.clone(), run.granularity),
            None => return TaskExit::Failed("session started without a run".to_string()),
        }
    };
    let events = EventPublisher::new(Some(shared.bus.clone()), run_id);
    let mut guard: Option<DailyGuard> = None;
    let mut failures = 0u32;

    let exit = 'session: loop {
        match shared
            .handles
            .prices
            .stream_prices(&instrument, granularity)
            .await
        {
            Ok(mut stream) => {
                debug!("[{}] price stream opened for {} {}", run_id, instrument, granularity);
                loop {
                    let item = tokio::select! {
                        biased;
                        _ = cancel.changed() => break 'session TaskExit::Cancelled,
                        item = stream.next() => item,
                    };
                    match item {
                        None => break 'session TaskExit::StreamEnded,
                        Some(Ok(bar)) => {
                            failures = 0;
                            if let Err(e) =
                                process_bar(&shared, &mut coordinator, &mut guard, &events, &bar).await
                            {
                                break 'session TaskExit::Failed(e.to_string());
                            }
                        }
                        Some(Err(e)) if e.is_fatal() => {
                            error!("[{}] price stream failed: {}", run_id, e);
                            break 'session TaskExit::Failed(e.to_string());
                        }
                        Some(Err(e)) => {
                            warn!("[{}] price stream broke: {}", run_id, e);
                            break;
                        }
                    }
                }
            }
            Err(e) if e.is_fatal() => {
                error!("[{}] cannot open price stream: {}", run_id, e);
                break 'session TaskExit::Failed(e.to_string());
            }
            Err(e) => warn!("[{}] cannot open price stream: {}", run_id, e),
        }

        failures += 1;
        if failures > shared.config.max_reconnect_attempts {
            let e = FxError::Stream(format!(
                "unavailable after {} reconnect attempts",
                shared.config.max_reconnect_attempts
            ));
            error!("[{}] {}", run_id, e);
            break 'session TaskExit::Failed(e.to_string());
        }
        let delay = backoff(shared.config.reconnect_base_delay_ms, failures);
        info!("[{}] reconnecting in {:?} (attempt {})", run_id, delay, failures);
        shared.inner.lock().await.progress.reconnects += 1;
        tokio::select! {
            biased;
            _ = cancel.changed() => break 'session TaskExit::Cancelled,
            _ = tokio::time::sleep(delay) => {}
        }
    };

    coordinator.stop();

    // Claim the shutdown unless stop() already has
    let claimed = {
        let mut inner = shared.inner.lock().await;
        if inner.state.is_stoppable() {
            inner.state = SessionState::Stopping;
            inner.cancel = None;
            true
        } else {
            false
        }
    };
    if claimed {
        finalize(&shared, exit.clone(), false).await;
    }
    exit
}

async fn process_bar(
    shared: &RunnerShared,
    coordinator: &mut ExecutionCoordinator,
    guard: &mut Option<DailyGuard>,
    events: &EventPublisher,
    bar: &PriceBar,
) -> Result<()> {
    let run_id = coordinator.run_id();
    let time = bar.close_time();
    let broker = &shared.handles.broker;

    shared.bus.publish(TOPIC_PRICES, bar);
    shared.bus.publish(&price_topic(&bar.instrument), bar);

    let executed = coordinator.handle_bar(bar).await?;

    let equity = match broker.account_equity().await {
        Ok(equity) => Some(equity),
        Err(e) if e.is_fatal() => return Err(e.into()),
        Err(e) => {
            warn!("[{}] equity unavailable: {}", run_id, e);
            None
        }
    };
    let open_positions = match broker.open_positions(&bar.instrument).await {
        Ok(positions) => Some(positions.len()),
        Err(e) if e.is_fatal() => return Err(e.into()),
        Err(e) => {
            debug!("[{}] positions unavailable: {}", run_id, e);
            None
        }
    };

    if let Some(equity) = equity {
        let guard = guard.get_or_insert_with(|| {
            DailyGuard::new(
                equity,
                time,
                shared.config.daily_target_pct,
                shared.config.daily_loss_limit_pct,
            )
        });
        if let Some(breach) = guard.observe(time, equity) {
            events.event(breach.event_name(), time, json!(breach));
            events.log(
                LogLevel::Warn,
                time,
                format!("{}: new entries halted for the day", breach.event_name()),
            );
        }
        coordinator.set_entries_halted(guard.entries_halted());
    }

    let first_bar = {
        let mut inner = shared.inner.lock().await;
        let first_bar = inner.state == SessionState::Starting;
        if first_bar {
            inner.state = SessionState::Running;
            if let Some(run) = inner.run.as_mut() {
                run.status = RunStatus::Running;
            }
        }
        let progress = &mut inner.progress;
        progress.bars_processed += 1;
        progress.last_bar_time = Some(time);
        progress.entries_halted = coordinator.entries_halted();
        if executed.is_some() {
            progress.orders_submitted += 1;
        }
        if let Some(count) = open_positions {
            progress.open_positions = count;
        }
        if let Some(equity) = equity.or(progress.equity) {
            progress.equity = Some(equity);
            progress.equity_curve.push(EquityPoint { time, equity });
        }
        first_bar
    };

    if first_bar {
        info!("[{}] first bar processed, session running", run_id);
        if let Err(e) = shared.repo.update_run_status(run_id, RunStatus::Running).await {
            warn!("[{}] could not persist running status: {}", run_id, e);
        }
    }

    events.event(
        "equity_update",
        time,
        json!({
            "equity": equity,
            "open_positions": open_positions,
            "bars_processed": coordinator.bars_processed(),
            "entries_halted": coordinator.entries_halted(),
        }),
    );
    Ok(())
}

// =============================================================================
// Shutdown
// =============================================================================

/// Apply the orphan policy, persist the terminal run and publish the outcome
async fn finalize(shared: &RunnerShared, exit: TaskExit, requested: bool) {
    let (mut run, curve) = {
        let inner = shared.inner.lock().await;
        match inner.run.clone() {
            Some(run) => (run, inner.progress.equity_curve.clone()),
            None => return,
        }
    };
    let run_id = run.run_id;
    let events = EventPublisher::new(Some(shared.bus.clone()), run_id);
    let now = Utc::now();

    run.orphaned_positions = settle_positions(shared, &run).await;

    let (status, error) = match &exit {
        TaskExit::Failed(e) => (RunStatus::Failed, Some(e.clone())),
        TaskExit::Cancelled => (RunStatus::Stopped, None),
        TaskExit::StreamEnded if requested => (RunStatus::Stopped, None),
        TaskExit::StreamEnded => (RunStatus::Completed, None),
    };
    run.finish(status, now, error.clone());

    let initial_equity = curve.first().map(|p| p.equity).unwrap_or_default();
    let metrics = compute_metrics(&[], &curve, initial_equity, periods_per_year(run.granularity));
    let attempts = shared.config.persistence_retry_attempts;

    // Metrics are frozen once the run is terminal, so they go first
    persist_with_retry(attempts, run_id, "metrics", || {
        shared.repo.save_metrics(run_id, &metrics)
    })
    .await;
    persist_with_retry(attempts, run_id, "terminal status", || {
        shared.repo.finish_run(&run)
    })
    .await;

    {
        let mut inner = shared.inner.lock().await;
        inner.state = match status {
            RunStatus::Failed => SessionState::Failed,
            _ => SessionState::Completed,
        };
        inner.run = Some(run.clone());
        inner.cancel = None;
    }

    match error {
        Some(e) => {
            error!("Live session {} failed: {}", run_id, e);
            events.event("error", now, json!({ "error": e }));
            events.log(LogLevel::Error, now, format!("session failed: {e}"));
        }
        None => {
            info!(
                "Live session {} {} ({} orphaned positions)",
                run_id,
                status,
                run.orphaned_positions.len()
            );
            events.event(
                "session_stopped",
                now,
                json!({ "status": status, "orphaned_positions": run.orphaned_positions }),
            );
        }
    }
}

/// Position ids still open at the broker once the orphan policy has run
async fn settle_positions(shared: &RunnerShared, run: &RunMetadata) -> Vec<String> {
    let broker = &shared.handles.broker;
    let positions = match broker.open_positions(&run.instrument).await {
        Ok(positions) => positions,
        Err(e) => {
            warn!("[{}] cannot list open positions at shutdown: {}", run.run_id, e);
            return run.orphaned_positions.clone();
        }
    };
    if positions.is_empty() {
        return Vec::new();
    }

    match shared.config.orphan_policy {
        OrphanPolicy::Leave => {
            warn!(
                "[{}] leaving {} open positions at the broker",
                run.run_id,
                positions.len()
            );
            positions.into_iter().map(|p| p.id).collect()
        }
        OrphanPolicy::Flatten => {
            let mut remaining = Vec::new();
            for position in positions {
                match broker.close_position(&position.id).await {
                    Ok(fill) => info!(
                        "[{}] flattened {} ({} units) @ {}",
                        run.run_id, position.id, position.units, fill.price
                    ),
                    Err(e) => {
                        error!("[{}] failed to flatten {}: {}", run.run_id, position.id, e);
                        remaining.push(position.id);
                    }
                }
            }
            remaining
        }
    }
}

async fn persist_with_retry<F, Fut>(attempts: u32, run_id: Uuid, what: &str, mut op: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<()>>,
{
    let attempts = attempts.max(1);
    for attempt in 1..=attempts {
        match op().await {
            Ok(()) => return true,
            Err(e) if attempt < attempts => {
                let delay = backoff(PERSIST_BASE_DELAY_MS, attempt);
                warn!(
                    "[{}] persisting {} failed (attempt {}/{}): {}; retrying in {:?}",
                    run_id, what, attempt, attempts, e, delay
                );
                tokio::time::sleep(delay).await;
            }
            Err(e) => {
                error!(
                    "[{}] giving up persisting {} after {} attempts: {}",
                    run_id, what, attempts, e
                );
            }
        }
    }
    false
}

/// `base * 2^(attempt - 1)`
fn backoff(base_ms: u64, attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1).min(16);
    Duration::from_millis(base_ms.saturating_mul(1u64 << exponent))
}

/// Bars per trading year (252 days) used to annualise live metrics
fn periods_per_year(granularity: Granularity) -> u32 {
    let seconds = granularity.duration().num_seconds().max(1);
    u32::try_from(252 * 86_400 / seconds).unwrap_or(u32::MAX).max(1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{
        BarStream, Broker, BrokerResult, PaperBroker, PaperFeed, PriceSource, RandomWalkConfig,
    };
    use crate::bus::TOPIC_EVENTS;
    use crate::domain::MetricsSnapshot;
    use crate::error::BrokerError;
    use crate::persistence::MemoryStore;
    use crate::risk::RiskParameters;
    use crate::strategy::StrategyParams;
    use async_trait::async_trait;
    use chrono::DateTime;
    use rust_decimal_macros::dec;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn risk() -> RiskParameters {
        RiskParameters {
            risk_fraction: dec!(0.01),
            max_positions: 2,
            spread_pips: dec!(1),
            stop_distance_pips: dec!(20),
            take_profit_pips: None,
            max_leverage: dec!(20),
        }
    }

    fn request(strategy: &str) -> LiveSessionRequest {
        let mut params = StrategyParams::new();
        if strategy == "sma" {
            params.insert("fast".into(), 2.into());
            params.insert("slow".into(), 5.into());
        }
        LiveSessionRequest {
            strategy: strategy.to_string(),
            params,
            instrument: "EUR_USD".into(),
            granularity: Granularity::M1,
            risk: risk(),
        }
    }

    fn paper(max_bars: Option<usize>, interval_ms: u64) -> Arc<PaperBroker> {
        Arc::new(PaperBroker::new(
            dec!(10000),
            dec!(1),
            PaperFeed::RandomWalk(RandomWalkConfig {
                seed: 42,
                step_pips: dec!(8),
                bar_interval: Duration::from_millis(interval_ms),
                max_bars,
                ..Default::default()
            }),
        ))
    }

    fn runner_with(
        paper: Arc<PaperBroker>,
        config: SessionConfig,
    ) -> (LiveRunner, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let handles = BrokerHandles {
            broker: paper.clone(),
            prices: paper,
        };
        let runner = LiveRunner::new(
            handles,
            store.clone(),
            StrategyRegistry::builtin(),
            EventBus::new(1024),
            config,
        );
        (runner, store)
    }

    struct BrokenSource {
        error: BrokerError,
    }

    #[async_trait]
    impl PriceSource for BrokenSource {
        async fn stream_prices(&self, _instrument: &str, _granularity: Granularity) -> BrokerResult<BarStream> {
            let item: BrokerResult<PriceBar> = Err(self.error.clone());
            Ok(futures::stream::iter(vec![item]).boxed())
        }
    }

    /// Store whose terminal write always fails
    #[derive(Default)]
    struct FailingFinish {
        inner: MemoryStore,
        finish_calls: AtomicU32,
    }

    #[async_trait]
    impl RunRepository for FailingFinish {
        async fn upsert_candles(&self, bars: &[PriceBar]) -> Result<usize> {
            self.inner.upsert_candles(bars).await
        }

        async fn load_candles(
            &self,
            instrument: &str,
            granularity: Granularity,
            from: Option<DateTime<Utc>>,
            to: Option<DateTime<Utc>>,
        ) -> Result<Vec<PriceBar>> {
            self.inner.load_candles(instrument, granularity, from, to).await
        }

        async fn start_run(&self, run: &RunMetadata) -> Result<()> {
            self.inner.start_run(run).await
        }

        async fn update_run_status(&self, run_id: Uuid, status: RunStatus) -> Result<()> {
            self.inner.update_run_status(run_id, status).await
        }

        async fn finish_run(&self, _run: &RunMetadata) -> Result<()> {
            self.finish_calls.fetch_add(1, Ordering::SeqCst);
            Err(FxError::Persistence("database unreachable".into()))
        }

        async fn save_metrics(&self, run_id: Uuid, metrics: &MetricsSnapshot) -> Result<()> {
            self.inner.save_metrics(run_id, metrics).await
        }

        async fn list_runs(&self, kind: Option<RunKind>, limit: usize) -> Result<Vec<RunMetadata>> {
            self.inner.list_runs(kind, limit).await
        }

        async fn get_run(&self, run_id: Uuid) -> Result<Option<RunMetadata>> {
            self.inner.get_run(run_id).await
        }

        async fn get_metrics(&self, run_id: Uuid) -> Result<Option<MetricsSnapshot>> {
            self.inner.get_metrics(run_id).await
        }
    }

    #[tokio::test]
    async fn test_stop_without_session() {
        let (runner, _) = runner_with(paper(Some(1), 0), SessionConfig::default());
        assert!(matches!(runner.stop().await, Err(FxError::NoActiveSession)));
        assert_eq!(runner.state().await, SessionState::Idle);
    }

    #[tokio::test]
    async fn test_second_start_conflicts() {
        let (runner, store) = runner_with(paper(None, 5), SessionConfig::default());

        let run_id = runner.start(request("sma")).await.unwrap();
        let second = runner.start(request("rsi")).await;
        assert!(matches!(second, Err(FxError::SessionConflict(ref id)) if *id == run_id.to_string()));

        tokio::time::sleep(Duration::from_millis(60)).await;
        let snapshot = runner.stop().await.unwrap();
        assert_eq!(snapshot.run_id, Some(run_id));
        assert_eq!(snapshot.strategy.as_deref(), Some("sma"));
        assert_eq!(snapshot.state, SessionState::Completed);
        assert_eq!(snapshot.run_status, Some(RunStatus::Stopped));

        let stored = store.get_run(run_id).await.unwrap().unwrap();
        assert_eq!(stored.status, RunStatus::Stopped);
        assert!(store.get_metrics(run_id).await.unwrap().is_some());
        assert!(matches!(runner.stop().await, Err(FxError::NoActiveSession)));
    }

    #[tokio::test]
    async fn test_unknown_strategy_leaves_runner_idle() {
        let (runner, store) = runner_with(paper(Some(1), 0), SessionConfig::default());
        let result = runner.start(request("martingale")).await;
        assert!(matches!(result, Err(FxError::UnknownStrategy(_))));
        assert_eq!(runner.state().await, SessionState::Idle);
        assert!(store.list_runs(None, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_invalid_risk_is_rejected() {
        let (runner, _) = runner_with(paper(Some(1), 0), SessionConfig::default());
        let mut req = request("sma");
        req.risk.risk_fraction = dec!(0);
        assert!(matches!(runner.start(req).await, Err(FxError::InvalidParams(_))));
    }

    #[tokio::test]
    async fn test_finite_stream_completes_run() {
        let (runner, store) = runner_with(paper(Some(40), 0), SessionConfig::default());
        let mut events = runner.bus().subscribe(TOPIC_EVENTS);

        let run_id = runner.start(request("sma")).await.unwrap();
        let snapshot = runner.wait().await;

        assert_eq!(snapshot.state, SessionState::Completed);
        assert_eq!(snapshot.run_status, Some(RunStatus::Completed));
        assert_eq!(snapshot.bars_processed, 40);
        assert!(snapshot.equity.is_some());

        let metrics = store.get_metrics(run_id).await.unwrap().unwrap();
        assert_eq!(metrics.equity_curve.len(), 40);

        let mut kinds = Vec::new();
        while let Some(message) = events.try_recv() {
            kinds.push(message.payload["type"].as_str().unwrap_or_default().to_string());
        }
        assert_eq!(kinds.first().map(String::as_str), Some("session_started"));
        assert_eq!(kinds.iter().filter(|k| *k == "equity_update").count(), 40);
        assert_eq!(kinds.last().map(String::as_str), Some("session_stopped"));

        // The runner is free again
        let next = runner.start(request("rsi")).await.unwrap();
        assert_ne!(next, run_id);
        assert_eq!(runner.wait().await.run_id, Some(next));
    }

    #[tokio::test]
    async fn test_terminal_write_failure_still_completes_session() {
        let broker = paper(Some(5), 0);
        let store = Arc::new(FailingFinish::default());
        let config = SessionConfig::default();
        let attempts = config.persistence_retry_attempts;
        let runner = LiveRunner::new(
            BrokerHandles {
                broker: broker.clone(),
                prices: broker,
            },
            store.clone(),
            StrategyRegistry::builtin(),
            EventBus::new(64),
            config,
        );

        let run_id = runner.start(request("sma")).await.unwrap();
        let snapshot = runner.wait().await;

        assert_eq!(attempts, 3);
        assert_eq!(store.finish_calls.load(Ordering::SeqCst), attempts);
        assert_eq!(snapshot.state, SessionState::Completed);
        assert_eq!(snapshot.run_status, Some(RunStatus::Completed));
        assert!(snapshot.ended_at.is_some());

        // The store never saw the terminal write
        let stored = store.get_run(run_id).await.unwrap().unwrap();
        assert_eq!(stored.status, RunStatus::Running);
        assert!(stored.ended_at.is_none());
        assert!(store.get_metrics(run_id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_leave_policy_records_orphans() {
        let broker = paper(Some(60), 0);
        let (runner, store) = runner_with(broker.clone(), SessionConfig::default());

        let run_id = runner.start(request("sma")).await.unwrap();
        let snapshot = runner.wait().await;

        let open: Vec<String> = broker
            .open_positions("EUR_USD")
            .await
            .unwrap()
            .into_iter()
            .map(|p| p.id)
            .collect();
        assert_eq!(snapshot.orphaned_positions, open);
        let stored = store.get_run(run_id).await.unwrap().unwrap();
        assert_eq!(stored.orphaned_positions, open);
    }

    #[tokio::test]
    async fn test_flatten_policy_closes_positions() {
        let broker = paper(Some(60), 0);
        let config = SessionConfig {
            orphan_policy: OrphanPolicy::Flatten,
            ..Default::default()
        };
        let (runner, _) = runner_with(broker.clone(), config);

        runner.start(request("sma")).await.unwrap();
        let snapshot = runner.wait().await;

        assert!(snapshot.orphaned_positions.is_empty());
        assert!(broker.open_positions("EUR_USD").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_fatal_stream_error_fails_session() {
        let broker = paper(Some(1), 0);
        let store = Arc::new(MemoryStore::new());
        let runner = LiveRunner::new(
            BrokerHandles {
                broker,
                prices: Arc::new(BrokenSource {
                    error: BrokerError::Auth("token revoked".into()),
                }),
            },
            store.clone(),
            StrategyRegistry::builtin(),
            EventBus::new(64),
            SessionConfig::default(),
        );
        let mut events = runner.bus().subscribe(TOPIC_EVENTS);

        let run_id = runner.start(request("sma")).await.unwrap();
        let snapshot = runner.wait().await;

        assert_eq!(snapshot.state, SessionState::Failed);
        assert!(snapshot.error.unwrap().contains("token revoked"));
        let stored = store.get_run(run_id).await.unwrap().unwrap();
        assert_eq!(stored.status, RunStatus::Failed);

        let mut saw_error = false;
        while let Some(message) = events.try_recv() {
            saw_error |= message.payload["type"] == "error";
        }
        assert!(saw_error);
    }

    #[tokio::test]
    async fn test_reconnects_are_bounded() {
        let broker = paper(Some(1), 0);
        let runner = LiveRunner::new(
            BrokerHandles {
                broker,
                prices: Arc::new(BrokenSource {
                    error: BrokerError::Stream("socket closed".into()),
                }),
            },
            Arc::new(MemoryStore::new()),
            StrategyRegistry::builtin(),
            EventBus::new(64),
            SessionConfig {
                max_reconnect_attempts: 2,
                reconnect_base_delay_ms: 1,
                ..Default::default()
            },
        );

        runner.start(request("sma")).await.unwrap();
        let snapshot = runner.wait().await;
        assert_eq!(snapshot.state, SessionState::Failed);
        assert_eq!(snapshot.reconnects, 2);
        let error = snapshot.error.unwrap();
        assert!(error.starts_with("Price stream error"), "{error}");
        assert!(error.contains("2 reconnect attempts"), "{error}");
    }

    #[test]
    fn test_backoff_doubles() {
        assert_eq!(backoff(100, 1), Duration::from_millis(100));
        assert_eq!(backoff(100, 3), Duration::from_millis(400));
    }

    #[test]
    fn test_periods_per_year() {
        assert_eq!(periods_per_year(Granularity::D), 252);
        assert_eq!(periods_per_year(Granularity::H1), 252 * 24);
    }
}
