use anyhow::{bail, Context, Result};
use clap::Parser;
use fxbot::adapters::PostgresStore;
use fxbot::backtest::{load_csv, prepare_bars, write_reports, ReplayEngine};
use fxbot::broker::{build_broker_for, BrokerKind, PaperFeed, RandomWalkConfig};
use fxbot::bus::{EventBus, TOPIC_EVENTS};
use fxbot::cli::{self, Cli, Commands};
use fxbot::config::AppConfig;
use fxbot::domain::{Granularity, RunKind, RunStatus};
use fxbot::error::FxError;
use fxbot::logging::{init_logging, init_logging_simple};
use fxbot::persistence::{MemoryStore, RunRepository};
use fxbot::session::{LiveRunner, LiveSessionRequest, SessionState};
use fxbot::strategy::{StrategyParams, StrategyRegistry};
use serde_json::json;
use std::path::Path;
use std::sync::Arc;
use tokio::signal;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = AppConfig::load_from(&cli.config)
        .with_context(|| format!("loading configuration from {}", cli.config.display()))?;
    if let Err(errors) = config.validate() {
        for error in &errors {
            eprintln!("config: {error}");
        }
        bail!("invalid configuration ({} errors)", errors.len());
    }

    match cli.command {
        Commands::Strategies => {
            init_logging_simple();
            cli::list_strategies(&StrategyRegistry::builtin());
        }
        Commands::Backtest {
            csv,
            strategy,
            params,
            instrument,
            granularity,
            output,
        } => {
            init_logging(&config.logging);
            let params = cli::collect_params(params);
            run_backtest_mode(
                &config,
                csv.as_deref(),
                &strategy,
                &params,
                &instrument,
                granularity,
                output.as_deref(),
            )
            .await?;
        }
        Commands::ImportCandles {
            csv,
            instrument,
            granularity,
        } => {
            init_logging(&config.logging);
            run_import_mode(&config, &csv, &instrument, granularity).await?;
        }
        Commands::Live {
            strategy,
            params,
            instrument,
            granularity,
            bars,
            broker,
        } => {
            init_logging(&config.logging);
            let request = LiveSessionRequest {
                strategy,
                params: cli::collect_params(params),
                instrument,
                granularity,
                risk: config.risk.to_parameters(),
            };
            run_live_mode(&config, request, bars, broker).await?;
        }
        Commands::Runs {
            kind,
            limit,
            run_id,
        } => {
            init_logging_simple();
            run_runs_mode(&config, kind, limit, run_id).await?;
        }
    }

    Ok(())
}

/// Postgres when a database is configured, otherwise an in-process store
async fn open_store(config: &AppConfig) -> Result<Arc<dyn RunRepository>> {
    match &config.database {
        Some(db) => {
            let store = PostgresStore::new(&db.url, db.max_connections)
                .await
                .context("connecting to database")?;
            store.migrate().await?;
            Ok(Arc::new(store))
        }
        None => {
            info!("No database configured, runs are kept in memory");
            Ok(Arc::new(MemoryStore::new()))
        }
    }
}

async fn run_backtest_mode(
    config: &AppConfig,
    csv: Option<&Path>,
    strategy: &str,
    params: &StrategyParams,
    instrument: &str,
    granularity: Granularity,
    output: Option<&Path>,
) -> Result<()> {
    let registry = StrategyRegistry::builtin();
    let unit = registry.create_strategy(strategy, params)?;
    let store = open_store(config).await?;
    let persistent = config.database.is_some();

    let bars = match csv {
        Some(path) => {
            let bars = prepare_bars(load_csv(path, instrument, granularity)?);
            if persistent {
                let written = store.upsert_candles(&bars).await?;
                info!("Stored {} candles for {} {}", written, instrument, granularity);
            }
            bars
        }
        None if persistent => store.load_candles(instrument, granularity, None, None).await?,
        None => bail!("--csv is required when no database is configured"),
    };
    if bars.is_empty() {
        bail!("no candles for {instrument} {granularity}");
    }

    let engine = ReplayEngine::new(config.backtest.clone());
    let report = engine.run_with_params(&bars, unit, params, &config.risk.to_parameters())?;

    if persistent {
        let run_id = report.run.run_id;
        if store.get_run(run_id).await?.is_some() {
            info!("Run {} already recorded", run_id);
        } else {
            // Metrics can only be attached while the run is still open
            let mut open = report.run.clone();
            open.status = RunStatus::Running;
            open.ended_at = None;
            store.start_run(&open).await?;
            store.save_metrics(run_id, &report.metrics).await?;
            store.finish_run(&report.run).await?;
            info!("Run {} recorded", run_id);
        }
    }

    if let Some(dir) = output {
        write_reports(&report, dir)?;
        info!("Reports written to {}", dir.display());
    }

    let mut metrics = report.metrics.clone();
    metrics.equity_curve.clear();
    let summary = json!({
        "run_id": report.run.run_id,
        "strategy": report.run.strategy_name,
        "instrument": report.run.instrument,
        "granularity": report.run.granularity,
        "bars": bars.len(),
        "from": report.run.started_at,
        "to": report.run.ended_at,
        "metrics": metrics,
    });
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}

async fn run_import_mode(
    config: &AppConfig,
    csv: &Path,
    instrument: &str,
    granularity: Granularity,
) -> Result<()> {
    if config.database.is_none() {
        bail!("import-candles needs a database (set database.url or FXBOT__DATABASE__URL)");
    }
    let store = open_store(config).await?;
    let bars = prepare_bars(load_csv(csv, instrument, granularity)?);
    let written = store.upsert_candles(&bars).await?;
    println!(
        "Imported {} candles for {} {} from {}",
        written,
        instrument,
        granularity,
        csv.display()
    );
    Ok(())
}

async fn run_live_mode(
    config: &AppConfig,
    request: LiveSessionRequest,
    bars: Option<usize>,
    broker: Option<BrokerKind>,
) -> Result<()> {
    let kind = broker.unwrap_or(config.broker.kind);
    let feed = match kind {
        BrokerKind::Paper => Some(PaperFeed::RandomWalk(RandomWalkConfig {
            max_bars: bars,
            ..Default::default()
        })),
        _ => {
            if bars.is_some() {
                warn!("--bars only applies to the paper broker");
            }
            None
        }
    };
    let handles = build_broker_for(kind, config, feed)?;
    let store = open_store(config).await?;
    let bus = EventBus::new(config.bus.queue_capacity);

    let events = bus.subscribe(TOPIC_EVENTS);
    let printer = tokio::spawn(async move {
        while let Some(message) = events.recv().await {
            println!("{}", message.payload);
        }
    });

    let runner = LiveRunner::new(
        handles,
        store,
        StrategyRegistry::builtin(),
        bus,
        config.session.clone(),
    );
    let run_id = runner.start(request).await?;
    info!("Session {} running on {} broker, Ctrl-C to stop", run_id, kind);

    let snapshot = tokio::select! {
        _ = signal::ctrl_c() => {
            info!("Ctrl-C received, stopping session");
            match runner.stop().await {
                Ok(snapshot) => snapshot,
                Err(FxError::NoActiveSession) => runner.wait().await,
                Err(e) => return Err(e.into()),
            }
        }
        snapshot = runner.wait() => snapshot,
    };
    printer.abort();

    println!("{}", serde_json::to_string_pretty(&snapshot)?);
    if snapshot.state == SessionState::Failed {
        bail!(
            "session {} failed: {}",
            run_id,
            snapshot.error.unwrap_or_default()
        );
    }
    Ok(())
}

async fn run_runs_mode(
    config: &AppConfig,
    kind: Option<RunKind>,
    limit: usize,
    run_id: Option<uuid::Uuid>,
) -> Result<()> {
    if config.database.is_none() {
        bail!("runs are only recorded when a database is configured");
    }
    let store = open_store(config).await?;

    if let Some(run_id) = run_id {
        let Some(run) = store.get_run(run_id).await? else {
            bail!("run {run_id} not found");
        };
        let metrics = store.get_metrics(run_id).await?;
        println!(
            "{}",
            serde_json::to_string_pretty(&json!({ "run": run, "metrics": metrics }))?
        );
        return Ok(());
    }

    let runs = store.list_runs(kind, limit).await?;
    println!(
        "\n{:<36}  {:<8}  {:<9}  {:<8}  {:<8}  {:<4}  STARTED",
        "RUN", "KIND", "STATUS", "STRATEGY", "PAIR", "TF"
    );
    println!("{}", "-".repeat(110));
    for run in runs {
        println!(
            "{:<36}  {:<8}  {:<9}  {:<8}  {:<8}  {:<4}  {}",
            run.run_id,
            run.kind.as_str(),
            run.status.as_str(),
            run.strategy_name,
            run.instrument,
            run.granularity.as_str(),
            run.started_at.format("%Y-%m-%d %H:%M:%S")
        );
    }
    println!();
    Ok(())
}
