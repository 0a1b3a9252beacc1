//! Live runner against the paper broker and the in-memory store

use fxbot::broker::{BrokerHandles, PaperBroker, PaperFeed, RandomWalkConfig};
use fxbot::bus::{EventBus, TOPIC_EVENTS, TOPIC_PRICES};
use fxbot::config::SessionConfig;
use fxbot::domain::{Granularity, RunKind, RunStatus};
use fxbot::error::FxError;
use fxbot::persistence::{MemoryStore, RunRepository};
use fxbot::risk::RiskParameters;
use fxbot::session::{LiveRunner, LiveSessionRequest, SessionState};
use fxbot::strategy::{StrategyParams, StrategyRegistry};
use rust_decimal_macros::dec;
use std::sync::Arc;
use std::time::Duration;

fn request() -> LiveSessionRequest {
    let mut params = StrategyParams::new();
    params.insert("period".into(), 5.into());
    params.insert("atr_period".into(), 5.into());
    LiveSessionRequest {
        strategy: "rsi".into(),
        params,
        instrument: "USD_JPY".into(),
        granularity: Granularity::M5,
        risk: RiskParameters {
            risk_fraction: dec!(0.005),
            max_positions: 3,
            spread_pips: dec!(1.5),
            stop_distance_pips: dec!(15),
            take_profit_pips: Some(dec!(30)),
            max_leverage: dec!(25),
        },
    }
}

fn setup(max_bars: Option<usize>, interval: Duration) -> (LiveRunner, Arc<MemoryStore>, EventBus) {
    let paper = Arc::new(PaperBroker::new(
        dec!(50000),
        dec!(1.5),
        PaperFeed::RandomWalk(RandomWalkConfig {
            start_price: dec!(150.000),
            step_pips: dec!(6),
            seed: 99,
            bar_interval: interval,
            max_bars,
            start_time: None,
        }),
    ));
    let store = Arc::new(MemoryStore::new());
    let bus = EventBus::new(4096);
    let runner = LiveRunner::new(
        BrokerHandles {
            broker: paper.clone(),
            prices: paper,
        },
        store.clone(),
        StrategyRegistry::builtin(),
        bus.clone(),
        SessionConfig::default(),
    );
    (runner, store, bus)
}

#[tokio::test]
async fn conflicting_start_does_not_disturb_running_session() {
    let (runner, store, _bus) = setup(None, Duration::from_millis(2));

    let first = runner.start(request()).await.unwrap();
    tokio::time::sleep(Duration::from_millis(30)).await;

    let conflict = runner.start(request()).await;
    assert!(matches!(conflict, Err(FxError::SessionConflict(_))));

    tokio::time::sleep(Duration::from_millis(30)).await;
    let before_stop = runner.snapshot().await;
    assert_eq!(before_stop.run_id, Some(first));
    assert!(before_stop.bars_processed > 0);
    assert_eq!(before_stop.state, SessionState::Running);

    let last = runner.stop().await.unwrap();
    assert_eq!(last.state, SessionState::Completed);
    assert!(last.bars_processed >= before_stop.bars_processed);

    let runs = store.list_runs(Some(RunKind::Live), 10).await.unwrap();
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].status, RunStatus::Stopped);
}

#[tokio::test]
async fn finite_feed_publishes_prices_and_persists_metrics() {
    let (runner, store, bus) = setup(Some(30), Duration::ZERO);
    let prices = bus.subscribe(TOPIC_PRICES);
    let pair = bus.subscribe("prices:USD_JPY");
    let events = bus.subscribe(TOPIC_EVENTS);

    let run_id = runner.start(request()).await.unwrap();
    let snapshot = runner.wait().await;

    assert_eq!(snapshot.state, SessionState::Completed);
    assert_eq!(snapshot.bars_processed, 30);
    assert_eq!(prices.len(), 30);
    assert_eq!(pair.len(), 30);
    assert!(events.len() >= 32);

    let run = store.get_run(run_id).await.unwrap().unwrap();
    assert_eq!(run.status, RunStatus::Completed);
    assert!(run.ended_at.is_some());
    assert_eq!(run.config_snapshot["params"]["period"], 5);

    let metrics = store.get_metrics(run_id).await.unwrap().unwrap();
    assert_eq!(metrics.equity_curve.len(), 30);
}

#[tokio::test]
async fn stop_after_completion_reports_no_session() {
    let (runner, _store, _bus) = setup(Some(3), Duration::ZERO);
    runner.start(request()).await.unwrap();
    runner.wait().await;
    assert!(matches!(runner.stop().await, Err(FxError::NoActiveSession)));
}
