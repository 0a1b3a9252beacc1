//! Paper broker: simulated account plus a synthetic or replayed bar feed
//!
//! Every bar the feed produces is applied to the simulated account before it
//! is handed to the consumer: protective exits are evaluated against the bar
//! range, then the quote moves to the bar close.

use async_trait::async_trait;
use chrono::{DateTime, DurationRound, Utc};
use futures::stream::BoxStream;
use futures::StreamExt;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use super::sim::SimulatedBroker;
use super::traits::{BarStream, Broker, BrokerKind, BrokerResult, PriceSource};
use crate::domain::{pip_size, BrokerPosition, Granularity, OrderFill, OrderRequest, PriceBar, Quote};

/// Seeded random walk
#[derive(Debug, Clone)]
pub struct RandomWalkConfig {
    pub start_price: Decimal,
    /// Largest close-to-close move, in pips
    pub step_pips: Decimal,
    pub seed: u64,
    /// Wall-clock delay between bars; zero emits as fast as consumed
    pub bar_interval: Duration,
    /// Stop after this many bars; `None` runs until the consumer stops
    pub max_bars: Option<usize>,
    pub start_time: Option<DateTime<Utc>>,
}

impl Default for RandomWalkConfig {
    fn default() -> Self {
        Self {
            start_price: dec!(1.1000),
            step_pips: dec!(5),
            seed: 7,
            bar_interval: Duration::from_secs(1),
            max_bars: None,
            start_time: None,
        }
    }
}

#[derive(Debug, Clone)]
pub enum PaperFeed {
    RandomWalk(RandomWalkConfig),
    /// Pre-loaded bars, emitted in order
    Replay {
        bars: Vec<PriceBar>,
        bar_interval: Duration,
    },
}

pub struct PaperBroker {
    sim: Arc<SimulatedBroker>,
    feed: PaperFeed,
    spread_pips: Decimal,
}

impl PaperBroker {
    pub fn new(balance: Decimal, spread_pips: Decimal, feed: PaperFeed) -> Self {
        Self {
            sim: Arc::new(SimulatedBroker::new(balance, Decimal::ZERO)),
            feed,
            spread_pips,
        }
    }
}

#[async_trait]
impl Broker for PaperBroker {
    fn kind(&self) -> BrokerKind {
        BrokerKind::Paper
    }

    async fn account_equity(&self) -> BrokerResult<Decimal> {
        self.sim.account_equity().await
    }

    async fn current_price(&self, instrument: &str) -> BrokerResult<Quote> {
        self.sim.current_price(instrument).await
    }

    async fn submit_order(&self, order: &OrderRequest) -> BrokerResult<OrderFill> {
        let fill = self.sim.submit_order(order).await?;
        info!(
            "paper: filled {} {} @ {} ({})",
            fill.units, fill.instrument, fill.price, fill.client_reference
        );
        Ok(fill)
    }

    async fn open_positions(&self, instrument: &str) -> BrokerResult<Vec<BrokerPosition>> {
        self.sim.open_positions(instrument).await
    }

    async fn close_position(&self, position_id: &str) -> BrokerResult<OrderFill> {
        self.sim.close_position(position_id).await
    }
}

struct WalkState {
    rng: StdRng,
    last_close: Decimal,
    open_time: DateTime<Utc>,
    produced: usize,
}

#[async_trait]
impl PriceSource for PaperBroker {
    async fn stream_prices(&self, instrument: &str, granularity: Granularity) -> BrokerResult<BarStream> {
        let sim = self.sim.clone();
        let spread = self.spread_pips * pip_size(instrument);

        let bars: BoxStream<'static, PriceBar> = match &self.feed {
            PaperFeed::Replay { bars, bar_interval } => {
                let selected: Vec<PriceBar> = bars
                    .iter()
                    .filter(|b| b.instrument == instrument)
                    .cloned()
                    .collect();
                debug!("paper: replaying {} bars for {}", selected.len(), instrument);
                let interval = *bar_interval;
                futures::stream::iter(selected)
                    .then(move |bar| async move {
                        if !interval.is_zero() {
                            tokio::time::sleep(interval).await;
                        }
                        bar
                    })
                    .boxed()
            }
            PaperFeed::RandomWalk(config) => {
                let start = config.start_time.unwrap_or_else(|| {
                    let now = Utc::now();
                    now.duration_trunc(granularity.duration()).unwrap_or(now)
                });
                let state = WalkState {
                    rng: StdRng::seed_from_u64(config.seed),
                    last_close: config.start_price,
                    open_time: start,
                    produced: 0,
                };
                let config = config.clone();
                let instrument = instrument.to_string();
                let pip = pip_size(&instrument);

                futures::stream::unfold(state, move |mut state| {
                    let config = config.clone();
                    let instrument = instrument.clone();
                    async move {
                        if config.max_bars.is_some_and(|max| state.produced >= max) {
                            return None;
                        }
                        if !config.bar_interval.is_zero() {
                            tokio::time::sleep(config.bar_interval).await;
                        }
                        let bar = next_walk_bar(&mut state, &config, &instrument, granularity, pip);
                        Some((bar, state))
                    }
                })
                .boxed()
            }
        };

        let stream = bars.map(move |bar| {
            sim.evaluate_exits(&bar);
            sim.set_quote(bar.to_quote(spread));
            Ok(bar)
        });
        Ok(stream.boxed())
    }
}

fn next_walk_bar(
    state: &mut WalkState,
    config: &RandomWalkConfig,
    instrument: &str,
    granularity: Granularity,
    pip: Decimal,
) -> PriceBar {
    let step = config.step_pips * pip;
    let open = state.last_close;
    let drift = Decimal::new(state.rng.gen_range(-100..=100), 2);
    let close = (open + step * drift).max(pip);
    let wick_up = Decimal::new(state.rng.gen_range(0..=50), 2) * step;
    let wick_down = Decimal::new(state.rng.gen_range(0..=50), 2) * step;
    let volume = Decimal::from(state.rng.gen_range(50u32..500));

    let bar = PriceBar {
        instrument: instrument.to_string(),
        granularity,
        open_time: state.open_time,
        open,
        high: open.max(close) + wick_up,
        low: (open.min(close) - wick_down).max(Decimal::ZERO),
        close,
        volume,
    };

    state.last_close = close;
    state.open_time += granularity.duration();
    state.produced += 1;
    bar
}
