pub mod adapters;
pub mod backtest;
pub mod broker;
pub mod bus;
pub mod cli;
pub mod config;
pub mod domain;
pub mod error;
pub mod execution;
pub mod logging;
pub mod persistence;
pub mod risk;
pub mod session;
pub mod strategy;

pub use backtest::{BacktestReport, ReplayEngine};
pub use broker::{Broker, BrokerHandles, PriceSource};
pub use bus::{EventBus, Subscription};
pub use config::AppConfig;
pub use error::{BrokerError, FxError, Result};
pub use execution::ExecutionCoordinator;
pub use persistence::{MemoryStore, RunRepository};
pub use session::{LiveRunner, LiveSessionRequest, SessionSnapshot, SessionState};
pub use strategy::{StrategyRegistry, StrategyUnit};
