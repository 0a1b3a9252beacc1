//! Deterministic backtesting over historical candles

pub mod data;
pub mod engine;
pub mod metrics;

pub use data::{load_csv, parse_timestamp, prepare_bars, read_csv, write_reports};
pub use engine::{BacktestReport, ReplayEngine};
pub use metrics::compute_metrics;
