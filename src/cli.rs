use clap::{Parser, Subcommand};
use serde_json::Value;
use std::path::PathBuf;

use crate::broker::BrokerKind;
use crate::domain::{Granularity, RunKind};
use crate::strategy::{StrategyParams, StrategyRegistry};

#[derive(Parser)]
#[command(name = "fxbot")]
#[command(version = "0.1.0")]
#[command(about = "Forex paper-trading execution and orchestration engine", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Config directory (default.toml, <FXBOT_ENV>.toml, local.toml)
    #[arg(short, long, default_value = "config", env = "FXBOT_CONFIG_DIR")]
    pub config: PathBuf,
}

#[derive(Subcommand)]
pub enum Commands {
    /// List available strategies and their parameters
    Strategies,
    /// Replay historical candles through a strategy
    Backtest {
        /// Candle CSV (time, open, high, low, close[, volume]); loads from the database when omitted
        #[arg(long)]
        csv: Option<PathBuf>,
        /// Strategy name (see `strategies`)
        #[arg(short, long)]
        strategy: String,
        /// Strategy parameter, repeatable (e.g. --param fast=5)
        #[arg(short = 'p', long = "param", value_parser = parse_param)]
        params: Vec<(String, Value)>,
        #[arg(short, long, default_value = "EUR_USD")]
        instrument: String,
        #[arg(short, long, default_value = "H1")]
        granularity: Granularity,
        /// Write trades.csv, equity_curve.csv and report.json here
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Load candles from a CSV file into the database
    ImportCandles {
        #[arg(long)]
        csv: PathBuf,
        #[arg(short, long, default_value = "EUR_USD")]
        instrument: String,
        #[arg(short, long, default_value = "H1")]
        granularity: Granularity,
    },
    /// Run a live session until Ctrl-C
    Live {
        #[arg(short, long)]
        strategy: String,
        #[arg(short = 'p', long = "param", value_parser = parse_param)]
        params: Vec<(String, Value)>,
        #[arg(short, long, default_value = "EUR_USD")]
        instrument: String,
        #[arg(short, long, default_value = "M1")]
        granularity: Granularity,
        /// Stop the paper feed after this many bars
        #[arg(long)]
        bars: Option<usize>,
        /// Override the configured broker (paper, oanda)
        #[arg(long)]
        broker: Option<BrokerKind>,
    },
    /// List recorded runs, or show one with its metrics
    Runs {
        #[arg(long)]
        kind: Option<RunKind>,
        #[arg(long, default_value = "20")]
        limit: usize,
        #[arg(long)]
        run_id: Option<uuid::Uuid>,
    },
}

/// `key=value`; integers stay numeric, anything else is passed as a string
pub fn parse_param(raw: &str) -> Result<(String, Value), String> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected key=value, got '{raw}'"))?;
    let key = key.trim();
    if key.is_empty() {
        return Err(format!("missing parameter name in '{raw}'"));
    }
    let value = value.trim();
    let value = if let Ok(n) = value.parse::<i64>() {
        Value::from(n)
    } else if let Ok(b) = value.parse::<bool>() {
        Value::from(b)
    } else {
        Value::from(value)
    };
    Ok((key.to_string(), value))
}

pub fn collect_params(pairs: Vec<(String, Value)>) -> StrategyParams {
    pairs.into_iter().collect()
}

/// Print the registry as a table
pub fn list_strategies(registry: &StrategyRegistry) {
    println!("\n{:<8} {:<50} PARAMETERS", "NAME", "DESCRIPTION");
    println!("{}", "-".repeat(100));
    for descriptor in registry.list_strategies() {
        let params: Vec<String> = descriptor
            .params
            .iter()
            .map(|p| format!("{}={} ({})", p.name, p.default, p.kind))
            .collect();
        println!(
            "{:<8} {:<50} {}",
            descriptor.name,
            descriptor.description,
            params.join(", ")
        );
    }
    println!();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_param_types() {
        assert_eq!(parse_param("fast=5").unwrap(), ("fast".into(), Value::from(5)));
        assert_eq!(
            parse_param("max_spread_pips=1.5").unwrap(),
            ("max_spread_pips".into(), Value::from("1.5"))
        );
        assert!(parse_param("fast").is_err());
        assert!(parse_param("=3").is_err());
    }

    #[test]
    fn test_cli_parses_backtest() {
        let cli = Cli::try_parse_from([
            "fxbot", "backtest", "--csv", "bars.csv", "-s", "sma", "-p", "fast=5", "-p", "slow=20",
            "-g", "M15",
        ])
        .unwrap();
        match cli.command {
            Commands::Backtest {
                csv,
                strategy,
                params,
                granularity,
                ..
            } => {
                assert_eq!(csv, Some(PathBuf::from("bars.csv")));
                assert_eq!(strategy, "sma");
                assert_eq!(collect_params(params).len(), 2);
                assert_eq!(granularity, Granularity::M15);
            }
            _ => panic!("expected backtest"),
        }
    }
}
