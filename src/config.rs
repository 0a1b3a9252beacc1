use config::{Config, ConfigError, Environment, File};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::broker::BrokerKind;
use crate::risk::RiskParameters;

/// Main configuration structure
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub broker: BrokerConfig,
    #[serde(default)]
    pub risk: RiskConfig,
    #[serde(default)]
    pub execution: ExecutionConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub bus: BusConfig,
    #[serde(default)]
    pub backtest: BacktestConfig,
    /// Optional; runs are kept in memory when absent
    #[serde(default)]
    pub database: Option<DatabaseConfig>,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BrokerConfig {
    #[serde(default)]
    pub kind: BrokerKind,
    /// REST endpoint (practice by default)
    #[serde(default = "default_oanda_url")]
    pub oanda_api_url: String,
    #[serde(default)]
    pub account_id: Option<String>,
    #[serde(default)]
    pub api_token: Option<String>,
    /// Candle polling interval for the live bar stream
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,
    /// Starting balance of the paper broker
    #[serde(default = "default_paper_balance")]
    pub paper_balance: Decimal,
}

fn default_oanda_url() -> String {
    "https://api-fxpractice.oanda.com/v3".to_string()
}

fn default_poll_interval() -> u64 {
    5000
}

fn default_paper_balance() -> Decimal {
    dec!(100000)
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            kind: BrokerKind::Paper,
            oanda_api_url: default_oanda_url(),
            account_id: None,
            api_token: None,
            poll_interval_ms: default_poll_interval(),
            paper_balance: default_paper_balance(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RiskConfig {
    /// Fraction of equity risked per trade (0.01 = 1%)
    pub risk_fraction: Decimal,
    /// Maximum concurrent positions per instrument
    pub max_positions: u32,
    pub spread_pips: Decimal,
    /// Default stop distance when the signal carries none
    pub stop_distance_pips: Decimal,
    #[serde(default)]
    pub take_profit_pips: Option<Decimal>,
    #[serde(default = "default_max_leverage")]
    pub max_leverage: Decimal,
}

fn default_max_leverage() -> Decimal {
    dec!(20)
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            risk_fraction: dec!(0.01),
            max_positions: 1,
            spread_pips: dec!(1.5),
            stop_distance_pips: dec!(20),
            take_profit_pips: Some(dec!(40)),
            max_leverage: default_max_leverage(),
        }
    }
}

impl RiskConfig {
    pub fn to_parameters(&self) -> RiskParameters {
        RiskParameters {
            risk_fraction: self.risk_fraction,
            max_positions: self.max_positions,
            spread_pips: self.spread_pips,
            stop_distance_pips: self.stop_distance_pips,
            take_profit_pips: self.take_profit_pips,
            max_leverage: self.max_leverage,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExecutionConfig {
    /// Attempts per broker call, first try included
    pub max_retries: u32,
    /// First backoff delay, doubled after each transient failure
    pub base_delay_ms: u64,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 200,
        }
    }
}

/// What happens to broker positions still open when a session is stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum OrphanPolicy {
    /// Keep them at the broker and record them on the run
    #[default]
    Leave,
    /// Submit closing orders before the run is finished
    Flatten,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SessionConfig {
    pub max_reconnect_attempts: u32,
    pub reconnect_base_delay_ms: u64,
    /// Attempts for the terminal run write
    pub persistence_retry_attempts: u32,
    #[serde(default)]
    pub orphan_policy: OrphanPolicy,
    /// Daily profit target as percent of session start equity
    #[serde(default)]
    pub daily_target_pct: Option<Decimal>,
    /// Daily loss limit as percent of session start equity (positive number)
    #[serde(default)]
    pub daily_loss_limit_pct: Option<Decimal>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_reconnect_attempts: 5,
            reconnect_base_delay_ms: 500,
            persistence_retry_attempts: 3,
            orphan_policy: OrphanPolicy::Leave,
            daily_target_pct: None,
            daily_loss_limit_pct: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct BusConfig {
    /// Per-subscriber queue capacity
    pub queue_capacity: usize,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self { queue_capacity: 256 }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BacktestConfig {
    pub initial_equity: Decimal,
    /// Adverse fill offset applied to every simulated fill
    pub slippage_pips: Decimal,
    /// Used to annualise growth, sharpe and sortino
    pub periods_per_year: u32,
}

impl Default for BacktestConfig {
    fn default() -> Self {
        Self {
            initial_equity: dec!(100000),
            slippage_pips: dec!(0.5),
            periods_per_year: 252,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// PostgreSQL connection URL
    pub url: String,
    /// Maximum connections in pool
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

fn default_max_connections() -> u32 {
    5
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Enable JSON formatted logs
    #[serde(default)]
    pub json: bool,
    /// Directory for the daily rolling log file
    #[serde(default)]
    pub dir: Option<String>,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
            dir: None,
        }
    }
}

impl AppConfig {
    /// Load configuration from files and environment
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from("config")
    }

    /// Load configuration from a specific directory
    pub fn load_from<P: AsRef<Path>>(config_dir: P) -> Result<Self, ConfigError> {
        let config_dir = config_dir.as_ref();

        let builder = Config::builder()
            .set_default("logging.level", "info")?
            .set_default("logging.json", false)?
            .set_default("risk.risk_fraction", "0.01")?
            .set_default("risk.max_positions", 1)?
            .set_default("risk.spread_pips", "1.5")?
            .set_default("risk.stop_distance_pips", "20")?
            .set_default("risk.take_profit_pips", "40")?
            .set_default("risk.max_leverage", "20")?
            .set_default("execution.max_retries", 3)?
            .set_default("execution.base_delay_ms", 200)?
            .set_default("session.max_reconnect_attempts", 5)?
            .set_default("session.reconnect_base_delay_ms", 500)?
            .set_default("session.persistence_retry_attempts", 3)?
            .set_default("bus.queue_capacity", 256)?
            .set_default("backtest.initial_equity", "100000")?
            .set_default("backtest.slippage_pips", "0.5")?
            .set_default("backtest.periods_per_year", 252)?
            .add_source(File::from(config_dir.join("default.toml")).required(false))
            // Environment-specific overrides (e.g., config/production.toml)
            .add_source(
                File::from(config_dir.join(
                    std::env::var("FXBOT_ENV").unwrap_or_else(|_| "development".to_string()),
                ))
                .required(false),
            )
            // FXBOT__RISK__RISK_FRACTION, FXBOT__DATABASE__URL, ...
            .add_source(
                Environment::with_prefix("FXBOT")
                    .separator("__")
                    .try_parsing(true),
            );

        builder.build()?.try_deserialize()
    }

    /// Paper-broker configuration for CLI usage without config files
    pub fn default_config() -> Self {
        Self {
            broker: BrokerConfig::default(),
            risk: RiskConfig::default(),
            execution: ExecutionConfig::default(),
            session: SessionConfig::default(),
            bus: BusConfig::default(),
            backtest: BacktestConfig::default(),
            database: None,
            logging: LoggingConfig::default(),
        }
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if let Err(e) = self.risk.to_parameters().validate() {
            errors.push(e.to_string());
        }

        if self.execution.max_retries == 0 {
            errors.push("execution.max_retries must be at least 1".to_string());
        }

        if self.session.persistence_retry_attempts == 0 {
            errors.push("session.persistence_retry_attempts must be at least 1".to_string());
        }

        if let Some(target) = self.session.daily_target_pct {
            if target <= Decimal::ZERO {
                errors.push("session.daily_target_pct must be positive".to_string());
            }
        }

        if let Some(limit) = self.session.daily_loss_limit_pct {
            if limit <= Decimal::ZERO {
                errors.push("session.daily_loss_limit_pct must be positive".to_string());
            }
        }

        if self.bus.queue_capacity == 0 {
            errors.push("bus.queue_capacity must be at least 1".to_string());
        }

        if self.backtest.initial_equity <= Decimal::ZERO {
            errors.push("backtest.initial_equity must be positive".to_string());
        }

        if self.backtest.slippage_pips < Decimal::ZERO {
            errors.push("backtest.slippage_pips cannot be negative".to_string());
        }

        if self.backtest.periods_per_year == 0 {
            errors.push("backtest.periods_per_year must be positive".to_string());
        }

        if self.broker.kind == BrokerKind::Oanda {
            let present = |value: &Option<String>, env: &str| {
                value.as_deref().is_some_and(|v| !v.is_empty())
                    || std::env::var(env).is_ok_and(|v| !v.is_empty())
            };
            if !present(&self.broker.account_id, "OANDA_ACCOUNT_ID") {
                errors.push("broker.account_id is required for the oanda broker".to_string());
            }
            if !present(&self.broker.api_token, "OANDA_API_TOKEN") {
                errors.push("broker.api_token is required for the oanda broker".to_string());
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = AppConfig::default_config();
        assert!(config.validate().is_ok());
        assert_eq!(config.session.orphan_policy, OrphanPolicy::Leave);
        assert_eq!(config.execution.max_retries, 3);
    }

    #[test]
    fn test_validate_collects_all_errors() {
        let mut config = AppConfig::default_config();
        config.risk.risk_fraction = Decimal::ZERO;
        config.bus.queue_capacity = 0;
        config.broker.kind = BrokerKind::Oanda;

        let errors = config.validate().unwrap_err();
        assert!(errors.len() >= 2);
        assert!(errors.iter().any(|e| e.contains("queue_capacity")));
        if std::env::var("OANDA_API_TOKEN").is_err() {
            assert!(errors.iter().any(|e| e.contains("api_token")));
        }
    }

    #[test]
    fn test_load_from_missing_dir_uses_defaults() {
        let config = AppConfig::load_from("does/not/exist").unwrap();
        assert_eq!(config.risk.max_positions, 1);
        assert_eq!(config.bus.queue_capacity, 256);
        assert_eq!(config.backtest.periods_per_year, 252);
        assert!(config.database.is_none());
    }
}
