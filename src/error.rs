use thiserror::Error;

/// Main error type for the engine
#[derive(Error, Debug)]
pub enum FxError {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    // Database errors
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("Persistence error: {0}")]
    Persistence(String),

    // Serialization errors
    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    // Session lifecycle errors
    #[error("A live session is already active: {0}")]
    SessionConflict(String),

    #[error("No active session to stop")]
    NoActiveSession,

    // Strategy errors
    #[error("Unknown strategy: {0}")]
    UnknownStrategy(String),

    #[error("Invalid strategy params: {0}")]
    InvalidParams(String),

    // Broker and market data errors
    #[error("Broker error: {0}")]
    Broker(#[from] BrokerError),

    #[error("Price stream error: {0}")]
    Stream(String),

    #[error("Market data error: {0}")]
    MarketData(String),

    // Risk management errors
    #[error("Risk rejected: {0}")]
    RiskRejected(#[from] RiskError),

    // Validation errors
    #[error("Validation failed: {0}")]
    Validation(String),

    // IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // Generic errors
    #[error("Internal error: {0}")]
    Internal(String),
}

impl FxError {
    /// Errors that must terminate a live session rather than skip a bar
    pub fn is_fatal(&self) -> bool {
        match self {
            FxError::Broker(e) => e.is_fatal(),
            _ => false,
        }
    }
}

/// Result type alias for FxError
pub type Result<T> = std::result::Result<T, FxError>;

/// Errors surfaced by broker adapters
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BrokerError {
    /// Timeouts, throttling, 5xx, dropped connections
    #[error("Transient broker failure: {0}")]
    Transient(String),

    #[error("Broker authentication failed: {0}")]
    Auth(String),

    #[error("Broker rejected request as invalid: {0}")]
    Validation(String),

    #[error("Order rejected: {0}")]
    Rejected(String),

    #[error("Price stream failure: {0}")]
    Stream(String),
}

impl BrokerError {
    pub fn is_transient(&self) -> bool {
        matches!(self, BrokerError::Transient(_) | BrokerError::Stream(_))
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, BrokerError::Auth(_))
    }

    /// Short tag used in emitted events
    pub fn kind(&self) -> &'static str {
        match self {
            BrokerError::Transient(_) => "transient",
            BrokerError::Auth(_) => "auth",
            BrokerError::Validation(_) => "validation",
            BrokerError::Rejected(_) => "rejected",
            BrokerError::Stream(_) => "stream",
        }
    }
}

impl From<reqwest::Error> for BrokerError {
    fn from(err: reqwest::Error) -> Self {
        if let Some(status) = err.status() {
            return BrokerError::from_status(status.as_u16(), err.to_string());
        }
        // Connect/timeout/body errors carry no status
        BrokerError::Transient(err.to_string())
    }
}

impl BrokerError {
    /// Classify an HTTP status returned by a broker REST API
    pub fn from_status(status: u16, body: String) -> Self {
        match status {
            401 | 403 => BrokerError::Auth(format!("HTTP {status}: {body}")),
            400 | 404 | 422 => BrokerError::Validation(format!("HTTP {status}: {body}")),
            429 | 500..=599 => BrokerError::Transient(format!("HTTP {status}: {body}")),
            _ => BrokerError::Rejected(format!("HTTP {status}: {body}")),
        }
    }
}

/// Specific error types for risk sizing
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RiskError {
    #[error("Sized to zero units: equity {equity}, stop {stop_distance_pips} pips")]
    ZeroUnits {
        equity: rust_decimal::Decimal,
        stop_distance_pips: rust_decimal::Decimal,
    },

    #[error("Max positions reached for {instrument}: {open} >= {max}")]
    MaxPositions {
        instrument: String,
        open: usize,
        max: u32,
    },

    #[error("Invalid risk parameters: {0}")]
    InvalidParameters(String),

    #[error("Trading halted: {reason}")]
    TradingHalted { reason: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_classification() {
        assert!(matches!(
            BrokerError::from_status(401, "bad token".into()),
            BrokerError::Auth(_)
        ));
        assert!(matches!(
            BrokerError::from_status(422, "bad units".into()),
            BrokerError::Validation(_)
        ));
        assert!(BrokerError::from_status(503, "down".into()).is_transient());
        assert!(BrokerError::from_status(429, "slow down".into()).is_transient());
        assert!(!BrokerError::from_status(400, "".into()).is_transient());
    }

    #[test]
    fn test_fatal_only_for_auth() {
        let auth: FxError = BrokerError::Auth("expired".into()).into();
        let transient: FxError = BrokerError::Transient("timeout".into()).into();
        assert!(auth.is_fatal());
        assert!(!transient.is_fatal());
        assert!(!FxError::NoActiveSession.is_fatal());
    }
}
