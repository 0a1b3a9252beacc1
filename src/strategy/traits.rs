//! Core strategy traits and types
//!
//! Defines the common interface that all signal generators implement.
//! Strategies are pure state machines: they never perform I/O and never
//! submit orders themselves.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

use crate::domain::{Granularity, PriceBar, Quote, Side};
use crate::risk::RiskParameters;

// ============================================================================
// Signals
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Long,
    Short,
    Flat,
}

impl Direction {
    pub fn side(&self) -> Option<Side> {
        match self {
            Direction::Long => Some(Side::Long),
            Direction::Short => Some(Side::Short),
            Direction::Flat => None,
        }
    }
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Direction::Long => write!(f, "long"),
            Direction::Short => write!(f, "short"),
            Direction::Flat => write!(f, "flat"),
        }
    }
}

/// Trading intent produced on bar close
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Signal {
    pub direction: Direction,
    /// In [0, 1]
    pub confidence: Decimal,
    pub stop_distance_pips: Option<Decimal>,
    pub target_distance_pips: Option<Decimal>,
    pub reason: String,
    pub time: DateTime<Utc>,
    #[serde(default)]
    pub metadata: BTreeMap<String, serde_json::Value>,
}

impl Signal {
    pub fn new(direction: Direction, confidence: Decimal, reason: impl Into<String>, time: DateTime<Utc>) -> Self {
        Self {
            direction,
            confidence: confidence.clamp(Decimal::ZERO, Decimal::ONE),
            stop_distance_pips: None,
            target_distance_pips: None,
            reason: reason.into(),
            time,
            metadata: BTreeMap::new(),
        }
    }

    pub fn with_stop(mut self, pips: Option<Decimal>) -> Self {
        self.stop_distance_pips = pips;
        self
    }

    pub fn with_target(mut self, pips: Option<Decimal>) -> Self {
        self.target_distance_pips = pips;
        self
    }

    pub fn with_meta(mut self, key: &str, value: serde_json::Value) -> Self {
        self.metadata.insert(key.to_string(), value);
        self
    }
}

// ============================================================================
// Strategy Trait
// ============================================================================

/// What a strategy knows about the session that drives it
#[derive(Debug, Clone)]
pub struct StrategyContext {
    pub run_id: Uuid,
    pub instrument: String,
    pub granularity: Granularity,
    /// Session risk limits, `max_positions` included
    pub risk: RiskParameters,
}

impl StrategyContext {
    pub fn new(run_id: Uuid, instrument: &str, granularity: Granularity, risk: RiskParameters) -> Self {
        Self {
            run_id,
            instrument: instrument.to_string(),
            granularity,
            risk,
        }
    }

    pub fn max_positions(&self) -> u32 {
        self.risk.max_positions
    }
}

/// Stateful signal generator driven one bar at a time
pub trait StrategyUnit: Send {
    /// Registry name
    fn name(&self) -> &str;

    /// Reset all state for a new run
    fn on_startup(&mut self, ctx: &StrategyContext);

    /// Intra-bar price update; never creates a signal
    fn on_price_tick(&mut self, _quote: &Quote) {}

    /// Bar close; may create, replace, or clear the pending signal
    fn on_bar_close(&mut self, bar: &PriceBar);

    /// Pending signal, if any
    fn get_signal(&self) -> Option<&Signal>;

    /// Remove and return the pending signal. Only the execution coordinator calls this.
    fn take_signal(&mut self) -> Option<Signal>;

    fn on_stop(&mut self) {}
}

/// Pending-signal slot with de-duplication of repeated directions
#[derive(Debug, Clone, Default)]
pub struct SignalSlot {
    pending: Option<Signal>,
    last_emitted: Option<Direction>,
}

impl SignalSlot {
    /// Store the signal unless it repeats the last emitted direction.
    /// Returns whether it was stored.
    pub fn emit(&mut self, signal: Signal) -> bool {
        if self.last_emitted == Some(signal.direction) {
            return false;
        }
        self.last_emitted = Some(signal.direction);
        self.pending = Some(signal);
        true
    }

    /// Store the signal even when it repeats the last direction
    pub fn replace(&mut self, signal: Signal) {
        self.last_emitted = Some(signal.direction);
        self.pending = Some(signal);
    }

    pub fn pending(&self) -> Option<&Signal> {
        self.pending.as_ref()
    }

    pub fn take(&mut self) -> Option<Signal> {
        self.pending.take()
    }

    pub fn clear(&mut self) {
        self.pending = None;
    }

    pub fn reset(&mut self) {
        self.pending = None;
        self.last_emitted = None;
    }
}
