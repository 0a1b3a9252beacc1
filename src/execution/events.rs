//! Payloads published on the `events` and `logs` topics

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::bus::{EventBus, TOPIC_EVENTS, TOPIC_LOGS};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DomainEvent {
    #[serde(rename = "type")]
    pub kind: String,
    pub run_id: Uuid,
    pub time: DateTime<Utc>,
    pub data: serde_json::Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogLine {
    pub level: LogLevel,
    pub run_id: Uuid,
    pub time: DateTime<Utc>,
    pub message: String,
}

/// Run-scoped publisher; without a bus every call is a no-op
#[derive(Clone)]
pub struct EventPublisher {
    bus: Option<EventBus>,
    run_id: Uuid,
}

impl EventPublisher {
    pub fn new(bus: Option<EventBus>, run_id: Uuid) -> Self {
        Self { bus, run_id }
    }

    pub fn is_enabled(&self) -> bool {
        self.bus.is_some()
    }

    pub fn bus(&self) -> Option<&EventBus> {
        self.bus.as_ref()
    }

    pub fn event(&self, kind: &str, time: DateTime<Utc>, data: serde_json::Value) {
        if let Some(bus) = &self.bus {
            bus.publish(
                TOPIC_EVENTS,
                &DomainEvent {
                    kind: kind.to_string(),
                    run_id: self.run_id,
                    time,
                    data,
                },
            );
        }
    }

    pub fn log(&self, level: LogLevel, time: DateTime<Utc>, message: impl Into<String>) {
        if let Some(bus) = &self.bus {
            bus.publish(
                TOPIC_LOGS,
                &LogLine {
                    level,
                    run_id: self.run_id,
                    time,
                    message: message.into(),
                },
            );
        }
    }
}
