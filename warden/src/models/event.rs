//! Status events

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Kind of recorded operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventType {
    Start,
    Stop,
    Rebuild,
    Health,
    Reconcile,
}

/// Outcome of a recorded operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    Success,
    Failure,
}

/// An immutable record of an attempted operation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusEvent {
    pub id: Uuid,
    pub event_type: EventType,
    pub timestamp: DateTime<Utc>,
    pub outcome: Outcome,
    pub detail: String,
}

impl StatusEvent {
    pub fn new(event_type: EventType, outcome: Outcome, detail: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            event_type,
            timestamp: Utc::now(),
            outcome,
            detail: detail.into(),
        }
    }

    pub fn success(event_type: EventType, detail: impl Into<String>) -> Self {
        Self::new(event_type, Outcome::Success, detail)
    }

    pub fn failure(event_type: EventType, detail: impl Into<String>) -> Self {
        Self::new(event_type, Outcome::Failure, detail)
    }

    pub fn is_success(&self) -> bool {
        self.outcome == Outcome::Success
    }
}
