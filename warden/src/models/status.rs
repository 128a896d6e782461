//! Service status snapshot and operation results

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::deploy::fsm::ServiceState;
use crate::deploy::identity::ProcessIdentity;
use crate::health::prober::HealthReport;
use crate::models::artifact::DeploymentArtifact;
use crate::models::event::{EventType, StatusEvent};

/// Mutating control operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Start,
    Stop,
    Redeploy,
    Reconcile,
}

impl Operation {
    pub fn event_type(&self) -> EventType {
        match self {
            Operation::Start => EventType::Start,
            Operation::Stop => EventType::Stop,
            Operation::Redeploy => EventType::Rebuild,
            Operation::Reconcile => EventType::Reconcile,
        }
    }
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Operation::Start => "start",
            Operation::Stop => "stop",
            Operation::Redeploy => "redeploy",
            Operation::Reconcile => "reconcile",
        };
        f.write_str(name)
    }
}

/// How an operation ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutcomeKind {
    Completed,
    Failed,
    /// Refused without touching the service
    Rejected,
}

/// Result of a control operation, mirrored by exactly one status event
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationOutcome {
    pub operation: Operation,
    pub outcome: OutcomeKind,
    pub success: bool,
    pub detail: String,
    /// Service state after the operation
    pub state: ServiceState,
    pub event: StatusEvent,
}

/// Age of the last health report relative to the check interval
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Freshness {
    Fresh,
    Stale,
    Unknown,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthView {
    pub freshness: Freshness,
    pub report: Option<HealthReport>,
}

/// Point-in-time view of the supervised service
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceStatus {
    pub state: ServiceState,
    pub since: DateTime<Utc>,
    pub last_error: Option<String>,
    pub in_flight: Option<Operation>,
    pub process: Option<ProcessIdentity>,
    pub artifact: Option<DeploymentArtifact>,
    pub health: HealthView,
    /// Newest first
    pub events: Vec<StatusEvent>,
}
