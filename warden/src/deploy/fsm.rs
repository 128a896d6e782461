//! Finite State Machine for the supervised service

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::WardenError;

/// Lifecycle state of the supervised service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceState {
    /// No process running
    Stopped,

    /// Spawn in progress
    Starting,

    /// Process running with a verified identity
    Running,

    /// Termination in progress
    Stopping,

    /// Process died without being asked to
    Crashed,

    /// An operation left the process state unknown; reconcile before mutating
    Failed,
}

/// Lifecycle event
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServiceEvent {
    /// Begin spawning
    Start,

    /// Spawn succeeded and identity was recorded
    Started,

    /// Spawn failed cleanly, no process was left behind
    StartFailed(String),

    /// Begin terminating
    Stop,

    /// Process is gone
    Stopped,

    /// Process was found dead while believed running
    Crash(String),

    /// Operation error with unknown outcome
    Fail(String),

    /// Reconciliation check result
    Reconciled { running: bool },
}

/// Service FSM
#[derive(Debug, Clone)]
pub struct ServiceFsm {
    state: ServiceState,
    error: Option<String>,
    since: DateTime<Utc>,
}

impl ServiceFsm {
    /// Create a new FSM in stopped state
    pub fn new() -> Self {
        Self {
            state: ServiceState::Stopped,
            error: None,
            since: Utc::now(),
        }
    }

    /// Get current state
    pub fn state(&self) -> ServiceState {
        self.state
    }

    /// Last error message, cleared on the next clean transition into Running or Stopped
    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    /// When the current state was entered
    pub fn since(&self) -> DateTime<Utc> {
        self.since
    }

    /// Whether a mutating operation may run
    pub fn accepts_operations(&self) -> bool {
        self.state != ServiceState::Failed
    }

    /// Process an event and transition state
    pub fn process(&mut self, event: ServiceEvent) -> Result<ServiceState, WardenError> {
        use ServiceEvent as E;
        use ServiceState as S;

        let new_state = match (self.state, &event) {
            // Any state may become ambiguous
            (_, E::Fail(err)) => {
                self.error = Some(err.clone());
                S::Failed
            }

            (S::Stopped, E::Start) => S::Starting,

            (S::Starting, E::Started) => {
                self.error = None;
                S::Running
            }
            (S::Starting, E::StartFailed(err)) => {
                self.error = Some(err.clone());
                S::Stopped
            }

            (S::Running, E::Stop) => S::Stopping,
            (S::Running, E::Crash(err)) => {
                self.error = Some(err.clone());
                S::Crashed
            }

            (S::Stopping, E::Stopped) => {
                self.error = None;
                S::Stopped
            }

            // Crash cleanup keeps the crash reason visible
            (S::Crashed, E::Stopped) => S::Stopped,

            (S::Stopped | S::Running | S::Crashed | S::Failed, E::Reconciled { running }) => {
                if self.state == S::Failed {
                    self.error = None;
                }
                if *running {
                    S::Running
                } else {
                    S::Stopped
                }
            }

            (state, event) => {
                return Err(WardenError::InvalidTransition(format!(
                    "{:?} -> {:?}",
                    state, event
                )));
            }
        };

        if new_state != self.state {
            self.since = Utc::now();
        }
        self.state = new_state;
        Ok(new_state)
    }
}

impl Default for ServiceFsm {
    fn default() -> Self {
        Self::new()
    }
}
