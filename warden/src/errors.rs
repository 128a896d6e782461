//! Error types for the deployment controller

use thiserror::Error;

/// Reasons an artifact could not be fetched
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FetchError {
    #[error("network failure: {0}")]
    Network(String),

    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("artifact not found: {0}")]
    NotFound(String),

    #[error("command failed: {0}")]
    Command(String),
}

/// Main error type for warden
#[derive(Error, Debug)]
pub enum WardenError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("Fetch error: {0}")]
    Fetch(#[from] FetchError),

    #[error("Spawn error: {0}")]
    Spawn(String),

    #[error("Identity error: {0}")]
    Identity(String),

    #[error("Probe timed out: {0}")]
    ProbeTimeout(String),

    #[error("Probe unhealthy: {0}")]
    ProbeUnhealthy(String),

    #[error("Operation rejected: {0} is already in progress")]
    ConcurrentOperationRejected(String),

    #[error("Service is already running (pid {0})")]
    AlreadyRunning(u32),

    #[error("Invalid transition: {0}")]
    InvalidTransition(String),

    #[error("Service state is ambiguous, reconcile first: {0}")]
    Reconciliation(String),

    #[error("Log source error: {0}")]
    LogSource(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Server error: {0}")]
    ServerError(String),

    #[error("Shutdown error: {0}")]
    ShutdownError(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl WardenError {
    /// Whether the error leaves the supervised process in an unknown state
    pub fn is_ambiguous(&self) -> bool {
        matches!(
            self,
            WardenError::Identity(_)
                | WardenError::Timeout(_)
                | WardenError::IoError(_)
                | WardenError::Internal(_)
        )
    }
}
