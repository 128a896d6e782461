//! Two-stage health probe: process identity first, then the application endpoint

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::debug;
use url::Url;

use crate::deploy::identity::{Liveness, ProcessStats};
use crate::deploy::supervisor::ProcessSupervisor;
use crate::errors::WardenError;

/// Prober options
#[derive(Debug, Clone)]
pub struct ProberOptions {
    /// Liveness endpoint; without one only the process is checked
    pub url: Option<Url>,

    /// Bound on the endpoint call, body included
    pub timeout: Duration,
}

impl Default for ProberOptions {
    fn default() -> Self {
        Self {
            url: None,
            timeout: Duration::from_secs(5),
        }
    }
}

/// Why the service is not healthy
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum UnhealthyReason {
    /// No live process is recorded
    NotRunning(String),

    /// The recorded PID now belongs to another program
    Recycled(String),

    /// The identity record could not be read
    IdentityUnknown(String),

    /// Process alive, endpoint did not answer in time
    ProbeTimeout(String),

    /// Process alive, endpoint answered with an error or refused the connection
    ApplicationError(String),
}

impl UnhealthyReason {
    /// Whether the process itself is known to be alive
    pub fn process_alive(&self) -> bool {
        matches!(
            self,
            UnhealthyReason::ProbeTimeout(_) | UnhealthyReason::ApplicationError(_)
        )
    }

    pub fn detail(&self) -> &str {
        match self {
            UnhealthyReason::NotRunning(d)
            | UnhealthyReason::Recycled(d)
            | UnhealthyReason::IdentityUnknown(d)
            | UnhealthyReason::ProbeTimeout(d)
            | UnhealthyReason::ApplicationError(d) => d,
        }
    }
}

/// Probe verdict
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", content = "reason", rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Unhealthy(UnhealthyReason),
}

/// Result of one probe
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthReport {
    pub checked_at: DateTime<Utc>,
    pub health: HealthStatus,

    /// Resource usage, when the process is alive
    pub process: Option<ProcessStats>,

    /// Body returned by the endpoint, when it is JSON
    pub response: Option<serde_json::Value>,
}

impl HealthReport {
    fn new(health: HealthStatus, process: Option<ProcessStats>) -> Self {
        Self {
            checked_at: Utc::now(),
            health,
            process,
            response: None,
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.health == HealthStatus::Healthy
    }

    /// Whether the process is alive, regardless of the application's answer
    pub fn process_alive(&self) -> bool {
        match &self.health {
            HealthStatus::Healthy => true,
            HealthStatus::Unhealthy(reason) => reason.process_alive(),
        }
    }

    /// Convert an unhealthy verdict into the matching error
    pub fn into_result(self) -> Result<HealthReport, WardenError> {
        match &self.health {
            HealthStatus::Healthy => Ok(self),
            HealthStatus::Unhealthy(UnhealthyReason::ProbeTimeout(d)) => {
                Err(WardenError::ProbeTimeout(d.clone()))
            }
            HealthStatus::Unhealthy(reason) => {
                Err(WardenError::ProbeUnhealthy(reason.detail().to_string()))
            }
        }
    }
}

/// Probes process liveness and the application's liveness endpoint
pub struct HealthProber {
    supervisor: Arc<ProcessSupervisor>,
    client: Client,
    options: ProberOptions,
}

impl HealthProber {
    pub fn new(supervisor: Arc<ProcessSupervisor>, options: ProberOptions) -> Result<Self, WardenError> {
        let client = Client::builder().timeout(options.timeout).build()?;
        Ok(Self {
            supervisor,
            client,
            options,
        })
    }

    pub async fn probe(&self) -> HealthReport {
        let stats = match self.supervisor.liveness().await {
            Ok(Some((_, Liveness::Alive(stats)))) => stats,
            Ok(Some((identity, Liveness::Exited))) => {
                return HealthReport::new(
                    HealthStatus::Unhealthy(UnhealthyReason::NotRunning(format!(
                        "PID {} has exited",
                        identity.pid
                    ))),
                    None,
                );
            }
            Ok(Some((identity, Liveness::Recycled { name, .. }))) => {
                return HealthReport::new(
                    HealthStatus::Unhealthy(UnhealthyReason::Recycled(format!(
                        "PID {} now belongs to '{}'",
                        identity.pid, name
                    ))),
                    None,
                );
            }
            Ok(None) => {
                return HealthReport::new(
                    HealthStatus::Unhealthy(UnhealthyReason::NotRunning(
                        "no process recorded".to_string(),
                    )),
                    None,
                );
            }
            Err(e) => {
                return HealthReport::new(
                    HealthStatus::Unhealthy(UnhealthyReason::IdentityUnknown(e.to_string())),
                    None,
                );
            }
        };

        let Some(url) = &self.options.url else {
            return HealthReport::new(HealthStatus::Healthy, Some(stats));
        };

        debug!("GET {}", url);
        let outcome = tokio::time::timeout(self.options.timeout, async {
            let response = self.client.get(url.clone()).send().await?;
            let status = response.status();
            let body = response.json::<serde_json::Value>().await.ok();
            Ok::<_, reqwest::Error>((status, body))
        })
        .await;

        match outcome {
            Ok(Ok((status, body))) if status.is_success() => {
                let mut report = HealthReport::new(HealthStatus::Healthy, Some(stats));
                report.response = body;
                report
            }
            Ok(Ok((status, body))) => {
                let mut report = HealthReport::new(
                    HealthStatus::Unhealthy(UnhealthyReason::ApplicationError(format!(
                        "API returned {}",
                        status
                    ))),
                    Some(stats),
                );
                report.response = body;
                report
            }
            Ok(Err(e)) if e.is_timeout() => HealthReport::new(
                HealthStatus::Unhealthy(UnhealthyReason::ProbeTimeout(format!(
                    "no answer from {} within {:?}",
                    url, self.options.timeout
                ))),
                Some(stats),
            ),
            Ok(Err(e)) => HealthReport::new(
                HealthStatus::Unhealthy(UnhealthyReason::ApplicationError(format!(
                    "API connection failed: {}",
                    e
                ))),
                Some(stats),
            ),
            Err(_) => HealthReport::new(
                HealthStatus::Unhealthy(UnhealthyReason::ProbeTimeout(format!(
                    "no answer from {} within {:?}",
                    url, self.options.timeout
                ))),
                Some(stats),
            ),
        }
    }
}
