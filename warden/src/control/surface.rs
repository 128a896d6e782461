//! Serialized control operations over the supervised service
//!
//! Mutating operations (start, stop, redeploy, reconcile) are mutually
//! exclusive: a second request while one is in flight is rejected, not
//! queued. Background checks take a shared read on the same gate and skip
//! their tick while a mutating operation holds it. Status reads only touch
//! in-memory state and never wait on either lock.

use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, error, info, warn};

use crate::control::events::EventJournal;
use crate::deploy::fetcher::ArtifactFetcher;
use crate::deploy::fsm::{ServiceEvent, ServiceFsm, ServiceState};
use crate::deploy::identity::{Liveness, ProcessIdentity};
use crate::deploy::supervisor::{ProcessSupervisor, StopOutcome};
use crate::errors::{FetchError, WardenError};
use crate::filesys::file::File;
use crate::health::prober::{HealthProber, HealthReport, HealthStatus, UnhealthyReason};
use crate::models::artifact::{DeploymentArtifact, FetchTarget, TriggerSource};
use crate::models::event::{EventType, StatusEvent};
use crate::models::status::{
    Freshness, HealthView, Operation, OperationOutcome, OutcomeKind, ServiceStatus,
};

/// Health reports older than this many check intervals are marked stale
const STALE_AFTER_INTERVALS: u32 = 3;

#[derive(Debug, Clone)]
pub struct SurfaceOptions {
    /// Bound on fetch + stop + start
    pub redeploy_timeout: Duration,

    /// Expected spacing of health reports
    pub health_interval: Duration,
}

impl Default for SurfaceOptions {
    fn default() -> Self {
        Self {
            redeploy_timeout: Duration::from_secs(600),
            health_interval: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RedeployPhase {
    Fetch,
    Stop,
    Start,
}

impl std::fmt::Display for RedeployPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RedeployPhase::Fetch => f.write_str("fetch"),
            RedeployPhase::Stop => f.write_str("stop"),
            RedeployPhase::Start => f.write_str("start"),
        }
    }
}

/// Holds the operation lock and clears the in-flight marker when dropped
struct OperationGuard<'a> {
    _lock: MutexGuard<'a, ()>,
    in_flight: &'a RwLock<Option<Operation>>,
}

impl Drop for OperationGuard<'_> {
    fn drop(&mut self) {
        *self.in_flight.write().unwrap_or_else(|e| e.into_inner()) = None;
    }
}

/// Single owner of the service lifecycle
pub struct ControlSurface {
    supervisor: Arc<ProcessSupervisor>,
    fetcher: Arc<dyn ArtifactFetcher>,
    prober: Arc<HealthProber>,
    journal: Arc<EventJournal>,
    artifact_file: File,
    options: SurfaceOptions,

    op_lock: Mutex<()>,
    gate: tokio::sync::RwLock<()>,

    fsm: RwLock<ServiceFsm>,
    in_flight: RwLock<Option<Operation>>,
    artifact: RwLock<Option<DeploymentArtifact>>,
    process: RwLock<Option<ProcessIdentity>>,
    last_health: RwLock<Option<HealthReport>>,
}

impl ControlSurface {
    /// Build the surface, loading the last deployed artifact from `artifact_file`.
    ///
    /// The service starts out `Stopped`; call [`ControlSurface::reconcile`]
    /// to adopt a process left running by a previous instance.
    pub async fn new(
        supervisor: Arc<ProcessSupervisor>,
        fetcher: Arc<dyn ArtifactFetcher>,
        prober: Arc<HealthProber>,
        journal: Arc<EventJournal>,
        artifact_file: File,
        options: SurfaceOptions,
    ) -> Result<Self, WardenError> {
        let artifact = if artifact_file.exists().await {
            match artifact_file.read_json::<DeploymentArtifact>().await {
                Ok(artifact) => Some(artifact),
                Err(e) => {
                    warn!(
                        "Ignoring unreadable artifact record {}: {}",
                        artifact_file.path().display(),
                        e
                    );
                    None
                }
            }
        } else {
            None
        };
        if let Some(artifact) = &artifact {
            info!("Current artifact: {} ({})", artifact.version, artifact.path.display());
        }

        Ok(Self {
            supervisor,
            fetcher,
            prober,
            journal,
            artifact_file,
            options,
            op_lock: Mutex::new(()),
            gate: tokio::sync::RwLock::new(()),
            fsm: RwLock::new(ServiceFsm::new()),
            in_flight: RwLock::new(None),
            artifact: RwLock::new(artifact),
            process: RwLock::new(None),
            last_health: RwLock::new(None),
        })
    }

    // --- queries ---

    pub fn state(&self) -> ServiceState {
        read(&self.fsm).state()
    }

    pub fn current_artifact(&self) -> Option<DeploymentArtifact> {
        read(&self.artifact).clone()
    }

    pub fn last_health(&self) -> Option<HealthReport> {
        read(&self.last_health).clone()
    }

    pub fn journal(&self) -> &Arc<EventJournal> {
        &self.journal
    }

    /// Whether a live process matching the recorded identity exists
    pub async fn is_running(&self) -> bool {
        self.supervisor.is_running().await
    }

    /// Snapshot of the service with the `events` most recent status events
    pub fn status(&self, events: usize) -> ServiceStatus {
        let (state, since, last_error) = {
            let fsm = read(&self.fsm);
            (fsm.state(), fsm.since(), fsm.error().map(str::to_string))
        };

        let report = self.last_health();
        let freshness = match &report {
            None => Freshness::Unknown,
            Some(report) => {
                let limit = self.options.health_interval * STALE_AFTER_INTERVALS;
                let age = (Utc::now() - report.checked_at).to_std().unwrap_or_default();
                if age > limit {
                    Freshness::Stale
                } else {
                    Freshness::Fresh
                }
            }
        };

        ServiceStatus {
            state,
            since,
            last_error,
            in_flight: *read(&self.in_flight),
            process: read(&self.process).clone(),
            artifact: self.current_artifact(),
            health: HealthView { freshness, report },
            events: self.journal.recent(events),
        }
    }

    // --- operations ---

    pub async fn request_start(&self) -> OperationOutcome {
        let _guard = match self.begin(Operation::Start).await {
            Ok(guard) => guard,
            Err(rejected) => return rejected,
        };
        let _gate = self.gate.write().await;
        let (note, result) = match self.prepare().await {
            Ok(note) => (note, self.do_start().await),
            Err(e) => (None, Err(e)),
        };
        self.finish(Operation::Start, None, note, result).await
    }

    pub async fn request_stop(&self) -> OperationOutcome {
        let _guard = match self.begin(Operation::Stop).await {
            Ok(guard) => guard,
            Err(rejected) => return rejected,
        };
        let _gate = self.gate.write().await;
        let (note, result) = match self.prepare().await {
            Ok(note) => (note, self.do_stop().await),
            Err(e) => (None, Err(e)),
        };
        self.finish(Operation::Stop, None, note, result).await
    }

    /// Fetch the newest artifact, then stop and start the service on it.
    ///
    /// A fetch failure leaves the running service untouched.
    pub async fn request_redeploy(&self, trigger: TriggerSource) -> OperationOutcome {
        let context = trigger.to_string();
        let _guard = match self.begin(Operation::Redeploy).await {
            Ok(guard) => guard,
            Err(rejected) => return rejected,
        };
        let _gate = self.gate.write().await;
        let (note, result) = match self.prepare().await {
            Ok(note) => (note, self.do_redeploy(trigger).await),
            Err(e) => (None, Err(e)),
        };
        self.finish(Operation::Redeploy, Some(&context), note, result).await
    }

    /// Re-derive the service state from the OS. The only operation accepted while `Failed`.
    pub async fn reconcile(&self) -> OperationOutcome {
        let _guard = match self.begin(Operation::Reconcile).await {
            Ok(guard) => guard,
            Err(rejected) => return rejected,
        };
        let _gate = self.gate.write().await;
        let result = self.do_reconcile().await;
        self.finish(Operation::Reconcile, None, None, result).await
    }

    // --- background checks ---

    /// Probe the service and track crashes. Skipped while an operation runs.
    pub async fn check_health(&self) -> Option<HealthReport> {
        let Ok(_gate) = self.gate.try_read() else {
            debug!("Operation in progress, skipping health check");
            return None;
        };

        let report = self.prober.probe().await;
        let previous = write(&self.last_health).replace(report.clone());

        if self.state() != ServiceState::Running {
            return Some(report);
        }

        match &report.health {
            HealthStatus::Unhealthy(UnhealthyReason::IdentityUnknown(detail)) => {
                let detail = format!("process identity unreadable: {}", detail);
                error!("{}", detail);
                let _ = self.transition(ServiceEvent::Fail(detail.clone()));
                self.journal
                    .record(StatusEvent::failure(EventType::Health, detail))
                    .await;
            }
            HealthStatus::Unhealthy(reason) if !reason.process_alive() => {
                self.handle_crash(reason).await;
            }
            health => {
                let changed = previous.map(|p| &p.health != health).unwrap_or(true);
                if changed {
                    let event = match health {
                        HealthStatus::Healthy => {
                            info!("Service is healthy");
                            StatusEvent::success(EventType::Health, "healthy")
                        }
                        HealthStatus::Unhealthy(reason) => {
                            warn!("Service is unhealthy: {}", reason.detail());
                            StatusEvent::failure(EventType::Health, reason.detail())
                        }
                    };
                    self.journal.record(event).await;
                }
            }
        }

        Some(report)
    }

    /// Redeploy when the source has a version other than the current artifact's
    pub async fn check_for_update(&self) -> Result<Option<OperationOutcome>, WardenError> {
        let latest = {
            let Ok(_gate) = self.gate.try_read() else {
                debug!("Operation in progress, skipping artifact check");
                return Ok(None);
            };
            if self.state() == ServiceState::Failed {
                debug!("Service needs reconciliation, skipping artifact check");
                return Ok(None);
            }
            self.fetcher.latest_version().await?
        };

        let current = self.current_artifact().map(|a| a.version);
        if current.as_deref() == Some(latest.as_str()) {
            debug!("Artifact {} is current", latest);
            return Ok(None);
        }

        info!(
            "New version {} available (current: {})",
            latest,
            current.as_deref().unwrap_or("none")
        );
        Ok(Some(self.request_redeploy(TriggerSource::Poll).await))
    }

    // --- operation bodies ---

    async fn do_start(&self) -> Result<String, WardenError> {
        if self.state() == ServiceState::Running {
            let pid = read(&self.process).as_ref().map_or(0, |p| p.pid);
            return Err(WardenError::AlreadyRunning(pid));
        }

        let artifact = self.current_artifact().ok_or_else(|| {
            WardenError::NotFound("no artifact available; run redeploy".to_string())
        })?;
        self.start_artifact(&artifact).await
    }

    async fn do_stop(&self) -> Result<String, WardenError> {
        if self.state() != ServiceState::Running {
            self.supervisor.clear_stale().await?;
            return Ok("service already stopped".to_string());
        }
        self.stop_running().await
    }

    async fn do_redeploy(&self, trigger: TriggerSource) -> Result<String, WardenError> {
        let timeout = self.options.redeploy_timeout;
        let mut phase = RedeployPhase::Fetch;
        match tokio::time::timeout(timeout, self.redeploy_steps(trigger, &mut phase)).await {
            Ok(result) => result,
            Err(_) if phase == RedeployPhase::Fetch => Err(WardenError::Fetch(FetchError::Network(
                format!("fetch timed out after {:?}", timeout),
            ))),
            Err(_) => Err(WardenError::Timeout(format!(
                "redeploy timed out after {:?} during {}",
                timeout, phase
            ))),
        }
    }

    async fn redeploy_steps(
        &self,
        trigger: TriggerSource,
        phase: &mut RedeployPhase,
    ) -> Result<String, WardenError> {
        info!("Redeploy requested ({}), fetching from {}", trigger, self.fetcher.describe());
        let artifact = self.fetcher.fetch(&FetchTarget::Latest).await?;

        *phase = RedeployPhase::Stop;
        let stopped = if self.state() == ServiceState::Running {
            Some(self.stop_running().await?)
        } else {
            None
        };

        *phase = RedeployPhase::Start;
        let mut started = self.start_artifact(&artifact).await?;
        if let Err(e) = self.promote_artifact(&artifact).await {
            warn!("Failed to record artifact {}: {}", artifact.version, e);
            started = format!("{} (artifact record not saved: {})", started, e);
        }
        Ok(match stopped {
            Some(stopped) => format!("{}; {}", stopped, started),
            None => started,
        })
    }

    async fn do_reconcile(&self) -> Result<String, WardenError> {
        // an interrupted operation can leave a transitional state behind
        if matches!(self.state(), ServiceState::Starting | ServiceState::Stopping) {
            self.transition(ServiceEvent::Fail("operation was interrupted".to_string()))?;
        }

        let liveness = match self.supervisor.liveness().await {
            Ok(liveness) => liveness,
            Err(e) => {
                warn!("Discarding unreadable identity record: {}", e);
                self.supervisor.forget().await?;
                None
            }
        };

        match liveness {
            Some((identity, Liveness::Alive(stats))) => {
                self.transition(ServiceEvent::Reconciled { running: true })?;
                let detail = format!(
                    "process {} is running {} (up {}s)",
                    identity.pid, identity.artifact_version, stats.uptime_secs
                );
                *write(&self.process) = Some(identity);
                Ok(detail)
            }
            other => {
                if let Some((identity, _)) = other {
                    debug!("Recorded PID {} is gone", identity.pid);
                    self.supervisor.forget().await?;
                }
                self.transition(ServiceEvent::Reconciled { running: false })?;
                *write(&self.process) = None;
                Ok("no live process, service is stopped".to_string())
            }
        }
    }

    // --- shared steps ---

    async fn start_artifact(&self, artifact: &DeploymentArtifact) -> Result<String, WardenError> {
        if !tokio::fs::try_exists(&artifact.path).await.unwrap_or(false) {
            return Err(WardenError::NotFound(format!(
                "artifact file {} is missing",
                artifact.path.display()
            )));
        }

        self.transition(ServiceEvent::Start)?;
        match self.supervisor.start(artifact).await {
            Ok(identity) => {
                let detail = format!("started {} (PID {})", artifact.version, identity.pid);
                *write(&self.process) = Some(identity);
                self.transition(ServiceEvent::Started)?;
                Ok(detail)
            }
            Err(e) if e.is_ambiguous() => {
                self.transition(ServiceEvent::Fail(e.to_string()))?;
                Err(e)
            }
            Err(e) => {
                self.transition(ServiceEvent::StartFailed(e.to_string()))?;
                Err(e)
            }
        }
    }

    async fn stop_running(&self) -> Result<String, WardenError> {
        self.transition(ServiceEvent::Stop)?;
        match self.supervisor.stop().await {
            Ok(outcome) => {
                *write(&self.process) = None;
                self.transition(ServiceEvent::Stopped)?;
                Ok(match outcome {
                    StopOutcome::AlreadyStopped => "process had already exited".to_string(),
                    StopOutcome::Terminated { pid } => format!("stopped PID {}", pid),
                    StopOutcome::Killed { pid } => format!("killed PID {} after stop timeout", pid),
                })
            }
            Err(e) => {
                self.transition(ServiceEvent::Fail(e.to_string()))?;
                Err(e)
            }
        }
    }

    /// Check that mutating operations are accepted, then fold in out-of-band changes
    async fn prepare(&self) -> Result<Option<String>, WardenError> {
        self.ensure_operational()?;
        self.refresh_lifecycle().await
    }

    /// Fold out-of-band changes into the state machine before an operation:
    /// a dead child is a crash, a live orphan is adopted.
    ///
    /// Returns a note describing the change, carried into the operation's event.
    async fn refresh_lifecycle(&self) -> Result<Option<String>, WardenError> {
        let liveness = self.supervisor.liveness().await?;
        let alive = match &liveness {
            Some((identity, Liveness::Alive(_))) => Some(identity.clone()),
            _ => None,
        };

        match (self.state(), alive) {
            (ServiceState::Running, None) => {
                let detail = match self.supervisor.take_last_exit() {
                    Some(status) => format!("process exited unexpectedly ({})", status),
                    None => "process is gone".to_string(),
                };
                warn!("{}", detail);
                self.transition(ServiceEvent::Crash(detail.clone()))?;
                self.supervisor.clear_stale().await?;
                *write(&self.process) = None;
                self.transition(ServiceEvent::Stopped)?;
                Ok(Some(detail))
            }
            (ServiceState::Crashed, None) => {
                self.transition(ServiceEvent::Stopped)?;
                Ok(None)
            }
            (ServiceState::Stopped | ServiceState::Crashed, Some(identity)) => {
                info!("Adopting running process {}", identity.pid);
                self.transition(ServiceEvent::Reconciled { running: true })?;
                let note = format!("adopted running process {}", identity.pid);
                *write(&self.process) = Some(identity);
                Ok(Some(note))
            }
            _ => Ok(None),
        }
    }

    async fn handle_crash(&self, reason: &UnhealthyReason) {
        let detail = match self.supervisor.take_last_exit() {
            Some(status) => format!("process exited unexpectedly ({})", status),
            None => format!("process lost: {}", reason.detail()),
        };
        error!("Service crashed: {}", detail);

        if let Err(e) = self.transition(ServiceEvent::Crash(detail.clone())) {
            warn!("{}", e);
            return;
        }
        self.journal
            .record(StatusEvent::failure(EventType::Health, detail))
            .await;

        if let Err(e) = self.supervisor.clear_stale().await {
            warn!("Failed to clear identity of crashed process: {}", e);
        }
        *write(&self.process) = None;
        if let Err(e) = self.transition(ServiceEvent::Stopped) {
            warn!("{}", e);
        }
    }

    /// Make a started artifact current. The in-memory copy is updated even
    /// when the record cannot be written.
    async fn promote_artifact(&self, artifact: &DeploymentArtifact) -> Result<(), WardenError> {
        *write(&self.artifact) = Some(artifact.clone());
        self.artifact_file.write_json(artifact).await
    }

    fn ensure_operational(&self) -> Result<(), WardenError> {
        let fsm = read(&self.fsm);
        if fsm.accepts_operations() {
            Ok(())
        } else {
            Err(WardenError::Reconciliation(
                fsm.error().unwrap_or("state unknown").to_string(),
            ))
        }
    }

    fn transition(&self, event: ServiceEvent) -> Result<ServiceState, WardenError> {
        let mut fsm = write(&self.fsm);
        let from = fsm.state();
        let to = fsm.process(event)?;
        if from != to {
            debug!("Service state {:?} -> {:?}", from, to);
        }
        Ok(to)
    }

    async fn begin(&self, operation: Operation) -> Result<OperationGuard<'_>, OperationOutcome> {
        match self.op_lock.try_lock() {
            Ok(lock) => {
                *write(&self.in_flight) = Some(operation);
                Ok(OperationGuard {
                    _lock: lock,
                    in_flight: &self.in_flight,
                })
            }
            Err(_) => {
                let in_flight = *read(&self.in_flight);
                let running = in_flight
                    .map(|op| op.to_string())
                    .unwrap_or_else(|| "another operation".to_string());
                let error = WardenError::ConcurrentOperationRejected(running);
                warn!("{} rejected: {}", operation, error);
                Err(self.finish(operation, None, None, Err(error)).await)
            }
        }
    }

    async fn finish(
        &self,
        operation: Operation,
        context: Option<&str>,
        note: Option<String>,
        result: Result<String, WardenError>,
    ) -> OperationOutcome {
        let (kind, text) = match result {
            Ok(detail) => (OutcomeKind::Completed, detail),
            Err(e) => {
                if e.is_ambiguous() && self.state() != ServiceState::Failed {
                    let _ = self.transition(ServiceEvent::Fail(e.to_string()));
                }
                let kind = match e {
                    WardenError::ConcurrentOperationRejected(_)
                    | WardenError::AlreadyRunning(_)
                    | WardenError::Reconciliation(_) => OutcomeKind::Rejected,
                    _ => OutcomeKind::Failed,
                };
                (kind, e.to_string())
            }
        };

        let text = match note {
            Some(note) => format!("{}; {}", note, text),
            None => text,
        };
        let detail = match context {
            Some(context) => format!("{}: {}", context, text),
            None => text,
        };
        let success = kind == OutcomeKind::Completed;
        let event = if success {
            info!("{} succeeded: {}", operation, detail);
            StatusEvent::success(operation.event_type(), detail.clone())
        } else {
            warn!("{} failed: {}", operation, detail);
            StatusEvent::failure(operation.event_type(), detail.clone())
        };
        let event = self.journal.record(event).await;

        OperationOutcome {
            operation,
            outcome: kind,
            success,
            detail,
            state: self.state(),
            event,
        }
    }
}

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|e| e.into_inner())
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|e| e.into_inner())
}
