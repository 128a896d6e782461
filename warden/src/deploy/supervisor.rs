//! Process supervisor
//!
//! Owns at most one child process per service. The child's identity is kept
//! in a durable record so that a restarted warden can recognise (or discard)
//! a process spawned by a previous run.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Mutex;
use std::time::Duration;

use chrono::Utc;
use tokio::process::{Child, Command};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::deploy::identity::{IdentityRecord, Liveness, ProcessIdentity, ProcessTable};
use crate::errors::WardenError;
use crate::filesys::file::File;
use crate::models::artifact::DeploymentArtifact;

/// Placeholder substituted with the artifact path in the command line
pub const ARTIFACT_PLACEHOLDER: &str = "{artifact}";

/// Output files larger than this are rotated before the next start
const MAX_OUTPUT_BYTES: u64 = 10 * 1024 * 1024;

/// Where a rotated output file is moved
pub fn rotated_output_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".1");
    path.with_file_name(name)
}

/// Poll interval while waiting for a process to exit
const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Supervisor options
#[derive(Debug, Clone)]
pub struct SupervisorOptions {
    pub command: String,
    pub args: Vec<String>,
    pub working_dir: Option<PathBuf>,
    pub env: BTreeMap<String, String>,

    /// How long to wait after SIGTERM before SIGKILL
    pub stop_timeout: Duration,

    /// How long a new process must survive before the start counts as successful
    pub startup_grace: Duration,

    /// Output file size that triggers a rotation on the next start
    pub max_output_bytes: u64,
}

impl Default for SupervisorOptions {
    fn default() -> Self {
        Self {
            command: "java".to_string(),
            args: vec!["-jar".to_string(), ARTIFACT_PLACEHOLDER.to_string()],
            working_dir: None,
            env: BTreeMap::new(),
            stop_timeout: Duration::from_secs(15),
            startup_grace: Duration::from_secs(2),
            max_output_bytes: MAX_OUTPUT_BYTES,
        }
    }
}

/// Result of a stop request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopOutcome {
    /// Nothing was running
    AlreadyStopped,

    /// The process exited after SIGTERM
    Terminated { pid: u32 },

    /// The process had to be killed
    Killed { pid: u32 },
}

/// Where the child's stdout and stderr are appended
#[derive(Debug, Clone)]
pub struct OutputFiles {
    pub stdout: File,
    pub stderr: File,
}

/// Supervises a single child process
pub struct ProcessSupervisor {
    options: SupervisorOptions,
    record: IdentityRecord,
    output: OutputFiles,
    table: Mutex<ProcessTable>,
    child: Mutex<Option<Child>>,
    last_exit: Mutex<Option<std::process::ExitStatus>>,
}

impl ProcessSupervisor {
    pub fn new(options: SupervisorOptions, record: IdentityRecord, output: OutputFiles) -> Self {
        Self {
            options,
            record,
            output,
            table: Mutex::new(ProcessTable::new()),
            child: Mutex::new(None),
            last_exit: Mutex::new(None),
        }
    }

    /// Identity of the recorded process, if any
    pub async fn identity(&self) -> Result<Option<ProcessIdentity>, WardenError> {
        self.record.load().await
    }

    /// Check the recorded process against the OS.
    ///
    /// Returns `None` when no process is recorded.
    pub async fn liveness(&self) -> Result<Option<(ProcessIdentity, Liveness)>, WardenError> {
        self.reap_child();

        let Some(identity) = self.record.load().await? else {
            return Ok(None);
        };
        let liveness = self.with_table(|table| table.inspect(&identity))?;
        Ok(Some((identity, liveness)))
    }

    /// Whether a live process matching the recorded identity exists
    pub async fn is_running(&self) -> bool {
        match self.liveness().await {
            Ok(Some((_, liveness))) => liveness.is_alive(),
            Ok(None) => false,
            Err(e) => {
                warn!("Unable to verify process identity: {}", e);
                false
            }
        }
    }

    /// Drop a record that no longer refers to a live process
    pub async fn clear_stale(&self) -> Result<bool, WardenError> {
        match self.liveness().await? {
            Some((_, Liveness::Alive(_))) => Ok(false),
            Some((identity, _)) => {
                info!("Clearing stale identity record for PID {}", identity.pid);
                self.record.clear().await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Remove the identity record without touching any process
    pub async fn forget(&self) -> Result<(), WardenError> {
        self.record.clear().await
    }

    /// Spawn the service for `artifact`.
    ///
    /// Rejected if a process with a valid identity is already running.
    pub async fn start(&self, artifact: &DeploymentArtifact) -> Result<ProcessIdentity, WardenError> {
        if let Some((identity, liveness)) = self.liveness().await? {
            if liveness.is_alive() {
                return Err(WardenError::AlreadyRunning(identity.pid));
            }
            debug!("Discarding stale identity record for PID {}", identity.pid);
            self.record.clear().await?;
        }

        self.take_last_exit();
        let command_line = self.command_line(artifact);
        info!("Starting service: {}", command_line.join(" "));

        let (stdout, stderr) = self.open_output().await?;
        let mut command = Command::new(&command_line[0]);
        command
            .args(&command_line[1..])
            .envs(&self.options.env)
            .stdin(Stdio::null())
            .stdout(stdout)
            .stderr(stderr)
            .kill_on_drop(false);
        if let Some(dir) = &self.options.working_dir {
            command.current_dir(dir);
        }

        let mut child = command.spawn().map_err(|e| {
            WardenError::Spawn(format!("failed to spawn '{}': {}", command_line[0], e))
        })?;
        let pid = child
            .id()
            .ok_or_else(|| WardenError::Spawn("process exited before reporting a PID".to_string()))?;

        let Some((name, start_time)) = self.with_table(|table| table.observe(pid))? else {
            let status = child.wait().await?;
            return Err(WardenError::Spawn(format!("process exited immediately ({})", status)));
        };

        let mut identity = ProcessIdentity {
            pid,
            start_time,
            name,
            generation: Uuid::new_v4(),
            command: command_line,
            artifact_path: artifact.path.clone(),
            artifact_version: artifact.version.clone(),
            started_at: Utc::now(),
        };

        if let Err(e) = self.record.save(&identity).await {
            error!("Failed to record identity of PID {}, killing it: {}", pid, e);
            let _ = child.kill().await;
            return Err(e);
        }

        if !self.options.startup_grace.is_zero() {
            tokio::time::sleep(self.options.startup_grace).await;
            if let Some(status) = child.try_wait()? {
                self.record.clear().await?;
                return Err(WardenError::Spawn(format!(
                    "process exited during startup ({})",
                    status
                )));
            }
            self.refresh_name(&mut identity).await;
        }

        self.replace_child(child);
        info!("Service started with PID {}", pid);
        Ok(identity)
    }

    /// Stop the service. Stopping a stopped service is a successful no-op.
    pub async fn stop(&self) -> Result<StopOutcome, WardenError> {
        let Some((identity, liveness)) = self.liveness().await? else {
            return Ok(StopOutcome::AlreadyStopped);
        };

        if !liveness.is_alive() {
            debug!("Recorded PID {} is not running", identity.pid);
            self.record.clear().await?;
            self.take_child();
            return Ok(StopOutcome::AlreadyStopped);
        }

        let pid = identity.pid;
        info!("Stopping service (PID {})", pid);

        let descendants = self.with_table(|table| table.descendants(pid))?;
        self.with_table(|table| table.terminate(pid))?;

        let outcome = if self.wait_for_exit(&identity, self.options.stop_timeout).await? {
            StopOutcome::Terminated { pid }
        } else {
            warn!(
                "PID {} did not exit within {:?}, killing it",
                pid, self.options.stop_timeout
            );
            self.with_table(|table| {
                table.kill(pid);
            })?;
            if !self.wait_for_exit(&identity, self.options.stop_timeout).await? {
                return Err(WardenError::Timeout(format!("PID {} survived SIGKILL", pid)));
            }
            StopOutcome::Killed { pid }
        };

        // Children left behind by a wrapper script would keep ports bound
        for child_pid in descendants {
            if self.with_table(|table| table.kill(child_pid))? {
                debug!("Killed leftover child process {}", child_pid);
            }
        }

        if let Some(mut child) = self.take_child() {
            let _ = child.wait().await;
        }
        self.take_last_exit();
        self.record.clear().await?;
        info!("Service stopped ({:?})", outcome);
        Ok(outcome)
    }

    /// Exit status of the owned child if it has exited
    pub fn reap_child(&self) -> Option<std::process::ExitStatus> {
        let mut guard = self.child.lock().ok()?;
        let child = guard.as_mut()?;
        match child.try_wait() {
            Ok(Some(status)) => {
                *guard = None;
                if let Ok(mut last_exit) = self.last_exit.lock() {
                    *last_exit = Some(status);
                }
                Some(status)
            }
            Ok(None) => None,
            Err(e) => {
                warn!("Failed to poll child process: {}", e);
                None
            }
        }
    }

    /// Exit status of the last child reaped on its own, consumed on read
    pub fn take_last_exit(&self) -> Option<std::process::ExitStatus> {
        self.last_exit.lock().ok().and_then(|mut guard| guard.take())
    }

    async fn wait_for_exit(
        &self,
        identity: &ProcessIdentity,
        timeout: Duration,
    ) -> Result<bool, WardenError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            self.reap_child();
            if !self.with_table(|table| table.inspect(identity))?.is_alive() {
                return Ok(true);
            }
            if tokio::time::Instant::now() >= deadline {
                return Ok(false);
            }
            tokio::time::sleep(EXIT_POLL_INTERVAL).await;
        }
    }

    /// Record the name a launcher exec'd into during startup
    async fn refresh_name(&self, identity: &mut ProcessIdentity) {
        let observed = match self.with_table(|table| table.observe(identity.pid)) {
            Ok(Some((name, start_time))) if start_time == identity.start_time => name,
            _ => return,
        };
        if observed == identity.name {
            return;
        }
        debug!("PID {} is now '{}' (was '{}')", identity.pid, observed, identity.name);
        identity.name = observed;
        if let Err(e) = self.record.save(identity).await {
            warn!("Failed to update identity of PID {}: {}", identity.pid, e);
        }
    }

    fn command_line(&self, artifact: &DeploymentArtifact) -> Vec<String> {
        let artifact_path = artifact.path.to_string_lossy();
        std::iter::once(&self.options.command)
            .chain(self.options.args.iter())
            .map(|part| part.replace(ARTIFACT_PLACEHOLDER, &artifact_path))
            .collect()
    }

    async fn open_output(&self) -> Result<(Stdio, Stdio), WardenError> {
        let limit = self.options.max_output_bytes;
        let stdout = open_append(&self.output.stdout, limit).await?;
        let stderr = open_append(&self.output.stderr, limit).await?;
        Ok((Stdio::from(stdout), Stdio::from(stderr)))
    }

    fn with_table<T>(&self, f: impl FnOnce(&mut ProcessTable) -> T) -> Result<T, WardenError> {
        let mut table = self
            .table
            .lock()
            .map_err(|_| WardenError::Internal("process table lock poisoned".to_string()))?;
        Ok(f(&mut table))
    }

    fn replace_child(&self, child: Child) {
        if let Ok(mut guard) = self.child.lock() {
            *guard = Some(child);
        }
    }

    fn take_child(&self) -> Option<Child> {
        self.child.lock().ok().and_then(|mut guard| guard.take())
    }
}

/// Open an output file for appending, rotating it first if it grew too large
///
/// The tail sources read what is left of the rotated file before moving on.
async fn open_append(file: &File, limit: u64) -> Result<std::fs::File, WardenError> {
    file.create_parent().await?;
    if let Ok(meta) = tokio::fs::metadata(file.path()).await {
        if meta.len() > limit {
            let rotated = rotated_output_path(file.path());
            tokio::fs::rename(file.path(), &rotated).await?;
            debug!("Rotated {} to {}", file.path().display(), rotated.display());
        }
    }
    let handle = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(file.path())
        .await?;
    Ok(handle.into_std().await)
}
