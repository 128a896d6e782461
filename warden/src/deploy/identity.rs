//! Durable identity of the supervised process
//!
//! A bare PID is not enough to recognise a process after a restart of warden:
//! the PID may have been recycled by the OS for an unrelated program. The
//! record therefore also stores the kernel-reported start time, which must
//! match the live process before it is trusted. The name is informational:
//! a launcher that execs the real server keeps its PID and start time but
//! changes its name.

use std::collections::HashSet;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sysinfo::{Pid, Process, ProcessStatus, ProcessesToUpdate, Signal, System};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::errors::WardenError;
use crate::filesys::file::File;

/// Start times reported for the same process may differ by rounding
const START_TIME_TOLERANCE_SECS: u64 = 1;

/// Identity of a spawned process
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessIdentity {
    pub pid: u32,

    /// Start time as reported by the OS, seconds since the epoch
    pub start_time: u64,

    /// Process name as last observed
    pub name: String,

    /// Unique token for this spawn
    pub generation: Uuid,

    /// Command line used to spawn it
    pub command: Vec<String>,

    /// Artifact the process runs
    pub artifact_path: PathBuf,
    pub artifact_version: String,

    pub started_at: DateTime<Utc>,
}

/// Resource usage of a live process
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessStats {
    pub pid: u32,
    pub cpu_percent: f32,
    pub memory_bytes: u64,
    pub uptime_secs: u64,
}

/// What the OS says about a recorded identity
#[derive(Debug, Clone, PartialEq)]
pub enum Liveness {
    /// The recorded process is alive and matches its identity
    Alive(ProcessStats),

    /// No process with that PID, or it is a zombie
    Exited,

    /// The PID now belongs to a different process
    Recycled { name: String, start_time: u64 },
}

impl Liveness {
    pub fn is_alive(&self) -> bool {
        matches!(self, Liveness::Alive(_))
    }
}

/// Persistent identity record, written atomically
#[derive(Debug, Clone)]
pub struct IdentityRecord {
    file: File,
}

impl IdentityRecord {
    pub fn new(file: File) -> Self {
        Self { file }
    }

    /// Load the record. A missing file is `None`; an unreadable one is an identity error.
    pub async fn load(&self) -> Result<Option<ProcessIdentity>, WardenError> {
        if !self.file.exists().await {
            return Ok(None);
        }
        self.file.read_json().await.map(Some).map_err(|e| {
            WardenError::Identity(format!(
                "corrupt identity record {}: {}",
                self.file.path().display(),
                e
            ))
        })
    }

    pub async fn save(&self, identity: &ProcessIdentity) -> Result<(), WardenError> {
        self.file.write_json(identity).await
    }

    pub async fn clear(&self) -> Result<(), WardenError> {
        self.file.delete().await
    }
}

/// Process table access backed by `sysinfo`
pub struct ProcessTable {
    sys: System,
}

impl ProcessTable {
    pub fn new() -> Self {
        Self { sys: System::new() }
    }

    fn refresh(&mut self, pid: Pid) -> Option<&Process> {
        self.sys.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
        self.sys.process(pid)
    }

    /// Read the current name and start time of a process.
    ///
    /// Uses a fresh snapshot since a cached entry keeps the name the process
    /// had when first seen, which goes stale after an exec.
    pub fn observe(&mut self, pid: u32) -> Option<(String, u64)> {
        let pid = Pid::from_u32(pid);
        let mut sys = System::new();
        sys.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
        let process = sys.process(pid)?;
        if matches!(process.status(), ProcessStatus::Zombie | ProcessStatus::Dead) {
            return None;
        }
        Some((
            process.name().to_string_lossy().into_owned(),
            process.start_time(),
        ))
    }

    /// Verify a recorded identity against the live process table
    pub fn inspect(&mut self, identity: &ProcessIdentity) -> Liveness {
        let Some(process) = self.refresh(Pid::from_u32(identity.pid)) else {
            return Liveness::Exited;
        };

        if matches!(process.status(), ProcessStatus::Zombie | ProcessStatus::Dead) {
            return Liveness::Exited;
        }

        let name = process.name().to_string_lossy().into_owned();
        let start_time = process.start_time();
        if start_time.abs_diff(identity.start_time) > START_TIME_TOLERANCE_SECS {
            debug!(
                "PID {} belongs to '{}' (started {}), expected '{}' (started {})",
                identity.pid, name, start_time, identity.name, identity.start_time
            );
            return Liveness::Recycled { name, start_time };
        }
        if name != identity.name {
            debug!("PID {} was '{}' and is now '{}'", identity.pid, identity.name, name);
        }

        Liveness::Alive(ProcessStats {
            pid: identity.pid,
            cpu_percent: process.cpu_usage(),
            memory_bytes: process.memory(),
            uptime_secs: process.run_time(),
        })
    }

    /// All descendants of `pid`, deepest first
    pub fn descendants(&mut self, pid: u32) -> Vec<u32> {
        self.sys.refresh_processes(ProcessesToUpdate::All, true);

        let mut found = Vec::new();
        let mut seen = HashSet::new();
        let mut frontier = vec![Pid::from_u32(pid)];
        while let Some(parent) = frontier.pop() {
            for (child_pid, process) in self.sys.processes() {
                if process.parent() == Some(parent) && seen.insert(*child_pid) {
                    found.push(child_pid.as_u32());
                    frontier.push(*child_pid);
                }
            }
        }
        found.reverse();
        found
    }

    /// Ask a process to terminate. Returns false if it no longer exists.
    pub fn terminate(&mut self, pid: u32) -> bool {
        match self.refresh(Pid::from_u32(pid)) {
            Some(process) => match process.kill_with(Signal::Term) {
                Some(sent) => sent,
                // Platform without SIGTERM
                None => process.kill(),
            },
            None => false,
        }
    }

    /// Kill a process outright. Returns false if it no longer exists.
    pub fn kill(&mut self, pid: u32) -> bool {
        match self.refresh(Pid::from_u32(pid)) {
            Some(process) => {
                let killed = process.kill();
                if !killed {
                    warn!("Failed to send SIGKILL to PID {}", pid);
                }
                killed
            }
            None => false,
        }
    }
}

impl Default for ProcessTable {
    fn default() -> Self {
        Self::new()
    }
}
