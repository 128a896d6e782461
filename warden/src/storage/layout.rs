//! Storage layout configuration

use std::path::PathBuf;

use crate::errors::WardenError;
use crate::filesys::dir::Dir;
use crate::filesys::file::File;

/// Storage layout for warden
#[derive(Debug, Clone)]
pub struct StorageLayout {
    /// Base directory for all storage
    pub base_dir: PathBuf,
}

impl StorageLayout {
    /// Create a new storage layout
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    /// Get the settings file path
    pub fn settings_file(&self) -> File {
        File::new(self.base_dir.join("settings.json"))
    }

    /// Directory holding one subdirectory per fetched artifact version
    pub fn artifacts_dir(&self) -> Dir {
        Dir::new(self.base_dir.join("artifacts"))
    }

    /// Record of the artifact currently deployed
    pub fn current_artifact_file(&self) -> File {
        self.state_dir().file("artifact.json")
    }

    /// Runtime directory (process identity, child output)
    pub fn run_dir(&self) -> Dir {
        Dir::new(self.base_dir.join("run"))
    }

    /// Identity record of the supervised process
    pub fn identity_file(&self) -> File {
        self.run_dir().file("service.identity.json")
    }

    /// Captured stdout of the supervised process
    pub fn stdout_file(&self) -> File {
        self.run_dir().file("service.out.log")
    }

    /// Captured stderr of the supervised process
    pub fn stderr_file(&self) -> File {
        self.run_dir().file("service.err.log")
    }

    /// Persistent state directory
    pub fn state_dir(&self) -> Dir {
        Dir::new(self.base_dir.join("state"))
    }

    /// Status event journal
    pub fn events_file(&self) -> File {
        self.state_dir().file("events.json")
    }

    /// Collected log entries and source cursors
    pub fn log_store_file(&self) -> File {
        self.state_dir().file("logs.json")
    }

    /// Directory for warden's own log files
    pub fn logs_dir(&self) -> Dir {
        Dir::new(self.base_dir.join("logs"))
    }

    /// Setup the storage layout (create directories)
    pub async fn setup(&self) -> Result<(), WardenError> {
        self.artifacts_dir().create().await?;
        self.run_dir().create().await?;
        self.state_dir().create().await?;
        self.logs_dir().create().await?;
        Ok(())
    }
}

impl Default for StorageLayout {
    fn default() -> Self {
        #[cfg(target_os = "linux")]
        let base_dir = PathBuf::from("/var/lib/warden");

        #[cfg(not(target_os = "linux"))]
        let base_dir = dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".warden");

        Self::new(base_dir)
    }
}

#[cfg(not(target_os = "linux"))]
mod dirs {
    use std::path::PathBuf;

    pub fn home_dir() -> Option<PathBuf> {
        std::env::var_os("HOME")
            .or_else(|| std::env::var_os("USERPROFILE"))
            .map(PathBuf::from)
    }
}
