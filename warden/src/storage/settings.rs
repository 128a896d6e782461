//! Settings file management

use std::collections::BTreeMap;
use std::path::PathBuf;

use secrecy::SecretString;
use serde::Deserialize;
use url::Url;

use crate::logs::LogLevel;

/// Warden settings, read from `settings.json`
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    /// Log level
    #[serde(default)]
    pub log_level: LogLevel,

    /// Directory for warden's own rolling log file
    #[serde(default)]
    pub log_dir: Option<PathBuf>,

    /// Emit JSON formatted logs on stdout
    #[serde(default)]
    pub json_logs: bool,

    /// Override of the storage base directory
    #[serde(default)]
    pub base_dir: Option<PathBuf>,

    /// How to launch the supervised process
    #[serde(default)]
    pub service: ServiceSettings,

    /// Where artifacts come from
    #[serde(default)]
    pub source: SourceSettings,

    /// Health check configuration
    #[serde(default)]
    pub health: HealthSettings,

    /// Log collection configuration
    #[serde(default)]
    pub log_source: LogSourceSettings,

    /// Periodic check for a newer artifact
    #[serde(default)]
    pub artifact_check: ArtifactCheckSettings,

    /// Number of status events kept in the journal
    #[serde(default = "default_events_capacity")]
    pub events_capacity: usize,

    /// Upper bound for a whole redeploy (fetch + stop + start)
    #[serde(default = "default_redeploy_timeout")]
    pub redeploy_timeout_secs: u64,

    /// Local HTTP server
    #[serde(default)]
    pub server: ServerSettings,
}

fn default_true() -> bool {
    true
}

fn default_events_capacity() -> usize {
    500
}

fn default_redeploy_timeout() -> u64 {
    600
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            log_level: LogLevel::Info,
            log_dir: None,
            json_logs: false,
            base_dir: None,
            service: ServiceSettings::default(),
            source: SourceSettings::default(),
            health: HealthSettings::default(),
            log_source: LogSourceSettings::default(),
            artifact_check: ArtifactCheckSettings::default(),
            events_capacity: default_events_capacity(),
            redeploy_timeout_secs: default_redeploy_timeout(),
            server: ServerSettings::default(),
        }
    }
}

/// Supervised process settings.
///
/// `{artifact}` in `command` or `args` is replaced by the artifact path.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServiceSettings {
    pub command: String,
    pub args: Vec<String>,
    pub working_dir: Option<PathBuf>,
    pub env: BTreeMap<String, String>,
    pub stop_timeout_secs: u64,
    pub startup_grace_secs: u64,
    pub stop_on_shutdown: bool,
}

impl Default for ServiceSettings {
    fn default() -> Self {
        Self {
            command: "java".to_string(),
            args: vec!["-jar".to_string(), "{artifact}".to_string()],
            working_dir: None,
            env: BTreeMap::new(),
            stop_timeout_secs: 15,
            startup_grace_secs: 2,
            stop_on_shutdown: false,
        }
    }
}

/// Artifact source
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SourceSettings {
    /// Pull a git checkout, build it and take the build output
    Git {
        repo_dir: PathBuf,
        /// Clone URL, used when `repo_dir` does not exist yet
        #[serde(default)]
        repo_url: Option<String>,
        #[serde(default = "default_remote")]
        remote: String,
        #[serde(default = "default_branch")]
        branch: String,
        #[serde(default)]
        build_cmd: Option<String>,
        artifact_path: PathBuf,
        #[serde(default = "default_command_timeout")]
        command_timeout_secs: u64,
    },

    /// Download an asset of the latest release from a GitHub-style API
    Release {
        #[serde(default = "default_api_base")]
        api_base: String,
        repo: String,
        asset_name: String,
        #[serde(default)]
        token: Option<SecretString>,
        #[serde(default = "default_download_timeout")]
        download_timeout_secs: u64,
    },
}

fn default_remote() -> String {
    "origin".to_string()
}

fn default_branch() -> String {
    "main".to_string()
}

fn default_command_timeout() -> u64 {
    300
}

fn default_api_base() -> String {
    "https://api.github.com".to_string()
}

fn default_download_timeout() -> u64 {
    300
}

impl Default for SourceSettings {
    fn default() -> Self {
        SourceSettings::Git {
            repo_dir: PathBuf::from("."),
            repo_url: None,
            remote: default_remote(),
            branch: default_branch(),
            build_cmd: Some("./gradlew clean build".to_string()),
            artifact_path: PathBuf::from("build/libs/app.jar"),
            command_timeout_secs: default_command_timeout(),
        }
    }
}

/// Health check settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HealthSettings {
    /// Liveness endpoint of the supervised application
    pub url: Option<Url>,
    pub timeout_secs: u64,
    pub interval_secs: u64,
}

impl Default for HealthSettings {
    fn default() -> Self {
        Self {
            url: Url::parse("http://127.0.0.1:8080/health").ok(),
            timeout_secs: 5,
            interval_secs: 30,
        }
    }
}

/// Log collection settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LogSourceSettings {
    /// Log retrieval endpoint of the supervised application
    pub url: Option<Url>,
    pub timeout_secs: u64,
    pub interval_secs: u64,
    /// Entries kept in the log store
    pub capacity: usize,
}

impl Default for LogSourceSettings {
    fn default() -> Self {
        Self {
            url: None,
            timeout_secs: 5,
            interval_secs: 15,
            capacity: 10_000,
        }
    }
}

/// Artifact check settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ArtifactCheckSettings {
    pub enabled: bool,
    pub interval_secs: u64,
}

impl Default for ArtifactCheckSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: 300,
        }
    }
}

/// Local HTTP server settings
#[derive(Debug, Clone, Deserialize)]
pub struct ServerSettings {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    /// Shared secret expected in the `X-Warden-Token` header of webhook calls
    #[serde(default)]
    pub webhook_secret: Option<SecretString>,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    3000
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            host: default_host(),
            port: default_port(),
            webhook_secret: None,
        }
    }
}
