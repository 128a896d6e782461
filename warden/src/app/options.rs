//! Application configuration options

use std::time::Duration;

use secrecy::SecretString;
use url::Url;

use crate::control::surface::SurfaceOptions;
use crate::deploy::supervisor::SupervisorOptions;
use crate::health::prober::ProberOptions;
use crate::storage::layout::StorageLayout;
use crate::storage::settings::{Settings, SourceSettings};
use crate::workers::{artifact_check, health, log_poller};

/// Main application options
#[derive(Debug, Clone)]
pub struct AppOptions {
    /// Lifecycle configuration
    pub lifecycle: LifecycleOptions,

    /// Storage layout paths
    pub storage: StorageLayout,

    /// How to launch the supervised process
    pub supervisor: SupervisorOptions,

    /// Artifact source
    pub source: SourceSettings,

    /// Health check options
    pub prober: ProberOptions,

    /// Control surface options
    pub surface: SurfaceOptions,

    /// Log collection
    pub logs: LogCollectionOptions,

    /// Number of status events kept
    pub events_capacity: usize,

    /// Enable local HTTP server
    pub enable_server: bool,

    /// Server configuration
    pub server: ServerOptions,

    /// Enable periodic artifact check
    pub enable_artifact_check: bool,

    /// Health worker options
    pub health_worker: health::Options,

    /// Log poller options
    pub log_poller: log_poller::Options,

    /// Artifact check worker options
    pub artifact_check: artifact_check::Options,
}

impl Default for AppOptions {
    fn default() -> Self {
        Self {
            lifecycle: LifecycleOptions::default(),
            storage: StorageLayout::default(),
            supervisor: SupervisorOptions::default(),
            source: SourceSettings::default(),
            prober: ProberOptions::default(),
            surface: SurfaceOptions::default(),
            logs: LogCollectionOptions::default(),
            events_capacity: 500,
            enable_server: true,
            server: ServerOptions::default(),
            enable_artifact_check: true,
            health_worker: health::Options::default(),
            log_poller: log_poller::Options::default(),
            artifact_check: artifact_check::Options::default(),
        }
    }
}

impl AppOptions {
    /// Derive options from the settings file
    pub fn from_settings(settings: &Settings, storage: StorageLayout) -> Self {
        let service = &settings.service;
        let health_interval = Duration::from_secs(settings.health.interval_secs.max(1));

        Self {
            lifecycle: LifecycleOptions {
                stop_on_shutdown: service.stop_on_shutdown,
                ..Default::default()
            },
            storage,
            supervisor: SupervisorOptions {
                command: service.command.clone(),
                args: service.args.clone(),
                working_dir: service.working_dir.clone(),
                env: service.env.clone(),
                stop_timeout: Duration::from_secs(service.stop_timeout_secs),
                startup_grace: Duration::from_secs(service.startup_grace_secs),
                ..Default::default()
            },
            source: settings.source.clone(),
            prober: ProberOptions {
                url: settings.health.url.clone(),
                timeout: Duration::from_secs(settings.health.timeout_secs.max(1)),
            },
            surface: SurfaceOptions {
                redeploy_timeout: Duration::from_secs(settings.redeploy_timeout_secs.max(1)),
                health_interval,
            },
            logs: LogCollectionOptions {
                url: settings.log_source.url.clone(),
                timeout: Duration::from_secs(settings.log_source.timeout_secs.max(1)),
                capacity: settings.log_source.capacity,
            },
            events_capacity: settings.events_capacity,
            enable_server: settings.server.enabled,
            server: ServerOptions {
                host: settings.server.host.clone(),
                port: settings.server.port,
                webhook_secret: settings.server.webhook_secret.clone(),
            },
            enable_artifact_check: settings.artifact_check.enabled,
            health_worker: health::Options {
                interval: health_interval,
                ..Default::default()
            },
            log_poller: log_poller::Options {
                interval: Duration::from_secs(settings.log_source.interval_secs.max(1)),
                ..Default::default()
            },
            artifact_check: artifact_check::Options {
                interval: Duration::from_secs(settings.artifact_check.interval_secs.max(1)),
                ..Default::default()
            },
        }
    }
}

/// Lifecycle options
#[derive(Debug, Clone)]
pub struct LifecycleOptions {
    /// Maximum delay for graceful shutdown
    pub max_shutdown_delay: Duration,

    /// Stop the supervised process when warden exits
    pub stop_on_shutdown: bool,
}

impl Default for LifecycleOptions {
    fn default() -> Self {
        Self {
            max_shutdown_delay: Duration::from_secs(30),
            stop_on_shutdown: false,
        }
    }
}

/// Log collection options
#[derive(Debug, Clone)]
pub struct LogCollectionOptions {
    /// Log endpoint of the supervised application, polled in addition to its output
    pub url: Option<Url>,

    /// Bound on one call to the log endpoint
    pub timeout: Duration,

    /// Entries kept in the store
    pub capacity: usize,
}

impl Default for LogCollectionOptions {
    fn default() -> Self {
        Self {
            url: None,
            timeout: Duration::from_secs(5),
            capacity: 10_000,
        }
    }
}

/// Local HTTP server options
#[derive(Debug, Clone)]
pub struct ServerOptions {
    /// Host to bind to
    pub host: String,

    /// Port to listen on
    pub port: u16,

    /// Webhook shared secret
    pub webhook_secret: Option<SecretString>,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 3000,
            webhook_secret: None,
        }
    }
}
