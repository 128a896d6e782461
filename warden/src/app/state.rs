//! Application state management

use std::sync::Arc;

use tracing::{error, info, warn};

use crate::app::options::AppOptions;
use crate::collect::aggregator::LogAggregator;
use crate::collect::source::{FileTailSource, HttpLogSource, LogSource};
use crate::collect::store::LogStore;
use crate::control::events::EventJournal;
use crate::control::surface::ControlSurface;
use crate::deploy::fetcher;
use crate::deploy::identity::IdentityRecord;
use crate::deploy::supervisor::{OutputFiles, ProcessSupervisor};
use crate::errors::WardenError;
use crate::health::prober::HealthProber;
use crate::models::log_entry::LogStream;
use crate::storage::layout::StorageLayout;

/// Main application state
pub struct AppState {
    /// Storage layout
    pub layout: StorageLayout,

    /// Owner of the service lifecycle
    pub surface: Arc<ControlSurface>,

    /// Collected logs
    pub logs: Arc<LogStore>,

    /// Feeds the log store
    pub aggregator: Arc<LogAggregator>,

    /// Status event journal
    pub journal: Arc<EventJournal>,
}

impl AppState {
    /// Wire every component and reconcile with whatever a previous run left behind
    pub async fn init(options: &AppOptions) -> Result<Self, WardenError> {
        info!("Initializing application state...");

        let layout = options.storage.clone();
        layout.setup().await?;

        let output = OutputFiles {
            stdout: layout.stdout_file(),
            stderr: layout.stderr_file(),
        };
        let supervisor = Arc::new(ProcessSupervisor::new(
            options.supervisor.clone(),
            IdentityRecord::new(layout.identity_file()),
            output.clone(),
        ));

        let fetcher = fetcher::from_settings(&options.source, layout.artifacts_dir())?;
        info!("Artifact source: {}", fetcher.describe());

        let prober = Arc::new(HealthProber::new(supervisor.clone(), options.prober.clone())?);
        let journal = Arc::new(EventJournal::open(layout.events_file(), options.events_capacity).await?);

        let surface = Arc::new(
            ControlSurface::new(
                supervisor,
                fetcher,
                prober,
                journal.clone(),
                layout.current_artifact_file(),
                options.surface.clone(),
            )
            .await?,
        );

        let logs = Arc::new(LogStore::open(layout.log_store_file(), options.logs.capacity).await?);
        let mut sources: Vec<Arc<dyn LogSource>> = vec![
            Arc::new(FileTailSource::new(LogStream::Stdout, output.stdout)),
            Arc::new(FileTailSource::new(LogStream::Stderr, output.stderr)),
        ];
        if let Some(url) = &options.logs.url {
            sources.push(Arc::new(HttpLogSource::new(url.clone(), options.logs.timeout)?));
        }
        let aggregator = Arc::new(LogAggregator::new(sources, logs.clone()));

        let outcome = surface.reconcile().await;
        if outcome.success {
            info!("Startup reconciliation: {}", outcome.detail);
        } else {
            warn!("Startup reconciliation failed: {}", outcome.detail);
        }

        Ok(Self {
            layout,
            surface,
            logs,
            aggregator,
            journal,
        })
    }

    /// Flush durable state, optionally stopping the supervised process
    pub async fn shutdown(&self, stop_service: bool) -> Result<(), WardenError> {
        info!("Shutting down application state...");

        if stop_service {
            let outcome = self.surface.request_stop().await;
            if !outcome.success {
                error!("Failed to stop service on shutdown: {}", outcome.detail);
            }
        } else {
            info!("Leaving service running, it will be adopted on next start");
        }

        self.logs.persist().await?;
        self.journal.persist().await?;
        Ok(())
    }
}
