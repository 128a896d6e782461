//! Health check worker

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use tracing::{debug, info};

use crate::control::surface::ControlSurface;

/// Health worker options
#[derive(Debug, Clone)]
pub struct Options {
    /// Probe interval
    pub interval: Duration,

    /// Delay before the first check
    pub initial_delay: Duration,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            initial_delay: Duration::from_secs(5),
        }
    }
}

/// Run the health worker
pub async fn run<S, F>(
    options: &Options,
    surface: &ControlSurface,
    sleep_fn: S,
    mut shutdown_signal: Pin<Box<dyn Future<Output = ()> + Send>>,
) where
    S: Fn(Duration) -> F,
    F: Future<Output = ()>,
{
    info!("Health worker starting...");
    let mut delay = options.initial_delay;

    loop {
        tokio::select! {
            _ = &mut shutdown_signal => {
                info!("Health worker shutting down...");
                return;
            }
            _ = sleep_fn(delay) => {}
        }
        delay = options.interval;

        // unhealthy results are recorded by the surface, there is nothing to back off from
        if let Some(report) = surface.check_health().await {
            debug!("Health: {:?}", report.health);
        }
    }
}
