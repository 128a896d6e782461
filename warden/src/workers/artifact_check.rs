//! Periodic check for a newer artifact at the source

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use tracing::{debug, error, info, warn};

use crate::control::surface::ControlSurface;
use crate::utils::{next_tick_delay, CooldownOptions};

/// Artifact check options
#[derive(Debug, Clone)]
pub struct Options {
    /// Check interval
    pub interval: Duration,

    /// Delay before the first check
    pub initial_delay: Duration,

    /// Backoff applied while the source is unreachable
    pub cooldown: CooldownOptions,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(300),
            initial_delay: Duration::from_secs(10),
            cooldown: CooldownOptions::default(),
        }
    }
}

/// Run the artifact check worker
pub async fn run<S, F>(
    options: &Options,
    surface: &ControlSurface,
    sleep_fn: S,
    mut shutdown_signal: Pin<Box<dyn Future<Output = ()> + Send>>,
) where
    S: Fn(Duration) -> F,
    F: Future<Output = ()>,
{
    info!("Artifact check worker starting...");
    let mut failures: u32 = 0;
    let mut delay = options.initial_delay;

    loop {
        tokio::select! {
            _ = &mut shutdown_signal => {
                info!("Artifact check worker shutting down...");
                return;
            }
            _ = sleep_fn(delay) => {}
        }

        match surface.check_for_update().await {
            Ok(Some(outcome)) if outcome.success => {
                info!("Deployed new version: {}", outcome.detail);
                failures = 0;
            }
            Ok(Some(outcome)) => {
                warn!("Automatic redeploy failed: {}", outcome.detail);
                failures = failures.saturating_add(1);
            }
            Ok(None) => {
                debug!("No new artifact");
                failures = 0;
            }
            Err(e) => {
                failures = failures.saturating_add(1);
                error!("Artifact check failed ({} in a row): {}", failures, e);
            }
        }

        delay = next_tick_delay(options.interval, &options.cooldown, failures);
    }
}
