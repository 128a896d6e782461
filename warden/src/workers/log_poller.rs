//! Log collection worker

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use tracing::{debug, error, info};

use crate::collect::aggregator::LogAggregator;
use crate::utils::{next_tick_delay, CooldownOptions};

/// Log poller options
#[derive(Debug, Clone)]
pub struct Options {
    /// Polling interval
    pub interval: Duration,

    /// Backoff applied while every source is failing
    pub cooldown: CooldownOptions,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(15),
            cooldown: CooldownOptions::default(),
        }
    }
}

/// Run the log poller worker
pub async fn run<S, F>(
    options: &Options,
    aggregator: &LogAggregator,
    sleep_fn: S,
    mut shutdown_signal: Pin<Box<dyn Future<Output = ()> + Send>>,
) where
    S: Fn(Duration) -> F,
    F: Future<Output = ()>,
{
    info!("Log poller starting...");
    let mut failures: u32 = 0;

    loop {
        match aggregator.poll().await {
            Ok(entries) => {
                if !entries.is_empty() {
                    debug!("Collected {} log entries", entries.len());
                }
                failures = 0;
            }
            Err(e) => {
                failures = failures.saturating_add(1);
                error!("Log poll failed ({} in a row): {}", failures, e);
            }
        }

        tokio::select! {
            _ = &mut shutdown_signal => {
                info!("Log poller shutting down...");
                return;
            }
            _ = sleep_fn(next_tick_delay(options.interval, &options.cooldown, failures)) => {}
        }
    }
}
