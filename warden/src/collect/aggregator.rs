//! Polls every log source into the shared store

use std::sync::Arc;

use tracing::{debug, error, warn};

use crate::collect::source::LogSource;
use crate::collect::store::LogStore;
use crate::errors::WardenError;
use crate::models::log_entry::LogEntry;

pub struct LogAggregator {
    sources: Vec<Arc<dyn LogSource>>,
    store: Arc<LogStore>,
}

impl LogAggregator {
    pub fn new(sources: Vec<Arc<dyn LogSource>>, store: Arc<LogStore>) -> Self {
        Self { sources, store }
    }

    pub fn store(&self) -> &Arc<LogStore> {
        &self.store
    }

    /// Pull new records from every source and admit them to the store.
    ///
    /// A failing source keeps its cursor and is retried on the next poll.
    /// The poll only fails when every source failed.
    pub async fn poll(&self) -> Result<Vec<LogEntry>, WardenError> {
        let mut added = Vec::new();
        let mut failures = Vec::new();

        for source in &self.sources {
            let cursor = self.store.cursor(source.name());
            match source.fetch(&cursor).await {
                Ok(batch) => {
                    let entries = self.store.commit(source.name(), batch.records, batch.cursor);
                    if !entries.is_empty() {
                        debug!("Collected {} entries from {}", entries.len(), source.name());
                    }
                    added.extend(entries);
                }
                Err(e) => {
                    warn!("Log source {} failed: {}", source.name(), e);
                    failures.push(format!("{}: {}", source.name(), e));
                }
            }
        }

        if let Err(e) = self.store.persist().await {
            error!("Failed to persist log store: {}", e);
        }

        if !self.sources.is_empty() && failures.len() == self.sources.len() {
            return Err(WardenError::LogSource(failures.join("; ")));
        }
        Ok(added)
    }
}
