//! Bounded, append-only journal of status events

use std::collections::VecDeque;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use tracing::{error, warn};

use crate::errors::WardenError;
use crate::filesys::file::File;
use crate::models::event::StatusEvent;

pub struct EventJournal {
    file: Option<File>,
    capacity: usize,
    events: RwLock<VecDeque<StatusEvent>>,
    persist_lock: tokio::sync::Mutex<()>,
}

impl EventJournal {
    /// Journal that lives only in memory
    pub fn in_memory(capacity: usize) -> Self {
        Self {
            file: None,
            capacity: capacity.max(1),
            events: RwLock::new(VecDeque::new()),
            persist_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Journal backed by `file`. An unreadable file is ignored and overwritten on the next record.
    pub async fn open(file: File, capacity: usize) -> Result<Self, WardenError> {
        let capacity = capacity.max(1);
        let mut events: VecDeque<StatusEvent> = if file.exists().await {
            match file.read_json().await {
                Ok(events) => events,
                Err(e) => {
                    warn!("Discarding unreadable event journal {}: {}", file.path().display(), e);
                    VecDeque::new()
                }
            }
        } else {
            VecDeque::new()
        };
        while events.len() > capacity {
            events.pop_front();
        }

        Ok(Self {
            file: Some(file),
            capacity,
            events: RwLock::new(events),
            persist_lock: tokio::sync::Mutex::new(()),
        })
    }

    /// Append an event. Persistence failures are logged, the event is kept in memory.
    pub async fn record(&self, event: StatusEvent) -> StatusEvent {
        {
            let mut events = self.write();
            events.push_back(event.clone());
            while events.len() > self.capacity {
                events.pop_front();
            }
        }
        if let Err(e) = self.persist().await {
            error!("Failed to persist event journal: {}", e);
        }
        event
    }

    /// Up to `n` most recent events, newest first
    pub fn recent(&self, n: usize) -> Vec<StatusEvent> {
        self.read().iter().rev().take(n).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub async fn persist(&self) -> Result<(), WardenError> {
        let Some(file) = &self.file else {
            return Ok(());
        };
        let _guard = self.persist_lock.lock().await;
        let bytes = {
            let events = self.read();
            serde_json::to_vec(&*events)?
        };
        file.write_atomic(&bytes).await
    }

    fn read(&self) -> RwLockReadGuard<'_, VecDeque<StatusEvent>> {
        self.events.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, VecDeque<StatusEvent>> {
        self.events.write().unwrap_or_else(|e| e.into_inner())
    }
}
