//! Bounded, durable log store
//!
//! Entries live in a ring buffer of fixed capacity; the oldest entries are
//! evicted first. Each source's resume cursor is stored next to the entries
//! and updated in the same commit, so a poll is either fully applied or not
//! at all.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, error};

use crate::errors::WardenError;
use crate::filesys::file::File;
use crate::models::log_entry::{LogEntry, LogRecord, LogStream};

const DEFAULT_PER_PAGE: usize = 50;
const MAX_PER_PAGE: usize = 500;

/// Resume position of one log source
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SourceCursor {
    /// Nothing read yet
    #[default]
    Start,

    /// Byte offset into an output file, and the file it refers to
    Offset {
        offset: u64,
        #[serde(default)]
        file_id: Option<u64>,
    },

    /// Newest timestamp seen, plus fingerprints of the entries carrying it
    Timestamp {
        at: DateTime<Utc>,
        seen: BTreeSet<String>,
    },
}

/// Log query with optional `[from, to)` range
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct LogQuery {
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
    pub stream: Option<LogStream>,
    /// 1-based page number
    pub page: Option<usize>,
    pub per_page: Option<usize>,
}

/// One page of query results
#[derive(Debug, Clone, Serialize)]
pub struct LogPage {
    pub entries: Vec<LogEntry>,
    pub page: usize,
    pub per_page: usize,
    pub total: usize,
    pub total_pages: usize,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct Snapshot {
    next_seq: u64,
    cursors: BTreeMap<String, SourceCursor>,
    entries: VecDeque<LogEntry>,
}

#[derive(Debug, Default)]
struct Inner {
    snapshot: Snapshot,
    revision: u64,
    persisted_revision: u64,
}

/// Bounded log store persisted as a JSON snapshot
pub struct LogStore {
    file: File,
    capacity: usize,
    inner: RwLock<Inner>,
    persist_lock: tokio::sync::Mutex<()>,
}

impl LogStore {
    /// Open the store, loading a previous snapshot if there is one.
    ///
    /// An unreadable snapshot is moved aside and the store starts empty.
    pub async fn open(file: File, capacity: usize) -> Result<Self, WardenError> {
        let capacity = capacity.max(1);
        let mut snapshot = if file.exists().await {
            match file.read_json::<Snapshot>().await {
                Ok(snapshot) => snapshot,
                Err(e) => {
                    let aside = file.path().with_extension("json.corrupt");
                    error!(
                        "Log store {} is unreadable ({}), moving it to {}",
                        file.path().display(),
                        e,
                        aside.display()
                    );
                    tokio::fs::rename(file.path(), &aside).await?;
                    Snapshot::default()
                }
            }
        } else {
            Snapshot::default()
        };

        while snapshot.entries.len() > capacity {
            snapshot.entries.pop_front();
        }
        if let Some(last) = snapshot.entries.back() {
            snapshot.next_seq = snapshot.next_seq.max(last.seq + 1);
        }
        debug!(
            "Opened log store with {} entries (capacity {})",
            snapshot.entries.len(),
            capacity
        );

        Ok(Self {
            file,
            capacity,
            inner: RwLock::new(Inner {
                snapshot,
                revision: 0,
                persisted_revision: 0,
            }),
            persist_lock: tokio::sync::Mutex::new(()),
        })
    }

    pub fn len(&self) -> usize {
        self.read().snapshot.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Resume cursor of a source
    pub fn cursor(&self, source: &str) -> SourceCursor {
        self.read()
            .snapshot
            .cursors
            .get(source)
            .cloned()
            .unwrap_or_default()
    }

    /// Append records from `source` and move its cursor, in one step
    pub fn commit(&self, source: &str, records: Vec<LogRecord>, cursor: SourceCursor) -> Vec<LogEntry> {
        let mut inner = self.write();
        let changed_cursor = inner.snapshot.cursors.get(source) != Some(&cursor);
        if records.is_empty() && !changed_cursor {
            return Vec::new();
        }

        let mut added = Vec::with_capacity(records.len());
        for record in records {
            let entry = LogEntry {
                seq: inner.snapshot.next_seq,
                timestamp: record.timestamp,
                stream: record.stream,
                severity: record.severity,
                message: record.message,
            };
            inner.snapshot.next_seq += 1;
            inner.snapshot.entries.push_back(entry.clone());
            added.push(entry);
        }
        while inner.snapshot.entries.len() > self.capacity {
            inner.snapshot.entries.pop_front();
        }

        inner.snapshot.cursors.insert(source.to_string(), cursor);
        inner.revision += 1;
        added
    }

    /// Entries matching the query, oldest first
    pub fn query(&self, query: &LogQuery) -> LogPage {
        let per_page = query
            .per_page
            .unwrap_or(DEFAULT_PER_PAGE)
            .clamp(1, MAX_PER_PAGE);
        let page = query.page.unwrap_or(1).max(1);

        let inner = self.read();
        let matching: Vec<&LogEntry> = inner
            .snapshot
            .entries
            .iter()
            .filter(|e| query.from.is_none_or(|from| e.timestamp >= from))
            .filter(|e| query.to.is_none_or(|to| e.timestamp < to))
            .filter(|e| query.stream.is_none_or(|stream| e.stream == stream))
            .collect();

        let total = matching.len();
        let entries = matching
            .into_iter()
            .skip((page - 1).saturating_mul(per_page))
            .take(per_page)
            .cloned()
            .collect();

        LogPage {
            entries,
            page,
            per_page,
            total,
            total_pages: total.div_ceil(per_page),
        }
    }

    /// Write the snapshot if anything changed since the last write
    pub async fn persist(&self) -> Result<(), WardenError> {
        let _guard = self.persist_lock.lock().await;

        let (bytes, revision) = {
            let inner = self.read();
            if inner.revision == inner.persisted_revision {
                return Ok(());
            }
            (serde_json::to_vec(&inner.snapshot)?, inner.revision)
        };

        self.file.write_atomic(&bytes).await?;
        let mut inner = self.write();
        inner.persisted_revision = inner.persisted_revision.max(revision);
        Ok(())
    }

    fn read(&self) -> RwLockReadGuard<'_, Inner> {
        self.inner.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, Inner> {
        self.inner.write().unwrap_or_else(|e| e.into_inner())
    }
}
