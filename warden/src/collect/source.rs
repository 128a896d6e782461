//! Log sources
//!
//! A source turns a cursor into a batch of new records plus the cursor to
//! resume from. Sources never touch the store themselves.

use std::collections::{BTreeSet, HashMap};
use std::io::SeekFrom;
use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use serde::Deserialize;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tracing::debug;
use url::Url;

use crate::collect::store::SourceCursor;
use crate::deploy::supervisor::rotated_output_path;
use crate::errors::WardenError;
use crate::filesys::file::File;
use crate::models::log_entry::{LogRecord, LogStream, Severity};
use crate::utils::sha256_hash;

const MAX_READ_BYTES: u64 = 1024 * 1024;

/// New records and the position after them
#[derive(Debug, Clone)]
pub struct LogBatch {
    pub records: Vec<LogRecord>,
    pub cursor: SourceCursor,
}

#[async_trait]
pub trait LogSource: Send + Sync {
    /// Stable name, used as the cursor key
    fn name(&self) -> &str;

    async fn fetch(&self, cursor: &SourceCursor) -> Result<LogBatch, WardenError>;
}

// --- output file tailing ---

/// Tails one of the supervised process's output files.
///
/// The cursor remembers which file it points into, so when the supervisor
/// rotates the output the rest of the old file is read before the new one.
pub struct FileTailSource {
    name: String,
    stream: LogStream,
    file: File,
}

impl FileTailSource {
    pub fn new(stream: LogStream, file: File) -> Self {
        let name = match stream {
            LogStream::Stdout => "stdout",
            LogStream::Stderr => "stderr",
            LogStream::Remote => "remote",
        };
        Self {
            name: name.to_string(),
            stream,
            file,
        }
    }

    fn fallback_severity(&self) -> Severity {
        match self.stream {
            LogStream::Stderr => Severity::Error,
            _ => Severity::Info,
        }
    }

    fn parse_lines(&self, buf: &[u8]) -> Vec<LogRecord> {
        let now = Utc::now();
        let fallback = self.fallback_severity();
        String::from_utf8_lossy(buf)
            .lines()
            .map(|line| line.trim_end_matches('\r'))
            .filter(|line| !line.trim().is_empty())
            .map(|line| LogRecord {
                timestamp: now,
                stream: self.stream,
                severity: Severity::sniff(line, fallback),
                message: line.to_string(),
            })
            .collect()
    }

    /// Whatever the previous file still held past `offset` when it was rotated
    async fn drain_rotated(&self, file_id: Option<u64>, offset: u64) -> Result<Vec<LogRecord>, WardenError> {
        let rotated = rotated_output_path(self.file.path());
        let Some((mut handle, meta)) = open_with_meta(&rotated).await? else {
            debug!("{} was replaced and {} is gone", self.name, rotated.display());
            return Ok(Vec::new());
        };
        if file_id_of(&meta) != file_id || meta.len() <= offset {
            debug!("{} was rotated more than once since the last poll", self.name);
            return Ok(Vec::new());
        }

        handle.seek(SeekFrom::Start(offset)).await?;
        let mut buf = Vec::new();
        handle.read_to_end(&mut buf).await?;
        debug!("Read {} bytes left in rotated {}", buf.len(), rotated.display());
        Ok(self.parse_lines(&buf))
    }
}

#[async_trait]
impl LogSource for FileTailSource {
    fn name(&self) -> &str {
        &self.name
    }

    async fn fetch(&self, cursor: &SourceCursor) -> Result<LogBatch, WardenError> {
        let (offset, cursor_file) = match cursor {
            SourceCursor::Offset { offset, file_id } => (*offset, *file_id),
            _ => (0, None),
        };

        let Some((mut handle, meta)) = open_with_meta(self.file.path()).await? else {
            return Ok(LogBatch {
                records: Vec::new(),
                cursor: cursor.clone(),
            });
        };
        let file_id = file_id_of(&meta);
        let len = meta.len();

        if cursor_file.is_some() && cursor_file != file_id {
            let records = self.drain_rotated(cursor_file, offset).await?;
            return Ok(LogBatch {
                records,
                cursor: SourceCursor::Offset { offset: 0, file_id },
            });
        }

        // file shrank: it was truncated in place
        let start = if len < offset {
            debug!("{} shrank below offset {}, reading from the start", self.name, offset);
            0
        } else {
            offset
        };
        if len == start {
            return Ok(LogBatch {
                records: Vec::new(),
                cursor: SourceCursor::Offset { offset: start, file_id },
            });
        }

        handle.seek(SeekFrom::Start(start)).await?;
        let mut buf = Vec::new();
        handle
            .take((len - start).min(MAX_READ_BYTES))
            .read_to_end(&mut buf)
            .await?;

        // only whole lines, unless a single line fills the read window
        let consumed = match buf.iter().rposition(|b| *b == b'\n') {
            Some(i) => i + 1,
            None if buf.len() as u64 >= MAX_READ_BYTES => buf.len(),
            None => 0,
        };

        Ok(LogBatch {
            records: self.parse_lines(&buf[..consumed]),
            cursor: SourceCursor::Offset {
                offset: start + consumed as u64,
                file_id,
            },
        })
    }
}

async fn open_with_meta(path: &Path) -> Result<Option<(tokio::fs::File, std::fs::Metadata)>, WardenError> {
    match tokio::fs::File::open(path).await {
        Ok(handle) => {
            let meta = handle.metadata().await?;
            Ok(Some((handle, meta)))
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

#[cfg(unix)]
fn file_id_of(meta: &std::fs::Metadata) -> Option<u64> {
    use std::os::unix::fs::MetadataExt;
    Some(meta.ino())
}

#[cfg(not(unix))]
fn file_id_of(_meta: &std::fs::Metadata) -> Option<u64> {
    None
}

// --- application log endpoint ---

#[derive(Debug, Deserialize)]
struct RemoteLog {
    timestamp: String,
    #[serde(default)]
    level: Option<String>,
    message: String,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RemotePayload {
    List(Vec<RemoteLog>),
    Wrapped { logs: Vec<RemoteLog> },
}

/// Polls the application's own log endpoint with `?since=<rfc3339>`
pub struct HttpLogSource {
    client: reqwest::Client,
    url: Url,
    timeout: Duration,
}

impl HttpLogSource {
    pub fn new(url: Url, timeout: Duration) -> Result<Self, WardenError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            url,
            timeout,
        })
    }
}

#[async_trait]
impl LogSource for HttpLogSource {
    fn name(&self) -> &str {
        "remote"
    }

    async fn fetch(&self, cursor: &SourceCursor) -> Result<LogBatch, WardenError> {
        let mut request = self.client.get(self.url.clone()).timeout(self.timeout);
        if let SourceCursor::Timestamp { at, .. } = cursor {
            request = request.query(&[("since", at.to_rfc3339())]);
        }

        let response = request.send().await?;
        if !response.status().is_success() {
            return Err(WardenError::LogSource(format!(
                "{} returned {}",
                self.url,
                response.status()
            )));
        }

        let payload: RemotePayload = response.json().await?;
        let logs = match payload {
            RemotePayload::List(logs) => logs,
            RemotePayload::Wrapped { logs } => logs,
        };

        let records = logs
            .into_iter()
            .filter_map(|log| {
                let Some(timestamp) = parse_timestamp(&log.timestamp) else {
                    debug!("Skipping remote log with timestamp {:?}", log.timestamp);
                    return None;
                };
                let severity = log
                    .level
                    .as_deref()
                    .and_then(Severity::parse)
                    .unwrap_or_else(|| Severity::sniff(&log.message, Severity::Info));
                Some(LogRecord {
                    timestamp,
                    stream: LogStream::Remote,
                    severity,
                    message: log.message,
                })
            })
            .collect();

        let (records, cursor) = dedupe_since(cursor, records);
        Ok(LogBatch { records, cursor })
    }
}

/// RFC 3339, or a naive ISO timestamp taken as UTC
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
        return Some(parsed.with_timezone(&Utc));
    }
    ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"]
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(raw, format).ok())
        .map(|naive| naive.and_utc())
}

fn fingerprint(record: &LogRecord, occurrence: usize) -> String {
    let digest = sha256_hash(format!("{:?}\u{1f}{}", record.severity, record.message).as_bytes());
    format!("{}#{}", &digest[..16], occurrence)
}

/// Drop records already covered by a timestamp cursor and advance it.
///
/// Records older than the cursor are dropped. Records at exactly the cursor
/// timestamp are kept only if their fingerprint has not been seen; identical
/// lines at the same instant are told apart by their occurrence index.
pub fn dedupe_since(cursor: &SourceCursor, mut records: Vec<LogRecord>) -> (Vec<LogRecord>, SourceCursor) {
    records.sort_by_key(|r| r.timestamp);

    let (mut at, mut seen) = match cursor {
        SourceCursor::Timestamp { at, seen } => (Some(*at), seen.clone()),
        _ => (None, BTreeSet::new()),
    };

    let mut occurrences: HashMap<(DateTime<Utc>, String), usize> = HashMap::new();
    let mut fresh = Vec::with_capacity(records.len());
    for record in records {
        let count = occurrences
            .entry((record.timestamp, record.message.clone()))
            .or_insert(0);
        let fp = fingerprint(&record, *count);
        *count += 1;

        match at {
            Some(current) if record.timestamp < current => continue,
            Some(current) if record.timestamp == current => {
                if !seen.insert(fp) {
                    continue;
                }
            }
            _ => {
                at = Some(record.timestamp);
                seen.clear();
                seen.insert(fp);
            }
        }
        fresh.push(record);
    }

    let cursor = match at {
        Some(at) => SourceCursor::Timestamp { at, seen },
        None => cursor.clone(),
    };
    (fresh, cursor)
}
