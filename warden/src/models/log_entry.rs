//! Collected log entries

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Where a log line came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogStream {
    Stdout,
    Stderr,
    Remote,
}

/// Log severity
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl Severity {
    /// Parse a level name as emitted by common logging frameworks
    pub fn parse(level: &str) -> Option<Self> {
        match level.trim().to_ascii_uppercase().as_str() {
            "TRACE" | "FINEST" | "FINER" => Some(Severity::Trace),
            "DEBUG" | "FINE" => Some(Severity::Debug),
            "INFO" | "CONFIG" => Some(Severity::Info),
            "WARN" | "WARNING" => Some(Severity::Warn),
            "ERROR" | "SEVERE" | "FATAL" => Some(Severity::Error),
            _ => None,
        }
    }

    /// Guess the severity of a raw output line
    pub fn sniff(line: &str, fallback: Severity) -> Severity {
        line.split(|c: char| !c.is_ascii_alphabetic())
            .filter(|token| !token.is_empty())
            .take(8)
            .find_map(|token| match token {
                "TRACE" => Some(Severity::Trace),
                "DEBUG" => Some(Severity::Debug),
                "INFO" => Some(Severity::Info),
                "WARN" | "WARNING" => Some(Severity::Warn),
                "ERROR" | "FATAL" | "SEVERE" => Some(Severity::Error),
                _ => None,
            })
            .unwrap_or(fallback)
    }
}

/// A collected log line
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    /// Store-assigned sequence number, strictly increasing
    pub seq: u64,
    pub timestamp: DateTime<Utc>,
    pub stream: LogStream,
    pub severity: Severity,
    pub message: String,
}

/// A log line before it is admitted to the store
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
    pub timestamp: DateTime<Utc>,
    pub stream: LogStream,
    pub severity: Severity,
    pub message: String,
}
