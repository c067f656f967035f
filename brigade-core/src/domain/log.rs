//! Log domain types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
}

/// A log record delivered to the controller
///
/// Several lines of the same step may be coalesced into one record; `line`
/// is the job-wide counter of the first line it contains.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogRecord {
    pub job_id: i64,
    pub step_order: usize,
    pub line: u64,
    pub value: String,
    pub last_modified: DateTime<Utc>,
    /// Set when the record closes its step
    pub done: Option<DateTime<Utc>>,
}

/// Metadata covered by a log record's signature
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogSignature {
    pub worker: String,
    pub job_id: i64,
    pub job_name: String,
    pub step_order: usize,
    pub line: u64,
    pub timestamp: i64,
}

/// A log record with the signature proving its origin and position
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignedLog {
    pub record: LogRecord,
    pub metadata: LogSignature,
    /// Hex-encoded signature; absent when signing failed
    pub signature: Option<String>,
}
