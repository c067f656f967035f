//! Job DTOs for worker/controller communication

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::job::Status;

/// Request to take a job for execution
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TakeJobRequest {
    pub worker_name: String,
}

/// Status of one top-level step, pushed by the worker between steps
///
/// The controller keys updates on `(job, step_order, status)`, so the same
/// update may be re-sent safely.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepStatusUpdate {
    pub step_order: usize,
    pub status: Status,
    pub start: DateTime<Utc>,
    pub done: DateTime<Utc>,
}

/// Live status of a job, as polled by the cancellation watchdog
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobLiveness {
    pub id: i64,
    pub status: Status,
}
