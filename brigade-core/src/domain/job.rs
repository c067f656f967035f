//! Job domain types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::action::{Action, Parameter, Variable};

/// Status of a job or of a single step
///
/// `Waiting` and `Building` are the only non-terminal states. A step moves
/// `Waiting -> Building -> {Success | Fail | Disabled | NeverBuilt | Stopped}`,
/// or straight from `Waiting` to a terminal state when it is skipped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    Waiting,
    Building,
    Success,
    Fail,
    Disabled,
    NeverBuilt,
    Stopped,
}

impl Status {
    /// Terminal states are final
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Status::Waiting | Status::Building)
    }

    /// Whether a status report may move from `self` to `next`
    pub fn can_transition_to(&self, next: Status) -> bool {
        match self {
            Status::Waiting => next != Status::Waiting,
            Status::Building => next.is_terminal(),
            _ => false,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Waiting => "waiting",
            Status::Building => "building",
            Status::Success => "success",
            Status::Fail => "fail",
            Status::Disabled => "disabled",
            Status::NeverBuilt => "never_built",
            Status::Stopped => "stopped",
        }
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of one action invocation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepResult {
    pub status: Status,
    #[serde(default)]
    pub reason: String,
    /// Variables produced by the step, visible to the following steps
    #[serde(default)]
    pub new_variables: Vec<Variable>,
}

impl StepResult {
    pub fn new(status: Status) -> Self {
        Self {
            status,
            reason: String::new(),
            new_variables: Vec::new(),
        }
    }

    pub fn success() -> Self {
        Self::new(Status::Success)
    }

    pub fn failed(reason: impl Into<String>) -> Self {
        Self {
            status: Status::Fail,
            reason: reason.into(),
            new_variables: Vec::new(),
        }
    }

    pub fn disabled() -> Self {
        Self::new(Status::Disabled)
    }

    pub fn never_built() -> Self {
        Self::new(Status::NeverBuilt)
    }

    pub fn with_variable(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.new_variables.push(Parameter::string(name, value));
        self
    }
}

/// Final result of a job, submitted to the controller
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobResult {
    pub job_id: i64,
    pub status: Status,
    #[serde(default)]
    pub reason: String,
    pub duration_seconds: u64,
    #[serde(default)]
    pub new_variables: Vec<Variable>,
    pub finished_at: DateTime<Utc>,
}

impl JobResult {
    pub fn new(job_id: i64, status: Status, reason: impl Into<String>) -> Self {
        Self {
            job_id,
            status,
            reason: reason.into(),
            duration_seconds: 0,
            new_variables: Vec::new(),
            finished_at: Utc::now(),
        }
    }

    pub fn failed(job_id: i64, reason: impl Into<String>) -> Self {
        Self::new(job_id, Status::Fail, reason)
    }
}

/// Everything a worker needs to run a job, returned when the job is taken
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobInfo {
    pub id: i64,
    pub name: String,
    pub status: Status,
    /// Root of the action tree; its children are the job's steps
    pub action: Action,
    #[serde(default)]
    pub parameters: Vec<Parameter>,
    #[serde(default)]
    pub secrets: Vec<Variable>,
    /// Hex-encoded key used to sign this job's log records
    #[serde(default)]
    pub signing_key: String,
}
