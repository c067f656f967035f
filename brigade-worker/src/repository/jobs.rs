//! Jobs repository
//!
//! Handles communication with the controller for job-related operations:
//! - Taking a job
//! - Polling a job's live status
//! - Pushing step statuses
//! - Submitting the final result

use anyhow::{Context, Result};
use async_trait::async_trait;
use brigade_client::ControllerClient;
use brigade_core::domain::job::{JobInfo, JobResult, Status};
use brigade_core::dto::job::StepStatusUpdate;
use std::sync::Arc;

/// Repository trait for job-related operations with the controller
#[async_trait]
pub trait JobRepository: Send + Sync {
    /// Takes a job for execution
    ///
    /// Returns the full job description, including secrets.
    async fn take_job(&self, job_id: i64, worker_name: &str) -> Result<JobInfo>;

    /// Polls the live status of a job
    ///
    /// Returns `None` when the controller no longer knows the job.
    async fn job_status(&self, job_id: i64) -> Result<Option<Status>>;

    /// Pushes the status of one top-level step
    async fn send_step_status(&self, job_id: i64, update: &StepStatusUpdate) -> Result<()>;

    /// Submits the final result of a job
    async fn send_result(&self, job_id: i64, result: &JobResult) -> Result<()>;
}

/// HTTP implementation of JobRepository
pub struct HttpJobRepository {
    client: Arc<ControllerClient>,
}

impl HttpJobRepository {
    pub fn new(client: Arc<ControllerClient>) -> Self {
        Self { client }
    }
}

#[async_trait]
impl JobRepository for HttpJobRepository {
    async fn take_job(&self, job_id: i64, worker_name: &str) -> Result<JobInfo> {
        self.client
            .take_job(job_id, worker_name)
            .await
            .with_context(|| format!("Failed to take job {}", job_id))
    }

    async fn job_status(&self, job_id: i64) -> Result<Option<Status>> {
        match self.client.job_status(job_id).await {
            Ok(status) => Ok(Some(status)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e).with_context(|| format!("Failed to get status of job {}", job_id)),
        }
    }

    async fn send_step_status(&self, job_id: i64, update: &StepStatusUpdate) -> Result<()> {
        self.client
            .send_step_status(job_id, update)
            .await
            .context("Failed to send step status")
    }

    async fn send_result(&self, job_id: i64, result: &JobResult) -> Result<()> {
        self.client
            .send_result(job_id, result)
            .await
            .context("Failed to send job result")
    }
}
