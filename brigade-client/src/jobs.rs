//! Job-related API endpoints

use crate::ControllerClient;
use crate::error::{ClientError, Result};
use brigade_core::domain::job::{JobInfo, JobResult, Status};
use brigade_core::dto::job::{JobLiveness, StepStatusUpdate, TakeJobRequest};

impl ControllerClient {
    // =============================================================================
    // Job Lifecycle
    // =============================================================================

    /// Take a job for execution
    ///
    /// Returns the full job description, including its secrets and the key
    /// used to sign its logs.
    pub async fn take_job(&self, job_id: i64, worker_name: &str) -> Result<JobInfo> {
        let response = self
            .post(&format!("/queue/jobs/{}/take", job_id))
            .json(&TakeJobRequest {
                worker_name: worker_name.to_string(),
            })
            .send()
            .await?;

        self.handle_response(response).await
    }

    /// Get the live status of a job
    ///
    /// A 404 is reported as [`ClientError::NotFound`].
    pub async fn job_status(&self, job_id: i64) -> Result<Status> {
        let response = self
            .get(&format!("/queue/jobs/{}/infos", job_id))
            .send()
            .await?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(ClientError::NotFound(format!("job {}", job_id)));
        }

        let liveness: JobLiveness = self.handle_response(response).await?;
        Ok(liveness.status)
    }

    /// Push the status of one step
    pub async fn send_step_status(&self, job_id: i64, update: &StepStatusUpdate) -> Result<()> {
        let response = self
            .post(&format!("/queue/jobs/{}/step", job_id))
            .json(update)
            .send()
            .await?;

        self.handle_empty_response(response).await
    }

    /// Submit the final result of a job
    pub async fn send_result(&self, job_id: i64, result: &JobResult) -> Result<()> {
        let response = self
            .post(&format!("/queue/jobs/{}/result", job_id))
            .json(result)
            .send()
            .await?;

        self.handle_empty_response(response).await
    }
}
