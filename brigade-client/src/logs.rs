//! Log delivery endpoint

use crate::ControllerClient;
use crate::error::Result;
use brigade_core::domain::log::SignedLog;

impl ControllerClient {
    /// Send one signed log record for a job
    pub async fn send_log(&self, log: &SignedLog) -> Result<()> {
        let response = self
            .post(&format!("/queue/jobs/{}/log", log.record.job_id))
            .json(log)
            .send()
            .await?;

        self.handle_empty_response(response).await
    }
}
