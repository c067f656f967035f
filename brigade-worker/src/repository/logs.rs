//! Logs repository
//!
//! Handles sending signed log records to the controller.
//! This is a stateless adapter - queueing and coalescing are handled by the service layer.

use anyhow::{Context, Result};
use async_trait::async_trait;
use brigade_client::ControllerClient;
use brigade_core::domain::log::SignedLog;
use std::sync::Arc;

/// Repository trait for log-related operations with the controller
#[async_trait]
pub trait LogRepository: Send + Sync {
    /// Sends one signed log record
    async fn send_log(&self, log: &SignedLog) -> Result<()>;
}

/// HTTP implementation of LogRepository
pub struct HttpLogRepository {
    client: Arc<ControllerClient>,
}

impl HttpLogRepository {
    pub fn new(client: Arc<ControllerClient>) -> Self {
        Self { client }
    }
}

#[async_trait]
impl LogRepository for HttpLogRepository {
    async fn send_log(&self, log: &SignedLog) -> Result<()> {
        self.client
            .send_log(log)
            .await
            .with_context(|| format!("Failed to send log line {}", log.record.line))
    }
}
