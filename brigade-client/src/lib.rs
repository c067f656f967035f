//! Brigade HTTP Client
//!
//! A small, type-safe HTTP client for the controller API consumed by the
//! Brigade worker.
//!
//! # Example
//!
//! ```no_run
//! use brigade_client::ControllerClient;
//!
//! #[tokio::main]
//! async fn main() -> brigade_client::Result<()> {
//!     let client = ControllerClient::new("http://localhost:8081").with_token("secret");
//!
//!     let job = client.take_job(42, "worker-1").await?;
//!     println!("Took job {} ({} steps)", job.name, job.action.actions.len());
//!     Ok(())
//! }
//! ```

pub mod error;
mod jobs;
mod logs;
mod plugins;

// Re-export commonly used types
pub use error::{ClientError, Result};

use reqwest::{Client, RequestBuilder};
use serde::de::DeserializeOwned;

/// HTTP client for the controller API
///
/// Methods are organized into logical groups:
/// - Job lifecycle (take, liveness, step status, result)
/// - Log delivery
/// - Plugin binaries (metadata and download)
#[derive(Debug, Clone)]
pub struct ControllerClient {
    /// Base URL of the controller (e.g., "http://localhost:8081")
    base_url: String,
    /// Bearer token sent with every request
    token: Option<String>,
    /// HTTP client instance
    client: Client,
}

impl ControllerClient {
    /// Create a new controller client
    ///
    /// # Arguments
    /// * `base_url` - The base URL of the controller API (e.g., "http://localhost:8081")
    ///
    /// # Example
    /// ```
    /// use brigade_client::ControllerClient;
    ///
    /// let client = ControllerClient::new("http://localhost:8081");
    /// ```
    pub fn new(base_url: impl Into<String>) -> Self {
        Self::with_client(base_url, Client::new())
    }

    /// Create a new controller client with a custom HTTP client
    ///
    /// This allows you to configure timeouts, proxies, TLS settings, etc.
    pub fn with_client(base_url: impl Into<String>, client: Client) -> Self {
        let base_url = base_url.into();
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            token: None,
            client,
        }
    }

    /// Authenticate every request with a bearer token
    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    /// Get the base URL of the controller
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    fn get(&self, path: &str) -> RequestBuilder {
        self.authorize(self.client.get(self.url(path)))
    }

    fn post(&self, path: &str) -> RequestBuilder {
        self.authorize(self.client.post(self.url(path)))
    }

    // =============================================================================
    // Response Handlers
    // =============================================================================

    /// Handle an API response and deserialize JSON
    ///
    /// This method checks the status code and returns an appropriate error if
    /// the request failed, or deserializes the response body if successful.
    async fn handle_response<T: DeserializeOwned>(
        &self,
        response: reqwest::Response,
    ) -> Result<T> {
        let response = self.check_status(response).await?;

        response
            .json()
            .await
            .map_err(|e| ClientError::ParseError(format!("Failed to parse JSON response: {}", e)))
    }

    /// Handle an API response that returns no content
    async fn handle_empty_response(&self, response: reqwest::Response) -> Result<()> {
        self.check_status(response).await.map(|_| ())
    }

    async fn check_status(&self, response: reqwest::Response) -> Result<reqwest::Response> {
        let status = response.status();

        if !status.is_success() {
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(ClientError::api_error(status.as_u16(), error_text));
        }

        Ok(response)
    }
}
