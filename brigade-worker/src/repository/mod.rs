//! Repository layer
//!
//! Repositories are thin adapters over the controller HTTP client. They
//! give the engine narrow, trait-based views of the controller API so the
//! interpreter, log pipeline and supervisor can be tested against
//! in-memory fakes.

mod jobs;
mod logs;
mod plugins;

use std::sync::Arc;

use brigade_client::ControllerClient;

// Re-export traits
pub use jobs::JobRepository;
pub use logs::LogRepository;
pub use plugins::PluginRepository;

// Re-export implementations
pub use jobs::HttpJobRepository;
pub use logs::HttpLogRepository;
pub use plugins::HttpPluginRepository;

/// Every controller interface a job needs
#[derive(Clone)]
pub struct Repositories {
    pub jobs: Arc<dyn JobRepository>,
    pub logs: Arc<dyn LogRepository>,
    pub plugins: Arc<dyn PluginRepository>,
}

impl Repositories {
    /// HTTP repositories sharing one controller client
    pub fn http(client: Arc<ControllerClient>) -> Self {
        Self {
            jobs: Arc::new(HttpJobRepository::new(Arc::clone(&client))),
            logs: Arc::new(HttpLogRepository::new(Arc::clone(&client))),
            plugins: Arc::new(HttpPluginRepository::new(client)),
        }
    }
}
