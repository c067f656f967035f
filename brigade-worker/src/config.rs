//! Worker configuration
//!
//! Defines all configurable parameters for the worker: controller
//! connection, the job to run, directories, and the timings of the log
//! pipeline, the cancellation watchdog and delivery retries.

use std::path::PathBuf;
use std::time::Duration;

use crate::retry::RetryPolicy;

/// Prefix of every environment variable read by the worker
///
/// Variables with this prefix are internal and are never passed on to
/// plugins or scripts.
pub const ENV_PREFIX: &str = "BRIGADE_";

/// Worker configuration
///
/// All timeouts and intervals are configurable to allow tuning
/// for different deployment scenarios (dev vs prod, fast vs slow networks).
#[derive(Debug, Clone)]
pub struct Config {
    /// Worker identity, included in every log signature
    pub worker_name: String,

    /// Controller base URL (e.g., "http://localhost:8081")
    pub api_url: String,

    /// Bearer token for the controller API
    pub api_token: Option<String>,

    /// Job this worker was spawned for
    pub job_id: Option<i64>,

    /// Base directory for job directories and the plugin cache
    pub basedir: PathBuf,

    /// Worker hook scripts, in `setup/` and `teardown/` subdirectories
    pub hooks_dir: Option<PathBuf>,

    /// Local port of the side-car HTTP interface, advertised to plugins
    pub http_port: u16,

    /// Maximum time a job can run before it is cancelled
    pub job_timeout: Duration,

    /// How often the log pipeline flushes queued lines
    pub log_flush_interval: Duration,

    /// How long the log pipeline keeps draining once the job is over
    pub log_drain_timeout: Duration,

    /// Capacity of the log queue
    pub log_queue_capacity: usize,

    /// How often the watchdog polls the job's live status
    pub status_poll_interval: Duration,

    /// Timeout of a single watchdog poll
    pub status_poll_timeout: Duration,

    /// Consecutive watchdog poll failures tolerated before cancelling the job
    pub max_status_poll_failures: u32,

    /// Retry policy for step statuses and the final result
    pub delivery_retry: RetryPolicy,

    /// Retry policy for a single log record
    pub log_retry: RetryPolicy,
}

impl Config {
    /// Creates a new configuration with defaults
    pub fn new(worker_name: String, api_url: String) -> Self {
        Self {
            worker_name,
            api_url,
            api_token: None,
            job_id: None,
            basedir: std::env::temp_dir().join("brigade"),
            hooks_dir: None,
            http_port: 0,
            job_timeout: Duration::from_secs(24 * 60 * 60),
            log_flush_interval: Duration::from_millis(250),
            log_drain_timeout: Duration::from_secs(10),
            log_queue_capacity: 100_000,
            status_poll_interval: Duration::from_secs(5),
            status_poll_timeout: Duration::from_secs(5),
            max_status_poll_failures: 3,
            delivery_retry: RetryPolicy::delivery(),
            log_retry: RetryPolicy::log_record(),
        }
    }

    /// Creates configuration from environment variables
    ///
    /// Expected environment variables:
    /// - BRIGADE_API_URL (required)
    /// - BRIGADE_WORKER_NAME (optional, default: random UUID)
    /// - BRIGADE_API_TOKEN (optional)
    /// - BRIGADE_JOB_ID (optional)
    /// - BRIGADE_BASEDIR (optional, default: $TMPDIR/brigade)
    /// - BRIGADE_HOOKS_DIR (optional, no hooks when unset)
    /// - BRIGADE_HTTP_PORT (optional, default: 0)
    /// - BRIGADE_JOB_TIMEOUT (optional, seconds, default: 86400)
    /// - BRIGADE_LOG_FLUSH_INTERVAL_MS (optional, default: 250)
    /// - BRIGADE_LOG_DRAIN_TIMEOUT (optional, seconds, default: 10)
    /// - BRIGADE_LOG_QUEUE_CAPACITY (optional, default: 100000)
    /// - BRIGADE_STATUS_POLL_INTERVAL (optional, seconds, default: 5)
    pub fn from_env() -> anyhow::Result<Self> {
        let api_url = std::env::var("BRIGADE_API_URL")
            .map_err(|_| anyhow::anyhow!("BRIGADE_API_URL environment variable not set"))?;

        let worker_name = std::env::var("BRIGADE_WORKER_NAME")
            .unwrap_or_else(|_| uuid::Uuid::new_v4().to_string());

        let mut config = Self::new(worker_name, api_url);

        config.api_token = std::env::var("BRIGADE_API_TOKEN").ok();

        config.job_id = match std::env::var("BRIGADE_JOB_ID") {
            Ok(value) => Some(
                value
                    .parse::<i64>()
                    .map_err(|e| anyhow::anyhow!("invalid BRIGADE_JOB_ID '{}': {}", value, e))?,
            ),
            Err(_) => None,
        };

        if let Ok(basedir) = std::env::var("BRIGADE_BASEDIR") {
            config.basedir = PathBuf::from(basedir);
        }

        config.hooks_dir = std::env::var("BRIGADE_HOOKS_DIR").ok().map(PathBuf::from);

        config.http_port = env_parse("BRIGADE_HTTP_PORT").unwrap_or(config.http_port);

        config.job_timeout = env_parse("BRIGADE_JOB_TIMEOUT")
            .map(Duration::from_secs)
            .unwrap_or(config.job_timeout);

        config.log_flush_interval = env_parse("BRIGADE_LOG_FLUSH_INTERVAL_MS")
            .map(Duration::from_millis)
            .unwrap_or(config.log_flush_interval);

        config.log_drain_timeout = env_parse("BRIGADE_LOG_DRAIN_TIMEOUT")
            .map(Duration::from_secs)
            .unwrap_or(config.log_drain_timeout);

        config.log_queue_capacity =
            env_parse("BRIGADE_LOG_QUEUE_CAPACITY").unwrap_or(config.log_queue_capacity);

        config.status_poll_interval = env_parse("BRIGADE_STATUS_POLL_INTERVAL")
            .map(Duration::from_secs)
            .unwrap_or(config.status_poll_interval);

        Ok(config)
    }

    /// Sets the job this worker runs
    pub fn with_job_id(mut self, job_id: i64) -> Self {
        self.job_id = Some(job_id);
        self
    }

    /// Validates the configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.worker_name.is_empty() {
            anyhow::bail!("worker_name cannot be empty");
        }

        if self.api_url.is_empty() {
            anyhow::bail!("api_url cannot be empty");
        }

        if !self.api_url.starts_with("http://") && !self.api_url.starts_with("https://") {
            anyhow::bail!("api_url must start with http:// or https://");
        }

        if self.job_timeout.is_zero() {
            anyhow::bail!("job_timeout must be greater than 0");
        }

        if self.log_flush_interval.is_zero() {
            anyhow::bail!("log_flush_interval must be greater than 0");
        }

        if self.log_queue_capacity == 0 {
            anyhow::bail!("log_queue_capacity must be greater than 0");
        }

        if self.status_poll_interval.is_zero() {
            anyhow::bail!("status_poll_interval must be greater than 0");
        }

        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::new(
            uuid::Uuid::new_v4().to_string(),
            "http://localhost:8081".to_string(),
        )
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|s| s.parse::<T>().ok())
}
