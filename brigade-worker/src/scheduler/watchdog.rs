//! Cancellation watchdog
//!
//! Polls the controller for the live status of the running job. The job is
//! cancelled when it is no longer building, no longer exists, or the
//! controller cannot be reached several times in a row.

use brigade_core::domain::job::Status;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::Config;
use crate::repository::JobRepository;

/// Polling tuning
#[derive(Debug, Clone, Copy)]
pub struct WatchdogSettings {
    pub interval: Duration,
    pub timeout: Duration,
    /// Consecutive failed polls tolerated
    pub max_failures: u32,
}

impl WatchdogSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            interval: config.status_poll_interval,
            timeout: config.status_poll_timeout,
            max_failures: config.max_status_poll_failures,
        }
    }
}

/// Running watchdog of one job
pub struct Watchdog {
    stop: CancellationToken,
    handle: JoinHandle<Option<String>>,
}

impl Watchdog {
    /// Starts polling; `cancel` is the job's cancellation token
    pub fn start(
        job_id: i64,
        jobs: Arc<dyn JobRepository>,
        cancel: CancellationToken,
        settings: WatchdogSettings,
    ) -> Self {
        let stop = CancellationToken::new();
        let handle = tokio::spawn(watch(job_id, jobs, cancel, stop.clone(), settings));
        Self { stop, handle }
    }

    /// Stops polling
    ///
    /// Returns why the watchdog cancelled the job, if it did.
    pub async fn stop(self) -> Option<String> {
        self.stop.cancel();
        match self.handle.await {
            Ok(verdict) => verdict,
            Err(e) => {
                warn!("Watchdog task failed: {}", e);
                None
            }
        }
    }
}

async fn watch(
    job_id: i64,
    jobs: Arc<dyn JobRepository>,
    cancel: CancellationToken,
    stop: CancellationToken,
    settings: WatchdogSettings,
) -> Option<String> {
    let mut ticker = time::interval_at(Instant::now() + settings.interval, settings.interval);
    let mut failures = 0u32;

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = stop.cancelled() => return None,
            _ = cancel.cancelled() => return None,
        }

        let verdict = match time::timeout(settings.timeout, jobs.job_status(job_id)).await {
            Ok(Ok(Some(Status::Building))) => {
                failures = 0;
                continue;
            }
            Ok(Ok(Some(status))) => format!("job is {}", status),
            Ok(Ok(None)) => "job not found".to_string(),
            Ok(Err(e)) => {
                failures += 1;
                warn!(
                    "Cannot poll status of job {} ({}/{}): {:#}",
                    job_id, failures, settings.max_failures, e
                );
                if failures <= settings.max_failures {
                    continue;
                }
                "controller unreachable".to_string()
            }
            Err(_) => {
                failures += 1;
                warn!(
                    "Status poll of job {} timed out after {:?} ({}/{})",
                    job_id, settings.timeout, failures, settings.max_failures
                );
                if failures <= settings.max_failures {
                    continue;
                }
                "controller unreachable".to_string()
            }
        };

        info!("Cancelling job {}: {}", job_id, verdict);
        cancel.cancel();
        return Some(verdict);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeJobRepository;

    fn settings() -> WatchdogSettings {
        WatchdogSettings {
            interval: Duration::from_secs(5),
            timeout: Duration::from_secs(5),
            max_failures: 3,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancels_when_job_stops_building() {
        let jobs = Arc::new(FakeJobRepository::default());
        let cancel = CancellationToken::new();
        let watchdog = Watchdog::start(1, jobs.clone(), cancel.clone(), settings());

        time::sleep(Duration::from_secs(12)).await;
        assert!(!cancel.is_cancelled());

        jobs.set_live_status(Some(Status::Stopped));
        cancel.cancelled().await;

        assert_eq!(watchdog.stop().await.as_deref(), Some("job is stopped"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancels_when_job_disappears() {
        let jobs = Arc::new(FakeJobRepository::default());
        jobs.set_live_status(None);
        let cancel = CancellationToken::new();
        let watchdog = Watchdog::start(1, jobs, cancel.clone(), settings());

        cancel.cancelled().await;
        assert_eq!(watchdog.stop().await.as_deref(), Some("job not found"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_tolerates_a_few_poll_failures() {
        let jobs = Arc::new(FakeJobRepository::default());
        jobs.fail_status_polls(true);
        let cancel = CancellationToken::new();
        let watchdog = Watchdog::start(1, jobs.clone(), cancel.clone(), settings());

        time::sleep(Duration::from_secs(16)).await;
        assert!(!cancel.is_cancelled());
        assert_eq!(jobs.status_polls(), 3);

        cancel.cancelled().await;
        assert_eq!(jobs.status_polls(), 4);
        assert_eq!(watchdog.stop().await.as_deref(), Some("controller unreachable"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_without_verdict() {
        let jobs = Arc::new(FakeJobRepository::default());
        let cancel = CancellationToken::new();
        let watchdog = Watchdog::start(1, jobs, cancel.clone(), settings());

        time::sleep(Duration::from_secs(30)).await;
        assert_eq!(watchdog.stop().await, None);
        assert!(!cancel.is_cancelled());
    }
}
