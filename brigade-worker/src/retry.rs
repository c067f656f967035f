//! Delivery retry policy
//!
//! Used for step statuses, final results and log records: attempt the
//! delivery, and on failure wait a fixed delay and try again, up to a fixed
//! number of attempts. Each attempt is bounded by its own timeout; a timed
//! out attempt counts as a transient failure. The loop stops early, without
//! reporting a failure, once the job's cancellation token fires.

use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum RetryError {
    /// The job was cancelled while retrying; not a delivery failure
    #[error("{what}: cancelled after {attempts} attempt(s)")]
    Cancelled { what: String, attempts: u32 },

    /// Every attempt failed
    #[error("{what}: giving up after {attempts} attempt(s): {last_error}")]
    Exhausted {
        what: String,
        attempts: u32,
        last_error: String,
    },
}

impl RetryError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, RetryError::Cancelled { .. })
    }
}

/// Fixed-delay retry policy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub delay: Duration,
    pub attempt_timeout: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, delay: Duration, attempt_timeout: Duration) -> Self {
        Self {
            max_attempts,
            delay,
            attempt_timeout,
        }
    }

    /// Policy for step statuses and job results: 10 attempts, 15s apart
    pub fn delivery() -> Self {
        Self::new(10, Duration::from_secs(15), Duration::from_secs(120))
    }

    /// Policy for a single log record: short, so one record never stalls the pipeline
    pub fn log_record() -> Self {
        Self::new(3, Duration::from_secs(1), Duration::from_secs(30))
    }

    /// Runs `op` until it succeeds, attempts run out, or `cancel` fires
    ///
    /// `what` names the delivery in log lines and errors.
    pub async fn run<T, F, Fut>(
        &self,
        what: &str,
        cancel: &CancellationToken,
        mut op: F,
    ) -> Result<T, RetryError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        let mut last_error = String::new();

        for attempt in 1..=self.max_attempts {
            match tokio::time::timeout(self.attempt_timeout, op()).await {
                Ok(Ok(value)) => {
                    if attempt > 1 {
                        debug!("{} delivered after {} attempt(s)", what, attempt);
                    }
                    return Ok(value);
                }
                Ok(Err(e)) => last_error = format!("{:#}", e),
                Err(_) => {
                    last_error = format!("attempt timed out after {:?}", self.attempt_timeout)
                }
            }

            if cancel.is_cancelled() {
                return Err(RetryError::Cancelled {
                    what: what.to_string(),
                    attempts: attempt,
                });
            }

            if attempt == self.max_attempts {
                break;
            }

            warn!(
                "Cannot deliver {} (attempt {}/{}): {} - new try in {:?}",
                what, attempt, self.max_attempts, last_error, self.delay
            );

            tokio::select! {
                _ = tokio::time::sleep(self.delay) => {}
                _ = cancel.cancelled() => {
                    return Err(RetryError::Cancelled {
                        what: what.to_string(),
                        attempts: attempt,
                    });
                }
            }
        }

        Err(RetryError::Exhausted {
            what: what.to_string(),
            attempts: self.max_attempts,
            last_error,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test(start_paused = true)]
    async fn test_gives_up_after_ten_attempts_with_fixed_delay() {
        let policy = RetryPolicy::delivery();
        let attempts = Arc::new(AtomicU32::new(0));
        let cancel = CancellationToken::new();
        let started = tokio::time::Instant::now();

        let counter = attempts.clone();
        let result: Result<(), _> = policy
            .run("step status", &cancel, || {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    anyhow::bail!("connection refused")
                }
            })
            .await;

        assert_eq!(attempts.load(Ordering::SeqCst), 10);
        assert_eq!(started.elapsed(), Duration::from_secs(9 * 15));
        match result {
            Err(RetryError::Exhausted {
                attempts,
                last_error,
                ..
            }) => {
                assert_eq!(attempts, 10);
                assert!(last_error.contains("connection refused"));
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_succeeds_after_transient_failures() {
        let policy = RetryPolicy::delivery();
        let attempts = Arc::new(AtomicU32::new(0));
        let cancel = CancellationToken::new();

        let counter = attempts.clone();
        let result = policy
            .run("result", &cancel, || {
                let counter = counter.clone();
                async move {
                    if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                        anyhow::bail!("503")
                    }
                    Ok(7)
                }
            })
            .await;

        assert_eq!(result.unwrap(), 7);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stops_early_when_cancelled() {
        let policy = RetryPolicy::delivery();
        let attempts = Arc::new(AtomicU32::new(0));
        let cancel = CancellationToken::new();

        let counter = attempts.clone();
        let token = cancel.clone();
        let result: Result<(), _> = policy
            .run("step status", &cancel, || {
                let counter = counter.clone();
                let token = token.clone();
                async move {
                    if counter.fetch_add(1, Ordering::SeqCst) == 1 {
                        token.cancel();
                    }
                    anyhow::bail!("unreachable")
                }
            })
            .await;

        let err = result.unwrap_err();
        assert!(err.is_cancelled());
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_during_delay_interrupts_sleep() {
        let policy = RetryPolicy::delivery();
        let cancel = CancellationToken::new();
        let token = cancel.clone();

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            token.cancel();
        });

        let started = tokio::time::Instant::now();
        let result: Result<(), _> = policy
            .run("result", &cancel, || async { anyhow::bail!("down") })
            .await;

        assert!(result.unwrap_err().is_cancelled());
        assert!(started.elapsed() < Duration::from_secs(15));
    }

    #[tokio::test(start_paused = true)]
    async fn test_attempt_timeout_counts_as_failure() {
        let policy = RetryPolicy::new(2, Duration::from_secs(1), Duration::from_secs(5));
        let cancel = CancellationToken::new();

        let result: Result<(), _> = policy
            .run("log", &cancel, || async {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok(())
            })
            .await;

        match result {
            Err(RetryError::Exhausted { last_error, .. }) => {
                assert!(last_error.contains("timed out"))
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }
}
