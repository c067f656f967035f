//! Log pipeline
//!
//! Decouples the rate at which steps emit log lines from the rate at which
//! the controller accepts them. Producers push entries into a bounded queue
//! through a cloneable [`LogSender`]; a single consumer task ticks on a fixed
//! interval, drains the queue, coalesces consecutive entries of the same
//! step, blurs secrets, signs, and delivers the records in order.
//!
//! Delivery at job end is best effort: [`LogPipeline::close`] drains for a
//! bounded time and then gives up. Lines still queued or still being
//! retried at that point are lost.

use brigade_core::domain::log::{LogLevel, LogRecord};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::mpsc::{self, error::TryRecvError, error::TrySendError};
use tokio::task::JoinHandle;
use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::repository::LogRepository;
use crate::retry::RetryPolicy;
use crate::service::blur::SecretBlurrer;
use crate::service::signer::LogSigner;

/// One queued log line
#[derive(Debug, Clone)]
pub struct LogEntry {
    pub step_order: usize,
    pub level: LogLevel,
    pub value: String,
    /// Job-wide line counter, assigned at enqueue time
    pub line: u64,
    pub timestamp: DateTime<Utc>,
    /// Set on the entry that closes its step
    pub done: Option<DateTime<Utc>>,
}

/// Producer handle of the pipeline
///
/// Cheap to clone; never blocks. When the queue is full the line is dropped
/// and counted.
#[derive(Clone)]
pub struct LogSender {
    tx: mpsc::Sender<LogEntry>,
    lines: Arc<AtomicU64>,
    dropped: Arc<AtomicU64>,
}

impl LogSender {
    /// Creates a sender and the receiving end of its queue
    pub(crate) fn channel(capacity: usize) -> (Self, mpsc::Receiver<LogEntry>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let sender = Self {
            tx,
            lines: Arc::new(AtomicU64::new(0)),
            dropped: Arc::new(AtomicU64::new(0)),
        };
        (sender, rx)
    }

    /// Enqueues a line for `step_order`
    pub fn send(&self, step_order: usize, level: LogLevel, text: impl Into<String>) {
        self.push(step_order, level, text.into(), None);
    }

    /// Enqueues the line that closes `step_order`
    pub fn send_done(&self, step_order: usize, level: LogLevel, text: impl Into<String>) {
        self.push(step_order, level, text.into(), Some(Utc::now()));
    }

    /// Number of lines dropped because the queue was full
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    fn push(
        &self,
        step_order: usize,
        level: LogLevel,
        text: String,
        done: Option<DateTime<Utc>>,
    ) {
        let line = self.lines.fetch_add(1, Ordering::SeqCst) + 1;
        let entry = LogEntry {
            step_order,
            level,
            value: format_line(level, text),
            line,
            timestamp: Utc::now(),
            done,
        };

        match self.tx.try_send(entry) {
            Ok(()) => {}
            Err(TrySendError::Full(entry)) => {
                let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                if dropped == 1 || dropped % 1000 == 0 {
                    warn!(
                        "Log queue full, dropping line {} of step {} ({} dropped so far)",
                        entry.line, entry.step_order, dropped
                    );
                }
            }
            Err(TrySendError::Closed(entry)) => {
                debug!(
                    "Log pipeline closed, discarding line {} of step {}",
                    entry.line, entry.step_order
                );
            }
        }
    }
}

fn format_line(level: LogLevel, text: String) -> String {
    let mut value = match level {
        LogLevel::Info => text,
        LogLevel::Debug => format!("[DEBUG] {}", text),
        LogLevel::Warning => format!("[WARN] {}", text),
        LogLevel::Error => format!("[ERROR] {}", text),
    };
    if !value.ends_with('\n') {
        value.push('\n');
    }
    value
}

/// Merges consecutive entries of the same step into one record
///
/// A record keeps the line counter of its first entry and takes its
/// modification time and completion marker from its last entry. Entries of
/// different steps are never merged, so per-step order is preserved.
pub fn coalesce(job_id: i64, entries: Vec<LogEntry>) -> Vec<LogRecord> {
    let mut records: Vec<LogRecord> = Vec::new();

    for entry in entries {
        match records.last_mut() {
            Some(last) if last.step_order == entry.step_order && last.done.is_none() => {
                last.value.push_str(&entry.value);
                last.last_modified = entry.timestamp;
                last.done = entry.done;
            }
            _ => records.push(LogRecord {
                job_id,
                step_order: entry.step_order,
                line: entry.line,
                value: entry.value,
                last_modified: entry.timestamp,
                done: entry.done,
            }),
        }
    }

    records
}

/// Delivery counters of a pipeline
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LogPipelineStats {
    /// Records acknowledged by the controller
    pub delivered: u64,
    /// Records given up on after retries
    pub failed: u64,
    /// Lines dropped because the queue was full
    pub dropped: u64,
}

#[derive(Default)]
struct Counters {
    delivered: AtomicU64,
    failed: AtomicU64,
}

/// Pipeline tuning
#[derive(Debug, Clone, Copy)]
pub struct LogPipelineSettings {
    pub flush_interval: Duration,
    pub capacity: usize,
    pub retry: RetryPolicy,
}

/// A running log pipeline for one job
pub struct LogPipeline {
    sender: LogSender,
    stop: CancellationToken,
    counters: Arc<Counters>,
    handle: JoinHandle<()>,
}

impl LogPipeline {
    /// Starts the consumer task
    pub fn start(
        job_id: i64,
        repository: Arc<dyn LogRepository>,
        signer: LogSigner,
        blurrer: SecretBlurrer,
        settings: LogPipelineSettings,
    ) -> Self {
        let (sender, rx) = LogSender::channel(settings.capacity);

        let stop = CancellationToken::new();
        let counters = Arc::new(Counters::default());

        let consumer = Consumer {
            job_id,
            rx,
            repository,
            signer,
            blurrer,
            retry: settings.retry,
            counters: Arc::clone(&counters),
        };
        let handle = tokio::spawn(consumer.run(settings.flush_interval, stop.clone()));

        Self {
            sender,
            stop,
            counters,
            handle,
        }
    }

    /// Producer handle for steps and drainers
    pub fn sender(&self) -> LogSender {
        self.sender.clone()
    }

    /// Stops the pipeline after draining what is queued, for at most `drain_timeout`
    ///
    /// Lines not delivered by then are lost.
    pub async fn close(self, drain_timeout: Duration) -> LogPipelineStats {
        self.stop.cancel();

        let mut handle = self.handle;
        match time::timeout(drain_timeout, &mut handle).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("Log pipeline task failed: {}", e),
            Err(_) => {
                warn!(
                    "Log pipeline did not drain within {:?}, remaining lines are lost",
                    drain_timeout
                );
                handle.abort();
            }
        }

        LogPipelineStats {
            delivered: self.counters.delivered.load(Ordering::SeqCst),
            failed: self.counters.failed.load(Ordering::SeqCst),
            dropped: self.sender.dropped(),
        }
    }
}

struct Consumer {
    job_id: i64,
    rx: mpsc::Receiver<LogEntry>,
    repository: Arc<dyn LogRepository>,
    signer: LogSigner,
    blurrer: SecretBlurrer,
    retry: RetryPolicy,
    counters: Arc<Counters>,
}

impl Consumer {
    async fn run(mut self, flush_interval: Duration, stop: CancellationToken) {
        let mut ticker = time::interval(flush_interval);
        ticker.set_missed_tick_behavior(time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if !self.flush().await {
                        break;
                    }
                }
                _ = stop.cancelled() => break,
            }
        }

        // Final drain; close() bounds how long this may take
        self.flush().await;
    }

    /// Delivers everything queued so far; returns false once every sender is gone
    async fn flush(&mut self) -> bool {
        let mut entries = Vec::new();
        let mut open = true;
        loop {
            match self.rx.try_recv() {
                Ok(entry) => entries.push(entry),
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    open = false;
                    break;
                }
            }
        }

        if entries.is_empty() {
            return open;
        }

        let records = coalesce(self.job_id, entries);
        debug!(
            "Sending {} log record(s) for job {}",
            records.len(),
            self.job_id
        );

        // Delivery of a record is never cut short by job cancellation
        let never = CancellationToken::new();
        for mut record in records {
            record.value = self.blurrer.blur_str(&record.value);
            let signed = self.signer.wrap(record);

            let what = format!("log line {}", signed.record.line);
            let repository = &self.repository;
            let result = self
                .retry
                .run(&what, &never, || repository.send_log(&signed))
                .await;

            match result {
                Ok(()) => {
                    self.counters.delivered.fetch_add(1, Ordering::SeqCst);
                }
                Err(e) => {
                    warn!("Log record lost for job {}: {}", self.job_id, e);
                    self.counters.failed.fetch_add(1, Ordering::SeqCst);
                }
            }
        }

        open
    }
}
