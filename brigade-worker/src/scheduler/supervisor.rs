//! Job supervisor
//!
//! Owns the lifecycle of one job: take it, prepare its directories and
//! hooks, run its action tree under a hard timeout while a watchdog polls
//! for external cancellation, flush its logs, submit the result, and clean
//! up.

use anyhow::{Context, Result};
use brigade_core::domain::job::{JobInfo, JobResult};
use std::sync::Arc;
use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::hooks;
use super::watchdog::{Watchdog, WatchdogSettings};
use super::workspace;
use crate::builtin::BuiltinRegistry;
use crate::config::Config;
use crate::context::{JobContext, JobDirectories};
use crate::interpreter::{Interpreter, prepare_parameters};
use crate::repository::Repositories;
use crate::service::{LogPipeline, LogPipelineSettings, LogSigner, SecretBlurrer};

/// Runs jobs for one worker
pub struct JobSupervisor {
    config: Config,
    repos: Repositories,
    builtins: Arc<BuiltinRegistry>,
}

impl JobSupervisor {
    pub fn new(config: Config, repos: Repositories, builtins: Arc<BuiltinRegistry>) -> Self {
        Self {
            config,
            repos,
            builtins,
        }
    }

    /// Takes and runs job `job_id` to completion
    ///
    /// Errors are returned only when the job could not be taken; everything
    /// after that ends in a submitted (or at least attempted) result.
    pub async fn process_job(&self, job_id: i64, shutdown: &CancellationToken) -> Result<JobResult> {
        info!("Taking job {}", job_id);
        let job = self
            .config
            .delivery_retry
            .run("take job", shutdown, || {
                self.repos.jobs.take_job(job_id, &self.config.worker_name)
            })
            .await
            .context("Failed to take job")?;

        info!(
            "Took job {} ({}) with {} step(s)",
            job.id,
            job.name,
            job.action.actions.len()
        );

        let dirs = match workspace::setup(&self.config.basedir, &job.name).await {
            Ok(dirs) => dirs,
            Err(e) => {
                error!("Cannot prepare directories of job {}: {:#}", job.id, e);
                let result = JobResult::failed(job.id, "cannot create job directories");
                self.submit_result(&result, shutdown).await;
                return Ok(result);
            }
        };

        let hook_env = match self.setup_hooks(&dirs, shutdown).await {
            Ok(env) => env,
            Err(e) => {
                error!("Cannot set up hooks of job {}: {:#}", job.id, e);
                let result = JobResult::failed(job.id, format!("unable to setup hooks: {:#}", e));
                self.submit_result(&result, shutdown).await;
                self.clean(job.id, &dirs).await;
                return Ok(result);
            }
        };

        let pipeline = LogPipeline::start(
            job.id,
            Arc::clone(&self.repos.logs),
            LogSigner::new(&self.config.worker_name, &job.name, &job.signing_key),
            SecretBlurrer::new(&job.secrets),
            LogPipelineSettings {
                flush_interval: self.config.log_flush_interval,
                capacity: self.config.log_queue_capacity,
                retry: self.config.log_retry,
            },
        );

        let cancel = shutdown.child_token();
        let mut ctx = JobContext::new(
            &job,
            &self.config,
            dirs,
            pipeline.sender(),
            self.repos.clone(),
            Arc::clone(&self.builtins),
            cancel.clone(),
        );
        ctx.hook_env = hook_env;

        let watchdog = Watchdog::start(
            job.id,
            Arc::clone(&self.repos.jobs),
            cancel.clone(),
            WatchdogSettings::from_config(&self.config),
        );

        let result = self.run(&job, &ctx).await;
        self.teardown_hooks(job.id, &ctx.dirs, shutdown).await;

        let verdict = watchdog.stop().await;
        if let Some(reason) = &verdict {
            info!("Job {} was cancelled: {}", job.id, reason);
        }

        let stats = pipeline.close(self.config.log_drain_timeout).await;
        info!(
            "Job {} logs: {} record(s) delivered, {} lost, {} line(s) dropped",
            job.id, stats.delivered, stats.failed, stats.dropped
        );

        // A job the controller no longer runs does not need its result retried
        let result_cancel = if verdict.is_some() { &cancel } else { shutdown };
        self.submit_result(&result, result_cancel).await;

        self.clean(job.id, &ctx.dirs).await;

        Ok(result)
    }

    /// Installs and runs the setup hooks; returns the variables they export
    async fn setup_hooks(
        &self,
        dirs: &JobDirectories,
        shutdown: &CancellationToken,
    ) -> Result<Vec<(String, String)>> {
        let Some(source) = &self.config.hooks_dir else {
            return Ok(Vec::new());
        };
        info!("Setting up hooks from {}", source.display());
        hooks::install(source, &dirs.hooks).await?;
        hooks::run_setup(&dirs.hooks, &dirs.working, shutdown).await
    }

    /// Teardown hook failures are logged only
    async fn teardown_hooks(&self, job_id: i64, dirs: &JobDirectories, shutdown: &CancellationToken) {
        if self.config.hooks_dir.is_none() {
            return;
        }
        if let Err(e) = hooks::run_teardown(&dirs.hooks, &dirs.working, shutdown).await {
            error!("Teardown hooks of job {} failed: {:#}", job_id, e);
        }
    }

    async fn clean(&self, job_id: i64, dirs: &JobDirectories) {
        if let Err(e) = workspace::teardown(dirs).await {
            warn!("Cannot clean directories of job {}: {:#}", job_id, e);
        }
    }

    /// Runs the action tree under the job timeout
    async fn run(&self, job: &JobInfo, ctx: &JobContext) -> JobResult {
        let parameters = match prepare_parameters(job, ctx) {
            Ok(parameters) => parameters,
            Err(e) => return JobResult::failed(job.id, e.to_string()),
        };

        let timeout = self.config.job_timeout;
        let interpreter = Interpreter::new(ctx, parameters);
        match time::timeout(timeout, interpreter.run_job(&job.action)).await {
            Ok(result) => result,
            Err(_) => {
                warn!("Job {} timed out after {:?}", job.id, timeout);
                ctx.cancel.cancel();
                let mut result =
                    JobResult::failed(job.id, format!("job timed out after {:?}", timeout));
                result.duration_seconds = timeout.as_secs();
                result
            }
        }
    }

    /// Submits the result with retry; giving up is logged, not returned
    async fn submit_result(&self, result: &JobResult, cancel: &CancellationToken) {
        let what = format!("result of job {}", result.job_id);
        let sent = self
            .config
            .delivery_retry
            .run(&what, cancel, || {
                self.repos.jobs.send_result(result.job_id, result)
            })
            .await;

        match sent {
            Ok(()) => info!("Job {} ended with status {}", result.job_id, result.status),
            Err(e) if e.is_cancelled() => warn!("{}", e),
            Err(e) => error!("{}", e),
        }
    }
}
