//! Execution context for jobs
//!
//! Contains all state needed while one job runs:
//! - Job identity and scoped directories
//! - Secrets and the blurrer built from them
//! - The log pipeline producer handle
//! - Controller repositories and the builtin dispatch table
//! - The cancellation token shared by every component of the job
//!
//! A `JobContext` is built once per job and passed down the call chain;
//! nothing about the current job lives in global state.

use brigade_core::domain::action::{Parameter, Variable, find_parameter};
use brigade_core::domain::job::JobInfo;
use brigade_core::domain::log::LogLevel;
use brigade_core::domain::plugin::{Platform, PluginResult};
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio_util::sync::CancellationToken;

use crate::builtin::BuiltinRegistry;
use crate::config::{Config, ENV_PREFIX};
use crate::plugin::{self, PluginError};
use crate::repository::Repositories;
use crate::retry::RetryPolicy;
use crate::service::{LogSender, SecretBlurrer};

/// Scoped directories of one job
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobDirectories {
    /// Parent of every job directory
    pub root: PathBuf,
    /// Working directory, where steps run
    pub working: PathBuf,
    pub keys: PathBuf,
    pub tmp: PathBuf,
    /// Copies of the worker hook scripts
    pub hooks: PathBuf,
}

/// Per-job state shared by every step
pub struct JobContext {
    pub job_id: i64,
    pub job_name: String,
    pub worker_name: String,
    pub dirs: JobDirectories,
    pub secrets: Vec<Variable>,
    /// Variables exported by setup hooks
    pub hook_env: Vec<(String, String)>,
    pub blurrer: SecretBlurrer,
    pub logs: LogSender,
    pub repos: Repositories,
    pub builtins: Arc<BuiltinRegistry>,
    /// Cache of downloaded plugin binaries, shared across jobs
    pub plugin_dir: PathBuf,
    pub platform: Platform,
    pub http_port: u16,
    pub delivery_retry: RetryPolicy,
    pub cancel: CancellationToken,
    manual_exit: AtomicBool,
}

impl JobContext {
    /// Creates the context of `job`
    pub fn new(
        job: &JobInfo,
        config: &Config,
        dirs: JobDirectories,
        logs: LogSender,
        repos: Repositories,
        builtins: Arc<BuiltinRegistry>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            job_id: job.id,
            job_name: job.name.clone(),
            worker_name: config.worker_name.clone(),
            dirs,
            secrets: job.secrets.clone(),
            hook_env: Vec::new(),
            blurrer: SecretBlurrer::new(&job.secrets),
            logs,
            repos,
            builtins,
            plugin_dir: config.basedir.join("plugins"),
            platform: Platform::current(),
            http_port: config.http_port,
            delivery_retry: config.delivery_retry,
            cancel,
            manual_exit: AtomicBool::new(false),
        }
    }

    /// Ends the job early: every action not yet started resolves to disabled
    pub fn request_exit(&self) {
        self.manual_exit.store(true, Ordering::SeqCst);
    }

    pub fn exit_requested(&self) -> bool {
        self.manual_exit.load(Ordering::SeqCst)
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Environment for subprocesses started by the job
    ///
    /// Inherited worker variables are stripped; hook exports, job-scoped
    /// variables and every non-secret parameter (as `UPPER_SNAKE`) are
    /// injected.
    pub fn environment(&self, parameters: &[Parameter]) -> Vec<(String, String)> {
        let mut env: Vec<(String, String)> = std::env::vars()
            .filter(|(name, _)| !name.starts_with(ENV_PREFIX))
            .collect();
        env.extend(self.hook_env.iter().cloned());

        for parameter in parameters.iter().filter(|p| !p.kind.is_secret()) {
            env.push((env_name(&parameter.name), parameter.value.clone()));
        }

        let path = |p: &Path| p.to_string_lossy().into_owned();
        env.push(("BRIGADE_JOB_ID".to_string(), self.job_id.to_string()));
        env.push(("BRIGADE_WORKSPACE".to_string(), path(&self.dirs.working)));
        env.push(("BRIGADE_KEYS_DIRECTORY".to_string(), path(&self.dirs.keys)));
        env.push(("BRIGADE_TMP_DIRECTORY".to_string(), path(&self.dirs.tmp)));
        env.push(("BRIGADE_HTTP_PORT".to_string(), self.http_port.to_string()));

        env
    }
}

/// `git.branch` -> `GIT_BRANCH`
pub fn env_name(parameter: &str) -> String {
    parameter
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_uppercase() } else { '_' })
        .collect()
}

/// View of the job handed to one running step
pub struct StepContext<'a> {
    pub job: &'a JobContext,
    pub step_order: usize,
    parameters: &'a [Parameter],
}

impl<'a> StepContext<'a> {
    pub fn new(job: &'a JobContext, step_order: usize, parameters: &'a [Parameter]) -> Self {
        Self {
            job,
            step_order,
            parameters,
        }
    }

    /// Enqueues a log line for the current step
    pub fn send_log(&self, level: LogLevel, text: impl Into<String>) {
        self.job.logs.send(self.step_order, level, text);
    }

    /// Current, already-interpolated job parameters
    pub fn parameters(&self) -> &[Parameter] {
        self.parameters
    }

    pub fn parameter(&self, name: &str) -> Option<&str> {
        find_parameter(self.parameters, name).map(|p| p.value.as_str())
    }

    /// Redacts secrets from a structured value
    pub fn blur(&self, value: &JsonValue) -> JsonValue {
        self.job.blurrer.blur_value(value)
    }

    pub fn working_dir(&self) -> &Path {
        &self.job.dirs.working
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.job.cancel
    }

    /// Environment for a subprocess started by this step
    pub fn environment(&self) -> Vec<(String, String)> {
        self.job.environment(self.parameters)
    }

    /// Runs plugin `name` with `options`, returning its normalized result
    pub async fn run_plugin(
        &self,
        name: &str,
        options: HashMap<String, String>,
    ) -> Result<PluginResult, PluginError> {
        plugin::invoke(self, name, options).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::TestJob;
    use brigade_core::domain::action::ParameterType;

    #[test]
    fn test_env_name() {
        assert_eq!(env_name("git.branch"), "GIT_BRANCH");
        assert_eq!(env_name("brigade.workspace"), "BRIGADE_WORKSPACE");
        assert_eq!(env_name("my-var"), "MY_VAR");
    }

    #[tokio::test]
    async fn test_environment_injects_job_variables_and_hides_secrets() {
        let job = TestJob::new();
        let ctx = job.context();
        let parameters = vec![
            Parameter::string("git.branch", "main"),
            Parameter::new("db.password", "hunter2-secret", ParameterType::Password),
        ];

        let env: HashMap<String, String> = ctx.environment(&parameters).into_iter().collect();

        assert_eq!(env.get("GIT_BRANCH").map(String::as_str), Some("main"));
        assert!(!env.contains_key("DB_PASSWORD"));
        assert_eq!(env.get("BRIGADE_JOB_ID"), Some(&ctx.job_id.to_string()));
        assert_eq!(
            env.get("BRIGADE_WORKSPACE").map(PathBuf::from),
            Some(ctx.dirs.working.clone())
        );
        assert!(env.contains_key("BRIGADE_TMP_DIRECTORY"));
    }

    #[tokio::test]
    async fn test_environment_carries_hook_exports() {
        let job = TestJob::new();
        let mut ctx = job.context();
        ctx.hook_env = vec![("CACHE_HOST".to_string(), "cache.local".to_string())];

        let env: HashMap<String, String> = ctx.environment(&[]).into_iter().collect();

        assert_eq!(env.get("CACHE_HOST").map(String::as_str), Some("cache.local"));
    }

    #[tokio::test]
    async fn test_request_exit() {
        let job = TestJob::new();
        let ctx = job.context();

        assert!(!ctx.exit_requested());
        ctx.request_exit();
        assert!(ctx.exit_requested());
    }

    #[tokio::test]
    async fn test_step_context_blurs_values() {
        let job = TestJob::new().with_secret("token", "s3cr3t-value");
        let ctx = job.context();
        let parameters = vec![Parameter::string("a", "b")];
        let step = StepContext::new(&ctx, 0, &parameters);

        let blurred = step.blur(&serde_json::json!({"auth": "Bearer s3cr3t-value"}));

        assert_eq!(blurred["auth"], "Bearer **********");
        assert_eq!(step.parameter("a"), Some("b"));
    }
}
