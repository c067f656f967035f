//! `script` builtin
//!
//! Runs the `script` parameter through `/bin/sh -c` in the job working
//! directory. Standard output and error become log lines of the step.
//! Output is read for at most [`OUTPUT_GRACE`] once the shell has exited,
//! since a background process may keep the pipes open.

use async_trait::async_trait;
use brigade_core::domain::action::{Parameter, Variable, find_parameter};
use brigade_core::domain::job::StepResult;
use brigade_core::domain::log::LogLevel;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tokio::time;
use tracing::{debug, warn};

use super::BuiltinAction;
use crate::context::StepContext;
use crate::service::forward_lines;

/// How long output is still collected after the shell exits
pub const OUTPUT_GRACE: Duration = Duration::from_secs(5);

/// Shell script step
pub struct ScriptAction;

impl ScriptAction {
    pub const NAME: &'static str = "script";
}

#[async_trait]
impl BuiltinAction for ScriptAction {
    async fn run(
        &self,
        ctx: &StepContext<'_>,
        parameters: &[Parameter],
        _secrets: &[Variable],
    ) -> StepResult {
        let Some(script) = find_parameter(parameters, "script").map(|p| p.value.as_str()) else {
            return StepResult::failed("missing parameter script");
        };
        if script.trim().is_empty() {
            return StepResult::failed("empty script");
        }

        let spawned = Command::new("/bin/sh")
            .arg("-c")
            .arg(script)
            .current_dir(ctx.working_dir())
            .env_clear()
            .envs(ctx.environment())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn();

        let mut child = match spawned {
            Ok(child) => child,
            Err(e) => {
                warn!("Cannot start script of job {}: {}", ctx.job.job_id, e);
                return StepResult::failed(format!("cannot start script: {}", e));
            }
        };

        let mut readers = Vec::new();
        if let Some(stdout) = child.stdout.take() {
            let logs = ctx.job.logs.clone();
            readers.push(tokio::spawn(forward_lines(
                stdout,
                logs,
                ctx.step_order,
                LogLevel::Info,
            )));
        }
        if let Some(stderr) = child.stderr.take() {
            let logs = ctx.job.logs.clone();
            readers.push(tokio::spawn(forward_lines(
                stderr,
                logs,
                ctx.step_order,
                LogLevel::Info,
            )));
        }

        let status = tokio::select! {
            status = child.wait() => status,
            _ = ctx.cancellation().cancelled() => {
                if let Err(e) = child.kill().await {
                    warn!("Cannot kill script of job {}: {}", ctx.job.job_id, e);
                }
                for reader in readers {
                    reader.abort();
                }
                return StepResult::failed("script interrupted");
            }
        };

        let drain = async {
            for reader in readers.iter_mut() {
                if let Err(e) = reader.await {
                    debug!("Script output reader ended abnormally: {}", e);
                }
            }
        };

        let mut interrupted = false;
        tokio::select! {
            drained = time::timeout(OUTPUT_GRACE, drain) => {
                if drained.is_err() {
                    warn!(
                        "Output of script of job {} still open after {:?}, detaching",
                        ctx.job.job_id, OUTPUT_GRACE
                    );
                }
            }
            _ = ctx.cancellation().cancelled() => interrupted = true,
        }

        for reader in &readers {
            reader.abort();
        }
        if interrupted {
            return StepResult::failed("script interrupted");
        }

        match status {
            Ok(status) if status.success() => StepResult::success(),
            Ok(status) => match status.code() {
                Some(code) => StepResult::failed(format!("exit status {}", code)),
                None => StepResult::failed("script terminated by signal"),
            },
            Err(e) => StepResult::failed(format!("cannot wait for script: {}", e)),
        }
    }
}
