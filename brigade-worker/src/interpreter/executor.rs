//! Action tree walk
//!
//! The root action's children are the job's steps. Each step gets start and
//! end log lines and a status update pushed to the controller. Composite
//! actions run their children in order: after a non-optional child fails,
//! only always-executed children still run and the others are never built.

use brigade_core::domain::action::{
    Action, ActionKind, Parameter, Variable, parameters_to_map, upsert_parameter,
};
use brigade_core::domain::job::{JobResult, Status, StepResult};
use brigade_core::domain::log::LogLevel;
use brigade_core::dto::job::StepStatusUpdate;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::time::Instant;
use tracing::{debug, error, info, warn};

use super::interpolate::resolve;
use crate::context::{JobContext, StepContext};
use crate::retry::RetryError;

/// Parameters in this namespace are already substituted upstream
const GIT_NAMESPACE: &str = "git.";

type StepFuture<'b> = Pin<Box<dyn Future<Output = StepResult> + Send + 'b>>;

/// Where a list of children sits in the tree
#[derive(Debug, Clone)]
enum Level {
    /// The job's own steps, each with its own step order
    Job,
    /// Children of a composite step, logged under that step
    SubSteps { step_order: usize, prefix: String },
}

/// Walks the action tree of one job
pub struct Interpreter<'a> {
    ctx: &'a JobContext,
    /// Job parameters; grows with the variables produced by steps
    parameters: Vec<Parameter>,
    new_variables: Vec<Variable>,
    /// Last status pushed for each step
    step_statuses: HashMap<usize, Status>,
}

impl<'a> Interpreter<'a> {
    pub fn new(ctx: &'a JobContext, parameters: Vec<Parameter>) -> Self {
        Self {
            ctx,
            parameters,
            new_variables: Vec::new(),
            step_statuses: HashMap::new(),
        }
    }

    /// Runs every step of `root` and returns the job result
    pub async fn run_job(mut self, root: &Action) -> JobResult {
        let started = Instant::now();

        let result = match resolve(&root.parameters, &[&self.parameters, &self.ctx.secrets]) {
            Ok(parameters) => self.run_children(root, &parameters, Level::Job).await,
            Err(e) => StepResult::failed(e.to_string()),
        };

        info!(
            "Job {} finished with status {} in {:?}",
            self.ctx.job_id,
            result.status,
            started.elapsed()
        );

        let mut job_result = JobResult::new(self.ctx.job_id, result.status, result.reason);
        job_result.duration_seconds = started.elapsed().as_secs();
        job_result.new_variables = self.new_variables;
        job_result
    }

    /// Job parameters as they stand, including produced variables
    pub fn parameters(&self) -> &[Parameter] {
        &self.parameters
    }

    fn run_action<'b>(
        &'b mut self,
        action: &'b Action,
        parent: &'b [Parameter],
        step_order: usize,
        name: String,
    ) -> StepFuture<'b> {
        Box::pin(async move {
            if !action.enabled || self.ctx.exit_requested() {
                return StepResult::disabled();
            }

            let sources = [parent, self.parameters.as_slice(), self.ctx.secrets.as_slice()];
            let parameters = match resolve(&action.parameters, &sources) {
                Ok(parameters) => parameters,
                Err(e) => {
                    warn!("Job {}: {}", self.ctx.job_id, e);
                    return StepResult::failed(e.to_string());
                }
            };

            let result = match action.kind {
                ActionKind::Builtin => self.run_builtin(action, &parameters, step_order).await,
                ActionKind::Plugin => self.run_plugin(action, &parameters, step_order).await,
                ActionKind::Composite => {
                    let level = Level::SubSteps {
                        step_order,
                        prefix: name,
                    };
                    return self.run_children(action, &parameters, level).await;
                }
            };

            for variable in &result.new_variables {
                upsert_parameter(&mut self.parameters, variable.clone());
                upsert_parameter(&mut self.new_variables, variable.clone());
            }

            result
        })
    }

    async fn run_builtin(
        &mut self,
        action: &Action,
        parameters: &[Parameter],
        step_order: usize,
    ) -> StepResult {
        let Some(builtin) = self.ctx.builtins.get(&action.name) else {
            return StepResult::failed(format!("unknown builtin step {}", action.name));
        };

        let step = StepContext::new(self.ctx, step_order, &self.parameters);
        builtin.run(&step, parameters, &self.ctx.secrets).await
    }

    async fn run_plugin(
        &mut self,
        action: &Action,
        parameters: &[Parameter],
        step_order: usize,
    ) -> StepResult {
        let mut options = parameters_to_map(parameters);
        for parameter in &self.parameters {
            if parameter.name.starts_with(GIT_NAMESPACE) {
                continue;
            }
            options.insert(parameter.name.clone(), parameter.value.clone());
        }

        let step = StepContext::new(self.ctx, step_order, &self.parameters);
        match step.run_plugin(&action.name, options).await {
            Ok(result) => {
                let mut step_result = StepResult::new(result.normalized_status());
                step_result.reason = result.details;
                let mut outputs: Vec<_> = result.outputs.into_iter().collect();
                outputs.sort();
                for (name, value) in outputs {
                    step_result = step_result.with_variable(name, value);
                }
                step_result
            }
            Err(e) => {
                warn!("Job {}: {:?}", self.ctx.job_id, e);
                StepResult::failed(e.to_string())
            }
        }
    }

    async fn run_children(
        &mut self,
        parent: &Action,
        parameters: &[Parameter],
        level: Level,
    ) -> StepResult {
        let mut aggregate = Aggregate::default();
        let mut critical_failed = false;

        for (index, child) in parent.actions.iter().enumerate() {
            let (step_order, name) = match &level {
                Level::Job => (index, child.display_name().to_string()),
                Level::SubSteps { step_order, prefix } => {
                    (*step_order, sub_step_name(prefix, child, index))
                }
            };
            let top_level = matches!(level, Level::Job);

            if self.ctx.is_cancelled() {
                debug!("Job {} cancelled, {} never built", self.ctx.job_id, name);
                aggregate.record(child, &StepResult::never_built());
                continue;
            }

            if critical_failed && !child.always_executed {
                let result = StepResult::never_built();
                if top_level {
                    let now = Utc::now();
                    let pushed = self.push_status(step_order, Status::NeverBuilt, now, now).await;
                    if let Err(fatal) = pushed {
                        return fatal;
                    }
                }
                aggregate.record(child, &result);
                continue;
            }

            if !child.enabled || self.ctx.exit_requested() {
                let result = StepResult::disabled();
                if top_level {
                    let now = Utc::now();
                    let pushed = self.push_status(step_order, Status::Disabled, now, now).await;
                    if let Err(fatal) = pushed {
                        return fatal;
                    }
                }
                aggregate.record(child, &result);
                continue;
            }

            let start = Utc::now();
            let started = Instant::now();
            if top_level {
                if let Err(fatal) = self.push_status(step_order, Status::Building, start, start).await {
                    return fatal;
                }
                self.log(step_order, format!("Starting step \"{}\"", name));
            } else {
                self.log(step_order, format!("Starting sub step \"{}\"", name));
            }

            let result = self
                .run_action(child, parameters, step_order, name.clone())
                .await;

            if result.status == Status::Fail && !result.reason.is_empty() {
                self.ctx
                    .logs
                    .send(step_order, LogLevel::Error, result.reason.clone());
            }

            let elapsed = started.elapsed().as_secs_f64().round() as u64;
            if top_level {
                self.ctx.logs.send_done(
                    step_order,
                    LogLevel::Info,
                    format!("End of step \"{}\" ({}) [{}s]", name, result.status, elapsed),
                );
                if let Err(fatal) = self
                    .push_status(step_order, result.status, start, Utc::now())
                    .await
                {
                    return fatal;
                }
            } else {
                self.log(
                    step_order,
                    format!("End of sub step \"{}\" ({}) [{}s]", name, result.status, elapsed),
                );
            }

            if result.status == Status::Fail && !child.optional {
                critical_failed = true;
            }
            aggregate.record(child, &result);
        }

        aggregate.finish()
    }

    fn log(&self, step_order: usize, text: String) {
        self.ctx.logs.send(step_order, LogLevel::Info, text);
    }

    /// Pushes a step status with retry
    ///
    /// Exhausted retries are fatal to the job. A retry loop cut short by
    /// cancellation is not: the walk stops at the next step. A status the
    /// step cannot move to from its last pushed one is dropped.
    async fn push_status(
        &mut self,
        step_order: usize,
        status: Status,
        start: DateTime<Utc>,
        done: DateTime<Utc>,
    ) -> Result<(), StepResult> {
        let update = StepStatusUpdate {
            step_order,
            status,
            start,
            done,
        };
        let ctx = self.ctx;
        let job_id = ctx.job_id;

        let previous = self
            .step_statuses
            .get(&step_order)
            .copied()
            .unwrap_or(Status::Waiting);
        if !previous.can_transition_to(status) {
            warn!(
                "Job {}: step {} cannot go from {} to {}",
                job_id, step_order, previous, status
            );
            return Ok(());
        }
        self.step_statuses.insert(step_order, status);

        let jobs = &ctx.repos.jobs;
        let what = format!("status {} of step {}", status, step_order);

        match ctx
            .delivery_retry
            .run(&what, &ctx.cancel, || jobs.send_step_status(job_id, &update))
            .await
        {
            Ok(()) => Ok(()),
            Err(RetryError::Cancelled { .. }) => {
                debug!("Job {} cancelled while pushing {}", job_id, what);
                Ok(())
            }
            Err(e) => {
                error!("Job {}: {}", job_id, e);
                Err(StepResult::failed(format!(
                    "cannot update status of step {}",
                    step_order
                )))
            }
        }
    }
}

/// `parent/child-N` with a 1-based index, or `/step_name` when one is set
fn sub_step_name(prefix: &str, child: &Action, index: usize) -> String {
    match child.step_name.as_deref().filter(|s| !s.is_empty()) {
        Some(step_name) => format!("/{}", step_name),
        None => format!("{}/{}-{}", prefix, child.name, index + 1),
    }
}

/// Status aggregation over the children of one composite action
#[derive(Debug, Default)]
struct Aggregate {
    total: usize,
    disabled: usize,
    failure: Option<String>,
}

impl Aggregate {
    fn record(&mut self, child: &Action, result: &StepResult) {
        self.total += 1;
        match result.status {
            Status::Disabled => self.disabled += 1,
            Status::Fail if !child.optional => {
                if self.failure.is_none() {
                    self.failure = Some(result.reason.clone());
                }
            }
            _ => {}
        }
    }

    fn finish(self) -> StepResult {
        if self.total > 0 && self.disabled == self.total {
            return StepResult::disabled();
        }
        match self.failure {
            Some(reason) => StepResult::failed(reason),
            None => StepResult::success(),
        }
    }
}
