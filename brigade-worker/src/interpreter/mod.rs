//! Action interpreter
//!
//! Walks a job's action tree, dispatching each node to a builtin, a plugin,
//! or its children, and aggregates statuses into the job result.

pub mod executor;
pub mod interpolate;

use brigade_core::domain::action::{Parameter, upsert_parameter};
use brigade_core::domain::job::JobInfo;

pub use executor::Interpreter;
pub use interpolate::InterpolationError;

use crate::context::JobContext;

/// Job parameters as seen by the steps
///
/// Adds `brigade.workspace` and `brigade.worker`, appends the job's secrets
/// so plugins receive them as options, then resolves the parameters
/// against each other.
pub fn prepare_parameters(
    job: &JobInfo,
    ctx: &JobContext,
) -> Result<Vec<Parameter>, InterpolationError> {
    let mut parameters = job.parameters.clone();

    upsert_parameter(
        &mut parameters,
        Parameter::string(
            "brigade.workspace",
            ctx.dirs.working.to_string_lossy().into_owned(),
        ),
    );
    upsert_parameter(
        &mut parameters,
        Parameter::string("brigade.worker", ctx.worker_name.clone()),
    );
    for secret in &job.secrets {
        if !parameters.iter().any(|p| p.name == secret.name) {
            parameters.push(secret.clone());
        }
    }

    interpolate::resolve_self(&parameters, &[])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::TestJob;
    use brigade_core::domain::action::{ParameterType, find_parameter};

    #[tokio::test]
    async fn test_prepare_parameters() {
        let job = TestJob::new().with_secret("registry.password", "p4ssw0rd-xyz");
        let ctx = job.context();
        let mut info = job.info();
        info.parameters = vec![
            Parameter::string("image", "{{.brigade.worker}}:latest"),
            Parameter::string("brigade.worker", "spoofed"),
        ];

        let parameters = prepare_parameters(&info, &ctx).unwrap();

        let image = find_parameter(&parameters, "image").unwrap();
        assert_eq!(image.value, format!("{}:latest", ctx.worker_name));
        let workspace = find_parameter(&parameters, "brigade.workspace").unwrap();
        assert_eq!(workspace.value, ctx.dirs.working.to_string_lossy());
        let secret = find_parameter(&parameters, "registry.password").unwrap();
        assert_eq!(secret.kind, ParameterType::Password);
    }
}
