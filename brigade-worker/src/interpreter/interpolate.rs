//! Placeholder substitution
//!
//! Replaces `{{.name}}` tokens in parameter values with the value of the
//! first source defining `name`. Substitution repeats until a pass changes
//! nothing, for at most [`MAX_PASSES`] passes. Tokens naming an unknown
//! parameter are left untouched.

use brigade_core::domain::action::{Parameter, find_parameter};
use thiserror::Error;

/// Upper bound on substitution passes
pub const MAX_PASSES: usize = 10;

const OPEN: &str = "{{.";
const CLOSE: &str = "}}";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum InterpolationError {
    #[error("parameter {name} is still changing after {passes} substitution passes")]
    NotConverged { name: String, passes: usize },
}

/// Runs one substitution pass over `value`
///
/// Replaced text is not rescanned within the same pass.
pub fn substitute(value: &str, sources: &[&[Parameter]]) -> String {
    let mut out = String::with_capacity(value.len());
    let mut rest = value;

    while let Some(start) = rest.find(OPEN) {
        let after_open = &rest[start + OPEN.len()..];
        let Some(end) = after_open.find(CLOSE) else {
            break;
        };

        let name = after_open[..end].trim();
        out.push_str(&rest[..start]);

        match lookup(name, sources) {
            Some(resolved) => out.push_str(resolved),
            None => out.push_str(&rest[start..start + OPEN.len() + end + CLOSE.len()]),
        }
        rest = &after_open[end + CLOSE.len()..];
    }

    out.push_str(rest);
    out
}

fn lookup<'a>(name: &str, sources: &[&'a [Parameter]]) -> Option<&'a str> {
    if name.is_empty() {
        return None;
    }
    sources
        .iter()
        .find_map(|source| find_parameter(source, name))
        .map(|p| p.value.as_str())
}

/// Resolves `parameters` against fixed `sources`, in precedence order
///
/// Returns new parameters; the input is left unchanged.
pub fn resolve(
    parameters: &[Parameter],
    sources: &[&[Parameter]],
) -> Result<Vec<Parameter>, InterpolationError> {
    let mut current = parameters.to_vec();

    for _ in 0..MAX_PASSES {
        let mut changed = false;
        for parameter in current.iter_mut() {
            let next = substitute(&parameter.value, sources);
            if next != parameter.value {
                parameter.value = next;
                changed = true;
            }
        }
        if !changed {
            return Ok(current);
        }
    }

    match first_unstable(&current, |value| substitute(value, sources)) {
        Some(name) => Err(InterpolationError::NotConverged {
            name,
            passes: MAX_PASSES,
        }),
        None => Ok(current),
    }
}

/// Resolves `parameters` against each other, then against `extra` sources
///
/// Every pass reads the values produced by the previous one.
pub fn resolve_self(
    parameters: &[Parameter],
    extra: &[&[Parameter]],
) -> Result<Vec<Parameter>, InterpolationError> {
    let mut current = parameters.to_vec();

    for _ in 0..MAX_PASSES {
        let next = self_pass(&current, extra);
        if next == current {
            return Ok(current);
        }
        current = next;
    }

    let next = self_pass(&current, extra);
    match current
        .iter()
        .zip(next.iter())
        .find(|(before, after)| before.value != after.value)
    {
        Some((parameter, _)) => Err(InterpolationError::NotConverged {
            name: parameter.name.clone(),
            passes: MAX_PASSES,
        }),
        None => Ok(current),
    }
}

fn self_pass(current: &[Parameter], extra: &[&[Parameter]]) -> Vec<Parameter> {
    let mut sources: Vec<&[Parameter]> = Vec::with_capacity(extra.len() + 1);
    sources.push(current);
    sources.extend_from_slice(extra);

    current
        .iter()
        .map(|p| Parameter {
            value: substitute(&p.value, &sources),
            ..p.clone()
        })
        .collect()
}

fn first_unstable(parameters: &[Parameter], pass: impl Fn(&str) -> String) -> Option<String> {
    parameters
        .iter()
        .find(|p| pass(&p.value) != p.value)
        .map(|p| p.name.clone())
}
