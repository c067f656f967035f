//! Action tree domain types

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// How an action is executed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    /// Dispatched by name to an in-process function
    Builtin,
    /// Executed by an external plugin process reached over a local socket
    Plugin,
    /// Runs its child actions in order
    Composite,
}

/// A node in the job's execution tree
///
/// Built once from the job payload; the worker never mutates it; parameter
/// substitution produces new parameter lists instead.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Action {
    pub name: String,
    pub kind: ActionKind,
    #[serde(default)]
    pub step_name: Option<String>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// A failure of this action does not stop its siblings
    #[serde(default)]
    pub optional: bool,
    /// Runs even after a sibling failed critically
    #[serde(default)]
    pub always_executed: bool,
    #[serde(default)]
    pub parameters: Vec<Parameter>,
    #[serde(default)]
    pub actions: Vec<Action>,
}

fn default_enabled() -> bool {
    true
}

impl Action {
    /// Creates an enabled action of the given kind with no parameters or children
    pub fn new(name: impl Into<String>, kind: ActionKind) -> Self {
        Self {
            name: name.into(),
            kind,
            step_name: None,
            enabled: true,
            optional: false,
            always_executed: false,
            parameters: Vec::new(),
            actions: Vec::new(),
        }
    }

    /// Creates a builtin action
    pub fn builtin(name: impl Into<String>) -> Self {
        Self::new(name, ActionKind::Builtin)
    }

    /// Creates a plugin action
    pub fn plugin(name: impl Into<String>) -> Self {
        Self::new(name, ActionKind::Plugin)
    }

    /// Creates a composite action with the given children
    pub fn composite(name: impl Into<String>, actions: Vec<Action>) -> Self {
        let mut action = Self::new(name, ActionKind::Composite);
        action.actions = actions;
        action
    }

    pub fn with_parameter(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.parameters.push(Parameter::string(name, value));
        self
    }

    pub fn with_step_name(mut self, step_name: impl Into<String>) -> Self {
        self.step_name = Some(step_name.into());
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    pub fn optional(mut self) -> Self {
        self.optional = true;
        self
    }

    pub fn always_executed(mut self) -> Self {
        self.always_executed = true;
        self
    }

    /// Name shown in step logs: the step name when set, the action name otherwise
    pub fn display_name(&self) -> &str {
        self.step_name.as_deref().unwrap_or(&self.name)
    }

    /// Value of the named parameter, if present
    pub fn parameter(&self, name: &str) -> Option<&str> {
        find_parameter(&self.parameters, name).map(|p| p.value.as_str())
    }
}

/// Type of a parameter or variable value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParameterType {
    #[default]
    String,
    Text,
    Boolean,
    Number,
    List,
    /// Never written to logs or environments in clear
    Password,
    Key,
}

impl ParameterType {
    /// Whether values of this type are secrets
    pub fn is_secret(&self) -> bool {
        matches!(self, ParameterType::Password | ParameterType::Key)
    }
}

/// A name/value/type triple attached to an action or a job
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Parameter {
    pub name: String,
    pub value: String,
    #[serde(rename = "type", default)]
    pub kind: ParameterType,
}

impl Parameter {
    pub fn new(name: impl Into<String>, value: impl Into<String>, kind: ParameterType) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
            kind,
        }
    }

    pub fn string(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self::new(name, value, ParameterType::String)
    }
}

/// A job-scoped variable: a secret from the controller, or a value produced by a step
pub type Variable = Parameter;

/// Finds a parameter by name
pub fn find_parameter<'a>(parameters: &'a [Parameter], name: &str) -> Option<&'a Parameter> {
    parameters.iter().find(|p| p.name == name)
}

/// Converts parameters to a name -> value map; later duplicates win
pub fn parameters_to_map(parameters: &[Parameter]) -> HashMap<String, String> {
    parameters
        .iter()
        .map(|p| (p.name.clone(), p.value.clone()))
        .collect()
}

/// Inserts or replaces a parameter by name
pub fn upsert_parameter(parameters: &mut Vec<Parameter>, parameter: Parameter) {
    match parameters.iter_mut().find(|p| p.name == parameter.name) {
        Some(existing) => existing.value = parameter.value,
        None => parameters.push(parameter),
    }
}
