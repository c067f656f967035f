//! Builtin actions
//!
//! Builtin actions run in-process and are dispatched by name through a
//! [`BuiltinRegistry`]. An action whose name is not registered fails its
//! step with `unknown builtin step`.

mod script;

use async_trait::async_trait;
use brigade_core::domain::action::{Parameter, Variable};
use brigade_core::domain::job::StepResult;
use std::collections::HashMap;
use std::sync::Arc;

use crate::context::StepContext;

pub use script::ScriptAction;

/// An in-process step implementation
#[async_trait]
pub trait BuiltinAction: Send + Sync {
    /// Runs the step with its resolved parameters and the job's secrets
    async fn run(
        &self,
        ctx: &StepContext<'_>,
        parameters: &[Parameter],
        secrets: &[Variable],
    ) -> StepResult;
}

/// Dispatch table of builtin actions, by name
#[derive(Clone, Default)]
pub struct BuiltinRegistry {
    actions: HashMap<String, Arc<dyn BuiltinAction>>,
}

impl BuiltinRegistry {
    /// Empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with every builtin shipped with the worker
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(ScriptAction::NAME, ScriptAction);
        registry
    }

    /// Registers `action` under `name`, replacing any previous one
    pub fn register(&mut self, name: impl Into<String>, action: impl BuiltinAction + 'static) {
        self.actions.insert(name.into(), Arc::new(action));
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn BuiltinAction>> {
        self.actions.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.actions.contains_key(name)
    }
}

impl std::fmt::Debug for BuiltinRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<&String> = self.actions.keys().collect();
        names.sort();
        f.debug_struct("BuiltinRegistry")
            .field("actions", &names)
            .finish()
    }
}
