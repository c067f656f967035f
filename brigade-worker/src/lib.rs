//! Brigade Worker
//!
//! Executes one CI job on behalf of a controller: walks the job's action
//! tree, runs builtin steps in-process and plugin steps as subprocesses,
//! streams signed and redacted logs back, and reports step statuses and
//! the final result.

pub mod builtin;
pub mod config;
pub mod context;
pub mod interpreter;
pub mod plugin;
pub mod repository;
pub mod retry;
pub mod scheduler;
pub mod service;

#[cfg(test)]
mod testing;
