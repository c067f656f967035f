//! Core domain types
//!
//! These types describe what the controller hands to a worker (a job and its
//! action tree) and what the worker reports back (step statuses, log records,
//! the final result).

pub mod action;
pub mod job;
pub mod log;
pub mod plugin;
