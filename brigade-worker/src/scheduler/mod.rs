//! Scheduler layer for the worker
//!
//! Manages the lifecycle of one job from taking it to submitting its
//! result: scoped directories, worker hooks, the cancellation watchdog, the
//! job timeout and final cleanup.

pub mod hooks;
pub mod supervisor;
pub mod watchdog;
pub mod workspace;

pub use supervisor::JobSupervisor;
