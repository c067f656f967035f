//! Data Transfer Objects for worker/controller communication

pub mod job;
