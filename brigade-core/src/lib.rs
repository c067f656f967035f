//! Brigade Core
//!
//! Core types shared by the Brigade worker and its controller client.
//!
//! This crate contains:
//! - Domain types: the job's action tree, statuses, results, log records
//!   and plugin metadata
//! - DTOs: request bodies exchanged with the controller API

pub mod domain;
pub mod dto;
