//! Core domain types and traits for FleetCI.
//!
//! This crate contains:
//! - Identifiers and the common error type
//! - The job model and retry policy
//! - Executor kinds and the executor resolver
//! - The workflow graph model and the workflow-runner entry point
//! - Credential, cron and settings records plus their storage traits
//! - The coordinator/agent wire protocol and client events

pub mod credential;
pub mod cron;
pub mod error;
pub mod event;
pub mod executor;
pub mod id;
pub mod job;
pub mod protocol;
pub mod settings;
pub mod workflow;

pub use error::{Error, Result};
pub use id::ResourceId;
