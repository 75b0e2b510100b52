//! # cadence-core
//!
//! Core types for the Cadence orchestration engine.
//!
//! Cadence drives a fixed plan → approve → execute → audit/fix/consult → test →
//! commit workflow across interchangeable AI providers. This crate holds the
//! pieces every other crate shares:
//!
//! - The session data model (sessions, checkpoints, plans, audit results)
//! - The error taxonomy ([`CadenceError`])
//! - Project and per-session configuration
//! - The fail-open helper for non-critical infrastructure

pub mod config;
mod error;
pub mod fail_open;
mod types;

pub use config::{
    AdapterConfig, AdapterKind, ConfigOverrides, OrchestratorConfig, ProjectConfig, RoleChains,
};
pub use error::{CadenceError, Result};
pub use types::*;
