//! # cadence-state
//!
//! Session persistence for Cadence.
//!
//! Every record is wrapped in a schema-versioned envelope ([`record`]) and
//! loaders reject anything they do not recognize. Two [`SessionStore`]
//! implementations are provided:
//!
//! - [`FsSessionStore`]: one directory per session under `.cadence/sessions`
//! - [`MemorySessionStore`]: for dry runs and tests

mod fs;
mod memory;
pub mod metrics;
pub mod record;
mod store;

pub use fs::FsSessionStore;
pub use memory::MemorySessionStore;
pub use metrics::{RoleMetrics, SessionMetrics};
pub use record::SCHEMA_VERSION;
pub use store::{content_digest, Baseline, SessionStore, SessionSummary};
