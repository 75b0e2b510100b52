//! # cadence-agent
//!
//! Provider adapters and fallback chains for Cadence orchestration.
//!
//! - [`ProviderAdapter`]: the uniform call contract to one AI backend
//! - [`CommandAdapter`] and [`AnthropicAdapter`]: concrete bindings
//! - [`ScriptedAdapter`]: deterministic adapter for tests and dry runs
//! - [`FallbackChain`]: ordered, role-scoped adapters with per-adapter circuit breakers
//!
//! Failures never leave an adapter as free text; they carry an
//! [`ErrorCategory`] that callers branch on.

mod adapter;
mod anthropic;
pub mod classify;
mod circuit_breaker;
mod command;
mod fallback;
mod scripted;
mod types;

pub use adapter::{ProviderAdapter, AVAILABILITY_TIMEOUT_SECS};
pub use anthropic::{category_for_status, AnthropicAdapter};
pub use circuit_breaker::{CircuitBreaker, CircuitState};
pub use classify::classify_failure;
pub use command::{CommandAdapter, CommandOutput};
pub use fallback::FallbackChain;
pub use scripted::{ScriptedAdapter, ScriptedReply};
pub use types::*;
