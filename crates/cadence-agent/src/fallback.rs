//! Role-scoped fallback chains
//!
//! A chain calls its adapters in order and returns the first success. It never
//! retries a single adapter: each adapter is called at most once per
//! `execute`, so latency is bounded by the chain length times the call timeout.

use cadence_core::AgentRole;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::adapter::ProviderAdapter;
use crate::circuit_breaker::CircuitBreaker;
use crate::types::{AgentResult, ErrorCategory, ProviderError};

struct ChainEntry {
    adapter: Arc<dyn ProviderAdapter>,
    breaker: CircuitBreaker,
}

/// Ordered adapters backing one role
pub struct FallbackChain {
    role: AgentRole,
    entries: Vec<ChainEntry>,
    call_timeout: Duration,
}

impl FallbackChain {
    pub fn new(role: AgentRole, call_timeout: Duration) -> Self {
        Self {
            role,
            entries: Vec::new(),
            call_timeout,
        }
    }

    /// Append an adapter with a default breaker
    pub fn with_adapter(self, adapter: Arc<dyn ProviderAdapter>) -> Self {
        self.with_adapter_and_breaker(adapter, CircuitBreaker::default())
    }

    pub fn with_adapter_and_breaker(
        mut self,
        adapter: Arc<dyn ProviderAdapter>,
        breaker: CircuitBreaker,
    ) -> Self {
        self.entries.push(ChainEntry { adapter, breaker });
        self
    }

    pub fn role(&self) -> AgentRole {
        self.role
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn adapter_names(&self) -> Vec<String> {
        self.entries.iter().map(|e| e.adapter.info().name).collect()
    }

    /// Call adapters in order until one succeeds
    ///
    /// Each call runs under the per-call timeout and the cancellation token.
    /// Cancellation stops the chain; every other failure advances it.
    #[instrument(skip(self, prompt, output_target, cancel), fields(role = %self.role))]
    pub async fn execute(
        &self,
        prompt: &str,
        output_target: Option<&Path>,
        cancel: &CancellationToken,
    ) -> AgentResult {
        let started = Instant::now();
        let mut attempts: Vec<ProviderError> = Vec::new();

        for entry in &self.entries {
            let name = entry.adapter.info().name;

            if cancel.is_cancelled() {
                attempts.push(ProviderError::new(
                    &name,
                    ErrorCategory::Cancelled,
                    "cancelled before call",
                ));
                break;
            }

            if !entry.breaker.can_execute() {
                debug!(
                    "Skipping {}: circuit open for another {}ms",
                    name,
                    entry.breaker.time_until_retry()
                );
                attempts.push(ProviderError::new(
                    &name,
                    ErrorCategory::Unavailable,
                    "circuit open",
                ));
                continue;
            }

            let call_started = Instant::now();
            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => AgentResult::failure(
                    ProviderError::new(&name, ErrorCategory::Cancelled, "cancelled during call"),
                    call_started.elapsed().as_millis() as u64,
                ),
                outcome = tokio::time::timeout(
                    self.call_timeout,
                    entry.adapter.execute(prompt, output_target),
                ) => match outcome {
                    Ok(result) => result,
                    Err(_) => AgentResult::failure(
                        ProviderError::new(
                            &name,
                            ErrorCategory::Timeout,
                            format!("no response within {}s", self.call_timeout.as_secs()),
                        ),
                        call_started.elapsed().as_millis() as u64,
                    ),
                },
            };

            if result.success {
                entry.breaker.record(None);
                if !attempts.is_empty() {
                    info!(
                        "{} succeeded via {} after {} fallback(s)",
                        self.role,
                        name,
                        attempts.len()
                    );
                }
                let mut result = result;
                result.provider = Some(name);
                result.fallbacks = attempts.len() as u32;
                result.attempts = attempts;
                return result;
            }

            let mut error = result.error.unwrap_or_else(|| {
                ProviderError::new(
                    &name,
                    ErrorCategory::Unknown,
                    "adapter reported failure without an error",
                )
            });
            error.provider = name;
            entry.breaker.record(Some(error.category));
            warn!("{} adapter failed: {}", self.role, error);

            let abort = error.category.is_abort();
            attempts.push(error);
            if abort {
                break;
            }
        }

        self.exhausted(attempts, started.elapsed().as_millis() as u64)
    }

    fn exhausted(&self, attempts: Vec<ProviderError>, duration_ms: u64) -> AgentResult {
        let category = if attempts.is_empty() {
            ErrorCategory::Unavailable
        } else if attempts.iter().any(|a| a.category.is_abort()) {
            ErrorCategory::Cancelled
        } else if attempts.iter().all(|a| a.category == attempts[0].category) {
            attempts[0].category
        } else {
            ErrorCategory::Unknown
        };

        let message = if attempts.is_empty() {
            format!("no adapters configured for {}", self.role)
        } else {
            format!(
                "all adapters failed for {}: {}",
                self.role,
                attempts
                    .iter()
                    .map(|a| format!("{}: {}", a.provider, a.category))
                    .collect::<Vec<_>>()
                    .join(", ")
            )
        };

        let mut result = AgentResult::failure(
            ProviderError::new(format!("{}-chain", self.role), category, message),
            duration_ms,
        );
        result.provider = None;
        result.fallbacks = attempts.len() as u32;
        result.attempts = attempts;
        result
    }
}
