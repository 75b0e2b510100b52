//! Per-session metrics record

use cadence_core::{AgentRole, SessionId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Counters for one role
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleMetrics {
    pub calls: u32,
    pub failures: u32,
    /// Adapters that failed before the chain found one that answered
    pub fallbacks: u32,
    pub duration_ms: u64,
    pub input_tokens: u64,
    pub output_tokens: u64,
}

/// Metrics persisted alongside a session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionMetrics {
    pub session_id: SessionId,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub roles: BTreeMap<AgentRole, RoleMetrics>,
    /// Executor retries spent by recovery cycles
    #[serde(default)]
    pub recovery_attempts: u32,
    #[serde(default)]
    pub reverts: u32,
}

impl SessionMetrics {
    pub fn new(session_id: SessionId) -> Self {
        let now = Utc::now();
        Self {
            session_id,
            started_at: now,
            updated_at: now,
            roles: BTreeMap::new(),
            recovery_attempts: 0,
            reverts: 0,
        }
    }

    /// Record one fallback-chain call
    pub fn record_call(
        &mut self,
        role: AgentRole,
        success: bool,
        duration_ms: u64,
        fallbacks: u32,
        tokens: Option<(u64, u64)>,
    ) {
        let entry = self.roles.entry(role).or_default();
        entry.calls += 1;
        if !success {
            entry.failures += 1;
        }
        entry.fallbacks += fallbacks;
        entry.duration_ms += duration_ms;
        if let Some((input, output)) = tokens {
            entry.input_tokens += input;
            entry.output_tokens += output;
        }
        self.updated_at = Utc::now();
    }

    pub fn record_recovery_attempt(&mut self) {
        self.recovery_attempts += 1;
        self.updated_at = Utc::now();
    }

    pub fn record_revert(&mut self) {
        self.reverts += 1;
        self.updated_at = Utc::now();
    }

    pub fn calls(&self, role: AgentRole) -> u32 {
        self.roles.get(&role).map(|r| r.calls).unwrap_or(0)
    }

    /// (input, output) tokens across all roles
    pub fn total_tokens(&self) -> (u64, u64) {
        self.roles.values().fold((0, 0), |(i, o), r| {
            (i + r.input_tokens, o + r.output_tokens)
        })
    }
}
