//! Per-file progress events
//!
//! Workers never touch the session. They report through an
//! [`EventSink`] and the orchestrator's control loop turns events into
//! session updates and checkpoints, in arrival order.

use cadence_agent::AgentResult;
use cadence_core::{AgentRole, AuditIssue, FileOutcome};
use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileEventKind {
    ExecuteStarted,
    /// First version of the file written; `iteration` is the first audit index
    Executed,
    AuditStarted { final_pass: bool },
    Audited { approved: bool, issues: Vec<AuditIssue> },
    FixStarted,
    /// Fix written; `iteration` is the audit index it will be reviewed at
    Fixed,
    ConsultStarted,
    Consulted,
    /// One fallback-chain call finished
    Call {
        role: AgentRole,
        success: bool,
        duration_ms: u64,
        fallbacks: u32,
        tokens: Option<(u64, u64)>,
    },
    /// A retry inside a recovery cycle
    RecoveryAttempt { reason: String },
    Settled { outcome: FileOutcome },
    /// Recovery ran out of attempts or time; the orchestrator decides what happens
    Exhausted { reason: String },
    /// Infrastructure failure that must end the session
    Fatal { error: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEvent {
    pub file: String,
    pub iteration: u32,
    pub kind: FileEventKind,
    pub at: DateTime<Utc>,
}

/// Sending half bound to one file
#[derive(Debug, Clone)]
pub struct EventSink {
    file: String,
    tx: mpsc::UnboundedSender<FileEvent>,
}

impl EventSink {
    pub fn new(file: impl Into<String>, tx: mpsc::UnboundedSender<FileEvent>) -> Self {
        Self {
            file: file.into(),
            tx,
        }
    }

    pub fn file(&self) -> &str {
        &self.file
    }

    pub fn emit(&self, iteration: u32, kind: FileEventKind) {
        let event = FileEvent {
            file: self.file.clone(),
            iteration,
            kind,
            at: Utc::now(),
        };
        if self.tx.send(event).is_err() {
            debug!("Event receiver dropped for {}", self.file);
        }
    }

    /// Report a chain call for metrics and role status
    pub fn call(&self, iteration: u32, role: AgentRole, result: &AgentResult) {
        self.emit(
            iteration,
            FileEventKind::Call {
                role,
                success: result.success,
                duration_ms: result.duration_ms,
                fallbacks: result.fallbacks,
                tokens: result
                    .usage
                    .map(|u| (u.input_tokens as u64, u.output_tokens as u64)),
            },
        );
    }
}
