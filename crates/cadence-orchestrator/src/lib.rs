//! # cadence-orchestrator
//!
//! Session orchestration engine for Cadence.
//!
//! This crate provides:
//! - The pure phase state machine and the [`Orchestrator`] that drives it
//! - Per-file execute/audit/fix/consult workers with bounded recovery
//! - Sequential, parallel and pipeline dispatch
//! - Audit parsing with a pluggable leniency policy
//! - Watch mode with per-path debouncing

mod approval;
mod audit;
mod commit;
mod concurrency;
mod events;
mod orchestrator;
mod plan;
mod prompt;
mod recovery;
mod state_machine;
mod syntax;
mod testing;
mod watch;
mod worker;
mod workspace;

pub use approval::{ApprovalDecision, ApprovalGate, FixedApproval};
pub use audit::{
    evaluate, parse_audit_response, AuditContext, FixedLeniency, LeniencyPolicy, StandardLeniency,
};
pub use commit::{commit_message, Committer, GitCommitter};
pub use concurrency::{ConcurrencyController, ExecutionMode, Lanes};
pub use events::{EventSink, FileEvent, FileEventKind};
pub use orchestrator::{
    DryRunReport, Orchestrator, ProgressEvent, ProgressFn, RoleAgents, SimulatedAction,
    SimulatedFile,
};
pub use plan::{build_plan, extract_planned_files};
pub use prompt::extract_code_block;
pub use recovery::{revert_file, Produce, RecoveryBudget, RecoveryClock, RecoveryManager};
pub use state_machine::{pending_work, transition, Action, Event};
pub use syntax::{
    detect_language, looks_like_code, BracketValidator, NoopValidator, SyntaxValidator,
};
pub use testing::{parse_counts, CommandTestRunner, TestRunner};
pub use watch::{Debouncer, Retrigger, WatchController};
pub use worker::{FileReport, FileWork, FileWorker, ResumePoint};
pub use workspace::{validate_path, Workspace, WriteJournal};
