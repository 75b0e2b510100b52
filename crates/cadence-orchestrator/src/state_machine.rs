//! Pure state machine for session phases
//!
//! `transition(phase, event) -> (phase, actions)` with no I/O:
//! - Deterministic, never panics
//! - Invalid events in a non-terminal phase lead to `Failed`
//! - Terminal phases absorb every event: no transition, no actions
//!
//! Work actions (`InvokeRole`, `RequestApproval`, `DispatchFiles`, `RunTests`,
//! `Commit`) tell the driver what to do next; the rest are bookkeeping.

use cadence_core::{AgentRole, Phase};

/// Events that drive phase transitions
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Start,
    PlanReady { file_count: usize },
    PlanFailed { error: String },
    Approved,
    Rejected { reason: String },
    /// Every planned file has been produced at least once
    ExecutionComplete,
    AuditStarted,
    FixStarted,
    ConsultStarted,
    /// Every file reached an accepted or reverted outcome
    FilesSettled { run_tests: bool, commit: bool },
    /// A file was still rejected after consultation and the lenient pass
    IterationsExhausted { file: String },
    TestsPassed { commit: bool },
    TestsFailed {
        mandatory: bool,
        summary: String,
        commit: bool,
    },
    Committed,
    CommitFailed { error: String },
    Fatal { error: String },
    Cancelled { reason: String },
}

/// Side effects requested by a transition
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    LogActivity { message: String },
    InvokeRole { role: AgentRole },
    RequestApproval,
    DispatchFiles,
    RunTests,
    Commit,
    RecordWarning { message: String },
    RecordError { message: String },
}

impl Action {
    /// Whether the driver has work to do for this action
    pub fn is_work(&self) -> bool {
        matches!(
            self,
            Self::InvokeRole { .. }
                | Self::RequestApproval
                | Self::DispatchFiles
                | Self::RunTests
                | Self::Commit
        )
    }
}

fn log(message: impl Into<String>) -> Action {
    Action::LogActivity {
        message: message.into(),
    }
}

fn fail(message: String) -> (Phase, Vec<Action>) {
    (
        Phase::Failed,
        vec![log(message.clone()), Action::RecordError { message }],
    )
}

/// Phases in which per-file work is in flight
pub fn is_file_phase(phase: Phase) -> bool {
    matches!(
        phase,
        Phase::Executing | Phase::Auditing | Phase::Fixing | Phase::Consulting
    )
}

/// Where tests and commit lead once files are settled
fn after_files(run_tests: bool, commit: bool) -> (Phase, Vec<Action>) {
    if run_tests {
        (Phase::Testing, vec![log("All files settled, running tests"), Action::RunTests])
    } else {
        after_tests(commit)
    }
}

fn after_tests(commit: bool) -> (Phase, Vec<Action>) {
    if commit {
        (Phase::Committing, vec![log("Committing accepted files"), Action::Commit])
    } else {
        (Phase::Completed, vec![log("Session completed")])
    }
}

/// Pure phase transition function
pub fn transition(phase: Phase, event: Event) -> (Phase, Vec<Action>) {
    if phase.is_terminal() {
        return (phase, Vec::new());
    }

    match (phase, event) {
        (Phase::Init, Event::Start) => (
            Phase::Planning,
            vec![
                log("Starting session"),
                Action::InvokeRole {
                    role: AgentRole::Architect,
                },
            ],
        ),

        (Phase::Planning, Event::PlanReady { file_count: 0 }) => {
            fail("Plan names no files to change".to_string())
        }
        (Phase::Planning, Event::PlanReady { file_count }) => (
            Phase::AwaitingApproval,
            vec![
                log(format!("Plan ready: {} file(s)", file_count)),
                Action::RequestApproval,
            ],
        ),
        (Phase::Planning, Event::PlanFailed { error }) => {
            fail(format!("Planning failed: {}", error))
        }

        (Phase::AwaitingApproval, Event::Approved) => (
            Phase::Executing,
            vec![log("Plan approved"), Action::DispatchFiles],
        ),
        (Phase::AwaitingApproval, Event::Rejected { reason }) => (
            Phase::Rejected,
            vec![
                log(format!("Plan rejected: {}", reason)),
                Action::RecordError {
                    message: format!("Plan rejected: {}", reason),
                },
            ],
        ),

        (Phase::Executing, Event::ExecutionComplete) => {
            (Phase::Auditing, vec![log("All files executed")])
        }
        // Per-file stage events only move the session once execution is complete
        (Phase::Executing, Event::AuditStarted | Event::FixStarted | Event::ConsultStarted) => {
            (Phase::Executing, Vec::new())
        }
        (Phase::Auditing | Phase::Fixing | Phase::Consulting, Event::AuditStarted) => {
            (Phase::Auditing, Vec::new())
        }
        (Phase::Auditing | Phase::Fixing | Phase::Consulting, Event::FixStarted) => {
            (Phase::Fixing, Vec::new())
        }
        (Phase::Auditing | Phase::Fixing | Phase::Consulting, Event::ConsultStarted) => {
            (Phase::Consulting, Vec::new())
        }

        (p, Event::FilesSettled { run_tests, commit }) if is_file_phase(p) => {
            after_files(run_tests, commit)
        }
        (p, Event::IterationsExhausted { file }) if is_file_phase(p) => {
            let message = format!("{} still rejected after consultation", file);
            (
                Phase::MaxIterations,
                vec![log(message.clone()), Action::RecordError { message }],
            )
        }

        (Phase::Testing, Event::TestsPassed { commit }) => after_tests(commit),
        (
            Phase::Testing,
            Event::TestsFailed {
                mandatory: true,
                summary,
                ..
            },
        ) => fail(format!("Tests failed: {}", summary)),
        (
            Phase::Testing,
            Event::TestsFailed {
                mandatory: false,
                summary,
                commit,
            },
        ) => {
            let (next, mut actions) = after_tests(commit);
            actions.insert(
                0,
                Action::RecordWarning {
                    message: format!("Tests failed (not required): {}", summary),
                },
            );
            (next, actions)
        }

        (Phase::Committing, Event::Committed) => (Phase::Completed, vec![log("Session completed")]),
        (Phase::Committing, Event::CommitFailed { error }) => (
            Phase::Completed,
            vec![
                Action::RecordWarning {
                    message: format!("Commit failed: {}", error),
                },
                log("Session completed without commit"),
            ],
        ),

        (_, Event::Fatal { error }) => fail(error),
        (_, Event::Cancelled { reason }) => fail(format!("Cancelled: {}", reason)),

        (phase, event) => fail(format!(
            "Invalid transition: {} cannot handle {:?}",
            phase, event
        )),
    }
}

/// Work to resume for a session persisted in `phase`
pub fn pending_work(phase: Phase) -> Option<Action> {
    match phase {
        Phase::Planning => Some(Action::InvokeRole {
            role: AgentRole::Architect,
        }),
        Phase::AwaitingApproval => Some(Action::RequestApproval),
        p if is_file_phase(p) => Some(Action::DispatchFiles),
        Phase::Testing => Some(Action::RunTests),
        Phase::Committing => Some(Action::Commit),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_happy_path_full_flow() {
        let (phase, actions) = transition(Phase::Init, Event::Start);
        assert_eq!(phase, Phase::Planning);
        assert!(actions.contains(&Action::InvokeRole {
            role: AgentRole::Architect
        }));

        let (phase, actions) = transition(phase, Event::PlanReady { file_count: 3 });
        assert_eq!(phase, Phase::AwaitingApproval);
        assert!(actions.contains(&Action::RequestApproval));

        let (phase, actions) = transition(phase, Event::Approved);
        assert_eq!(phase, Phase::Executing);
        assert!(actions.contains(&Action::DispatchFiles));

        let (phase, _) = transition(phase, Event::ExecutionComplete);
        assert_eq!(phase, Phase::Auditing);

        let (phase, _) = transition(phase, Event::FixStarted);
        assert_eq!(phase, Phase::Fixing);
        let (phase, _) = transition(phase, Event::ConsultStarted);
        assert_eq!(phase, Phase::Consulting);
        let (phase, _) = transition(phase, Event::AuditStarted);
        assert_eq!(phase, Phase::Auditing);

        let (phase, actions) = transition(
            phase,
            Event::FilesSettled {
                run_tests: true,
                commit: true,
            },
        );
        assert_eq!(phase, Phase::Testing);
        assert!(actions.contains(&Action::RunTests));

        let (phase, actions) = transition(phase, Event::TestsPassed { commit: true });
        assert_eq!(phase, Phase::Committing);
        assert!(actions.contains(&Action::Commit));

        let (phase, _) = transition(phase, Event::Committed);
        assert_eq!(phase, Phase::Completed);
    }

    #[test]
    fn test_skip_tests_and_commit() {
        let (phase, actions) = transition(
            Phase::Auditing,
            Event::FilesSettled {
                run_tests: false,
                commit: false,
            },
        );
        assert_eq!(phase, Phase::Completed);
        assert!(!actions.iter().any(Action::is_work));
    }

    #[test]
    fn test_stage_events_do_not_leave_executing() {
        for event in [Event::AuditStarted, Event::FixStarted, Event::ConsultStarted] {
            let (phase, actions) = transition(Phase::Executing, event);
            assert_eq!(phase, Phase::Executing);
            assert!(actions.is_empty());
        }
    }

    #[test]
    fn test_planner_failure() {
        let (phase, actions) = transition(
            Phase::Planning,
            Event::PlanFailed {
                error: "claude: rate_limit, gemini: rate_limit".into(),
            },
        );
        assert_eq!(phase, Phase::Failed);
        assert!(actions.iter().any(|a| matches!(
            a,
            Action::RecordError { message } if message.contains("gemini: rate_limit")
        )));
    }

    #[test]
    fn test_empty_plan_fails() {
        let (phase, _) = transition(Phase::Planning, Event::PlanReady { file_count: 0 });
        assert_eq!(phase, Phase::Failed);
    }

    #[test]
    fn test_rejection_and_iterations_exhausted() {
        let (phase, _) = transition(
            Phase::AwaitingApproval,
            Event::Rejected {
                reason: "too broad".into(),
            },
        );
        assert_eq!(phase, Phase::Rejected);

        let (phase, _) = transition(
            Phase::Consulting,
            Event::IterationsExhausted {
                file: "src/b.rs".into(),
            },
        );
        assert_eq!(phase, Phase::MaxIterations);
    }

    #[test]
    fn test_optional_test_failure_is_warning() {
        let (phase, actions) = transition(
            Phase::Testing,
            Event::TestsFailed {
                mandatory: false,
                summary: "1 failed".into(),
                commit: false,
            },
        );
        assert_eq!(phase, Phase::Completed);
        assert!(matches!(actions[0], Action::RecordWarning { .. }));

        let (phase, _) = transition(
            Phase::Testing,
            Event::TestsFailed {
                mandatory: true,
                summary: "1 failed".into(),
                commit: true,
            },
        );
        assert_eq!(phase, Phase::Failed);
    }

    #[test]
    fn test_commit_failure_completes_with_warning() {
        let (phase, actions) = transition(
            Phase::Committing,
            Event::CommitFailed {
                error: "nothing to commit".into(),
            },
        );
        assert_eq!(phase, Phase::Completed);
        assert!(matches!(actions[0], Action::RecordWarning { .. }));
    }

    #[test]
    fn test_fatal_and_cancel_from_any_non_terminal() {
        for phase in [
            Phase::Init,
            Phase::Planning,
            Phase::AwaitingApproval,
            Phase::Executing,
            Phase::Fixing,
            Phase::Consulting,
            Phase::Auditing,
            Phase::Testing,
            Phase::Committing,
        ] {
            let (next, _) = transition(phase, Event::Fatal { error: "disk".into() });
            assert_eq!(next, Phase::Failed);
            let (next, _) = transition(phase, Event::Cancelled { reason: "user".into() });
            assert_eq!(next, Phase::Failed);
        }
    }

    #[test]
    fn test_terminal_phases_absorb_events() {
        for phase in [
            Phase::Completed,
            Phase::Failed,
            Phase::Rejected,
            Phase::MaxIterations,
        ] {
            let (next, actions) = transition(phase, Event::Start);
            assert_eq!(next, phase);
            assert!(actions.is_empty());
            let (next, _) = transition(phase, Event::Fatal { error: "x".into() });
            assert_eq!(next, phase);
        }
    }

    #[test]
    fn test_invalid_transition_fails() {
        let (phase, actions) = transition(Phase::Init, Event::Approved);
        assert_eq!(phase, Phase::Failed);
        assert!(actions
            .iter()
            .any(|a| matches!(a, Action::RecordError { .. })));

        let (phase, _) = transition(Phase::Testing, Event::ExecutionComplete);
        assert_eq!(phase, Phase::Failed);
    }

    #[test]
    fn test_pending_work() {
        assert_eq!(pending_work(Phase::AwaitingApproval), Some(Action::RequestApproval));
        assert_eq!(pending_work(Phase::Fixing), Some(Action::DispatchFiles));
        assert_eq!(pending_work(Phase::Committing), Some(Action::Commit));
        assert_eq!(pending_work(Phase::Completed), None);
        assert_eq!(pending_work(Phase::Init), None);
    }
}
