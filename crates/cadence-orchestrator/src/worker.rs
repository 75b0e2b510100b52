//! Per-file execute → audit → fix → consult lifecycle
//!
//! Iterations count audit passes. A file is audited at iteration 1 after
//! execution; each rejection below `max_iterations` triggers a fix and the
//! next audit. A rejection at `max_iterations` asks the consultant once, the
//! executor applies the advice, and a final lenient audit decides between
//! force-accept and rejection.

use cadence_agent::FallbackChain;
use cadence_core::{
    AgentRole, AuditIssue, CadenceError, Checkpoint, CheckpointMarker, FileOutcome,
    OrchestratorConfig, Result,
};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::audit::{evaluate, parse_audit_response, AuditContext, LeniencyPolicy};
use crate::concurrency::Lanes;
use crate::events::{EventSink, FileEventKind};
use crate::prompt::{audit_prompt, consult_prompt};
use crate::recovery::{Produce, RecoveryClock, RecoveryManager};
use crate::syntax::SyntaxValidator;
use crate::workspace::Workspace;

/// Where a file's lifecycle continues from
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ResumePoint {
    #[default]
    NotStarted,
    Audit { iteration: u32, final_pass: bool },
    Fix { iteration: u32, issues: Vec<AuditIssue> },
    Consult { issues: Vec<AuditIssue> },
    Settled { outcome: FileOutcome },
}

fn rejection_reason(issues: &[AuditIssue]) -> String {
    if issues.is_empty() {
        return "auditor rejected the file on the final pass".to_string();
    }
    let listed = issues
        .iter()
        .map(|i| format!("[{}] {}", i.severity, i.description))
        .collect::<Vec<_>>()
        .join("; ");
    format!("unresolved issues after final pass: {}", listed)
}

impl ResumePoint {
    /// Fold a file's checkpoints, in log order, into its next step
    pub fn replay<'a>(
        checkpoints: impl IntoIterator<Item = &'a Checkpoint>,
        max_iterations: u32,
    ) -> Self {
        let mut point = Self::NotStarted;
        let mut consulted = false;

        for cp in checkpoints {
            point = match &cp.marker {
                CheckpointMarker::Executed => Self::Audit {
                    iteration: cp.iteration.max(1),
                    final_pass: false,
                },
                CheckpointMarker::Fixed => Self::Audit {
                    iteration: cp.iteration,
                    final_pass: false,
                },
                CheckpointMarker::Consulted => {
                    consulted = true;
                    Self::Audit {
                        iteration: max_iterations,
                        final_pass: true,
                    }
                }
                CheckpointMarker::Audited { approved: true, .. } => Self::Settled {
                    outcome: if consulted {
                        FileOutcome::ForceAccepted
                    } else {
                        FileOutcome::Approved
                    },
                },
                CheckpointMarker::Audited {
                    approved: false,
                    issues,
                } => {
                    if consulted {
                        Self::Settled {
                            outcome: FileOutcome::Rejected {
                                reason: rejection_reason(issues),
                            },
                        }
                    } else if cp.iteration < max_iterations {
                        Self::Fix {
                            iteration: cp.iteration,
                            issues: issues.clone(),
                        }
                    } else {
                        Self::Consult {
                            issues: issues.clone(),
                        }
                    }
                }
                CheckpointMarker::Settled { outcome } => Self::Settled {
                    outcome: outcome.clone(),
                },
                CheckpointMarker::PhaseCompleted => continue,
            };
        }
        point
    }

    pub fn is_settled(&self) -> bool {
        matches!(self, Self::Settled { .. })
    }

    fn iteration(&self, max_iterations: u32) -> u32 {
        match self {
            Self::NotStarted | Self::Settled { .. } => 0,
            Self::Audit { iteration, .. } | Self::Fix { iteration, .. } => *iteration,
            Self::Consult { .. } => max_iterations,
        }
    }
}

/// One file to drive to settlement
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileWork {
    pub path: String,
    pub description: String,
    pub resume: ResumePoint,
}

impl FileWork {
    pub fn new(path: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            description: description.into(),
            resume: ResumePoint::NotStarted,
        }
    }

    pub fn resuming(mut self, resume: ResumePoint) -> Self {
        self.resume = resume;
        self
    }
}

/// What a worker reports when it returns
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileReport {
    pub path: String,
    pub outcome: FileOutcome,
    pub iteration: u32,
    pub audit_calls: u32,
}

/// Shared worker state for one dispatch
pub struct FileWorker {
    config: OrchestratorConfig,
    task: String,
    auditor: Arc<FallbackChain>,
    consultant: Option<Arc<FallbackChain>>,
    workspace: Workspace,
    validator: Arc<dyn SyntaxValidator>,
    policy: Arc<dyn LeniencyPolicy>,
    recovery: RecoveryManager,
}

struct Progress {
    clock: RecoveryClock,
    iteration: u32,
    audit_calls: u32,
}

impl FileWorker {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: OrchestratorConfig,
        task: impl Into<String>,
        plan: impl Into<String>,
        executor: Arc<FallbackChain>,
        auditor: Arc<FallbackChain>,
        consultant: Option<Arc<FallbackChain>>,
        workspace: Workspace,
        validator: Arc<dyn SyntaxValidator>,
        policy: Arc<dyn LeniencyPolicy>,
    ) -> Self {
        let task = task.into();
        let recovery = RecoveryManager::new(
            config.clone(),
            task.clone(),
            plan,
            executor,
            workspace.clone(),
            validator.clone(),
        );
        Self {
            config,
            task,
            auditor,
            consultant: consultant.filter(|c| !c.is_empty()),
            workspace,
            validator,
            policy,
            recovery,
        }
    }

    /// Drive one file until it settles, is interrupted or exhausts recovery
    pub async fn run(
        &self,
        work: FileWork,
        lanes: &Lanes,
        sink: &EventSink,
        cancel: &CancellationToken,
    ) -> FileReport {
        let max = self.config.max_iterations;
        let mut progress = Progress {
            clock: RecoveryClock::default(),
            iteration: work.resume.iteration(max),
            audit_calls: 0,
        };
        let mut point = work.resume.clone();

        let report = |outcome: FileOutcome, progress: &Progress| FileReport {
            path: work.path.clone(),
            outcome,
            iteration: progress.iteration,
            audit_calls: progress.audit_calls,
        };

        if let ResumePoint::Settled { outcome } = &point {
            return report(outcome.clone(), &progress);
        }

        let _slot = match lanes.lifecycle(cancel).await {
            Ok(slot) => slot,
            Err(_) => return report(FileOutcome::Interrupted, &progress),
        };

        loop {
            let step = match point {
                ResumePoint::NotStarted => {
                    self.execute(&work, &mut progress, lanes, sink, cancel).await
                }
                ResumePoint::Audit {
                    iteration,
                    final_pass,
                } => {
                    self.audit(&work, iteration, final_pass, &mut progress, lanes, sink, cancel)
                        .await
                }
                ResumePoint::Fix { iteration, issues } => {
                    self.fix(&work, iteration, &issues, &mut progress, lanes, sink, cancel)
                        .await
                }
                ResumePoint::Consult { issues } => {
                    self.consult(&work, &issues, &mut progress, lanes, sink, cancel)
                        .await
                }
                ResumePoint::Settled { outcome } => {
                    info!("{} settled: {:?}", work.path, outcome);
                    return report(outcome, &progress);
                }
            };

            match step {
                Ok(next) => point = next,
                Err(CadenceError::Cancelled) => {
                    debug!("{} interrupted", work.path);
                    return report(FileOutcome::Interrupted, &progress);
                }
                Err(e) if e.is_session_fatal() => {
                    let error = e.to_string();
                    warn!("{} hit a fatal error: {}", work.path, error);
                    sink.emit(progress.iteration, FileEventKind::Fatal { error: error.clone() });
                    return report(FileOutcome::Failed { reason: error }, &progress);
                }
                Err(e) => {
                    let reason = match e {
                        CadenceError::RecoveryExhausted { reason, .. } => reason,
                        other => other.to_string(),
                    };
                    warn!("Recovery exhausted for {}: {}", work.path, reason);
                    sink.emit(
                        progress.iteration,
                        FileEventKind::Exhausted {
                            reason: reason.clone(),
                        },
                    );
                    return report(FileOutcome::Failed { reason }, &progress);
                }
            }
        }
    }

    async fn execute(
        &self,
        work: &FileWork,
        progress: &mut Progress,
        lanes: &Lanes,
        sink: &EventSink,
        cancel: &CancellationToken,
    ) -> Result<ResumePoint> {
        let _lane = lanes.execute(cancel).await?;
        sink.emit(0, FileEventKind::ExecuteStarted);
        self.recovery
            .produce(
                &mut progress.clock,
                &work.path,
                &work.description,
                0,
                Produce::Initial,
                sink,
                cancel,
            )
            .await?;
        progress.iteration = 1;
        sink.emit(1, FileEventKind::Executed);
        Ok(ResumePoint::Audit {
            iteration: 1,
            final_pass: false,
        })
    }

    #[allow(clippy::too_many_arguments)]
    async fn audit(
        &self,
        work: &FileWork,
        iteration: u32,
        final_pass: bool,
        progress: &mut Progress,
        lanes: &Lanes,
        sink: &EventSink,
        cancel: &CancellationToken,
    ) -> Result<ResumePoint> {
        let _lane = lanes.audit(cancel).await?;
        sink.emit(iteration, FileEventKind::AuditStarted { final_pass });

        let content = self.workspace.read(&work.path).await?.unwrap_or_default();
        let prompt = audit_prompt(
            &self.config,
            &self.task,
            &work.path,
            &content,
            iteration,
            final_pass,
        );
        let raw = self
            .recovery
            .attempt(
                &mut progress.clock,
                &work.path,
                AgentRole::Auditor,
                &self.auditor,
                &prompt,
                iteration,
                sink,
                cancel,
                parse_audit_response,
            )
            .await?;
        progress.audit_calls += 1;

        let syntax = self.validator.validate(&work.path, &content);
        let ctx = AuditContext {
            iteration,
            max_iterations: self.config.max_iterations,
            final_pass,
        };
        let verdict = evaluate(&work.path, raw, Some(&syntax), self.policy.as_ref(), &ctx);
        let approved = verdict.is_approved();
        sink.emit(
            iteration,
            FileEventKind::Audited {
                approved,
                issues: verdict.issues.clone(),
            },
        );

        let outcome = match (approved, final_pass) {
            (true, false) => Some(FileOutcome::Approved),
            (true, true) => Some(FileOutcome::ForceAccepted),
            (false, true) => Some(FileOutcome::Rejected {
                reason: rejection_reason(&verdict.issues),
            }),
            (false, false) => None,
        };
        if let Some(outcome) = outcome {
            sink.emit(iteration, FileEventKind::Settled { outcome: outcome.clone() });
            return Ok(ResumePoint::Settled { outcome });
        }

        debug!(
            "{} needs work at iteration {}: {} issue(s)",
            work.path,
            iteration,
            verdict.issues.len()
        );
        if iteration < self.config.max_iterations {
            Ok(ResumePoint::Fix {
                iteration,
                issues: verdict.issues,
            })
        } else {
            Ok(ResumePoint::Consult {
                issues: verdict.issues,
            })
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn fix(
        &self,
        work: &FileWork,
        iteration: u32,
        issues: &[AuditIssue],
        progress: &mut Progress,
        lanes: &Lanes,
        sink: &EventSink,
        cancel: &CancellationToken,
    ) -> Result<ResumePoint> {
        let _lane = lanes.execute(cancel).await?;
        sink.emit(iteration, FileEventKind::FixStarted);
        self.recovery
            .produce(
                &mut progress.clock,
                &work.path,
                &work.description,
                iteration,
                Produce::Fix {
                    issues,
                    advice: None,
                },
                sink,
                cancel,
            )
            .await?;

        let next = iteration + 1;
        progress.iteration = next;
        sink.emit(next, FileEventKind::Fixed);
        Ok(ResumePoint::Audit {
            iteration: next,
            final_pass: false,
        })
    }

    async fn consult(
        &self,
        work: &FileWork,
        issues: &[AuditIssue],
        progress: &mut Progress,
        lanes: &Lanes,
        sink: &EventSink,
        cancel: &CancellationToken,
    ) -> Result<ResumePoint> {
        let max = self.config.max_iterations;
        sink.emit(max, FileEventKind::ConsultStarted);

        if let Some(consultant) = &self.consultant {
            let advice = {
                let _lane = lanes.audit(cancel).await?;
                let content = self.workspace.read(&work.path).await?.unwrap_or_default();
                let prompt = consult_prompt(&self.config, &self.task, &work.path, &content, issues);
                self.recovery
                    .attempt(
                        &mut progress.clock,
                        &work.path,
                        AgentRole::Consultant,
                        consultant,
                        &prompt,
                        max,
                        sink,
                        cancel,
                        |raw| Ok(raw.trim().to_string()),
                    )
                    .await?
            };

            let _lane = lanes.execute(cancel).await?;
            self.recovery
                .produce(
                    &mut progress.clock,
                    &work.path,
                    &work.description,
                    max,
                    Produce::Fix {
                        issues,
                        advice: Some(&advice).filter(|a| !a.is_empty()).map(String::as_str),
                    },
                    sink,
                    cancel,
                )
                .await?;
        } else {
            debug!("No consultant configured; {} goes straight to the final pass", work.path);
        }

        progress.iteration = max;
        sink.emit(max, FileEventKind::Consulted);
        Ok(ResumePoint::Audit {
            iteration: max,
            final_pass: true,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::StandardLeniency;
    use crate::concurrency::ExecutionMode;
    use crate::events::FileEvent;
    use crate::syntax::BracketValidator;
    use cadence_agent::{ScriptedAdapter, ScriptedReply};
    use cadence_core::Severity;
    use std::time::Duration;
    use tempfile::tempdir;
    use tokio::sync::mpsc;

    const APPROVE: &str = r#"{"status": "APPROVED", "issues": []}"#;
    const MINOR: &str = r#"{"status": "NEEDS_WORK", "issues": [{"severity": "minor", "description": "rename x"}]}"#;
    const CRITICAL: &str = r#"{"status": "NEEDS_WORK", "issues": [{"severity": "critical", "description": "panics"}]}"#;

    fn chain(role: AgentRole, adapter: Arc<ScriptedAdapter>) -> Arc<FallbackChain> {
        Arc::new(FallbackChain::new(role, Duration::from_secs(5)).with_adapter(adapter))
    }

    fn worker(
        dir: &std::path::Path,
        max_iterations: u32,
        executor: Arc<ScriptedAdapter>,
        auditor: Arc<ScriptedAdapter>,
        consultant: Option<Arc<ScriptedAdapter>>,
    ) -> FileWorker {
        let config = OrchestratorConfig {
            max_iterations,
            recovery_backoff_ms: 0,
            ..Default::default()
        };
        FileWorker::new(
            config,
            "task",
            "FILE: src/a.rs - a",
            chain(AgentRole::Executor, executor),
            chain(AgentRole::Auditor, auditor),
            consultant.map(|c| chain(AgentRole::Consultant, c)),
            Workspace::new(dir),
            Arc::new(BracketValidator::default()),
            Arc::new(StandardLeniency),
        )
    }

    async fn run(worker: &FileWorker, work: FileWork) -> (FileReport, Vec<FileEvent>) {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let sink = EventSink::new(work.path.clone(), tx);
        let lanes = Lanes::for_mode(ExecutionMode::Sequential);
        let report = worker.run(work, &lanes, &sink, &CancellationToken::new()).await;
        drop(sink);
        let mut events = Vec::new();
        while let Some(e) = rx.recv().await {
            events.push(e);
        }
        (report, events)
    }

    fn executor() -> Arc<ScriptedAdapter> {
        Arc::new(
            ScriptedAdapter::new("exec")
                .with_default(ScriptedReply::output("```rust\nfn a() {}\n```")),
        )
    }

    fn checkpoint(iteration: u32, marker: CheckpointMarker) -> Checkpoint {
        Checkpoint::new(
            0,
            cadence_core::Phase::Executing,
            Some("src/a.rs".into()),
            iteration,
            marker,
        )
    }

    #[tokio::test]
    async fn test_first_pass_approval() {
        let dir = tempdir().unwrap();
        let auditor =
            Arc::new(ScriptedAdapter::new("audit").with_default(ScriptedReply::output(APPROVE)));
        let w = worker(dir.path(), 3, executor(), auditor.clone(), None);

        let (report, events) = run(&w, FileWork::new("src/a.rs", "a")).await;
        assert_eq!(report.outcome, FileOutcome::Approved);
        assert_eq!(report.audit_calls, 1);
        assert_eq!(report.iteration, 1);
        assert!(dir.path().join("src/a.rs").exists());

        let executed = events.iter().position(|e| e.kind == FileEventKind::Executed).unwrap();
        let audit = events
            .iter()
            .position(|e| matches!(e.kind, FileEventKind::AuditStarted { .. }))
            .unwrap();
        assert!(executed < audit);
    }

    #[tokio::test]
    async fn test_minor_issue_fixed_then_approved() {
        let dir = tempdir().unwrap();
        let auditor = Arc::new(
            ScriptedAdapter::new("audit")
                .with_reply("Audit file", ScriptedReply::output(MINOR))
                .with_reply("Audit file", ScriptedReply::output(APPROVE)),
        );
        let exec = executor();
        let w = worker(dir.path(), 3, exec.clone(), auditor.clone(), None);

        let (report, _) = run(&w, FileWork::new("src/a.rs", "a")).await;
        assert_eq!(report.outcome, FileOutcome::Approved);
        assert_eq!(report.audit_calls, 2);
        assert_eq!(report.iteration, 2);
        assert_eq!(exec.calls_matching("Fix file: src/a.rs"), 1);
    }

    #[tokio::test]
    async fn test_consultant_then_force_accept() {
        let dir = tempdir().unwrap();
        let auditor = Arc::new(
            ScriptedAdapter::new("audit")
                .with_reply("final review", ScriptedReply::output(MINOR))
                .with_default(ScriptedReply::output(CRITICAL)),
        );
        let consultant = Arc::new(
            ScriptedAdapter::new("consult").with_default(ScriptedReply::output("Guard the index")),
        );
        let exec = executor();
        let w = worker(dir.path(), 2, exec.clone(), auditor.clone(), Some(consultant.clone()));

        let (report, events) = run(&w, FileWork::new("src/a.rs", "a")).await;
        assert_eq!(report.outcome, FileOutcome::ForceAccepted);
        assert_eq!(report.audit_calls, 3);
        assert_eq!(consultant.call_count(), 1);
        assert!(exec.calls().iter().any(|p| p.contains("Guard the index")));
        assert!(events.iter().any(|e| e.kind == FileEventKind::Consulted));
    }

    #[tokio::test]
    async fn test_final_pass_rejection() {
        let dir = tempdir().unwrap();
        let auditor =
            Arc::new(ScriptedAdapter::new("audit").with_default(ScriptedReply::output(CRITICAL)));
        let w = worker(dir.path(), 1, executor(), auditor, None);

        let (report, _) = run(&w, FileWork::new("src/a.rs", "a")).await;
        assert!(matches!(
            report.outcome,
            FileOutcome::Rejected { ref reason } if reason.contains("panics")
        ));
    }

    #[tokio::test]
    async fn test_executor_exhaustion_reported() {
        let dir = tempdir().unwrap();
        let exec = Arc::new(ScriptedAdapter::failing(
            "exec",
            cadence_agent::ErrorCategory::Timeout,
        ));
        let auditor =
            Arc::new(ScriptedAdapter::new("audit").with_default(ScriptedReply::output(APPROVE)));
        let w = worker(dir.path(), 3, exec, auditor.clone(), None);

        let (report, events) = run(&w, FileWork::new("src/a.rs", "a")).await;
        assert!(matches!(report.outcome, FileOutcome::Failed { .. }));
        assert!(events
            .iter()
            .any(|e| matches!(e.kind, FileEventKind::Exhausted { .. })));
        assert_eq!(auditor.call_count(), 0);
    }

    #[tokio::test]
    async fn test_resume_skips_completed_steps() {
        let dir = tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("src")).unwrap();
        std::fs::write(dir.path().join("src/a.rs"), "fn a() {}\n").unwrap();
        let exec = executor();
        let auditor =
            Arc::new(ScriptedAdapter::new("audit").with_default(ScriptedReply::output(APPROVE)));
        let w = worker(dir.path(), 3, exec.clone(), auditor, None);

        let work = FileWork::new("src/a.rs", "a").resuming(ResumePoint::Audit {
            iteration: 2,
            final_pass: false,
        });
        let (report, _) = run(&w, work).await;
        assert_eq!(report.outcome, FileOutcome::Approved);
        assert_eq!(exec.call_count(), 0);
    }

    #[test]
    fn test_replay_checkpoints() {
        let issue = AuditIssue {
            file: "src/a.rs".into(),
            severity: Severity::Minor,
            description: "x".into(),
            suggestion: String::new(),
        };
        let rejected = CheckpointMarker::Audited {
            approved: false,
            issues: vec![issue.clone()],
        };

        assert_eq!(ResumePoint::replay(Vec::<&Checkpoint>::new(), 3), ResumePoint::NotStarted);

        let log = [checkpoint(1, CheckpointMarker::Executed)];
        assert_eq!(
            ResumePoint::replay(&log, 3),
            ResumePoint::Audit { iteration: 1, final_pass: false }
        );

        let log = [
            checkpoint(1, CheckpointMarker::Executed),
            checkpoint(1, rejected.clone()),
        ];
        assert_eq!(
            ResumePoint::replay(&log, 3),
            ResumePoint::Fix { iteration: 1, issues: vec![issue.clone()] }
        );
        assert_eq!(
            ResumePoint::replay(&log, 1),
            ResumePoint::Consult { issues: vec![issue.clone()] }
        );

        let log = [
            checkpoint(1, CheckpointMarker::Executed),
            checkpoint(1, rejected.clone()),
            checkpoint(1, CheckpointMarker::Consulted),
            checkpoint(1, CheckpointMarker::Audited { approved: true, issues: vec![] }),
        ];
        assert_eq!(
            ResumePoint::replay(&log, 1),
            ResumePoint::Settled { outcome: FileOutcome::ForceAccepted }
        );
    }
}
