//! End-to-end session scenarios driven by scripted adapters

use async_trait::async_trait;
use cadence_agent::{ErrorCategory, FallbackChain, ScriptedAdapter, ScriptedReply};
use cadence_core::{
    AgentRole, CadenceError, Checkpoint, CheckpointMarker, FileOutcome, OrchestratorConfig, Phase,
    Plan, Result, Session, SessionId, TestResult,
};
use cadence_orchestrator::{
    ApprovalDecision, Committer, FileEventKind, FixedApproval, Orchestrator, ProgressEvent,
    RoleAgents, SimulatedAction, TestRunner,
};
use cadence_state::{
    Baseline, MemorySessionStore, SessionMetrics, SessionStore, SessionSummary,
};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::tempdir;
use tokio_util::sync::CancellationToken;

const PLAN: &str = "Split the parser into three modules.\n\n\
FILE: src/alpha.rs - tokenizer\n\
FILE: src/beta.rs - parser\n\
FILE: src/gamma.rs - printer\n";

const CODE: &str = "```rust\npub fn run() -> u32 {\n    42\n}\n```";
const APPROVE: &str = r#"{"status": "APPROVED", "issues": [], "summary": "ok"}"#;
const MINOR: &str = r#"{"status": "NEEDS_WORK", "issues": [{"severity": "minor", "description": "rename tmp", "suggestion": "use token"}]}"#;
const CRITICAL: &str = r#"{"status": "NEEDS_WORK", "issues": [{"severity": "critical", "description": "unbounded recursion"}]}"#;

fn chain(role: AgentRole, adapters: &[Arc<ScriptedAdapter>]) -> Arc<FallbackChain> {
    let mut chain = FallbackChain::new(role, Duration::from_secs(30));
    for adapter in adapters {
        chain = chain.with_adapter(adapter.clone());
    }
    Arc::new(chain)
}

struct Agents {
    architect: Arc<ScriptedAdapter>,
    executor: Arc<ScriptedAdapter>,
    auditor: Arc<ScriptedAdapter>,
    consultant: Arc<ScriptedAdapter>,
}

impl Agents {
    fn new() -> Self {
        Self {
            architect: Arc::new(
                ScriptedAdapter::new("claude").with_default(ScriptedReply::output(PLAN)),
            ),
            executor: Arc::new(
                ScriptedAdapter::new("codex").with_default(ScriptedReply::output(CODE)),
            ),
            auditor: Arc::new(
                ScriptedAdapter::new("gemini").with_default(ScriptedReply::output(APPROVE)),
            ),
            consultant: Arc::new(
                ScriptedAdapter::new("claude")
                    .with_default(ScriptedReply::output("Extract a helper")),
            ),
        }
    }

    fn with_auditor(mut self, auditor: ScriptedAdapter) -> Self {
        self.auditor = Arc::new(auditor);
        self
    }

    fn with_executor(mut self, executor: ScriptedAdapter) -> Self {
        self.executor = Arc::new(executor);
        self
    }

    fn roles(&self) -> RoleAgents {
        RoleAgents {
            architect: chain(AgentRole::Architect, &[self.architect.clone()]),
            executor: chain(AgentRole::Executor, &[self.executor.clone()]),
            auditor: chain(AgentRole::Auditor, &[self.auditor.clone()]),
            consultant: Some(chain(AgentRole::Consultant, &[self.consultant.clone()])),
        }
    }
}

fn config() -> OrchestratorConfig {
    OrchestratorConfig {
        auto_approve: true,
        max_iterations: 2,
        recovery_backoff_ms: 0,
        ..Default::default()
    }
}

/// Beta gets one minor issue on its first audit
fn auditor_minor_on_beta() -> ScriptedAdapter {
    ScriptedAdapter::new("gemini")
        .with_reply("Audit file: src/beta.rs (iteration 1", ScriptedReply::output(MINOR))
        .with_default(ScriptedReply::output(APPROVE))
}

fn outcomes(session: &Session) -> BTreeMap<String, Option<FileOutcome>> {
    session
        .files
        .iter()
        .map(|(path, p)| (path.clone(), p.outcome.clone()))
        .collect()
}

fn assert_checkpoints_ordered(checkpoints: &[Checkpoint]) {
    for pair in checkpoints.windows(2) {
        assert!(pair[0].id < pair[1].id, "ids must increase");
        assert!(pair[0].timestamp <= pair[1].timestamp, "timestamps must not decrease");
    }
}

fn snapshot(root: &Path) -> BTreeMap<String, Vec<u8>> {
    fn walk(dir: &Path, root: &Path, out: &mut BTreeMap<String, Vec<u8>>) {
        for entry in std::fs::read_dir(dir).unwrap() {
            let path = entry.unwrap().path();
            if path.is_dir() {
                walk(&path, root, out);
            } else {
                let rel = path.strip_prefix(root).unwrap().to_string_lossy().to_string();
                out.insert(rel, std::fs::read(&path).unwrap());
            }
        }
    }
    let mut out = BTreeMap::new();
    walk(root, root, &mut out);
    out
}

#[tokio::test]
async fn test_three_files_with_one_minor_issue() {
    let dir = tempdir().unwrap();
    let agents = Agents::new().with_auditor(auditor_minor_on_beta());
    let orchestrator = Orchestrator::new(dir.path(), agents.roles());

    let session = orchestrator.start("Split the parser", config()).await.unwrap();

    assert_eq!(session.phase, Phase::Completed);
    assert!(!session.can_resume);
    assert_eq!(session.files.len(), 3);
    for progress in session.files.values() {
        assert_eq!(progress.outcome, Some(FileOutcome::Approved));
    }
    assert_eq!(session.files["src/beta.rs"].audit_calls, 2);
    assert_eq!(session.files["src/alpha.rs"].audit_calls, 1);
    assert_eq!(agents.auditor.calls_matching("Audit file: src/beta.rs"), 2);
    assert_eq!(agents.executor.calls_matching("Fix file: src/beta.rs"), 1);
    assert_eq!(agents.consultant.call_count(), 0);
    assert!(dir.path().join("src/gamma.rs").exists());

    // Persisted state matches what was returned
    let stored = orchestrator.status(&session.session_id).await.unwrap();
    assert_eq!(stored.phase, Phase::Completed);
    assert_eq!(stored.checkpoints.len(), session.checkpoints.len());
    assert_checkpoints_ordered(&stored.checkpoints);
    assert!(stored.last_checkpoint().is_some());

    let metrics = orchestrator.metrics(&session.session_id).await.unwrap().unwrap();
    assert_eq!(metrics.calls(AgentRole::Auditor), 4);
    assert_eq!(metrics.calls(AgentRole::Architect), 1);
}

#[tokio::test]
async fn test_planner_falls_back_after_rate_limits() {
    let dir = tempdir().unwrap();
    let first = Arc::new(ScriptedAdapter::failing("claude", ErrorCategory::RateLimit));
    let second = Arc::new(ScriptedAdapter::failing("gemini", ErrorCategory::RateLimit));
    let third = Arc::new(ScriptedAdapter::new("codex").with_default(ScriptedReply::output(PLAN)));

    let agents = Agents::new();
    let mut roles = agents.roles();
    roles.architect = chain(
        AgentRole::Architect,
        &[first.clone(), second.clone(), third.clone()],
    );
    let orchestrator = Orchestrator::new(dir.path(), roles);

    let session = orchestrator.start("task", config()).await.unwrap();
    assert_eq!(session.phase, Phase::Completed);
    assert_eq!(first.call_count(), 1);
    assert_eq!(second.call_count(), 1);
    assert_eq!(third.call_count(), 1);

    let plan = orchestrator.plan(&session.session_id).await.unwrap().unwrap();
    assert_eq!(plan.provider.as_deref(), Some("codex"));
    assert_eq!(plan.files.len(), 3);

    let metrics = orchestrator.metrics(&session.session_id).await.unwrap().unwrap();
    assert_eq!(metrics.roles[&AgentRole::Architect].fallbacks, 2);
}

#[tokio::test]
async fn test_planner_exhaustion_fails_session() {
    let dir = tempdir().unwrap();
    let agents = Agents::new();
    let mut roles = agents.roles();
    roles.architect = chain(
        AgentRole::Architect,
        &[
            Arc::new(ScriptedAdapter::failing("claude", ErrorCategory::RateLimit)),
            Arc::new(ScriptedAdapter::failing("gemini", ErrorCategory::Auth)),
        ],
    );
    let orchestrator = Orchestrator::new(dir.path(), roles);

    let session = orchestrator.start("task", config()).await.unwrap();
    assert_eq!(session.phase, Phase::Failed);
    assert!(!session.can_resume);
    let error = session.last_error.unwrap();
    assert!(error.contains("claude: rate_limit"), "{}", error);
    assert!(error.contains("gemini: auth"), "{}", error);
    assert_eq!(agents.executor.call_count(), 0);

    // Entering a failure phase appends no checkpoint
    let last = session.checkpoints.last().unwrap();
    assert_eq!(last.phase, Phase::Init);
}

#[tokio::test]
async fn test_parallel_mode_respects_concurrency_limit() {
    let dir = tempdir().unwrap();
    let plan = (1..=5)
        .map(|i| format!("FILE: src/m{}.rs - module {}", i, i))
        .collect::<Vec<_>>()
        .join("\n");
    let mut agents = Agents::new().with_executor(
        ScriptedAdapter::new("codex")
            .with_default(ScriptedReply::output(CODE))
            .with_delay(Duration::from_millis(40)),
    );
    agents.architect =
        Arc::new(ScriptedAdapter::new("claude").with_default(ScriptedReply::output(plan)));
    let orchestrator = Orchestrator::new(dir.path(), agents.roles());

    let cfg = OrchestratorConfig {
        parallel: true,
        max_concurrency: 2,
        ..config()
    };
    let session = orchestrator.start("task", cfg).await.unwrap();

    assert_eq!(session.phase, Phase::Completed);
    assert_eq!(session.accepted_files().len(), 5);
    assert!(agents.executor.peak_concurrency() <= 2);
    assert_eq!(agents.executor.call_count(), 5);
}

#[tokio::test]
async fn test_pipeline_audits_each_file_after_its_execution() {
    let dir = tempdir().unwrap();
    let agents = Agents::new()
        .with_executor(
            ScriptedAdapter::new("codex")
                .with_default(ScriptedReply::output(CODE))
                .with_delay(Duration::from_millis(10)),
        )
        .with_auditor(auditor_minor_on_beta());
    let events: Arc<Mutex<Vec<ProgressEvent>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = events.clone();
    let orchestrator = Orchestrator::new(dir.path(), agents.roles()).with_progress(Arc::new(
        move |event: &ProgressEvent| {
            sink.lock().unwrap().push(event.clone());
            Ok::<(), CadenceError>(())
        },
    ));

    let session = orchestrator.pipeline("task", config()).await.unwrap();
    assert_eq!(session.phase, Phase::Completed);

    let events = events.lock().unwrap();
    for file in ["src/alpha.rs", "src/beta.rs", "src/gamma.rs"] {
        let position = |wanted: fn(&FileEventKind) -> bool| {
            events.iter().position(|e| match e {
                ProgressEvent::File(f) => f.file == file && wanted(&f.kind),
                _ => false,
            })
        };
        let executed = position(|k| *k == FileEventKind::Executed).unwrap();
        let audit = position(|k| matches!(k, FileEventKind::AuditStarted { .. })).unwrap();
        assert!(executed < audit, "{} audited before execution finished", file);
    }

    for file in ["src/alpha.rs", "src/beta.rs", "src/gamma.rs"] {
        let ids: Vec<(u64, &CheckpointMarker)> = session
            .checkpoints
            .iter()
            .filter(|c| c.file.as_deref() == Some(file))
            .map(|c| (c.id, &c.marker))
            .collect();
        assert!(matches!(ids.first(), Some((_, CheckpointMarker::Executed))));
        assert!(matches!(ids.last(), Some((_, CheckpointMarker::Settled { .. }))));
    }
}

#[tokio::test]
async fn test_recovery_exhaustion_reverts_to_baseline() {
    let dir = tempdir().unwrap();
    std::fs::create_dir_all(dir.path().join("src")).unwrap();
    std::fs::write(dir.path().join("src/alpha.rs"), "// original alpha\n").unwrap();

    let agents = Agents::new().with_executor(
        ScriptedAdapter::new("codex")
            .with_reply("Implement file: src/alpha.rs", ScriptedReply::fail(ErrorCategory::Timeout))
            .with_reply("Implement file: src/beta.rs", ScriptedReply::fail(ErrorCategory::Timeout))
            .with_default(ScriptedReply::output(CODE)),
    );
    let orchestrator = Orchestrator::new(dir.path(), agents.roles());
    let cfg = OrchestratorConfig {
        max_recovery_attempts: 2,
        ..config()
    };

    let session = orchestrator.start("task", cfg).await.unwrap();

    assert_eq!(session.phase, Phase::Completed);
    assert!(matches!(
        session.files["src/alpha.rs"].outcome,
        Some(FileOutcome::Reverted { .. })
    ));
    assert!(matches!(
        session.files["src/beta.rs"].outcome,
        Some(FileOutcome::Reverted { .. })
    ));
    assert_eq!(session.files["src/gamma.rs"].outcome, Some(FileOutcome::Approved));
    assert_eq!(
        std::fs::read_to_string(dir.path().join("src/alpha.rs")).unwrap(),
        "// original alpha\n"
    );
    assert!(!dir.path().join("src/beta.rs").exists());
    assert_eq!(agents.executor.calls_matching("Implement file: src/alpha.rs"), 2);
    assert_eq!(session.warnings.len(), 2);

    let metrics = orchestrator.metrics(&session.session_id).await.unwrap().unwrap();
    assert_eq!(metrics.reverts, 2);
    assert_eq!(metrics.recovery_attempts, 2);
}

#[tokio::test]
async fn test_recovery_exhaustion_without_revert_fails_session() {
    let dir = tempdir().unwrap();
    let agents = Agents::new().with_executor(
        ScriptedAdapter::new("codex")
            .with_reply(
                "Implement file: src/beta.rs",
                ScriptedReply::fail(ErrorCategory::Connection),
            )
            .with_default(ScriptedReply::output(CODE)),
    );
    let orchestrator = Orchestrator::new(dir.path(), agents.roles());
    let cfg = OrchestratorConfig {
        auto_revert_on_failure: false,
        ..config()
    };

    let session = orchestrator.start("task", cfg).await.unwrap();
    assert_eq!(session.phase, Phase::Failed);
    assert!(session.last_error.unwrap().contains("src/beta.rs"));
    assert!(matches!(
        session.files["src/beta.rs"].outcome,
        Some(FileOutcome::Failed { .. })
    ));
}

#[tokio::test]
async fn test_consultation_and_max_iterations() {
    let dir = tempdir().unwrap();
    let agents = Agents::new().with_auditor(
        ScriptedAdapter::new("gemini")
            .with_reply("Audit file: src/beta.rs", ScriptedReply::output(CRITICAL))
            .with_default(ScriptedReply::output(APPROVE)),
    );
    let orchestrator = Orchestrator::new(dir.path(), agents.roles());

    let session = orchestrator.start("task", config()).await.unwrap();
    assert_eq!(session.phase, Phase::MaxIterations);
    assert!(matches!(
        session.files["src/beta.rs"].outcome,
        Some(FileOutcome::Rejected { .. })
    ));
    assert_eq!(agents.consultant.calls_matching("Consult on file: src/beta.rs"), 1);
    assert!(agents.executor.calls().iter().any(|p| p.contains("Extract a helper")));
    // two regular passes plus the final one
    assert_eq!(session.files["src/beta.rs"].audit_calls, 3);
    assert!(session.last_error.unwrap().contains("src/beta.rs"));
}

#[tokio::test]
async fn test_dry_run_leaves_repository_untouched() {
    let dir = tempdir().unwrap();
    std::fs::create_dir_all(dir.path().join("src")).unwrap();
    std::fs::write(dir.path().join("src/alpha.rs"), "fn alpha() {}\n").unwrap();
    let before = snapshot(dir.path());

    let agents = Agents::new();
    let orchestrator = Orchestrator::new(dir.path(), agents.roles());
    let report = orchestrator.dry_run("task", config()).await.unwrap();

    assert_eq!(snapshot(dir.path()), before);
    assert!(!dir.path().join(".cadence").exists());
    assert_eq!(agents.executor.call_count(), 0);
    assert_eq!(agents.auditor.call_count(), 0);
    assert_eq!(report.plan.files.len(), 3);
    assert_eq!(report.files[0].action, SimulatedAction::Modify);
    assert_eq!(report.files[1].action, SimulatedAction::Create);
    assert_eq!(report.files[0].language.as_deref(), Some("rust"));
    assert_eq!(report.max_audit_passes, 3);
    assert!(orchestrator.list().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_waits_for_approval_then_resumes() {
    let dir = tempdir().unwrap();
    let store = Arc::new(MemorySessionStore::new());
    let agents = Agents::new();
    let cfg = OrchestratorConfig {
        auto_approve: false,
        ..config()
    };

    let orchestrator = Orchestrator::new(dir.path(), agents.roles()).with_store(store.clone());
    let waiting = orchestrator.start("task", cfg).await.unwrap();
    assert_eq!(waiting.phase, Phase::AwaitingApproval);
    assert!(waiting.can_resume);
    assert_eq!(agents.executor.call_count(), 0);

    let approving = Orchestrator::new(dir.path(), agents.roles())
        .with_store(store.clone())
        .with_approval(Arc::new(FixedApproval(ApprovalDecision::Approved)));
    let done = approving.resume(&waiting.session_id).await.unwrap();
    assert_eq!(done.phase, Phase::Completed);
    assert_eq!(agents.architect.call_count(), 1);

    // Terminal sessions come back unchanged
    let again = approving.resume(&waiting.session_id).await.unwrap();
    assert_eq!(again.checkpoints.len(), done.checkpoints.len());
}

#[tokio::test]
async fn test_rejected_plan() {
    let dir = tempdir().unwrap();
    let agents = Agents::new();
    let orchestrator = Orchestrator::new(dir.path(), agents.roles()).with_approval(Arc::new(
        FixedApproval(ApprovalDecision::Rejected {
            reason: "too broad".into(),
        }),
    ));
    let cfg = OrchestratorConfig {
        auto_approve: false,
        ..config()
    };

    let session = orchestrator.start("task", cfg).await.unwrap();
    assert_eq!(session.phase, Phase::Rejected);
    assert!(session.last_error.unwrap().contains("too broad"));
    assert_eq!(agents.executor.call_count(), 0);
}

#[tokio::test]
async fn test_cancellation_fails_session_and_keeps_checkpoints() {
    let dir = tempdir().unwrap();
    let agents = Agents::new().with_executor(
        ScriptedAdapter::new("codex")
            .with_default(ScriptedReply::output(CODE))
            .with_delay(Duration::from_secs(10)),
    );
    let cancel = CancellationToken::new();
    let orchestrator =
        Orchestrator::new(dir.path(), agents.roles()).with_cancellation(cancel.clone());

    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        trigger.cancel();
    });

    let session = orchestrator.start("task", config()).await.unwrap();
    assert_eq!(session.phase, Phase::Failed);
    assert!(session.last_error.unwrap().contains("cancelled by caller"));
    assert!(session
        .files
        .values()
        .all(|p| p.outcome == Some(FileOutcome::Interrupted)));
    // Planning and approval were completed before the cancel
    assert!(session
        .checkpoints
        .iter()
        .any(|c| c.phase == Phase::AwaitingApproval));
}

#[tokio::test]
async fn test_session_timeout() {
    let dir = tempdir().unwrap();
    let agents = Agents::new().with_executor(
        ScriptedAdapter::new("codex")
            .with_default(ScriptedReply::output(CODE))
            .with_delay(Duration::from_secs(30)),
    );
    let orchestrator = Orchestrator::new(dir.path(), agents.roles());
    let cfg = OrchestratorConfig {
        session_timeout_secs: Some(1),
        ..config()
    };

    let session = orchestrator.start("task", cfg).await.unwrap();
    assert_eq!(session.phase, Phase::Failed);
    assert!(session.last_error.unwrap().contains("session timeout"));
}

struct RecordingRunner {
    success: bool,
}

#[async_trait]
impl TestRunner for RecordingRunner {
    async fn run(&self, _root: &Path, command: &str) -> Result<TestResult> {
        Ok(TestResult {
            success: self.success,
            passed: 3,
            failed: if self.success { 0 } else { 1 },
            command: command.to_string(),
            ..Default::default()
        })
    }
}

#[derive(Default)]
struct RecordingCommitter {
    commits: Mutex<Vec<(Vec<String>, String)>>,
}

#[async_trait]
impl Committer for RecordingCommitter {
    async fn commit(&self, _root: &Path, files: &[String], message: &str) -> Result<String> {
        self.commits
            .lock()
            .unwrap()
            .push((files.to_vec(), message.to_string()));
        Ok("abc1234".to_string())
    }
}

#[tokio::test]
async fn test_tests_and_commit() {
    let dir = tempdir().unwrap();
    let committer = Arc::new(RecordingCommitter::default());
    let orchestrator = Orchestrator::new(dir.path(), Agents::new().roles())
        .with_test_runner(Arc::new(RecordingRunner { success: true }))
        .with_committer(committer.clone());
    let cfg = OrchestratorConfig {
        run_tests: true,
        test_command: Some("cargo test".into()),
        git_commit: true,
        commit_message: Some("refactor: split parser".into()),
        ..config()
    };

    let session = orchestrator.start("task", cfg).await.unwrap();
    assert_eq!(session.phase, Phase::Completed);
    let commits = committer.commits.lock().unwrap();
    assert_eq!(commits.len(), 1);
    assert_eq!(commits[0].0.len(), 3);
    assert_eq!(commits[0].1, "refactor: split parser");
    assert!(session.checkpoints.iter().any(|c| c.phase == Phase::Testing));
}

#[tokio::test]
async fn test_failing_tests_policy() {
    let cfg = OrchestratorConfig {
        run_tests: true,
        test_command: Some("pytest".into()),
        ..config()
    };

    let dir = tempdir().unwrap();
    let orchestrator = Orchestrator::new(dir.path(), Agents::new().roles())
        .with_test_runner(Arc::new(RecordingRunner { success: false }));
    let session = orchestrator.start("task", cfg.clone()).await.unwrap();
    assert_eq!(session.phase, Phase::Failed);
    assert!(session.last_error.unwrap().contains("Tests failed"));

    let dir = tempdir().unwrap();
    let orchestrator = Orchestrator::new(dir.path(), Agents::new().roles())
        .with_test_runner(Arc::new(RecordingRunner { success: false }));
    let optional = OrchestratorConfig {
        tests_required: false,
        ..cfg
    };
    let session = orchestrator.start("task", optional).await.unwrap();
    assert_eq!(session.phase, Phase::Completed);
    assert_eq!(session.warnings.len(), 1);
}

#[tokio::test]
async fn test_rerun_files_skips_planning() {
    let dir = tempdir().unwrap();
    let agents = Agents::new();
    let orchestrator = Orchestrator::new(dir.path(), agents.roles());

    let session = orchestrator
        .rerun_files("task", PLAN, vec!["src/beta.rs".to_string()], config())
        .await
        .unwrap();
    assert_eq!(session.phase, Phase::Completed);
    assert_eq!(session.files.len(), 1);
    assert_eq!(agents.architect.call_count(), 0);
    assert_eq!(agents.executor.calls_matching("Implement file: src/beta.rs"), 1);
    assert_eq!(agents.executor.calls_matching("Implement file: src/alpha.rs"), 0);

    let plan = orchestrator.plan(&session.session_id).await.unwrap().unwrap();
    assert_eq!(plan.files[0].description, "parser");
}

#[tokio::test]
async fn test_fallback_to_second_executor() {
    let dir = tempdir().unwrap();
    let broken = Arc::new(ScriptedAdapter::failing("codex", ErrorCategory::Connection));
    let working =
        Arc::new(ScriptedAdapter::new("claude").with_default(ScriptedReply::output(CODE)));
    let mut agents = Agents::new();
    agents.architect = Arc::new(
        ScriptedAdapter::new("claude")
            .with_default(ScriptedReply::output("FILE: src/alpha.rs - one")),
    );
    let mut roles = agents.roles();
    roles.executor = chain(AgentRole::Executor, &[broken.clone(), working.clone()]);
    let orchestrator = Orchestrator::new(dir.path(), roles);

    let session = orchestrator.start("task", config()).await.unwrap();
    assert_eq!(session.phase, Phase::Completed);
    assert_eq!(broken.call_count(), 1);
    assert_eq!(working.call_count(), 1);

    let metrics = orchestrator.metrics(&session.session_id).await.unwrap().unwrap();
    assert_eq!(metrics.roles[&AgentRole::Executor].fallbacks, 1);
}

#[tokio::test]
async fn test_list_and_clean() {
    let dir = tempdir().unwrap();
    let orchestrator = Orchestrator::new(dir.path(), Agents::new().roles());
    let first = orchestrator.start("first", config()).await.unwrap();
    let second = orchestrator.start("second", config()).await.unwrap();

    let listed = orchestrator.list().await.unwrap();
    assert_eq!(listed.len(), 2);

    assert!(orchestrator.clean(&first.session_id).await.unwrap());
    assert!(!orchestrator.clean(&first.session_id).await.unwrap());
    let listed = orchestrator.list().await.unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].session_id, second.session_id);
    assert!(matches!(
        orchestrator.status(&first.session_id).await,
        Err(CadenceError::SessionNotFound(_))
    ));
}

/// Store that stops accepting writes after a number of checkpoint appends,
/// like a process killed mid-session
struct CrashingStore {
    inner: Arc<MemorySessionStore>,
    appends_left: AtomicUsize,
}

impl CrashingStore {
    fn new(inner: Arc<MemorySessionStore>, appends: usize) -> Self {
        Self {
            inner,
            appends_left: AtomicUsize::new(appends),
        }
    }

    fn alive(&self) -> Result<()> {
        if self.appends_left.load(Ordering::SeqCst) == 0 {
            return Err(CadenceError::StateStore("simulated crash".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl SessionStore for CrashingStore {
    async fn save_session(&self, session: &Session) -> Result<()> {
        self.alive()?;
        self.inner.save_session(session).await
    }

    async fn load_session(&self, id: &SessionId) -> Result<Session> {
        self.inner.load_session(id).await
    }

    async fn save_plan(&self, plan: &Plan) -> Result<()> {
        self.alive()?;
        self.inner.save_plan(plan).await
    }

    async fn load_plan(&self, id: &SessionId) -> Result<Option<Plan>> {
        self.inner.load_plan(id).await
    }

    async fn append_checkpoint(&self, id: &SessionId, checkpoint: &Checkpoint) -> Result<()> {
        self.alive()?;
        if self.appends_left.fetch_sub(1, Ordering::SeqCst) == 1 {
            return Err(CadenceError::StateStore("simulated crash".into()));
        }
        self.inner.append_checkpoint(id, checkpoint).await
    }

    async fn load_checkpoints(&self, id: &SessionId) -> Result<Vec<Checkpoint>> {
        self.inner.load_checkpoints(id).await
    }

    async fn save_metrics(&self, metrics: &SessionMetrics) -> Result<()> {
        self.alive()?;
        self.inner.save_metrics(metrics).await
    }

    async fn load_metrics(&self, id: &SessionId) -> Result<Option<SessionMetrics>> {
        self.inner.load_metrics(id).await
    }

    async fn save_baseline(&self, id: &SessionId, baseline: &Baseline) -> Result<bool> {
        self.alive()?;
        self.inner.save_baseline(id, baseline).await
    }

    async fn load_baseline(&self, id: &SessionId, path: &str) -> Result<Option<Baseline>> {
        self.inner.load_baseline(id, path).await
    }

    async fn list_sessions(&self) -> Result<Vec<SessionSummary>> {
        self.inner.list_sessions().await
    }

    async fn remove(&self, id: &SessionId) -> Result<bool> {
        self.alive()?;
        self.inner.remove(id).await
    }
}

#[tokio::test]
async fn test_resume_after_crash_at_every_checkpoint() {
    let reference = {
        let dir = tempdir().unwrap();
        let agents = Agents::new().with_auditor(auditor_minor_on_beta());
        let session = Orchestrator::new(dir.path(), agents.roles())
            .start("task", config())
            .await
            .unwrap();
        assert_eq!(session.phase, Phase::Completed);
        session
    };
    let total = reference.checkpoints.len();
    assert!(total > 5);

    for crash_at in 1..=total {
        let dir = tempdir().unwrap();
        let memory = Arc::new(MemorySessionStore::new());

        let agents = Agents::new().with_auditor(auditor_minor_on_beta());
        let crashing = Orchestrator::new(dir.path(), agents.roles())
            .with_store(Arc::new(CrashingStore::new(memory.clone(), crash_at)));
        let err = crashing.start("task", config()).await.unwrap_err();
        assert!(matches!(err, CadenceError::StateStore(_)), "crash at {}", crash_at);

        let stored = memory.list_sessions().await.unwrap();
        assert_eq!(stored.len(), 1);
        let id = stored[0].session_id.clone();
        let persisted = memory.load_session(&id).await.unwrap();
        assert!(!persisted.is_terminal(), "crash at {} left {}", crash_at, persisted.phase);
        assert_eq!(persisted.checkpoints.len(), crash_at - 1);

        let agents = Agents::new().with_auditor(auditor_minor_on_beta());
        let resumed = Orchestrator::new(dir.path(), agents.roles())
            .with_store(memory.clone())
            .resume(&id)
            .await
            .unwrap();

        assert_eq!(resumed.phase, reference.phase, "crash at {}", crash_at);
        assert_eq!(outcomes(&resumed), outcomes(&reference), "crash at {}", crash_at);
        assert_checkpoints_ordered(&resumed.checkpoints);
        assert!(resumed.checkpoints.len() >= crash_at - 1);
    }
}
