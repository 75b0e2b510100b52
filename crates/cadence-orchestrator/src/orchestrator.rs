//! Session driver
//!
//! The orchestrator owns the session. Every phase change goes through the
//! pure [`transition`] function and is persisted before any work for the new
//! phase starts. Workers report through events; this module is the single
//! writer for sessions, checkpoints and metrics.

use cadence_agent::{AgentResult, ErrorCategory, FallbackChain};
use cadence_core::fail_open::{fail_open, fail_open_sync};
use cadence_core::{
    AgentRole, AgentState, CadenceError, Checkpoint, CheckpointMarker, FileOutcome, FileStage,
    OrchestratorConfig, Phase, Plan, PlannedFile, Result, Session, SessionId,
};
use cadence_state::{
    Baseline, FsSessionStore, MemorySessionStore, SessionMetrics, SessionStore, SessionSummary,
};
use futures::FutureExt;
use serde::Serialize;
use std::collections::{BTreeMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::approval::{ApprovalDecision, ApprovalGate};
use crate::audit::{LeniencyPolicy, StandardLeniency};
use crate::commit::{commit_message, Committer, GitCommitter};
use crate::concurrency::{ConcurrencyController, ExecutionMode};
use crate::events::{FileEvent, FileEventKind};
use crate::plan::build_plan;
use crate::prompt::planning_prompt;
use crate::recovery::revert_file;
use crate::state_machine::{is_file_phase, pending_work, transition, Action, Event};
use crate::syntax::{detect_language, BracketValidator, SyntaxValidator};
use crate::testing::{CommandTestRunner, TestRunner};
use crate::watch::{Retrigger, WatchController};
use crate::worker::{FileWork, FileWorker, ResumePoint};
use crate::workspace::{validate_path, Workspace, WriteJournal};

/// Fallback chains for the four roles
#[derive(Clone)]
pub struct RoleAgents {
    pub architect: Arc<FallbackChain>,
    pub executor: Arc<FallbackChain>,
    pub auditor: Arc<FallbackChain>,
    /// Optional; without one the final pass follows the last rejection directly
    pub consultant: Option<Arc<FallbackChain>>,
}

/// Progress notifications for a UI layer
#[derive(Debug, Clone)]
pub enum ProgressEvent {
    Phase {
        session_id: SessionId,
        from: Phase,
        to: Phase,
    },
    File(FileEvent),
}

/// Progress callback; errors are logged and otherwise ignored
pub type ProgressFn = Arc<dyn Fn(&ProgressEvent) -> Result<()> + Send + Sync>;

/// What a dry run would do to one planned file
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum SimulatedAction {
    Create,
    Modify,
    Skip { reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SimulatedFile {
    pub path: String,
    pub description: String,
    pub language: Option<String>,
    #[serde(flatten)]
    pub action: SimulatedAction,
}

/// Result of a dry run: the real plan plus the simulated per-file work
#[derive(Debug, Clone, Serialize)]
pub struct DryRunReport {
    pub session_id: SessionId,
    pub plan: Plan,
    pub mode: ExecutionMode,
    pub files: Vec<SimulatedFile>,
    /// Audit passes per file at most, counting the final lenient pass
    pub max_audit_passes: u32,
    pub would_run_tests: bool,
    pub would_commit: bool,
}

/// Plan supplied by the caller instead of the architect
struct PresetPlan {
    text: String,
    files: Vec<String>,
}

/// Mutable state of one driven session
struct Run {
    session: Session,
    metrics: SessionMetrics,
    plan: Option<Plan>,
    preset: Option<PresetPlan>,
    cancel: CancellationToken,
    timed_out: Arc<AtomicBool>,
}

impl Run {
    fn new(session: Session, metrics: SessionMetrics, cancel: CancellationToken) -> Self {
        Self {
            session,
            metrics,
            plan: None,
            preset: None,
            cancel,
            timed_out: Arc::new(AtomicBool::new(false)),
        }
    }

    fn cancel_reason(&self) -> String {
        if self.timed_out.load(Ordering::SeqCst) {
            format!(
                "session timeout after {}s",
                self.session.config.session_timeout_secs.unwrap_or_default()
            )
        } else {
            "cancelled by caller".to_string()
        }
    }

    fn file(&mut self, path: &str) -> &mut cadence_core::FileProgress {
        self.session.files.entry(path.to_string()).or_default()
    }

    fn record_call(&mut self, role: AgentRole, result: &AgentResult) {
        self.metrics.record_call(
            role,
            result.success,
            result.duration_ms,
            result.fallbacks,
            result
                .usage
                .map(|u| (u.input_tokens as u64, u.output_tokens as u64)),
        );
        let state = if result.success {
            AgentState::Completed
        } else {
            AgentState::Failed
        };
        self.session
            .record_agent(role, state, Some(result.duration_ms));
    }
}

/// Dispatch bookkeeping shared by file events
struct DispatchState {
    cancel: CancellationToken,
    fatal: Option<String>,
}

pub struct Orchestrator {
    workspace: Workspace,
    journal: WriteJournal,
    agents: RoleAgents,
    store: Arc<dyn SessionStore>,
    validator: Option<Arc<dyn SyntaxValidator>>,
    policy: Arc<dyn LeniencyPolicy>,
    approval: Option<Arc<dyn ApprovalGate>>,
    test_runner: Arc<dyn TestRunner>,
    committer: Arc<dyn Committer>,
    progress: Option<ProgressFn>,
    cancel: CancellationToken,
}

impl Orchestrator {
    /// Orchestrator for the repository at `root`, persisting under
    /// `<root>/.cadence/sessions`
    pub fn new(root: impl Into<PathBuf>, agents: RoleAgents) -> Self {
        let root = root.into();
        let journal = WriteJournal::new();
        Self {
            workspace: Workspace::new(&root).with_journal(journal.clone()),
            journal,
            store: Arc::new(FsSessionStore::new(&root)),
            agents,
            validator: None,
            policy: Arc::new(StandardLeniency),
            approval: None,
            test_runner: Arc::new(CommandTestRunner),
            committer: Arc::new(GitCommitter),
            progress: None,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_store(mut self, store: Arc<dyn SessionStore>) -> Self {
        self.store = store;
        self
    }

    /// Replace the default bracket validator
    pub fn with_validator(mut self, validator: Arc<dyn SyntaxValidator>) -> Self {
        self.validator = Some(validator);
        self
    }

    pub fn with_policy(mut self, policy: Arc<dyn LeniencyPolicy>) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_approval(mut self, gate: Arc<dyn ApprovalGate>) -> Self {
        self.approval = Some(gate);
        self
    }

    pub fn with_test_runner(mut self, runner: Arc<dyn TestRunner>) -> Self {
        self.test_runner = runner;
        self
    }

    pub fn with_committer(mut self, committer: Arc<dyn Committer>) -> Self {
        self.committer = committer;
        self
    }

    pub fn with_progress(mut self, progress: ProgressFn) -> Self {
        self.progress = Some(progress);
        self
    }

    /// Token that cancels every session this orchestrator drives
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn root(&self) -> &Path {
        self.workspace.root()
    }

    pub fn store(&self) -> &Arc<dyn SessionStore> {
        &self.store
    }

    // ------------------------------------------------------------------
    // Commands
    // ------------------------------------------------------------------

    /// Run a new session to a terminal phase (or until it waits for approval)
    #[instrument(skip(self, task, config))]
    pub async fn start(&self, task: &str, config: OrchestratorConfig) -> Result<Session> {
        config.validate()?;
        let session = Session::new(SessionId::generate(), task, config);
        info!("Starting session {}", session.session_id);
        self.launch(session, None, self.cancel.child_token()).await
    }

    /// [`start`](Self::start) with the pipeline execution mode forced on
    pub async fn pipeline(&self, task: &str, mut config: OrchestratorConfig) -> Result<Session> {
        config.pipeline = true;
        self.start(task, config).await
    }

    /// Continue a persisted session from its last completed unit of work
    ///
    /// Terminal sessions are returned unchanged.
    #[instrument(skip(self))]
    pub async fn resume(&self, id: &SessionId) -> Result<Session> {
        let session = self.store.load_session(id).await?;
        if session.is_terminal() {
            info!("Session {} is already {}", id, session.phase);
            return Ok(session);
        }

        let metrics = fail_open("load metrics", || self.store.load_metrics(id))
            .await
            .flatten()
            .unwrap_or_else(|| SessionMetrics::new(id.clone()));
        let plan = self.store.load_plan(id).await?;

        let mut run = Run::new(session, metrics, self.cancel.child_token());
        run.plan = plan;

        let actions = if run.session.phase == Phase::Init {
            self.apply(&mut run, Event::Start).await?
        } else {
            pending_work(run.session.phase).into_iter().collect()
        };
        info!(
            "Resuming session {} in {} with {} checkpoint(s)",
            id,
            run.session.phase,
            run.session.checkpoints.len()
        );
        self.execute(run, actions).await
    }

    /// Plan for real, then report what execution would do without touching
    /// the repository or the session store
    #[instrument(skip(self, task, config))]
    pub async fn dry_run(&self, task: &str, config: OrchestratorConfig) -> Result<DryRunReport> {
        config.validate()?;
        let scratch = MemorySessionStore::new();
        let session = Session::new(SessionId::generate(), task, config.clone());
        scratch.save_session(&session).await?;

        let prompt = planning_prompt(&config, task);
        let cancel = self.cancel.child_token();
        let result = self.agents.architect.execute(&prompt, None, &cancel).await;
        if !result.success {
            return Err(CadenceError::Provider(result.error_message()));
        }
        let plan = build_plan(session.session_id.clone(), &result.output, result.provider.clone());
        scratch.save_plan(&plan).await?;

        let mut files = Vec::with_capacity(plan.files.len());
        for planned in &plan.files {
            let action = match validate_path(&planned.path) {
                Err(e) => SimulatedAction::Skip {
                    reason: e.to_string(),
                },
                Ok(_) => match self.workspace.read(&planned.path).await {
                    Ok(Some(_)) => SimulatedAction::Modify,
                    Ok(None) => SimulatedAction::Create,
                    Err(e) => SimulatedAction::Skip {
                        reason: e.to_string(),
                    },
                },
            };
            files.push(SimulatedFile {
                path: planned.path.clone(),
                description: planned.description.clone(),
                language: detect_language(&planned.path).map(str::to_string),
                action,
            });
        }

        info!("Dry run planned {} file(s)", files.len());
        Ok(DryRunReport {
            session_id: session.session_id,
            plan,
            mode: ExecutionMode::from_config(&config),
            files,
            max_audit_passes: config.max_iterations + 1,
            would_run_tests: config.run_tests,
            would_commit: config.git_commit,
        })
    }

    pub async fn status(&self, id: &SessionId) -> Result<Session> {
        self.store.load_session(id).await
    }

    pub async fn plan(&self, id: &SessionId) -> Result<Option<Plan>> {
        self.store.load_plan(id).await
    }

    pub async fn metrics(&self, id: &SessionId) -> Result<Option<SessionMetrics>> {
        self.store.load_metrics(id).await
    }

    /// Delete a session's stored state
    pub async fn clean(&self, id: &SessionId) -> Result<bool> {
        let removed = self.store.remove(id).await?;
        if removed {
            info!("Removed session {}", id);
        }
        Ok(removed)
    }

    pub async fn list(&self) -> Result<Vec<SessionSummary>> {
        self.store.list_sessions().await
    }

    /// New session that re-runs `files` against an existing plan, skipping
    /// planning and approval
    pub async fn rerun_files(
        &self,
        task: &str,
        plan_text: &str,
        files: Vec<String>,
        config: OrchestratorConfig,
    ) -> Result<Session> {
        self.rerun_with(task, plan_text, files, config, self.cancel.child_token())
            .await
    }

    async fn rerun_with(
        &self,
        task: &str,
        plan_text: &str,
        files: Vec<String>,
        mut config: OrchestratorConfig,
        cancel: CancellationToken,
    ) -> Result<Session> {
        config.auto_approve = true;
        config.validate()?;
        let session = Session::new(SessionId::generate(), task, config);
        info!(
            "Re-running {} file(s) in session {}",
            files.len(),
            session.session_id
        );
        let preset = PresetPlan {
            text: plan_text.to_string(),
            files,
        };
        self.launch(session, Some(preset), cancel).await
    }

    /// Run once, then re-run changed files until `cancel` fires
    ///
    /// Returns the number of re-runs started.
    pub async fn watch(
        self: Arc<Self>,
        task: &str,
        config: OrchestratorConfig,
        cancel: CancellationToken,
    ) -> Result<u32> {
        let initial = self.start(task, config.clone()).await?;
        let plan_text = self
            .store
            .load_plan(&initial.session_id)
            .await?
            .map(|p| p.text)
            .unwrap_or_default();

        let this = self.clone();
        let task = task.to_string();
        let run_config = config.clone();
        let retrigger: Retrigger = Arc::new(move |files: Vec<String>, token: CancellationToken| {
            let this = this.clone();
            let task = task.clone();
            let plan_text = plan_text.clone();
            let config = run_config.clone();
            async move {
                this.rerun_with(&task, &plan_text, files, config, token)
                    .await
                    .map(|_| ())
            }
            .boxed()
        });

        let controller = WatchController::new(
            self.workspace.root(),
            &config.watch_patterns,
            Duration::from_millis(config.watch_debounce_ms),
            retrigger,
        )?
        .with_journal(self.journal.clone());
        controller.run(cancel).await
    }

    // ------------------------------------------------------------------
    // Driver
    // ------------------------------------------------------------------

    async fn launch(
        &self,
        session: Session,
        preset: Option<PresetPlan>,
        cancel: CancellationToken,
    ) -> Result<Session> {
        self.store.save_session(&session).await?;
        let metrics = SessionMetrics::new(session.session_id.clone());
        let mut run = Run::new(session, metrics, cancel);
        run.preset = preset;
        let actions = self.apply(&mut run, Event::Start).await?;
        self.execute(run, actions).await
    }

    async fn execute(&self, mut run: Run, actions: Vec<Action>) -> Result<Session> {
        let timer = run.session.config.session_timeout_secs.map(|secs| {
            let token = run.cancel.clone();
            let flag = run.timed_out.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_secs(secs)).await;
                flag.store(true, Ordering::SeqCst);
                token.cancel();
            })
        });

        let outcome = self.drive(&mut run, actions).await;
        if let Some(timer) = timer {
            timer.abort();
        }
        self.save_metrics(&run).await;

        match outcome {
            Ok(()) => {
                info!(
                    "Session {} stopped in {}",
                    run.session.session_id, run.session.phase
                );
                Ok(run.session)
            }
            Err(e) => {
                error!("Session {} aborted: {}", run.session.session_id, e);
                if e.is_session_fatal() && !run.session.is_terminal() {
                    let mut failed = run.session.clone();
                    failed.phase = Phase::Failed;
                    failed.can_resume = false;
                    failed.last_error = Some(e.to_string());
                    failed.touch();
                    fail_open("persist failed session", || self.store.save_session(&failed)).await;
                }
                Err(e)
            }
        }
    }

    async fn drive(&self, run: &mut Run, actions: Vec<Action>) -> Result<()> {
        let mut queue: VecDeque<Action> = actions.into();

        while let Some(action) = queue.pop_front() {
            if run.session.is_terminal() {
                break;
            }

            let event = if run.cancel.is_cancelled() {
                Some(Event::Cancelled {
                    reason: run.cancel_reason(),
                })
            } else {
                match action {
                    Action::InvokeRole {
                        role: AgentRole::Architect,
                    } => self.plan_step(run).await?,
                    Action::RequestApproval => self.approval_step(run).await?,
                    Action::DispatchFiles => self.dispatch_step(run).await?,
                    Action::RunTests => self.test_step(run).await?,
                    Action::Commit => self.commit_step(run).await?,
                    other => {
                        debug!("No driver work for {:?}", other);
                        None
                    }
                }
            };

            let Some(event) = event else {
                break;
            };
            queue.extend(self.apply(run, event).await?);
        }
        Ok(())
    }

    /// Apply an event to the session, persist it, and return the work the
    /// new phase requires
    async fn apply(&self, run: &mut Run, event: Event) -> Result<Vec<Action>> {
        let from = run.session.phase;
        let (to, actions) = transition(from, event);

        for action in &actions {
            match action {
                Action::LogActivity { message } => {
                    info!(session = %run.session.session_id, "{}", message)
                }
                Action::RecordWarning { message } => {
                    warn!(session = %run.session.session_id, "{}", message);
                    run.session.warnings.push(message.clone());
                }
                Action::RecordError { message } => {
                    run.session.last_error = Some(message.clone());
                }
                _ => {}
            }
        }

        if to != from {
            // Moves among auditing/fixing/consulting mirror file activity and
            // complete nothing
            let mirror = is_file_phase(to) && is_file_phase(from) && from != Phase::Executing;
            if !to.is_failure() && !mirror {
                let iteration = run.session.iteration;
                self.checkpoint(run, None, iteration, CheckpointMarker::PhaseCompleted)
                    .await?;
            }
            run.session.phase = to;
            self.report(ProgressEvent::Phase {
                session_id: run.session.session_id.clone(),
                from,
                to,
            });
        }

        run.session.can_resume = !to.is_terminal();
        run.session.touch();
        self.store.save_session(&run.session).await?;

        Ok(actions.into_iter().filter(Action::is_work).collect())
    }

    async fn checkpoint(
        &self,
        run: &mut Run,
        file: Option<String>,
        iteration: u32,
        marker: CheckpointMarker,
    ) -> Result<()> {
        let checkpoint = Checkpoint::new(
            run.session.next_checkpoint_id(),
            run.session.phase,
            file,
            iteration,
            marker,
        );
        self.store
            .append_checkpoint(&run.session.session_id, &checkpoint)
            .await?;
        run.session.checkpoints.push(checkpoint);
        Ok(())
    }

    fn report(&self, event: ProgressEvent) {
        if let Some(progress) = &self.progress {
            fail_open_sync("progress callback", || (progress.as_ref())(&event));
        }
    }

    async fn save_metrics(&self, run: &Run) {
        fail_open("save metrics", || self.store.save_metrics(&run.metrics)).await;
    }

    // ------------------------------------------------------------------
    // Steps
    // ------------------------------------------------------------------

    async fn plan_step(&self, run: &mut Run) -> Result<Option<Event>> {
        let id = run.session.session_id.clone();
        run.session
            .record_agent(AgentRole::Architect, AgentState::InProgress, None);

        let plan = match run.preset.take() {
            Some(preset) => {
                let mut plan = build_plan(id.clone(), &preset.text, None);
                let described: BTreeMap<String, String> = plan
                    .files
                    .iter()
                    .map(|f| (f.path.clone(), f.description.clone()))
                    .collect();
                plan.files = preset
                    .files
                    .into_iter()
                    .map(|path| PlannedFile {
                        description: described.get(&path).cloned().unwrap_or_default(),
                        path,
                    })
                    .collect();
                run.session
                    .record_agent(AgentRole::Architect, AgentState::NotNeeded, None);
                plan
            }
            None => {
                let prompt = planning_prompt(&run.session.config, &run.session.task);
                let result = self.agents.architect.execute(&prompt, None, &run.cancel).await;
                run.record_call(AgentRole::Architect, &result);

                if !result.success {
                    if result.category() == Some(ErrorCategory::Cancelled) {
                        return Ok(Some(Event::Cancelled {
                            reason: run.cancel_reason(),
                        }));
                    }
                    return Ok(Some(Event::PlanFailed {
                        error: result.error_message(),
                    }));
                }
                if result.fallbacks > 0 {
                    info!(
                        "Plan produced by {} after {} fallback(s)",
                        result.provider.as_deref().unwrap_or("unknown"),
                        result.fallbacks
                    );
                }
                build_plan(id, &result.output, result.provider.clone())
            }
        };

        if let Some(bad) = plan.files.iter().find_map(|f| validate_path(&f.path).err()) {
            return Ok(Some(Event::PlanFailed {
                error: bad.to_string(),
            }));
        }

        self.store.save_plan(&plan).await?;
        for file in &plan.files {
            run.file(&file.path);
        }
        let file_count = plan.files.len();
        run.plan = Some(plan);
        Ok(Some(Event::PlanReady { file_count }))
    }

    async fn approval_step(&self, run: &mut Run) -> Result<Option<Event>> {
        if run.session.config.auto_approve {
            return Ok(Some(Event::Approved));
        }
        let Some(gate) = &self.approval else {
            info!(
                "Session {} awaiting approval; resume it to continue",
                run.session.session_id
            );
            return Ok(None);
        };
        let Some(plan) = &run.plan else {
            return Ok(Some(Event::Fatal {
                error: "Plan missing for approval".to_string(),
            }));
        };

        let decision = tokio::select! {
            _ = run.cancel.cancelled() => {
                return Ok(Some(Event::Cancelled { reason: run.cancel_reason() }));
            }
            decision = gate.review(&run.session, plan) => decision?,
        };
        Ok(Some(match decision {
            ApprovalDecision::Approved => Event::Approved,
            ApprovalDecision::Rejected { reason } => Event::Rejected { reason },
        }))
    }

    async fn dispatch_step(&self, run: &mut Run) -> Result<Option<Event>> {
        let Some(plan) = run.plan.clone() else {
            return Ok(Some(Event::Fatal {
                error: "Plan missing for execution".to_string(),
            }));
        };
        let config = run.session.config.clone();
        let id = run.session.session_id.clone();

        // First snapshot wins, so a resumed session keeps its original baselines
        for file in &plan.files {
            let content = self.workspace.read(&file.path).await?;
            self.store
                .save_baseline(&id, &Baseline::capture(&file.path, content))
                .await?;
        }

        let mut work = Vec::new();
        for file in &plan.files {
            let history: Vec<&Checkpoint> = run
                .session
                .checkpoints
                .iter()
                .filter(|c| c.file.as_deref() == Some(file.path.as_str()))
                .collect();
            let resume = ResumePoint::replay(history, config.max_iterations);
            if let ResumePoint::Settled { outcome } = &resume {
                let progress = run.file(&file.path);
                progress.stage = FileStage::Settled;
                progress.outcome = Some(outcome.clone());
                continue;
            }
            work.push(FileWork::new(&file.path, &file.description).resuming(resume));
        }

        let validator = self
            .validator
            .clone()
            .unwrap_or_else(|| Arc::new(BracketValidator::new(config.languages.clone())));
        let worker = Arc::new(FileWorker::new(
            config.clone(),
            run.session.task.clone(),
            plan.text.clone(),
            self.agents.executor.clone(),
            self.agents.auditor.clone(),
            self.agents.consultant.clone(),
            self.workspace.clone(),
            validator,
            self.policy.clone(),
        ));
        let controller = ConcurrencyController::new(ExecutionMode::from_config(&config));

        for role in [AgentRole::Executor, AgentRole::Auditor] {
            run.session.record_agent(role, AgentState::InProgress, None);
        }
        // A resumed session may have nothing left to execute
        self.check_execution_complete(run).await?;

        let mut state = DispatchState {
            cancel: run.cancel.child_token(),
            fatal: None,
        };
        let (tx, mut rx) = mpsc::unbounded_channel();
        let dispatch = controller.dispatch(work, worker, tx, state.cancel.clone());
        let consume = async {
            while let Some(event) = rx.recv().await {
                if let Err(e) = self.on_file_event(run, &mut state, event).await {
                    state.cancel.cancel();
                    return Err(e);
                }
            }
            Ok::<(), CadenceError>(())
        };
        let (reports, consumed) = tokio::join!(dispatch, consume);
        consumed?;

        for report in reports {
            let progress = run.file(&report.path);
            if progress.outcome.is_none() {
                progress.outcome = Some(report.outcome);
            }
        }
        for (role, status) in run.session.agents.iter_mut() {
            match (role, status.state) {
                (AgentRole::Consultant, AgentState::Pending) => {
                    status.state = AgentState::NotNeeded
                }
                (_, AgentState::InProgress) => status.state = AgentState::Completed,
                _ => {}
            }
        }
        self.save_metrics(run).await;

        if let Some(error) = state.fatal {
            return Ok(Some(Event::Fatal { error }));
        }
        if run.cancel.is_cancelled() {
            return Ok(Some(Event::Cancelled {
                reason: run.cancel_reason(),
            }));
        }
        let rejected = run
            .session
            .files
            .iter()
            .find(|(_, p)| matches!(p.outcome, Some(FileOutcome::Rejected { .. })));
        if let Some((file, _)) = rejected {
            return Ok(Some(Event::IterationsExhausted { file: file.clone() }));
        }
        Ok(Some(Event::FilesSettled {
            run_tests: config.run_tests,
            commit: config.git_commit,
        }))
    }

    /// Leave `executing` once every file has produced content
    async fn check_execution_complete(&self, run: &mut Run) -> Result<()> {
        if run.session.phase != Phase::Executing {
            return Ok(());
        }
        let executed = run
            .session
            .files
            .values()
            .all(|p| !matches!(p.stage, FileStage::Pending | FileStage::Executing));
        if executed {
            self.apply(run, Event::ExecutionComplete).await?;
        }
        Ok(())
    }

    async fn on_file_event(
        &self,
        run: &mut Run,
        state: &mut DispatchState,
        event: FileEvent,
    ) -> Result<()> {
        self.report(ProgressEvent::File(event.clone()));
        let FileEvent {
            file,
            iteration,
            kind,
            ..
        } = event;

        match kind {
            FileEventKind::Call {
                role,
                success,
                duration_ms,
                fallbacks,
                tokens,
            } => {
                run.metrics
                    .record_call(role, success, duration_ms, fallbacks, tokens);
                let agent_state = if success {
                    AgentState::InProgress
                } else {
                    AgentState::Failed
                };
                run.session.record_agent(role, agent_state, Some(duration_ms));
                return Ok(());
            }
            FileEventKind::RecoveryAttempt { reason } => {
                debug!("Recovery retry for {}: {}", file, reason);
                run.metrics.record_recovery_attempt();
                return Ok(());
            }
            FileEventKind::ExecuteStarted => {
                run.file(&file).stage = FileStage::Executing;
            }
            FileEventKind::Executed => {
                let progress = run.file(&file);
                progress.stage = FileStage::Auditing;
                progress.iteration = iteration;
                self.checkpoint(run, Some(file), iteration, CheckpointMarker::Executed)
                    .await?;
            }
            FileEventKind::AuditStarted { .. } => {
                run.file(&file).stage = FileStage::Auditing;
                self.apply(run, Event::AuditStarted).await?;
            }
            FileEventKind::Audited { approved, issues } => {
                run.file(&file).audit_calls += 1;
                self.checkpoint(
                    run,
                    Some(file),
                    iteration,
                    CheckpointMarker::Audited { approved, issues },
                )
                .await?;
            }
            FileEventKind::FixStarted => {
                run.file(&file).stage = FileStage::Fixing;
                self.apply(run, Event::FixStarted).await?;
            }
            FileEventKind::Fixed => {
                run.file(&file).iteration = iteration;
                self.checkpoint(run, Some(file), iteration, CheckpointMarker::Fixed)
                    .await?;
            }
            FileEventKind::ConsultStarted => {
                run.file(&file).stage = FileStage::Consulting;
                self.apply(run, Event::ConsultStarted).await?;
            }
            FileEventKind::Consulted => {
                run.file(&file).iteration = iteration;
                self.checkpoint(run, Some(file), iteration, CheckpointMarker::Consulted)
                    .await?;
            }
            FileEventKind::Settled { outcome } => {
                let progress = run.file(&file);
                progress.stage = FileStage::Settled;
                progress.outcome = Some(outcome.clone());
                self.checkpoint(run, Some(file), iteration, CheckpointMarker::Settled { outcome })
                    .await?;
            }
            FileEventKind::Exhausted { reason } => {
                self.on_exhausted(run, state, &file, iteration, reason)
                    .await?;
            }
            FileEventKind::Fatal { error } => {
                let progress = run.file(&file);
                progress.stage = FileStage::Settled;
                progress.outcome = Some(FileOutcome::Failed {
                    reason: error.clone(),
                });
                state.fatal.get_or_insert(error);
                state.cancel.cancel();
            }
        }

        run.session.iteration = run
            .session
            .files
            .values()
            .map(|p| p.iteration)
            .max()
            .unwrap_or_default();
        self.check_execution_complete(run).await?;
        run.session.touch();
        self.store.save_session(&run.session).await
    }

    async fn on_exhausted(
        &self,
        run: &mut Run,
        state: &mut DispatchState,
        file: &str,
        iteration: u32,
        reason: String,
    ) -> Result<()> {
        run.file(file).stage = FileStage::Settled;

        if !run.session.config.auto_revert_on_failure {
            run.file(file).outcome = Some(FileOutcome::Failed {
                reason: reason.clone(),
            });
            state
                .fatal
                .get_or_insert(format!("Recovery exhausted for {}: {}", file, reason));
            state.cancel.cancel();
            return Ok(());
        }

        match revert_file(
            self.store.as_ref(),
            &self.workspace,
            &run.session.session_id,
            file,
        )
        .await
        {
            Ok(()) => {
                run.metrics.record_revert();
                let message = format!("Reverted {} after recovery failed: {}", file, reason);
                warn!("{}", message);
                run.session.warnings.push(message);
                let outcome = FileOutcome::Reverted { reason };
                run.file(file).outcome = Some(outcome.clone());
                self.checkpoint(
                    run,
                    Some(file.to_string()),
                    iteration,
                    CheckpointMarker::Settled { outcome },
                )
                .await
            }
            Err(e) => {
                run.file(file).outcome = Some(FileOutcome::Failed {
                    reason: reason.clone(),
                });
                state
                    .fatal
                    .get_or_insert(format!("Failed to revert {}: {}", file, e));
                state.cancel.cancel();
                Ok(())
            }
        }
    }

    async fn test_step(&self, run: &mut Run) -> Result<Option<Event>> {
        let config = &run.session.config;
        let commit = config.git_commit;
        let mandatory = config.tests_required;
        let Some(command) = config.test_command.clone() else {
            return Ok(Some(Event::TestsFailed {
                mandatory,
                summary: "no test command configured".to_string(),
                commit,
            }));
        };

        let outcome = tokio::select! {
            _ = run.cancel.cancelled() => {
                return Ok(Some(Event::Cancelled { reason: run.cancel_reason() }));
            }
            outcome = self.test_runner.run(self.workspace.root(), &command) => outcome,
        };

        Ok(Some(match outcome {
            Ok(result) if result.success => {
                info!(
                    "Tests passed ({} passed, {} skipped)",
                    result.passed, result.skipped
                );
                Event::TestsPassed { commit }
            }
            Ok(result) => Event::TestsFailed {
                mandatory,
                summary: format!(
                    "{}: {} passed, {} failed",
                    result.command, result.passed, result.failed
                ),
                commit,
            },
            Err(e) => Event::TestsFailed {
                mandatory,
                summary: e.to_string(),
                commit,
            },
        }))
    }

    async fn commit_step(&self, run: &mut Run) -> Result<Option<Event>> {
        let files: Vec<String> = run
            .session
            .accepted_files()
            .into_iter()
            .map(str::to_string)
            .collect();
        let message = commit_message(
            run.session.config.commit_message.as_deref(),
            &run.session.task,
        );

        let outcome = tokio::select! {
            _ = run.cancel.cancelled() => {
                return Ok(Some(Event::Cancelled { reason: run.cancel_reason() }));
            }
            outcome = self.committer.commit(self.workspace.root(), &files, &message) => outcome,
        };

        Ok(Some(match outcome {
            Ok(rev) => {
                info!("Committed {} file(s) as {}", files.len(), rev);
                Event::Committed
            }
            Err(e) => Event::CommitFailed {
                error: e.to_string(),
            },
        }))
    }
}
