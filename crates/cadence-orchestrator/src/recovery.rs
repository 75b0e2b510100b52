//! Bounded recovery for per-file work
//!
//! Every executor, auditor and consultant call a file worker makes goes
//! through [`RecoveryManager`]. Each operation gets `max_attempts` tries with
//! linear backoff, and the retries plus all fix work for one file share a
//! wall-clock budget tracked by its [`RecoveryClock`]. Running out of either
//! yields [`CadenceError::RecoveryExhausted`]; the orchestrator then reverts
//! the file or fails the session.

use cadence_agent::{AgentResult, ErrorCategory, FallbackChain};
use cadence_core::{
    AgentRole, AuditIssue, CadenceError, OrchestratorConfig, Result, SessionId, Severity,
};
use cadence_state::SessionStore;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::events::{EventSink, FileEventKind};
use crate::prompt::{execute_prompt, extract_code_block, fix_prompt, regenerate_prompt};
use crate::syntax::{looks_like_code, SyntaxValidator};
use crate::workspace::Workspace;

/// Attempt and time limits
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecoveryBudget {
    pub max_attempts: u32,
    pub wall_clock: Duration,
    pub backoff: Duration,
}

impl RecoveryBudget {
    pub fn from_config(config: &OrchestratorConfig) -> Self {
        Self {
            max_attempts: config.max_recovery_attempts.max(1),
            wall_clock: Duration::from_secs(config.recovery_timeout_minutes * 60),
            backoff: Duration::from_millis(config.recovery_backoff_ms),
        }
    }

    /// Delay before retry number `retry` (1-based)
    pub fn backoff_for(&self, retry: u32) -> Duration {
        self.backoff * retry
    }
}

/// Cumulative recovery time for one file
#[derive(Debug, Default, Clone, Copy)]
pub struct RecoveryClock {
    spent: Duration,
}

impl RecoveryClock {
    pub fn spent(&self) -> Duration {
        self.spent
    }

    /// Budget left, zero once exhausted
    pub fn remaining(&self, budget: &RecoveryBudget) -> Duration {
        budget.wall_clock.saturating_sub(self.spent)
    }

    fn charge(&mut self, elapsed: Duration) {
        self.spent += elapsed;
    }
}

/// What the executor is asked to produce
#[derive(Debug, Clone, Copy)]
pub enum Produce<'a> {
    /// First version of the file
    Initial,
    /// Targeted fix of the current content
    Fix {
        issues: &'a [AuditIssue],
        advice: Option<&'a str>,
    },
}

/// Shared, per-session recovery context
pub struct RecoveryManager {
    config: OrchestratorConfig,
    budget: RecoveryBudget,
    task: String,
    plan: String,
    executor: Arc<FallbackChain>,
    workspace: Workspace,
    validator: Arc<dyn SyntaxValidator>,
}

fn exhausted(file: &str, reason: impl Into<String>) -> CadenceError {
    CadenceError::RecoveryExhausted {
        file: file.to_string(),
        reason: reason.into(),
    }
}

impl RecoveryManager {
    pub fn new(
        config: OrchestratorConfig,
        task: impl Into<String>,
        plan: impl Into<String>,
        executor: Arc<FallbackChain>,
        workspace: Workspace,
        validator: Arc<dyn SyntaxValidator>,
    ) -> Self {
        Self {
            budget: RecoveryBudget::from_config(&config),
            config,
            task: task.into(),
            plan: plan.into(),
            executor,
            workspace,
            validator,
        }
    }

    /// Replace the limits derived from the config
    pub fn with_budget(mut self, budget: RecoveryBudget) -> Self {
        self.budget = budget;
        self
    }

    pub fn budget(&self) -> RecoveryBudget {
        self.budget
    }

    fn over_budget(&self, file: &str) -> CadenceError {
        exhausted(
            file,
            format!(
                "recovery time budget of {}s exceeded",
                self.budget.wall_clock.as_secs()
            ),
        )
    }

    fn check_budget(&self, file: &str, clock: &RecoveryClock) -> Result<()> {
        if clock.remaining(&self.budget).is_zero() {
            return Err(self.over_budget(file));
        }
        Ok(())
    }

    /// Run one provider call, charging it to the clock when `charged`
    ///
    /// A charged call is cut off when it would outlive the remaining budget.
    async fn call<F>(
        &self,
        file: &str,
        clock: &mut RecoveryClock,
        charged: bool,
        call: F,
    ) -> Result<AgentResult>
    where
        F: Future<Output = AgentResult>,
    {
        if !charged {
            return Ok(call.await);
        }

        let started = Instant::now();
        let outcome = tokio::time::timeout(clock.remaining(&self.budget), call).await;
        clock.charge(started.elapsed());
        match outcome {
            Ok(result) => Ok(result),
            Err(_) => {
                warn!("Recovery budget for {} ran out during a provider call", file);
                Err(self.over_budget(file))
            }
        }
    }

    async fn backoff(
        &self,
        clock: &mut RecoveryClock,
        retry: u32,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let delay = self.budget.backoff_for(retry);
        if delay.is_zero() {
            return Ok(());
        }
        tokio::select! {
            _ = cancel.cancelled() => Err(CadenceError::Cancelled),
            _ = tokio::time::sleep(delay) => {
                clock.charge(delay);
                Ok(())
            }
        }
    }

    fn produce_prompt(
        &self,
        file: &str,
        description: &str,
        request: Produce<'_>,
        current: Option<&str>,
        draft: Option<&(String, Vec<AuditIssue>)>,
        last_reason: &str,
    ) -> String {
        // A rejected draft (syntax errors) takes precedence over disk content
        if let Some((content, syntax_issues)) = draft {
            if looks_like_code(content) {
                let mut issues = syntax_issues.clone();
                if let Produce::Fix { issues: audit, .. } = request {
                    issues.extend_from_slice(audit);
                }
                return fix_prompt(&self.config, &self.task, file, content, &issues, None);
            }
            return regenerate_prompt(
                &self.config,
                &self.task,
                &self.plan,
                file,
                description,
                last_reason,
            );
        }

        match request {
            Produce::Initial => {
                execute_prompt(&self.config, &self.task, &self.plan, file, description, current)
            }
            Produce::Fix { issues, advice } => match current {
                Some(content) if looks_like_code(content) => {
                    fix_prompt(&self.config, &self.task, file, content, issues, advice)
                }
                _ => regenerate_prompt(
                    &self.config,
                    &self.task,
                    &self.plan,
                    file,
                    description,
                    "the current content is not usable code",
                ),
            },
        }
    }

    /// Run executor attempts until one yields syntactically valid content,
    /// which is written to the workspace and returned
    #[allow(clippy::too_many_arguments)]
    pub async fn produce(
        &self,
        clock: &mut RecoveryClock,
        file: &str,
        description: &str,
        iteration: u32,
        request: Produce<'_>,
        sink: &EventSink,
        cancel: &CancellationToken,
    ) -> Result<String> {
        let charged = matches!(request, Produce::Fix { .. });
        let mut last_reason = String::from("no attempt made");
        let mut draft: Option<(String, Vec<AuditIssue>)> = None;

        for attempt in 1..=self.budget.max_attempts {
            if cancel.is_cancelled() {
                return Err(CadenceError::Cancelled);
            }
            if charged || attempt > 1 {
                self.check_budget(file, clock)?;
            }
            if attempt > 1 {
                sink.emit(
                    iteration,
                    FileEventKind::RecoveryAttempt {
                        reason: last_reason.clone(),
                    },
                );
                self.backoff(clock, attempt - 1, cancel).await?;
            }

            let current = self.workspace.read(file).await?;
            let prompt = self.produce_prompt(
                file,
                description,
                request,
                current.as_deref(),
                draft.as_ref(),
                &last_reason,
            );

            let result = self
                .call(
                    file,
                    clock,
                    charged || attempt > 1,
                    self.executor.execute(&prompt, None, cancel),
                )
                .await?;
            sink.call(iteration, AgentRole::Executor, &result);

            if !result.success {
                if result.category() == Some(ErrorCategory::Cancelled) {
                    return Err(CadenceError::Cancelled);
                }
                last_reason = result.error_message();
                warn!("Executor attempt {} for {} failed: {}", attempt, file, last_reason);
                continue;
            }

            let content = extract_code_block(&result.output);
            if content.trim().is_empty() {
                last_reason = "executor returned no content".to_string();
                continue;
            }

            let syntax = self.validator.validate(file, &content);
            if !syntax.valid {
                last_reason = format!("invalid {} syntax: {}", syntax.language, syntax.describe());
                debug!("Attempt {} for {} rejected: {}", attempt, file, last_reason);
                let issues = vec![AuditIssue {
                    file: file.to_string(),
                    severity: Severity::Critical,
                    description: syntax.describe(),
                    suggestion: "Fix the syntax errors".to_string(),
                }];
                draft = Some((content, issues));
                continue;
            }

            self.workspace.write(file, &content).await?;
            return Ok(content);
        }

        Err(exhausted(
            file,
            format!(
                "{} attempt(s) failed; last error: {}",
                self.budget.max_attempts, last_reason
            ),
        ))
    }

    /// Call a role with retries, parsing each response with `parse`
    ///
    /// Parse failures count as failed attempts.
    #[allow(clippy::too_many_arguments)]
    pub async fn attempt<T>(
        &self,
        clock: &mut RecoveryClock,
        file: &str,
        role: AgentRole,
        chain: &FallbackChain,
        prompt: &str,
        iteration: u32,
        sink: &EventSink,
        cancel: &CancellationToken,
        parse: impl Fn(&str) -> Result<T>,
    ) -> Result<T> {
        let mut last_reason = String::from("no attempt made");

        for attempt in 1..=self.budget.max_attempts {
            if cancel.is_cancelled() {
                return Err(CadenceError::Cancelled);
            }
            if attempt > 1 {
                self.check_budget(file, clock)?;
                sink.emit(
                    iteration,
                    FileEventKind::RecoveryAttempt {
                        reason: last_reason.clone(),
                    },
                );
                self.backoff(clock, attempt - 1, cancel).await?;
            }

            let result = self
                .call(file, clock, attempt > 1, chain.execute(prompt, None, cancel))
                .await?;
            sink.call(iteration, role, &result);

            if !result.success {
                if result.category() == Some(ErrorCategory::Cancelled) {
                    return Err(CadenceError::Cancelled);
                }
                last_reason = result.error_message();
                warn!("{} attempt {} for {} failed: {}", role, attempt, file, last_reason);
                continue;
            }

            match parse(&result.output) {
                Ok(value) => return Ok(value),
                Err(e) => {
                    last_reason = e.to_string();
                    debug!("{} response for {} unusable: {}", role, file, last_reason);
                }
            }
        }

        Err(exhausted(
            file,
            format!(
                "{} {} attempt(s) failed; last error: {}",
                self.budget.max_attempts, role, last_reason
            ),
        ))
    }
}

/// Restore a file to its pre-session baseline
///
/// Files that did not exist before the session are deleted.
pub async fn revert_file(
    store: &dyn SessionStore,
    workspace: &Workspace,
    session_id: &SessionId,
    path: &str,
) -> Result<()> {
    let baseline = store.load_baseline(session_id, path).await?.ok_or_else(|| {
        CadenceError::StateStore(format!("No baseline recorded for {}", path))
    })?;

    match baseline.content {
        Some(content) => workspace.write(path, &content).await?,
        None => workspace.remove(path).await?,
    }
    info!("Reverted {} to its pre-session content", path);
    Ok(())
}
