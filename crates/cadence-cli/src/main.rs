//! Cadence CLI - multi-provider code generation with audit loops
//!
//! Usage:
//!   cadence init                  Write a default .cadence/config.toml
//!   cadence start <task>          Plan, approve, execute and audit a task
//!   cadence pipeline <task>       Same, with per-file audit overlap
//!   cadence resume <session>      Continue an interrupted session
//!   cadence watch <task>          Run once, then re-run changed files
//!   cadence dry-run <task>        Plan only and show what would happen
//!   cadence status|plan|metrics   Inspect a stored session
//!   cadence list | clean          Manage stored sessions

use anyhow::{Context, Result};
use async_trait::async_trait;
use cadence_agent::{AnthropicAdapter, CommandAdapter, FallbackChain, ProviderAdapter};
use cadence_core::{
    AdapterConfig, AdapterKind, AgentRole, ConfigOverrides, OrchestratorConfig, Plan,
    ProjectConfig, Session, SessionId,
};
use cadence_orchestrator::{
    ApprovalDecision, ApprovalGate, DryRunReport, FileEventKind, FixedApproval, Orchestrator,
    ProgressEvent, RoleAgents, SimulatedAction,
};
use cadence_state::{FsSessionStore, SessionStore};
use clap::{Args, Parser, Subcommand};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser)]
#[command(name = "cadence")]
#[command(author, version, about = "Multi-provider code generation with audit loops")]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Repository root (defaults to current directory)
    #[arg(long, global = true, default_value = ".")]
    repo: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a default configuration file
    Init {
        /// Overwrite an existing configuration
        #[arg(long)]
        force: bool,
    },

    /// Run a new session
    Start {
        task: String,

        #[command(flatten)]
        run: RunArgs,
    },

    /// Run a new session in pipeline mode
    Pipeline {
        task: String,

        #[command(flatten)]
        run: RunArgs,
    },

    /// Continue a stored session from its last checkpoint
    Resume {
        session: String,

        /// Approve the plan without prompting
        #[arg(short, long)]
        yes: bool,
    },

    /// Run once, then re-run files as they change
    Watch {
        task: String,

        /// Glob patterns to watch (repeatable)
        #[arg(long = "pattern", value_name = "GLOB")]
        patterns: Vec<String>,

        #[command(flatten)]
        run: RunArgs,
    },

    /// Plan a task and show what execution would do
    DryRun {
        task: String,

        /// Print the report as JSON
        #[arg(long)]
        json: bool,

        #[command(flatten)]
        run: RunArgs,
    },

    /// Show a stored session
    Status {
        session: String,

        #[arg(long)]
        json: bool,
    },

    /// Show a stored session's plan
    Plan { session: String },

    /// Show a stored session's metrics
    Metrics { session: String },

    /// List stored sessions
    List,

    /// Delete a stored session
    Clean { session: String },
}

/// Per-run overrides of `.cadence/config.toml`
#[derive(Args, Default)]
struct RunArgs {
    /// Approve the plan without prompting
    #[arg(short, long)]
    yes: bool,

    /// Per-call provider timeout in seconds
    #[arg(long)]
    timeout: Option<u64>,

    /// Audit iterations per file before consulting
    #[arg(long)]
    max_iterations: Option<u32>,

    /// Process files concurrently
    #[arg(long)]
    parallel: bool,

    #[arg(long)]
    max_concurrency: Option<usize>,

    /// Run this test command after all files settle
    #[arg(long, value_name = "CMD")]
    test: Option<String>,

    /// Treat test failures as warnings
    #[arg(long)]
    tests_optional: bool,

    /// Commit accepted files
    #[arg(long)]
    commit: bool,

    #[arg(long, value_name = "MSG")]
    commit_message: Option<String>,

    /// Fail the session instead of reverting files whose recovery ran out
    #[arg(long)]
    no_revert: bool,

    /// Abort the session after this many seconds
    #[arg(long, value_name = "SECS")]
    session_timeout: Option<u64>,
}

impl RunArgs {
    fn overrides(&self) -> ConfigOverrides {
        ConfigOverrides {
            timeout_secs: self.timeout,
            max_iterations: self.max_iterations,
            auto_approve: self.yes.then_some(true),
            parallel: self.parallel.then_some(true),
            max_concurrency: self.max_concurrency,
            run_tests: self.test.as_ref().map(|_| true),
            test_command: self.test.clone(),
            tests_required: self.tests_optional.then_some(false),
            git_commit: self.commit.then_some(true),
            commit_message: self.commit_message.clone(),
            auto_revert_on_failure: self.no_revert.then_some(false),
            session_timeout_secs: self.session_timeout,
            ..Default::default()
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let level = if cli.verbose { Level::DEBUG } else { Level::INFO };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let repo = cli.repo;
    match cli.command {
        Commands::Init { force } => cmd_init(&repo, force),
        Commands::Start { task, run } => cmd_start(&repo, &task, run, false).await,
        Commands::Pipeline { task, run } => cmd_start(&repo, &task, run, true).await,
        Commands::Resume { session, yes } => cmd_resume(&repo, &session, yes).await,
        Commands::Watch {
            task,
            patterns,
            run,
        } => cmd_watch(&repo, &task, patterns, run).await,
        Commands::DryRun { task, json, run } => cmd_dry_run(&repo, &task, json, run).await,
        Commands::Status { session, json } => cmd_status(&repo, &session, json).await,
        Commands::Plan { session } => cmd_plan(&repo, &session).await,
        Commands::Metrics { session } => cmd_metrics(&repo, &session).await,
        Commands::List => cmd_list(&repo).await,
        Commands::Clean { session } => cmd_clean(&repo, &session).await,
    }
}

fn cmd_init(repo: &Path, force: bool) -> Result<()> {
    let path = repo.join(".cadence/config.toml");
    if path.exists() && !force {
        println!("{} already exists (use --force to overwrite)", path.display());
        return Ok(());
    }
    ProjectConfig::write_default(repo).context("Failed to write default config")?;
    println!("Initialized Cadence in {}", repo.display());
    println!("Created:");
    println!("  .cadence/config.toml");
    Ok(())
}

async fn cmd_start(repo: &Path, task: &str, run: RunArgs, pipeline: bool) -> Result<()> {
    let project = ProjectConfig::load_or_default(repo)?;
    let config = OrchestratorConfig::resolve(&project, &run.overrides())?;
    let cancel = cancel_on_ctrl_c();
    let orchestrator = build_orchestrator(repo, &project, &config, run.yes)?
        .with_cancellation(cancel);

    let session = if pipeline {
        orchestrator.pipeline(task, config).await?
    } else {
        orchestrator.start(task, config).await?
    };
    print_outcome(&session);
    Ok(())
}

async fn cmd_resume(repo: &Path, session: &str, yes: bool) -> Result<()> {
    let id = parse_id(session)?;
    let project = ProjectConfig::load_or_default(repo)?;
    // Resume keeps the session's own config snapshot; only the chains come from disk
    let snapshot = FsSessionStore::new(repo).load_session(&id).await?.config;
    let orchestrator = build_orchestrator(repo, &project, &snapshot, yes)?
        .with_cancellation(cancel_on_ctrl_c());

    let session = orchestrator.resume(&id).await?;
    print_outcome(&session);
    Ok(())
}

async fn cmd_watch(repo: &Path, task: &str, patterns: Vec<String>, run: RunArgs) -> Result<()> {
    let project = ProjectConfig::load_or_default(repo)?;
    let mut overrides = run.overrides();
    overrides.watch = Some(true);
    // Re-runs happen unattended
    overrides.auto_approve = Some(true);
    if !patterns.is_empty() {
        overrides.watch_patterns = Some(patterns);
    }
    let config = OrchestratorConfig::resolve(&project, &overrides)?;

    let cancel = cancel_on_ctrl_c();
    let orchestrator = Arc::new(
        build_orchestrator(repo, &project, &config, true)?.with_cancellation(cancel.clone()),
    );
    println!(
        "Watching {} (Ctrl-C to stop)",
        config.watch_patterns.join(", ")
    );
    let reruns = orchestrator.watch(task, config, cancel).await?;
    println!("Stopped watching after {} re-run(s)", reruns);
    Ok(())
}

async fn cmd_dry_run(repo: &Path, task: &str, json: bool, run: RunArgs) -> Result<()> {
    let project = ProjectConfig::load_or_default(repo)?;
    let mut overrides = run.overrides();
    overrides.dry_run = Some(true);
    let config = OrchestratorConfig::resolve(&project, &overrides)?;
    let orchestrator = build_orchestrator(repo, &project, &config, true)?
        .with_cancellation(cancel_on_ctrl_c());

    let report = orchestrator.dry_run(task, config).await?;
    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_dry_run(&report);
    }
    Ok(())
}

async fn cmd_status(repo: &Path, session: &str, json: bool) -> Result<()> {
    let id = parse_id(session)?;
    let orchestrator = inspector(repo)?;
    let session = orchestrator.status(&id).await?;
    if json {
        println!("{}", serde_json::to_string_pretty(&session)?);
        return Ok(());
    }

    println!("Session {}", session.session_id);
    println!("  Task:      {}", first_line(&session.task));
    println!("  Phase:     {}", session.phase);
    println!("  Iteration: {}", session.iteration);
    println!("  Started:   {}", session.started_at.format("%Y-%m-%d %H:%M:%S"));
    println!("  Resumable: {}", session.can_resume);
    if let Some(error) = &session.last_error {
        println!("  Error:     {}", error);
    }
    if !session.files.is_empty() {
        println!("\nFiles:");
        for (path, progress) in &session.files {
            let outcome = progress
                .outcome
                .as_ref()
                .map(|o| format!("{:?}", o))
                .unwrap_or_else(|| format!("{:?}", progress.stage));
            println!(
                "  {:<40} {} (iteration {}, {} audit(s))",
                path, outcome, progress.iteration, progress.audit_calls
            );
        }
    }
    for warning in &session.warnings {
        println!("warning: {}", warning);
    }
    println!("\n{} checkpoint(s)", session.checkpoints.len());
    Ok(())
}

async fn cmd_plan(repo: &Path, session: &str) -> Result<()> {
    let id = parse_id(session)?;
    match inspector(repo)?.plan(&id).await? {
        Some(plan) => print_plan(&plan),
        None => println!("Session {} has no plan yet", id),
    }
    Ok(())
}

async fn cmd_metrics(repo: &Path, session: &str) -> Result<()> {
    let id = parse_id(session)?;
    let Some(metrics) = inspector(repo)?.metrics(&id).await? else {
        println!("No metrics recorded for {}", id);
        return Ok(());
    };

    println!("Metrics for {}", id);
    for (role, m) in &metrics.roles {
        println!(
            "  {:<10} {} call(s), {} failed, {} fallback(s), {}ms, {}/{} tokens",
            role.to_string(),
            m.calls,
            m.failures,
            m.fallbacks,
            m.duration_ms,
            m.input_tokens,
            m.output_tokens
        );
    }
    println!("  Recovery attempts: {}", metrics.recovery_attempts);
    println!("  Reverts:           {}", metrics.reverts);
    Ok(())
}

async fn cmd_list(repo: &Path) -> Result<()> {
    let sessions = inspector(repo)?.list().await?;
    if sessions.is_empty() {
        println!("No sessions");
        return Ok(());
    }
    for summary in sessions {
        println!(
            "{}  {:<16} {}  {}",
            summary.session_id,
            summary.phase.to_string(),
            summary.last_activity.format("%Y-%m-%d %H:%M"),
            first_line(&summary.task)
        );
    }
    Ok(())
}

async fn cmd_clean(repo: &Path, session: &str) -> Result<()> {
    let id = parse_id(session)?;
    if inspector(repo)?.clean(&id).await? {
        println!("Removed session {}", id);
    } else {
        println!("No session {}", id);
    }
    Ok(())
}

// ----------------------------------------------------------------------
// Wiring
// ----------------------------------------------------------------------

fn parse_id(raw: &str) -> Result<SessionId> {
    raw.parse::<SessionId>().map_err(anyhow::Error::msg)
}

/// Orchestrator for read-only commands; no adapters are ever called
fn inspector(repo: &Path) -> Result<Orchestrator> {
    let project = ProjectConfig::load_or_default(repo)?;
    build_orchestrator(repo, &project, &OrchestratorConfig::default(), true)
}

fn build_orchestrator(
    repo: &Path,
    project: &ProjectConfig,
    config: &OrchestratorConfig,
    auto_approve: bool,
) -> Result<Orchestrator> {
    let timeout = Duration::from_secs(config.timeout_secs);
    let chain = |role: AgentRole| -> Result<Arc<FallbackChain>> {
        let mut chain = FallbackChain::new(role, timeout);
        for name in project.roles.for_role(role) {
            let adapter_config = project
                .adapters
                .get(name)
                .with_context(|| format!("Unknown adapter '{}'", name))?;
            chain = chain.with_adapter(build_adapter(repo, name, adapter_config));
        }
        Ok(Arc::new(chain))
    };

    let consultant = chain(AgentRole::Consultant)?;
    let agents = RoleAgents {
        architect: chain(AgentRole::Architect)?,
        executor: chain(AgentRole::Executor)?,
        auditor: chain(AgentRole::Auditor)?,
        consultant: (!consultant.is_empty()).then_some(consultant),
    };

    let gate: Arc<dyn ApprovalGate> = if auto_approve {
        Arc::new(FixedApproval(ApprovalDecision::Approved))
    } else {
        Arc::new(PromptApproval)
    };

    Ok(Orchestrator::new(repo, agents)
        .with_approval(gate)
        .with_progress(Arc::new(|event: &ProgressEvent| {
            print_progress(event);
            Ok::<(), cadence_core::CadenceError>(())
        })))
}

/// Build one adapter; credentials are read here and nowhere else
fn build_adapter(repo: &Path, name: &str, config: &AdapterConfig) -> Arc<dyn ProviderAdapter> {
    let credential = config.api_key_env.as_deref().and_then(|var| {
        let value = std::env::var(var).ok();
        if value.is_none() {
            warn!("Adapter {}: environment variable {} is not set", name, var);
        }
        value.map(|v| (var.to_string(), v))
    });

    match config.kind {
        AdapterKind::Command => {
            let program = config.program.clone().unwrap_or_else(|| name.to_string());
            let mut adapter = CommandAdapter::new(name, program)
                .with_args(config.args.clone())
                .with_working_dir(repo);
            if let Some(model) = &config.model {
                adapter = adapter.with_model(model.clone());
            }
            if let Some((var, value)) = credential {
                adapter = adapter.with_env(var, value);
            }
            Arc::new(adapter)
        }
        AdapterKind::Anthropic => {
            // An empty key makes the adapter report itself unavailable
            let key = credential.map(|(_, v)| v).unwrap_or_default();
            let mut adapter = AnthropicAdapter::new(name, key);
            if let Some(model) = &config.model {
                adapter = adapter.with_model(model.clone());
            }
            if let Some(max_tokens) = config.max_tokens {
                adapter = adapter.with_max_tokens(max_tokens);
            }
            if let Some(endpoint) = &config.endpoint {
                adapter = adapter.with_endpoint(endpoint.clone());
            }
            Arc::new(adapter)
        }
    }
}

fn cancel_on_ctrl_c() -> CancellationToken {
    let cancel = CancellationToken::new();
    let token = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupted, stopping after in-flight work");
            token.cancel();
        }
    });
    cancel
}

/// Asks on the terminal before executing a plan
struct PromptApproval;

#[async_trait]
impl ApprovalGate for PromptApproval {
    async fn review(
        &self,
        _session: &Session,
        plan: &Plan,
    ) -> cadence_core::Result<ApprovalDecision> {
        print_plan(plan);
        let answer = tokio::task::spawn_blocking(|| {
            print!("\nExecute this plan? [y/N] ");
            std::io::stdout().flush()?;
            let mut line = String::new();
            std::io::stdin().read_line(&mut line)?;
            Ok::<_, std::io::Error>(line)
        })
        .await
        .map_err(|e| cadence_core::CadenceError::SessionFatal(e.to_string()))??;

        Ok(match answer.trim().to_lowercase().as_str() {
            "y" | "yes" => ApprovalDecision::Approved,
            _ => ApprovalDecision::Rejected {
                reason: "declined at prompt".to_string(),
            },
        })
    }
}

// ----------------------------------------------------------------------
// Output
// ----------------------------------------------------------------------

fn first_line(text: &str) -> &str {
    text.lines().next().unwrap_or_default()
}

fn print_progress(event: &ProgressEvent) {
    match event {
        ProgressEvent::Phase { from, to, .. } => println!("[{}] -> [{}]", from, to),
        ProgressEvent::File(event) => {
            let line = match &event.kind {
                FileEventKind::ExecuteStarted => "executing".to_string(),
                FileEventKind::AuditStarted { final_pass: true } => {
                    format!("final audit (iteration {})", event.iteration)
                }
                FileEventKind::AuditStarted { .. } => {
                    format!("auditing (iteration {})", event.iteration)
                }
                FileEventKind::Audited {
                    approved: false,
                    issues,
                } => format!("{} issue(s)", issues.len()),
                FileEventKind::FixStarted => "fixing".to_string(),
                FileEventKind::ConsultStarted => "consulting".to_string(),
                FileEventKind::RecoveryAttempt { reason } => format!("retrying: {}", reason),
                FileEventKind::Settled { outcome } => format!("{:?}", outcome),
                FileEventKind::Exhausted { reason } => format!("recovery exhausted: {}", reason),
                FileEventKind::Fatal { error } => format!("fatal: {}", error),
                _ => return,
            };
            println!("  {}: {}", event.file, line);
        }
    }
}

fn print_plan(plan: &Plan) {
    println!("Plan ({} file(s)):", plan.files.len());
    for file in &plan.files {
        println!("  {}  {}", file.path, file.description);
    }
}

fn print_dry_run(report: &DryRunReport) {
    println!("Dry run for session {}", report.session_id);
    println!("  Mode: {}", report.mode);
    if let Some(provider) = &report.plan.provider {
        println!("  Planned by: {}", provider);
    }
    println!("\nFiles:");
    for file in &report.files {
        let action = match &file.action {
            SimulatedAction::Create => "create".to_string(),
            SimulatedAction::Modify => "modify".to_string(),
            SimulatedAction::Skip { reason } => format!("skip ({})", reason),
        };
        println!(
            "  {:<40} {:<8} {}",
            file.path,
            action,
            file.language.as_deref().unwrap_or("-")
        );
    }
    println!(
        "\nUp to {} audit pass(es) per file; tests: {}; commit: {}",
        report.max_audit_passes,
        if report.would_run_tests { "yes" } else { "no" },
        if report.would_commit { "yes" } else { "no" }
    );
}

fn print_outcome(session: &Session) {
    println!("\nSession {} finished in {}", session.session_id, session.phase);
    let accepted = session.accepted_files();
    println!("  {} of {} file(s) accepted", accepted.len(), session.files.len());
    for warning in &session.warnings {
        println!("  warning: {}", warning);
    }
    if let Some(error) = &session.last_error {
        println!("  error: {}", error);
    }
    if session.can_resume {
        println!("  resume with: cadence resume {}", session.session_id);
    }
}
