//! Core type definitions for Cadence orchestration

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

use crate::config::OrchestratorConfig;

/// Session identifier
///
/// Format: `s-{12 hex chars}` (e.g., s-3f9a0c1d2e4b)
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    /// Generate a fresh session id
    pub fn generate() -> Self {
        let simple = Uuid::new_v4().simple().to_string();
        Self(format!("s-{}", &simple[..12]))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for SessionId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty()
            || !s
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            return Err(format!("Invalid session id: {}", s));
        }
        Ok(Self(s.to_string()))
    }
}

/// Orchestration phase of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Init,
    Planning,
    AwaitingApproval,
    Executing,
    Fixing,
    Consulting,
    Auditing,
    Testing,
    Committing,
    Completed,
    Failed,
    Rejected,
    MaxIterations,
}

impl Phase {
    /// Terminal phases accept no further transitions
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::Rejected | Self::MaxIterations
        )
    }

    /// Terminal phases other than `completed`
    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Failed | Self::Rejected | Self::MaxIterations)
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Init => "init",
            Self::Planning => "planning",
            Self::AwaitingApproval => "awaiting_approval",
            Self::Executing => "executing",
            Self::Fixing => "fixing",
            Self::Consulting => "consulting",
            Self::Auditing => "auditing",
            Self::Testing => "testing",
            Self::Committing => "committing",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Rejected => "rejected",
            Self::MaxIterations => "max_iterations",
        };
        write!(f, "{}", name)
    }
}

impl std::str::FromStr for Phase {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().replace('-', "_").as_str() {
            "init" => Ok(Self::Init),
            "planning" => Ok(Self::Planning),
            "awaiting_approval" => Ok(Self::AwaitingApproval),
            "executing" => Ok(Self::Executing),
            "fixing" => Ok(Self::Fixing),
            "consulting" => Ok(Self::Consulting),
            "auditing" => Ok(Self::Auditing),
            "testing" => Ok(Self::Testing),
            "committing" => Ok(Self::Committing),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "rejected" => Ok(Self::Rejected),
            "max_iterations" => Ok(Self::MaxIterations),
            _ => Err(format!("Invalid phase: {}", s)),
        }
    }
}

/// Logical pipeline stage backed by a fallback chain
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentRole {
    #[serde(alias = "planner")]
    Architect,
    Executor,
    Auditor,
    Consultant,
}

impl AgentRole {
    pub const ALL: [AgentRole; 4] = [
        AgentRole::Architect,
        AgentRole::Executor,
        AgentRole::Auditor,
        AgentRole::Consultant,
    ];
}

impl std::fmt::Display for AgentRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Architect => write!(f, "architect"),
            Self::Executor => write!(f, "executor"),
            Self::Auditor => write!(f, "auditor"),
            Self::Consultant => write!(f, "consultant"),
        }
    }
}

impl std::str::FromStr for AgentRole {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "architect" | "planner" => Ok(Self::Architect),
            "executor" => Ok(Self::Executor),
            "auditor" => Ok(Self::Auditor),
            "consultant" => Ok(Self::Consultant),
            _ => Err(format!(
                "Invalid role: {}. Use architect, executor, auditor, or consultant.",
                s
            )),
        }
    }
}

/// Lifecycle state of one role within a session
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentState {
    #[default]
    Pending,
    InProgress,
    Completed,
    Failed,
    NotNeeded,
}

/// Per-role status with accumulated call time
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentStatus {
    pub state: AgentState,
    #[serde(default)]
    pub duration_ms: Option<u64>,
}

/// Where a single file currently is in its execute/audit cycle
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileStage {
    #[default]
    Pending,
    Executing,
    Auditing,
    Fixing,
    Consulting,
    Settled,
}

/// Final per-file result
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum FileOutcome {
    /// Auditor approved under the normal policy
    Approved,
    /// Approved on the lenient pass after consultation
    ForceAccepted,
    /// Still rejected after the lenient pass
    Rejected { reason: String },
    /// Recovery exhausted and the file was restored to its baseline
    Reverted { reason: String },
    /// Recovery exhausted with no revert
    Failed { reason: String },
    /// Work stopped by cancellation
    Interrupted,
}

impl FileOutcome {
    /// Whether the file's content is part of the accepted change set
    pub fn is_accepted(&self) -> bool {
        matches!(self, Self::Approved | Self::ForceAccepted)
    }
}

/// Per-file progress tracked on the session
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileProgress {
    pub stage: FileStage,
    pub iteration: u32,
    pub audit_calls: u32,
    #[serde(default)]
    pub outcome: Option<FileOutcome>,
}

/// What a checkpoint records
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CheckpointMarker {
    /// The checkpoint's phase finished and the session moved forward
    PhaseCompleted,
    /// Executor produced the file
    Executed,
    /// Auditor verdict for one iteration
    Audited {
        approved: bool,
        #[serde(default)]
        issues: Vec<AuditIssue>,
    },
    /// A fix was written for the next iteration
    Fixed,
    /// Consultant advice was applied
    Consulted,
    /// The file reached its terminal outcome
    Settled { outcome: FileOutcome },
}

/// Immutable, append-only record of one completed unit of work
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub id: u64,
    pub phase: Phase,
    #[serde(default)]
    pub file: Option<String>,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub iteration: u32,
    pub marker: CheckpointMarker,
}

impl Checkpoint {
    pub fn new(
        id: u64,
        phase: Phase,
        file: Option<String>,
        iteration: u32,
        marker: CheckpointMarker,
    ) -> Self {
        Self {
            id,
            phase,
            file,
            timestamp: Utc::now(),
            iteration,
            marker,
        }
    }
}

/// One orchestration session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub session_id: SessionId,
    pub task: String,
    pub phase: Phase,
    pub iteration: u32,
    pub started_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub agents: BTreeMap<AgentRole, AgentStatus>,
    #[serde(default)]
    pub checkpoints: Vec<Checkpoint>,
    #[serde(default)]
    pub files: BTreeMap<String, FileProgress>,
    pub can_resume: bool,
    #[serde(default)]
    pub last_error: Option<String>,
    #[serde(default)]
    pub warnings: Vec<String>,
    /// Configuration snapshot this session runs under
    pub config: OrchestratorConfig,
}

impl Session {
    pub fn new(session_id: SessionId, task: impl Into<String>, config: OrchestratorConfig) -> Self {
        let now = Utc::now();
        let agents = AgentRole::ALL
            .iter()
            .map(|role| (*role, AgentStatus::default()))
            .collect();

        Self {
            session_id,
            task: task.into(),
            phase: Phase::Init,
            iteration: 0,
            started_at: now,
            last_activity: now,
            agents,
            checkpoints: Vec::new(),
            files: BTreeMap::new(),
            can_resume: true,
            last_error: None,
            warnings: Vec::new(),
            config,
        }
    }

    pub fn touch(&mut self) {
        self.last_activity = Utc::now();
    }

    pub fn is_terminal(&self) -> bool {
        self.phase.is_terminal()
    }

    /// Record a role state change, accumulating call time
    pub fn record_agent(&mut self, role: AgentRole, state: AgentState, duration_ms: Option<u64>) {
        let status = self.agents.entry(role).or_default();
        status.state = state;
        if let Some(ms) = duration_ms {
            status.duration_ms = Some(status.duration_ms.unwrap_or(0) + ms);
        }
    }

    /// The last checkpoint, if any
    pub fn last_checkpoint(&self) -> Option<&Checkpoint> {
        self.checkpoints.last()
    }

    /// Next checkpoint sequence number
    pub fn next_checkpoint_id(&self) -> u64 {
        self.checkpoints.last().map(|c| c.id + 1).unwrap_or(1)
    }

    /// Files whose outcome is accepted
    pub fn accepted_files(&self) -> Vec<&str> {
        self.files
            .iter()
            .filter(|(_, p)| p.outcome.as_ref().map(|o| o.is_accepted()).unwrap_or(false))
            .map(|(f, _)| f.as_str())
            .collect()
    }
}

/// A file named by the plan
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlannedFile {
    pub path: String,
    #[serde(default)]
    pub description: String,
}

/// Change plan produced by the architect role
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Plan {
    pub session_id: SessionId,
    pub text: String,
    pub files: Vec<PlannedFile>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub provider: Option<String>,
}

/// Audit issue severity (ordered: minor < major < critical)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    #[default]
    Minor,
    Major,
    Critical,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Minor => write!(f, "minor"),
            Self::Major => write!(f, "major"),
            Self::Critical => write!(f, "critical"),
        }
    }
}

impl std::str::FromStr for Severity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "critical" | "blocker" => Ok(Self::Critical),
            "major" | "high" => Ok(Self::Major),
            "minor" | "low" | "medium" | "info" | "nit" => Ok(Self::Minor),
            _ => Err(format!("Invalid severity: {}", s)),
        }
    }
}

/// One problem reported by the auditor
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditIssue {
    #[serde(default)]
    pub file: String,
    #[serde(default)]
    pub severity: Severity,
    pub description: String,
    #[serde(default)]
    pub suggestion: String,
}

/// Audit verdict
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AuditStatus {
    #[serde(rename = "APPROVED")]
    Approved,
    #[serde(rename = "NEEDS_WORK")]
    NeedsWork,
}

/// Result of one audit pass over one file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditResult {
    pub status: AuditStatus,
    #[serde(default)]
    pub issues: Vec<AuditIssue>,
    #[serde(default)]
    pub summary: String,
}

impl AuditResult {
    pub fn is_approved(&self) -> bool {
        self.status == AuditStatus::Approved
    }
}

/// One diagnostic from a syntax validator
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyntaxDiagnostic {
    pub line: u32,
    pub column: u32,
    pub message: String,
}

/// Output of an (external) syntax validator
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyntaxValidationResult {
    pub file: String,
    pub language: String,
    pub valid: bool,
    #[serde(default)]
    pub errors: Vec<SyntaxDiagnostic>,
}

impl SyntaxValidationResult {
    pub fn valid(file: impl Into<String>, language: impl Into<String>) -> Self {
        Self {
            file: file.into(),
            language: language.into(),
            valid: true,
            errors: Vec::new(),
        }
    }

    /// Render diagnostics for inclusion in a prompt or error message
    pub fn describe(&self) -> String {
        self.errors
            .iter()
            .map(|e| format!("{}:{}:{}: {}", self.file, e.line, e.column, e.message))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Output of an (external) test runner
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestResult {
    pub success: bool,
    pub passed: u32,
    pub failed: u32,
    pub skipped: u32,
    pub duration_ms: u64,
    pub output: String,
    pub command: String,
}
