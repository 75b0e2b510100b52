//! Session state store contract

use async_trait::async_trait;
use cadence_core::{Checkpoint, Phase, Plan, Result, Session, SessionId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::metrics::SessionMetrics;

/// Pre-session snapshot of one file, used to revert it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Baseline {
    pub path: String,
    /// `None` when the file did not exist before the session
    pub content: Option<String>,
    pub digest: Option<String>,
    pub captured_at: DateTime<Utc>,
}

impl Baseline {
    pub fn capture(path: impl Into<String>, content: Option<String>) -> Self {
        let digest = content.as_deref().map(content_digest);
        Self {
            path: path.into(),
            content,
            digest,
            captured_at: Utc::now(),
        }
    }
}

/// Hex SHA-256 of a string
pub fn content_digest(content: &str) -> String {
    hex::encode(Sha256::digest(content.as_bytes()))
}

/// Listing entry for stored sessions
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionSummary {
    pub session_id: SessionId,
    pub task: String,
    pub phase: Phase,
    pub started_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
}

impl From<&Session> for SessionSummary {
    fn from(session: &Session) -> Self {
        Self {
            session_id: session.session_id.clone(),
            task: session.task.clone(),
            phase: session.phase,
            started_at: session.started_at,
            last_activity: session.last_activity,
        }
    }
}

/// Persistence for sessions, plans, checkpoints, metrics and baselines
///
/// Implementations serialize writes. The orchestrator is the only writer.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Overwrite the session record
    async fn save_session(&self, session: &Session) -> Result<()>;

    /// Load a session; its checkpoints come from the checkpoint log
    async fn load_session(&self, id: &SessionId) -> Result<Session>;

    async fn save_plan(&self, plan: &Plan) -> Result<()>;

    async fn load_plan(&self, id: &SessionId) -> Result<Option<Plan>>;

    /// Append one checkpoint to the ordered log
    async fn append_checkpoint(&self, id: &SessionId, checkpoint: &Checkpoint) -> Result<()>;

    async fn load_checkpoints(&self, id: &SessionId) -> Result<Vec<Checkpoint>>;

    async fn save_metrics(&self, metrics: &SessionMetrics) -> Result<()>;

    async fn load_metrics(&self, id: &SessionId) -> Result<Option<SessionMetrics>>;

    /// Store a baseline unless one already exists for the path.
    /// Returns whether it was written.
    async fn save_baseline(&self, id: &SessionId, baseline: &Baseline) -> Result<bool>;

    async fn load_baseline(&self, id: &SessionId, path: &str) -> Result<Option<Baseline>>;

    /// Sessions ordered by start time, newest first
    async fn list_sessions(&self) -> Result<Vec<SessionSummary>>;

    /// Delete everything stored for a session. Returns whether it existed.
    async fn remove(&self, id: &SessionId) -> Result<bool>;
}
