//! Filesystem session store
//!
//! Layout, one directory per session:
//!
//! ```text
//! <root>/.cadence/sessions/<id>/
//!   session.json
//!   plan.json
//!   metrics.json
//!   checkpoints.jsonl
//!   baselines/<sha256 of path>.json
//! ```

use async_trait::async_trait;
use cadence_core::{CadenceError, Checkpoint, Plan, Result, Session, SessionId};
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, instrument, warn};

use crate::metrics::SessionMetrics;
use crate::record::{
    decode, encode, encode_pretty, BASELINE_SCHEMA, CHECKPOINT_SCHEMA, METRICS_SCHEMA,
    PLAN_SCHEMA, SESSION_SCHEMA,
};
use crate::store::{content_digest, Baseline, SessionStore, SessionSummary};

/// Session store rooted at `<root>/.cadence/sessions`
pub struct FsSessionStore {
    sessions_dir: PathBuf,
    write_lock: Mutex<()>,
}

impl FsSessionStore {
    /// Store for the repository at `repo_root`
    pub fn new(repo_root: impl AsRef<Path>) -> Self {
        Self::at(repo_root.as_ref().join(".cadence").join("sessions"))
    }

    /// Store using `sessions_dir` directly
    pub fn at(sessions_dir: impl Into<PathBuf>) -> Self {
        Self {
            sessions_dir: sessions_dir.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn sessions_dir(&self) -> &Path {
        &self.sessions_dir
    }

    fn session_dir(&self, id: &SessionId) -> Result<PathBuf> {
        // Ids arrive from the command line; revalidate before using one as a path
        id.as_str()
            .parse::<SessionId>()
            .map_err(CadenceError::PathValidation)?;
        Ok(self.sessions_dir.join(id.as_str()))
    }

    async fn write_atomic(path: &Path, content: &str) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, content).await?;
        fs::rename(&tmp, path).await?;
        Ok(())
    }

    async fn read_optional(path: &Path) -> Result<Option<String>> {
        match fs::read_to_string(path).await {
            Ok(content) => Ok(Some(content)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl SessionStore for FsSessionStore {
    #[instrument(skip(self, session), fields(session = %session.session_id, phase = %session.phase))]
    async fn save_session(&self, session: &Session) -> Result<()> {
        let path = self.session_dir(&session.session_id)?.join("session.json");
        let content = encode_pretty(SESSION_SCHEMA, session)?;
        let _guard = self.write_lock.lock().await;
        Self::write_atomic(&path, &content).await?;
        debug!("Saved session to {:?}", path);
        Ok(())
    }

    async fn load_session(&self, id: &SessionId) -> Result<Session> {
        let path = self.session_dir(id)?.join("session.json");
        let content = Self::read_optional(&path)
            .await?
            .ok_or_else(|| CadenceError::SessionNotFound(id.to_string()))?;
        let mut session: Session = decode(SESSION_SCHEMA, &content)?;

        let log = self.load_checkpoints(id).await?;
        if log.len() >= session.checkpoints.len() {
            session.checkpoints = log;
        }
        Ok(session)
    }

    async fn save_plan(&self, plan: &Plan) -> Result<()> {
        let path = self.session_dir(&plan.session_id)?.join("plan.json");
        let content = encode_pretty(PLAN_SCHEMA, plan)?;
        let _guard = self.write_lock.lock().await;
        Self::write_atomic(&path, &content).await
    }

    async fn load_plan(&self, id: &SessionId) -> Result<Option<Plan>> {
        let path = self.session_dir(id)?.join("plan.json");
        match Self::read_optional(&path).await? {
            Some(content) => Ok(Some(decode(PLAN_SCHEMA, &content)?)),
            None => Ok(None),
        }
    }

    #[instrument(skip(self, checkpoint), fields(session = %id, checkpoint = checkpoint.id))]
    async fn append_checkpoint(&self, id: &SessionId, checkpoint: &Checkpoint) -> Result<()> {
        let dir = self.session_dir(id)?;
        let line = encode(CHECKPOINT_SCHEMA, checkpoint)?;

        let _guard = self.write_lock.lock().await;
        fs::create_dir_all(&dir).await?;
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(dir.join("checkpoints.jsonl"))
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.write_all(b"\n").await?;
        file.flush().await?;
        Ok(())
    }

    async fn load_checkpoints(&self, id: &SessionId) -> Result<Vec<Checkpoint>> {
        let path = self.session_dir(id)?.join("checkpoints.jsonl");
        let Some(content) = Self::read_optional(&path).await? else {
            return Ok(Vec::new());
        };

        let mut checkpoints = Vec::new();
        let lines: Vec<&str> = content.lines().filter(|l| !l.trim().is_empty()).collect();
        for (i, line) in lines.iter().enumerate() {
            match decode::<Checkpoint>(CHECKPOINT_SCHEMA, line) {
                Ok(checkpoint) => checkpoints.push(checkpoint),
                // A torn final line is what a crash mid-append leaves behind
                Err(CadenceError::StateStore(e)) if i + 1 == lines.len() => {
                    warn!("Ignoring truncated checkpoint line: {}", e);
                }
                Err(e) => return Err(e),
            }
        }
        Ok(checkpoints)
    }

    async fn save_metrics(&self, metrics: &SessionMetrics) -> Result<()> {
        let path = self.session_dir(&metrics.session_id)?.join("metrics.json");
        let content = encode_pretty(METRICS_SCHEMA, metrics)?;
        let _guard = self.write_lock.lock().await;
        Self::write_atomic(&path, &content).await
    }

    async fn load_metrics(&self, id: &SessionId) -> Result<Option<SessionMetrics>> {
        let path = self.session_dir(id)?.join("metrics.json");
        match Self::read_optional(&path).await? {
            Some(content) => Ok(Some(decode(METRICS_SCHEMA, &content)?)),
            None => Ok(None),
        }
    }

    async fn save_baseline(&self, id: &SessionId, baseline: &Baseline) -> Result<bool> {
        let path = self
            .session_dir(id)?
            .join("baselines")
            .join(format!("{}.json", content_digest(&baseline.path)));
        let content = encode_pretty(BASELINE_SCHEMA, baseline)?;

        let _guard = self.write_lock.lock().await;
        if fs::try_exists(&path).await? {
            return Ok(false);
        }
        Self::write_atomic(&path, &content).await?;
        Ok(true)
    }

    async fn load_baseline(&self, id: &SessionId, path: &str) -> Result<Option<Baseline>> {
        let file = self
            .session_dir(id)?
            .join("baselines")
            .join(format!("{}.json", content_digest(path)));
        match Self::read_optional(&file).await? {
            Some(content) => Ok(Some(decode(BASELINE_SCHEMA, &content)?)),
            None => Ok(None),
        }
    }

    async fn list_sessions(&self) -> Result<Vec<SessionSummary>> {
        let mut entries = match fs::read_dir(&self.sessions_dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut summaries = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let Some(name) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            let Ok(id) = name.parse::<SessionId>() else {
                continue;
            };
            match self.load_session(&id).await {
                Ok(session) => summaries.push(SessionSummary::from(&session)),
                Err(e) => warn!("Skipping unreadable session {}: {}", id, e),
            }
        }

        summaries.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        Ok(summaries)
    }

    async fn remove(&self, id: &SessionId) -> Result<bool> {
        let dir = self.session_dir(id)?;
        let _guard = self.write_lock.lock().await;
        if !fs::try_exists(&dir).await? {
            return Ok(false);
        }
        fs::remove_dir_all(&dir).await?;
        Ok(true)
    }
}
