//! In-memory session store for dry runs and tests

use async_trait::async_trait;
use cadence_core::{CadenceError, Checkpoint, Plan, Result, Session, SessionId};
use std::collections::HashMap;
use tokio::sync::RwLock;

use crate::metrics::SessionMetrics;
use crate::store::{Baseline, SessionStore, SessionSummary};

#[derive(Default)]
struct Entry {
    session: Option<Session>,
    plan: Option<Plan>,
    checkpoints: Vec<Checkpoint>,
    metrics: Option<SessionMetrics>,
    baselines: HashMap<String, Baseline>,
}

/// Session store that keeps everything in memory
#[derive(Default)]
pub struct MemorySessionStore {
    entries: RwLock<HashMap<SessionId, Entry>>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn save_session(&self, session: &Session) -> Result<()> {
        let mut entries = self.entries.write().await;
        entries.entry(session.session_id.clone()).or_default().session = Some(session.clone());
        Ok(())
    }

    async fn load_session(&self, id: &SessionId) -> Result<Session> {
        let entries = self.entries.read().await;
        let entry = entries
            .get(id)
            .ok_or_else(|| CadenceError::SessionNotFound(id.to_string()))?;
        let mut session = entry
            .session
            .clone()
            .ok_or_else(|| CadenceError::SessionNotFound(id.to_string()))?;
        if entry.checkpoints.len() >= session.checkpoints.len() {
            session.checkpoints = entry.checkpoints.clone();
        }
        Ok(session)
    }

    async fn save_plan(&self, plan: &Plan) -> Result<()> {
        let mut entries = self.entries.write().await;
        entries.entry(plan.session_id.clone()).or_default().plan = Some(plan.clone());
        Ok(())
    }

    async fn load_plan(&self, id: &SessionId) -> Result<Option<Plan>> {
        let entries = self.entries.read().await;
        Ok(entries.get(id).and_then(|e| e.plan.clone()))
    }

    async fn append_checkpoint(&self, id: &SessionId, checkpoint: &Checkpoint) -> Result<()> {
        let mut entries = self.entries.write().await;
        entries
            .entry(id.clone())
            .or_default()
            .checkpoints
            .push(checkpoint.clone());
        Ok(())
    }

    async fn load_checkpoints(&self, id: &SessionId) -> Result<Vec<Checkpoint>> {
        let entries = self.entries.read().await;
        Ok(entries
            .get(id)
            .map(|e| e.checkpoints.clone())
            .unwrap_or_default())
    }

    async fn save_metrics(&self, metrics: &SessionMetrics) -> Result<()> {
        let mut entries = self.entries.write().await;
        entries.entry(metrics.session_id.clone()).or_default().metrics = Some(metrics.clone());
        Ok(())
    }

    async fn load_metrics(&self, id: &SessionId) -> Result<Option<SessionMetrics>> {
        let entries = self.entries.read().await;
        Ok(entries.get(id).and_then(|e| e.metrics.clone()))
    }

    async fn save_baseline(&self, id: &SessionId, baseline: &Baseline) -> Result<bool> {
        let mut entries = self.entries.write().await;
        let baselines = &mut entries.entry(id.clone()).or_default().baselines;
        if baselines.contains_key(&baseline.path) {
            return Ok(false);
        }
        baselines.insert(baseline.path.clone(), baseline.clone());
        Ok(true)
    }

    async fn load_baseline(&self, id: &SessionId, path: &str) -> Result<Option<Baseline>> {
        let entries = self.entries.read().await;
        Ok(entries.get(id).and_then(|e| e.baselines.get(path).cloned()))
    }

    async fn list_sessions(&self) -> Result<Vec<SessionSummary>> {
        let entries = self.entries.read().await;
        let mut summaries: Vec<SessionSummary> = entries
            .values()
            .filter_map(|e| e.session.as_ref())
            .map(SessionSummary::from)
            .collect();
        summaries.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        Ok(summaries)
    }

    async fn remove(&self, id: &SessionId) -> Result<bool> {
        Ok(self.entries.write().await.remove(id).is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cadence_core::{CheckpointMarker, OrchestratorConfig, Phase};

    #[tokio::test]
    async fn test_memory_store_contract() {
        let store = MemorySessionStore::new();
        let session = Session::new(SessionId::generate(), "task", OrchestratorConfig::default());
        let id = session.session_id.clone();

        assert!(matches!(
            store.load_session(&id).await,
            Err(CadenceError::SessionNotFound(_))
        ));

        store.save_session(&session).await.unwrap();
        store
            .append_checkpoint(
                &id,
                &Checkpoint::new(1, Phase::Init, None, 0, CheckpointMarker::PhaseCompleted),
            )
            .await
            .unwrap();

        let loaded = store.load_session(&id).await.unwrap();
        assert_eq!(loaded.checkpoints.len(), 1);
        assert_eq!(store.list_sessions().await.unwrap().len(), 1);

        let baseline = Baseline::capture("a.rs", None);
        assert!(store.save_baseline(&id, &baseline).await.unwrap());
        assert!(!store.save_baseline(&id, &baseline).await.unwrap());

        assert!(store.remove(&id).await.unwrap());
        assert!(store.list_sessions().await.unwrap().is_empty());
    }
}
