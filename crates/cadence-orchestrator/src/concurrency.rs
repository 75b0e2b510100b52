//! Execution modes and the file dispatcher
//!
//! - **Sequential**: one file at a time, each fully settled before the next
//! - **Parallel**: up to `k` files in flight, each holding its slot for its
//!   whole execute/audit/fix lifecycle
//! - **Pipeline**: separate execution and audit lanes of width `k`, so audits
//!   of finished files overlap with execution of the rest
//!
//! In every mode a file is audited as soon as its own execution finishes.

use cadence_core::{CadenceError, FileOutcome, OrchestratorConfig, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use tokio::sync::{mpsc, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::events::{EventSink, FileEvent};
use crate::worker::{FileReport, FileWork, FileWorker};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "lowercase")]
pub enum ExecutionMode {
    Sequential,
    Parallel { max_concurrency: usize },
    Pipeline { max_concurrency: usize },
}

impl ExecutionMode {
    /// Pipeline wins over parallel when both are set
    pub fn from_config(config: &OrchestratorConfig) -> Self {
        let k = config.max_concurrency.max(1);
        if config.pipeline {
            Self::Pipeline { max_concurrency: k }
        } else if config.parallel {
            Self::Parallel { max_concurrency: k }
        } else {
            Self::Sequential
        }
    }
}

impl fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Sequential => write!(f, "sequential"),
            Self::Parallel { max_concurrency } => write!(f, "parallel (k={})", max_concurrency),
            Self::Pipeline { max_concurrency } => write!(f, "pipeline (k={})", max_concurrency),
        }
    }
}

async fn acquire(
    semaphore: &Option<Arc<Semaphore>>,
    cancel: &CancellationToken,
) -> Result<Option<OwnedSemaphorePermit>> {
    let Some(semaphore) = semaphore else {
        return Ok(None);
    };
    tokio::select! {
        _ = cancel.cancelled() => Err(CadenceError::Cancelled),
        permit = semaphore.clone().acquire_owned() => permit
            .map(Some)
            .map_err(|_| CadenceError::Cancelled),
    }
}

/// Admission limits shared by all workers of one dispatch
#[derive(Debug, Clone, Default)]
pub struct Lanes {
    lifecycle: Option<Arc<Semaphore>>,
    execute: Option<Arc<Semaphore>>,
    audit: Option<Arc<Semaphore>>,
}

impl Lanes {
    pub fn for_mode(mode: ExecutionMode) -> Self {
        match mode {
            ExecutionMode::Sequential => Self {
                lifecycle: Some(Arc::new(Semaphore::new(1))),
                ..Default::default()
            },
            ExecutionMode::Parallel { max_concurrency } => Self {
                lifecycle: Some(Arc::new(Semaphore::new(max_concurrency))),
                ..Default::default()
            },
            ExecutionMode::Pipeline { max_concurrency } => Self {
                lifecycle: None,
                execute: Some(Arc::new(Semaphore::new(max_concurrency))),
                audit: Some(Arc::new(Semaphore::new(max_concurrency))),
            },
        }
    }

    /// Slot held for a file's whole lifecycle
    pub async fn lifecycle(
        &self,
        cancel: &CancellationToken,
    ) -> Result<Option<OwnedSemaphorePermit>> {
        acquire(&self.lifecycle, cancel).await
    }

    /// Slot held while generating or fixing content
    pub async fn execute(
        &self,
        cancel: &CancellationToken,
    ) -> Result<Option<OwnedSemaphorePermit>> {
        acquire(&self.execute, cancel).await
    }

    /// Slot held while auditing or consulting
    pub async fn audit(&self, cancel: &CancellationToken) -> Result<Option<OwnedSemaphorePermit>> {
        acquire(&self.audit, cancel).await
    }
}

/// Runs one worker task per distinct file
#[derive(Debug, Clone, Copy)]
pub struct ConcurrencyController {
    mode: ExecutionMode,
}

impl ConcurrencyController {
    pub fn new(mode: ExecutionMode) -> Self {
        Self { mode }
    }

    pub fn mode(&self) -> ExecutionMode {
        self.mode
    }

    /// Run every work item to settlement and collect reports in plan order
    ///
    /// Events are sent on `events` as they happen; the channel closes when
    /// the last worker finishes.
    pub async fn dispatch(
        &self,
        work: Vec<FileWork>,
        worker: Arc<FileWorker>,
        events: mpsc::UnboundedSender<FileEvent>,
        cancel: CancellationToken,
    ) -> Vec<FileReport> {
        let lanes = Lanes::for_mode(self.mode);
        let mut seen = HashSet::new();
        let work: Vec<FileWork> = work
            .into_iter()
            .filter(|w| seen.insert(w.path.clone()))
            .collect();
        let order: Vec<String> = work.iter().map(|w| w.path.clone()).collect();

        info!("Dispatching {} file(s) in {} mode", work.len(), self.mode);

        let mut set = JoinSet::new();
        for item in work {
            let worker = worker.clone();
            let lanes = lanes.clone();
            let sink = EventSink::new(item.path.clone(), events.clone());
            let cancel = cancel.clone();
            set.spawn(async move { worker.run(item, &lanes, &sink, &cancel).await });
        }
        drop(events);

        let mut reports = Vec::with_capacity(order.len());
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(report) => reports.push(report),
                Err(e) => error!("File worker terminated abnormally: {}", e),
            }
        }

        order
            .into_iter()
            .map(|path| {
                let position = reports.iter().position(|r| r.path == path);
                match position {
                    Some(i) => reports.swap_remove(i),
                    None => FileReport {
                        path,
                        outcome: FileOutcome::Failed {
                            reason: "worker terminated abnormally".to_string(),
                        },
                        iteration: 0,
                        audit_calls: 0,
                    },
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mode_from_config() {
        let mut config = OrchestratorConfig::default();
        assert_eq!(ExecutionMode::from_config(&config), ExecutionMode::Sequential);

        config.parallel = true;
        config.max_concurrency = 4;
        assert_eq!(
            ExecutionMode::from_config(&config),
            ExecutionMode::Parallel { max_concurrency: 4 }
        );

        config.pipeline = true;
        assert_eq!(
            ExecutionMode::from_config(&config),
            ExecutionMode::Pipeline { max_concurrency: 4 }
        );
    }

    #[tokio::test]
    async fn test_lanes_bound_lifecycle_slots() {
        let lanes = Lanes::for_mode(ExecutionMode::Parallel { max_concurrency: 2 });
        let cancel = CancellationToken::new();

        let a = lanes.lifecycle(&cancel).await.unwrap();
        let b = lanes.lifecycle(&cancel).await.unwrap();
        assert!(a.is_some() && b.is_some());

        let blocked = tokio::time::timeout(
            std::time::Duration::from_millis(50),
            lanes.lifecycle(&cancel),
        )
        .await;
        assert!(blocked.is_err());

        drop(a);
        assert!(lanes.lifecycle(&cancel).await.unwrap().is_some());
        // Parallel mode has no stage lanes
        assert!(lanes.execute(&cancel).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_waiting_for_slot_is_cancellable() {
        let lanes = Lanes::for_mode(ExecutionMode::Sequential);
        let cancel = CancellationToken::new();
        let _held = lanes.lifecycle(&cancel).await.unwrap();

        cancel.cancel();
        let err = lanes.lifecycle(&cancel).await.unwrap_err();
        assert!(matches!(err, CadenceError::Cancelled));
    }
}
