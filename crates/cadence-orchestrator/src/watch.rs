//! Watch mode: re-run orchestration for changed files
//!
//! Filesystem events are filtered by glob, debounced per path (each new
//! event resets that path's timer) and dispatched in batches. A change to a
//! file whose run is still in flight cancels that run; the replacement covers
//! every file of the cancelled run and starts only after it has stopped.
//! Changes the engine made itself are ignored via the [`WriteJournal`].

use cadence_core::{CadenceError, Result};
use futures::future::BoxFuture;
use notify::{Config, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::workspace::{validate_path, WriteJournal};

/// Starts one orchestration run for a batch of changed files
pub type Retrigger =
    Arc<dyn Fn(Vec<String>, CancellationToken) -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// Per-path trailing-edge debounce
#[derive(Debug)]
pub struct Debouncer {
    window: Duration,
    pending: HashMap<String, Instant>,
}

impl Debouncer {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            pending: HashMap::new(),
        }
    }

    /// Record a change, restarting the path's timer
    pub fn push(&mut self, path: impl Into<String>, now: Instant) {
        self.pending.insert(path.into(), now);
    }

    /// Remove and return every path quiet for a full window, sorted
    pub fn due(&mut self, now: Instant) -> Vec<String> {
        let mut ready: Vec<String> = self
            .pending
            .iter()
            .filter(|(_, at)| now.duration_since(**at) >= self.window)
            .map(|(path, _)| path.clone())
            .collect();
        for path in &ready {
            self.pending.remove(path);
        }
        ready.sort();
        ready
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.pending.values().min().map(|at| *at + self.window)
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

struct ActiveRun {
    files: Vec<String>,
    cancel: CancellationToken,
    /// Cancelled once the run's task has ended
    done: CancellationToken,
}

/// Runs started and not yet joined, and which run owns each path
#[derive(Default)]
struct RunRegistry {
    next_id: u64,
    runs: HashMap<u64, ActiveRun>,
    owners: HashMap<String, u64>,
}

impl RunRegistry {
    /// Cancel every run owning a path in `batch`
    ///
    /// Returns the batch widened with the cancelled runs' other files, and
    /// the signals to wait on before the replacement may start.
    fn supersede(&mut self, batch: &[String]) -> (Vec<String>, Vec<CancellationToken>) {
        let mut files: BTreeSet<String> = batch.iter().cloned().collect();
        let ids: BTreeSet<u64> = batch
            .iter()
            .filter_map(|path| self.owners.get(path).copied())
            .collect();

        let mut waits = Vec::new();
        for id in ids {
            let Some(run) = self.runs.remove(&id) else {
                continue;
            };
            info!("Cancelling in-flight run for {:?}", run.files);
            run.cancel.cancel();
            for file in &run.files {
                self.release(file, id);
            }
            files.extend(run.files);
            waits.push(run.done);
        }
        (files.into_iter().collect(), waits)
    }

    fn register(
        &mut self,
        files: &[String],
        cancel: CancellationToken,
        done: CancellationToken,
    ) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        for file in files {
            self.owners.insert(file.clone(), id);
        }
        self.runs.insert(
            id,
            ActiveRun {
                files: files.to_vec(),
                cancel,
                done,
            },
        );
        id
    }

    /// Forget a finished run; false when it had already been superseded
    fn finish(&mut self, id: u64) -> bool {
        let Some(run) = self.runs.remove(&id) else {
            return false;
        };
        for file in &run.files {
            self.release(file, id);
        }
        true
    }

    fn release(&mut self, file: &str, id: u64) {
        if self.owners.get(file) == Some(&id) {
            self.owners.remove(file);
        }
    }

    fn cancel_all(&self) {
        for run in self.runs.values() {
            run.cancel.cancel();
        }
    }

    fn len(&self) -> usize {
        self.runs.len()
    }
}

pub struct WatchController {
    root: PathBuf,
    patterns: Vec<glob::Pattern>,
    debounce: Duration,
    journal: Option<WriteJournal>,
    retrigger: Retrigger,
}

impl WatchController {
    pub fn new(
        root: impl Into<PathBuf>,
        patterns: &[String],
        debounce: Duration,
        retrigger: Retrigger,
    ) -> Result<Self> {
        let patterns = patterns
            .iter()
            .map(|p| {
                glob::Pattern::new(p).map_err(|e| {
                    CadenceError::Config(format!("Invalid watch pattern {}: {}", p, e))
                })
            })
            .collect::<Result<Vec<_>>>()?;
        let root = root.into();
        let root = std::fs::canonicalize(&root).unwrap_or(root);

        Ok(Self {
            root,
            patterns,
            debounce,
            journal: None,
            retrigger,
        })
    }

    pub fn with_journal(mut self, journal: WriteJournal) -> Self {
        self.journal = Some(journal);
        self
    }

    /// Whether a repository-relative path is watched
    pub fn matches(&self, relative: &str) -> bool {
        validate_path(relative).is_ok() && self.patterns.iter().any(|p| p.matches(relative))
    }

    fn relative(&self, path: &Path) -> Option<String> {
        let relative = if path.is_absolute() {
            path.strip_prefix(&self.root).ok()?
        } else {
            path
        };
        let text = relative.to_str()?.replace('\\', "/");
        Some(text)
    }

    async fn changed_by_user(&self, relative: &str) -> bool {
        let Some(journal) = &self.journal else {
            return true;
        };
        let current = tokio::fs::read_to_string(self.root.join(relative)).await.ok();
        !journal.is_own_write(relative, current.as_deref())
    }

    /// Watch the repository until `cancel` fires
    pub async fn run(&self, cancel: CancellationToken) -> Result<u32> {
        let (tx, rx) = mpsc::unbounded_channel();

        let mut watcher = RecommendedWatcher::new(
            move |res: notify::Result<Event>| match res {
                Ok(event) => {
                    if matches!(
                        event.kind,
                        EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_)
                    ) {
                        for path in event.paths {
                            if tx.send(path).is_err() {
                                return;
                            }
                        }
                    }
                }
                Err(e) => error!("File watcher error: {}", e),
            },
            Config::default(),
        )
        .map_err(|e| CadenceError::Other(format!("Failed to start watcher: {}", e)))?;

        watcher
            .watch(&self.root, RecursiveMode::Recursive)
            .map_err(|e| {
                CadenceError::Other(format!("Failed to watch {}: {}", self.root.display(), e))
            })?;
        info!(
            "Watching {} for {} pattern(s)",
            self.root.display(),
            self.patterns.len()
        );

        let runs = self.run_with_events(rx, cancel).await;
        drop(watcher);
        runs
    }

    /// Start a run for `batch`, superseding runs that own any of its paths
    fn launch(
        &self,
        batch: &[String],
        registry: &mut RunRegistry,
        runs: &mut JoinSet<(u64, Vec<String>, Result<()>)>,
        cancel: &CancellationToken,
    ) {
        let (files, waits) = registry.supersede(batch);
        let token = cancel.child_token();
        let done = CancellationToken::new();
        let id = registry.register(&files, token.clone(), done.clone());
        info!(
            "Re-running orchestration for {} file(s), {} run(s) in flight",
            files.len(),
            registry.len()
        );

        let retrigger = Arc::clone(&self.retrigger);
        runs.spawn(async move {
            let _done = done.drop_guard();
            for previous in waits {
                previous.cancelled().await;
            }
            let result = if token.is_cancelled() {
                Err(CadenceError::Cancelled)
            } else {
                retrigger(files.clone(), token).await
            };
            (id, files, result)
        });
    }

    /// Process change notifications until the channel closes or `cancel`
    /// fires. Returns the number of runs started.
    pub async fn run_with_events(
        &self,
        mut events: mpsc::UnboundedReceiver<PathBuf>,
        cancel: CancellationToken,
    ) -> Result<u32> {
        let mut debouncer = Debouncer::new(self.debounce);
        let mut registry = RunRegistry::default();
        let mut runs: JoinSet<(u64, Vec<String>, Result<()>)> = JoinSet::new();
        let mut started = 0u32;
        let mut closed = false;

        loop {
            if closed && debouncer.is_empty() {
                break;
            }
            let deadline = debouncer.next_deadline();

            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("Watch cancelled");
                    break;
                }
                event = events.recv(), if !closed => match event {
                    Some(path) => {
                        if let Some(relative) = self.relative(&path).filter(|r| self.matches(r)) {
                            debug!("Change queued: {}", relative);
                            debouncer.push(relative, Instant::now());
                        }
                    }
                    None => closed = true,
                },
                _ = async {
                    match deadline {
                        Some(at) => tokio::time::sleep_until(at).await,
                        None => std::future::pending().await,
                    }
                } => {
                    let mut batch = Vec::new();
                    for path in debouncer.due(Instant::now()) {
                        if self.changed_by_user(&path).await {
                            batch.push(path);
                        } else {
                            debug!("Ignoring own write to {}", path);
                        }
                    }
                    if !batch.is_empty() {
                        self.launch(&batch, &mut registry, &mut runs, &cancel);
                        started += 1;
                    }
                }
                Some(joined) = runs.join_next(), if !runs.is_empty() => {
                    finish_run(&mut registry, joined);
                }
            }
        }

        if cancel.is_cancelled() {
            registry.cancel_all();
        }
        while let Some(joined) = runs.join_next().await {
            finish_run(&mut registry, joined);
        }
        Ok(started)
    }
}

fn finish_run(
    registry: &mut RunRegistry,
    joined: std::result::Result<(u64, Vec<String>, Result<()>), tokio::task::JoinError>,
) {
    match joined {
        Ok((id, files, result)) => {
            let current = registry.finish(id);
            match result {
                Ok(()) => debug!("Watch run for {:?} finished", files),
                Err(CadenceError::Cancelled) => debug!("Watch run for {:?} cancelled", files),
                Err(e) if current => warn!("Watch run for {:?} failed: {}", files, e),
                Err(e) => debug!("Superseded run for {:?} ended: {}", files, e),
            }
        }
        Err(e) => warn!("Watch run panicked: {}", e),
    }
}
