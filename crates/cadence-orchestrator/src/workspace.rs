//! File access for generated changes
//!
//! All paths come from provider output, so each one is validated before it
//! touches the disk: relative, no `..`, nothing under protected directories.

use cadence_core::{CadenceError, Result};
use cadence_state::content_digest;
use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio::fs;
use tracing::debug;

/// Directories and files generated content may never write to
const PROTECTED: &[&str] = &[".git", ".cadence", ".jj", ".env"];

/// Validate a plan-supplied path and return it as a relative path
pub fn validate_path(path: &str) -> Result<PathBuf> {
    let candidate = Path::new(path);

    if path.trim().is_empty() {
        return Err(CadenceError::PathValidation("Empty path".to_string()));
    }

    if candidate.is_absolute() {
        return Err(CadenceError::PathValidation(format!(
            "Absolute paths not allowed: {}",
            path
        )));
    }

    for component in candidate.components() {
        match component {
            Component::ParentDir => {
                return Err(CadenceError::PathValidation(format!(
                    "Path traversal not allowed: {}",
                    path
                )))
            }
            Component::Prefix(_) | Component::RootDir => {
                return Err(CadenceError::PathValidation(format!(
                    "Absolute paths not allowed: {}",
                    path
                )))
            }
            _ => {}
        }
    }

    let first = candidate
        .components()
        .find_map(|c| match c {
            Component::Normal(name) => name.to_str(),
            _ => None,
        })
        .unwrap_or_default();
    if PROTECTED.contains(&first) {
        return Err(CadenceError::PathValidation(format!(
            "Cannot write to protected path: {}",
            path
        )));
    }

    Ok(candidate.to_path_buf())
}

/// Digests of the content this process last wrote, per path
///
/// Watch mode uses it to tell its own writes apart from user edits.
/// `None` records a deletion.
#[derive(Debug, Clone, Default)]
pub struct WriteJournal {
    entries: Arc<Mutex<HashMap<String, Option<String>>>>,
}

impl WriteJournal {
    pub fn new() -> Self {
        Self::default()
    }

    fn record(&self, path: &str, content: Option<&str>) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.insert(path.to_string(), content.map(content_digest));
        }
    }

    /// Whether `current` is exactly what this process last left at `path`
    pub fn is_own_write(&self, path: &str, current: Option<&str>) -> bool {
        let Ok(entries) = self.entries.lock() else {
            return false;
        };
        match entries.get(path) {
            Some(recorded) => *recorded == current.map(content_digest),
            None => false,
        }
    }
}

/// Repository working tree the session writes into
#[derive(Debug, Clone)]
pub struct Workspace {
    root: PathBuf,
    journal: Option<WriteJournal>,
}

impl Workspace {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            journal: None,
        }
    }

    pub fn with_journal(mut self, journal: WriteJournal) -> Self {
        self.journal = Some(journal);
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Absolute location of a validated relative path
    pub fn resolve(&self, path: &str) -> Result<PathBuf> {
        Ok(self.root.join(validate_path(path)?))
    }

    /// Current content, `None` if the file does not exist
    pub async fn read(&self, path: &str) -> Result<Option<String>> {
        match fs::read_to_string(self.resolve(path)?).await {
            Ok(content) => Ok(Some(content)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn write(&self, path: &str, content: &str) -> Result<()> {
        let target = self.resolve(path)?;
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::write(&target, content).await?;
        if let Some(journal) = &self.journal {
            journal.record(path, Some(content));
        }
        debug!("Wrote {} ({} bytes)", path, content.len());
        Ok(())
    }

    /// Delete a file; a missing file is not an error
    pub async fn remove(&self, path: &str) -> Result<()> {
        match fs::remove_file(self.resolve(path)?).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        if let Some(journal) = &self.journal {
            journal.record(path, None);
        }
        Ok(())
    }
}
