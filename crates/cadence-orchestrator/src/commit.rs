//! Commit step for accepted files

use async_trait::async_trait;
use cadence_core::{CadenceError, Result};
use std::path::Path;
use tokio::process::Command;
use tracing::{debug, info};

#[async_trait]
pub trait Committer: Send + Sync {
    /// Commit `files` and return the new revision id
    async fn commit(&self, root: &Path, files: &[String], message: &str) -> Result<String>;
}

/// Commits through the `git` binary
#[derive(Debug, Clone, Copy, Default)]
pub struct GitCommitter;

async fn git(root: &Path, args: &[&str]) -> Result<String> {
    debug!("git {}", args.join(" "));
    let output = Command::new("git")
        .args(args)
        .current_dir(root)
        .output()
        .await
        .map_err(|e| CadenceError::Other(format!("Failed to run git: {}", e)))?;

    if !output.status.success() {
        return Err(CadenceError::Other(format!(
            "git {} failed: {}",
            args.first().copied().unwrap_or_default(),
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }
    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

#[async_trait]
impl Committer for GitCommitter {
    async fn commit(&self, root: &Path, files: &[String], message: &str) -> Result<String> {
        if files.is_empty() {
            return Err(CadenceError::Other("Nothing to commit".to_string()));
        }

        let mut add = vec!["add", "--"];
        add.extend(files.iter().map(String::as_str));
        git(root, &add).await?;
        git(root, &["commit", "-m", message]).await?;

        let rev = git(root, &["rev-parse", "--short", "HEAD"]).await?;
        info!("Committed {} file(s) as {}", files.len(), rev);
        Ok(rev)
    }
}

/// Commit message for a session
pub fn commit_message(configured: Option<&str>, task: &str) -> String {
    match configured {
        Some(message) if !message.trim().is_empty() => message.trim().to_string(),
        _ => {
            let subject: String = task
                .lines()
                .next()
                .unwrap_or_default()
                .chars()
                .take(72)
                .collect();
            format!("cadence: {}", subject.trim())
        }
    }
}
