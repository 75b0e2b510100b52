//! Adapter for provider command-line tools
//!
//! The prompt is written to the child's stdin; stdout is the response. Any
//! credential is injected into the child's environment only.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, instrument, warn};

use crate::adapter::{write_output, ProviderAdapter, AVAILABILITY_TIMEOUT_SECS};
use crate::classify::classify_failure;
use crate::types::{AdapterInfo, AgentResult, ErrorCategory, ProviderError};

/// Output from a provider command
#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
}

impl From<std::process::Output> for CommandOutput {
    fn from(output: std::process::Output) -> Self {
        Self {
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            exit_code: output.status.code(),
        }
    }
}

/// Runs a provider CLI such as `claude -p`, `gemini -p` or `codex exec -`
#[derive(Debug, Clone)]
pub struct CommandAdapter {
    name: String,
    program: String,
    args: Vec<String>,
    model: Option<String>,
    env: Vec<(String, String)>,
    working_dir: Option<PathBuf>,
}

impl CommandAdapter {
    pub fn new(name: impl Into<String>, program: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            program: program.into(),
            args: Vec::new(),
            model: None,
            env: Vec::new(),
            working_dir: None,
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    /// Model name, passed as `--model <name>`
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    /// Set a variable in the child's environment (e.g. an opaque API key)
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args);
        if let Some(model) = &self.model {
            cmd.args(["--model", model]);
        }
        for (key, value) in &self.env {
            cmd.env(key, value);
        }
        if let Some(dir) = &self.working_dir {
            cmd.current_dir(dir);
        }
        cmd
    }

    async fn run(&self, prompt: &str) -> std::io::Result<CommandOutput> {
        let mut child = self
            .command()
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(prompt.as_bytes()).await?;
            stdin.shutdown().await?;
        }

        let output = child.wait_with_output().await?;
        Ok(CommandOutput::from(output))
    }

    fn error(&self, category: ErrorCategory, message: impl Into<String>) -> ProviderError {
        ProviderError::new(&self.name, category, message)
    }
}

#[async_trait]
impl ProviderAdapter for CommandAdapter {
    #[instrument(skip(self, prompt), fields(adapter = %self.name, prompt_len = prompt.len()))]
    async fn execute(&self, prompt: &str, output_target: Option<&Path>) -> AgentResult {
        let started = Instant::now();
        let elapsed = || started.elapsed().as_millis() as u64;

        let output = match self.run(prompt).await {
            Ok(output) => output,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return AgentResult::failure(
                    self.error(
                        ErrorCategory::Unavailable,
                        format!("{} not found on PATH", self.program),
                    ),
                    elapsed(),
                );
            }
            Err(e) => {
                let message = format!("Failed to run {}: {}", self.program, e);
                let category = classify_failure(&message, None);
                return AgentResult::failure(self.error(category, message), elapsed());
            }
        };

        if output.exit_code != Some(0) {
            let combined = format!("{}\n{}", output.stderr, output.stdout);
            let category = classify_failure(&combined, output.exit_code);
            debug!("{} exited with {:?}: {}", self.program, output.exit_code, output.stderr);
            let message = output
                .stderr
                .lines()
                .find(|l| !l.trim().is_empty())
                .unwrap_or("command failed without output")
                .to_string();
            return AgentResult::failure(self.error(category, message), elapsed());
        }

        if output.stdout.trim().is_empty() {
            // Some CLIs exit 0 but print the provider error on stderr
            let category = match classify_failure(&output.stderr, None) {
                ErrorCategory::Unknown => ErrorCategory::InvalidResponse,
                other => other,
            };
            return AgentResult::failure(self.error(category, "empty response"), elapsed());
        }

        let mut result = AgentResult::success(output.stdout, elapsed());
        result.provider = Some(self.name.clone());
        if let Some(target) = output_target {
            if let Err(e) = write_output(target, &result.output).await {
                warn!("Failed to write output to {}: {}", target.display(), e);
                return AgentResult::failure(
                    self.error(ErrorCategory::Unknown, format!("Failed to write output: {}", e)),
                    elapsed(),
                );
            }
            result = result.with_output_file(target.to_path_buf());
        }
        result
    }

    async fn is_available(&self) -> bool {
        let probe = Command::new(&self.program)
            .arg("--version")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .status();

        match tokio::time::timeout(Duration::from_secs(AVAILABILITY_TIMEOUT_SECS), probe).await {
            Ok(Ok(status)) => status.success(),
            _ => false,
        }
    }

    fn info(&self) -> AdapterInfo {
        AdapterInfo {
            name: self.name.clone(),
            model: self.model.clone().unwrap_or_else(|| "default".to_string()),
            provider: self.program.clone(),
        }
    }
}
