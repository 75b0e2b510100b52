//! Configuration management for Cadence
//!
//! Two layers:
//! - [`ProjectConfig`]: repository-level settings loaded from `.cadence/config.toml`,
//!   including provider adapters and the fallback chain for each role
//! - [`OrchestratorConfig`]: the immutable per-session snapshot resolved from the
//!   project config plus command-line overrides

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

use crate::types::AgentRole;
use crate::{CadenceError, Result};

/// Immutable configuration snapshot for one session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Per adapter call timeout
    pub timeout_secs: u64,
    /// Audit iterations per file before consultation
    pub max_iterations: u32,
    /// Skip the approval gate
    pub auto_approve: bool,
    /// Run files concurrently
    pub parallel: bool,
    /// Worker pool size
    pub max_concurrency: usize,
    /// Overlap auditing of finished files with execution of others
    pub pipeline: bool,
    /// Re-trigger on file changes
    pub watch: bool,
    pub watch_patterns: Vec<String>,
    pub watch_debounce_ms: u64,
    /// Gate commit on a test run
    pub run_tests: bool,
    pub test_command: Option<String>,
    /// Test failure fails the session (otherwise recorded as a warning)
    pub tests_required: bool,
    /// Invoke the committer in the committing phase
    pub git_commit: bool,
    pub commit_message: Option<String>,
    /// Languages whose syntax validators run (empty = all known)
    pub languages: Vec<String>,
    /// Per-role prompt prefixes, forwarded verbatim
    pub custom_prompts: BTreeMap<AgentRole, String>,
    pub max_recovery_attempts: u32,
    pub recovery_timeout_minutes: u64,
    pub recovery_backoff_ms: u64,
    pub auto_revert_on_failure: bool,
    /// Whole-session deadline
    pub session_timeout_secs: Option<u64>,
    /// Plan for real, simulate execution and audit
    pub dry_run: bool,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 300,
            max_iterations: 3,
            auto_approve: false,
            parallel: false,
            max_concurrency: 3,
            pipeline: false,
            watch: false,
            watch_patterns: vec!["src/**/*".to_string()],
            watch_debounce_ms: 300,
            run_tests: false,
            test_command: None,
            tests_required: true,
            git_commit: false,
            commit_message: None,
            languages: Vec::new(),
            custom_prompts: BTreeMap::new(),
            max_recovery_attempts: 3,
            recovery_timeout_minutes: 10,
            recovery_backoff_ms: 1000,
            auto_revert_on_failure: true,
            session_timeout_secs: None,
            dry_run: false,
        }
    }
}

impl OrchestratorConfig {
    /// Build the session snapshot from project config and overrides
    pub fn resolve(project: &ProjectConfig, overrides: &ConfigOverrides) -> Result<Self> {
        let mut config = project.orchestrator.clone();
        overrides.apply(&mut config);
        config.validate()?;
        Ok(config)
    }

    /// Reject configurations the orchestrator cannot honor
    pub fn validate(&self) -> Result<()> {
        if self.max_iterations == 0 {
            return Err(CadenceError::Config("max_iterations must be at least 1".into()));
        }
        if self.max_concurrency == 0 {
            return Err(CadenceError::Config("max_concurrency must be at least 1".into()));
        }
        if self.timeout_secs == 0 {
            return Err(CadenceError::Config("timeout_secs must be positive".into()));
        }
        if self.max_recovery_attempts == 0 {
            return Err(CadenceError::Config(
                "max_recovery_attempts must be at least 1".into(),
            ));
        }
        if self.run_tests
            && self
                .test_command
                .as_deref()
                .map(str::trim)
                .unwrap_or("")
                .is_empty()
        {
            return Err(CadenceError::Config(
                "run_tests requires a test_command".into(),
            ));
        }
        if self.watch && self.watch_patterns.is_empty() {
            return Err(CadenceError::Config(
                "watch mode requires at least one watch pattern".into(),
            ));
        }
        Ok(())
    }

    /// Prompt prefix configured for a role
    pub fn prompt_prefix(&self, role: AgentRole) -> Option<&str> {
        self.custom_prompts.get(&role).map(String::as_str)
    }
}

/// Command-line overrides applied on top of the project config
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub timeout_secs: Option<u64>,
    pub max_iterations: Option<u32>,
    pub auto_approve: Option<bool>,
    pub parallel: Option<bool>,
    pub max_concurrency: Option<usize>,
    pub pipeline: Option<bool>,
    pub watch: Option<bool>,
    pub watch_patterns: Option<Vec<String>>,
    pub run_tests: Option<bool>,
    pub test_command: Option<String>,
    pub tests_required: Option<bool>,
    pub git_commit: Option<bool>,
    pub commit_message: Option<String>,
    pub languages: Option<Vec<String>>,
    pub auto_revert_on_failure: Option<bool>,
    pub session_timeout_secs: Option<u64>,
    pub dry_run: Option<bool>,
}

impl ConfigOverrides {
    fn apply(&self, config: &mut OrchestratorConfig) {
        macro_rules! set {
            ($field:ident) => {
                if let Some(v) = &self.$field {
                    config.$field = v.clone();
                }
            };
        }
        set!(timeout_secs);
        set!(max_iterations);
        set!(auto_approve);
        set!(parallel);
        set!(max_concurrency);
        set!(pipeline);
        set!(watch);
        set!(watch_patterns);
        set!(run_tests);
        set!(tests_required);
        set!(git_commit);
        set!(languages);
        set!(auto_revert_on_failure);
        set!(dry_run);
        if self.test_command.is_some() {
            config.test_command = self.test_command.clone();
        }
        if self.commit_message.is_some() {
            config.commit_message = self.commit_message.clone();
        }
        if self.session_timeout_secs.is_some() {
            config.session_timeout_secs = self.session_timeout_secs;
        }
    }
}

/// How an adapter talks to its backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AdapterKind {
    /// A provider CLI reading the prompt from stdin
    Command,
    /// The Anthropic messages HTTP API
    Anthropic,
}

/// One provider adapter declaration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdapterConfig {
    pub kind: AdapterKind,
    /// Program for `command` adapters
    #[serde(default)]
    pub program: Option<String>,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub model: Option<String>,
    /// Environment variable the CLI reads the credential from
    #[serde(default)]
    pub api_key_env: Option<String>,
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default)]
    pub max_tokens: Option<usize>,
}

impl AdapterConfig {
    pub fn command(program: &str, args: &[&str]) -> Self {
        Self {
            kind: AdapterKind::Command,
            program: Some(program.to_string()),
            args: args.iter().map(|a| a.to_string()).collect(),
            model: None,
            api_key_env: None,
            endpoint: None,
            max_tokens: None,
        }
    }
}

/// Ordered adapter names per role
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleChains {
    #[serde(alias = "planner")]
    pub architect: Vec<String>,
    pub executor: Vec<String>,
    pub auditor: Vec<String>,
    #[serde(default)]
    pub consultant: Vec<String>,
}

impl RoleChains {
    pub fn for_role(&self, role: AgentRole) -> &[String] {
        match role {
            AgentRole::Architect => &self.architect,
            AgentRole::Executor => &self.executor,
            AgentRole::Auditor => &self.auditor,
            AgentRole::Consultant => &self.consultant,
        }
    }
}

impl Default for RoleChains {
    fn default() -> Self {
        Self {
            architect: vec!["claude".to_string(), "gemini".to_string()],
            executor: vec!["codex".to_string(), "claude".to_string()],
            auditor: vec!["gemini".to_string(), "claude".to_string()],
            consultant: vec!["claude".to_string()],
        }
    }
}

/// Repository-level Cadence configuration
///
/// Loaded from `.cadence/config.toml` in the repo root.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectConfig {
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,

    #[serde(default = "default_adapters")]
    pub adapters: BTreeMap<String, AdapterConfig>,

    #[serde(default)]
    pub roles: RoleChains,
}

fn default_adapters() -> BTreeMap<String, AdapterConfig> {
    let mut adapters = BTreeMap::new();
    adapters.insert("claude".to_string(), AdapterConfig::command("claude", &["-p"]));
    adapters.insert("gemini".to_string(), AdapterConfig::command("gemini", &["-p"]));
    adapters.insert("codex".to_string(), AdapterConfig::command("codex", &["exec", "-"]));
    adapters
}

impl Default for ProjectConfig {
    fn default() -> Self {
        Self {
            orchestrator: OrchestratorConfig::default(),
            adapters: default_adapters(),
            roles: RoleChains::default(),
        }
    }
}

impl ProjectConfig {
    /// Load configuration from `.cadence/config.toml` or use defaults
    pub fn load_or_default(repo_root: &Path) -> Result<Self> {
        let config_path = repo_root.join(".cadence/config.toml");

        if config_path.exists() {
            let content = std::fs::read_to_string(&config_path)?;
            let config: Self = toml::from_str(&content).map_err(|e| {
                CadenceError::Config(format!("Failed to parse config file: {}", e))
            })?;
            config.validate_roles()?;
            Ok(config)
        } else {
            Ok(Self::default())
        }
    }

    /// Write default configuration to `.cadence/config.toml`
    pub fn write_default(repo_root: &Path) -> Result<()> {
        let config_dir = repo_root.join(".cadence");
        std::fs::create_dir_all(&config_dir)?;

        let config_path = config_dir.join("config.toml");
        let content = toml::to_string_pretty(&Self::default())
            .map_err(|e| CadenceError::Config(format!("Failed to serialize config: {}", e)))?;
        std::fs::write(&config_path, content)?;
        Ok(())
    }

    /// Every role chain must reference declared adapters; the first three roles
    /// need at least one adapter each
    pub fn validate_roles(&self) -> Result<()> {
        for role in AgentRole::ALL {
            let chain = self.roles.for_role(role);
            if chain.is_empty() && role != AgentRole::Consultant {
                return Err(CadenceError::Config(format!(
                    "Role {} has no adapters configured",
                    role
                )));
            }
            for name in chain {
                if !self.adapters.contains_key(name) {
                    return Err(CadenceError::Config(format!(
                        "Role {} references unknown adapter '{}'",
                        role, name
                    )));
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_defaults() {
        let config = OrchestratorConfig::default();
        assert_eq!(config.timeout_secs, 300);
        assert_eq!(config.max_concurrency, 3);
        assert_eq!(config.watch_debounce_ms, 300);
        assert!(config.auto_revert_on_failure);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_overrides_apply_and_validate() {
        let project = ProjectConfig::default();
        let overrides = ConfigOverrides {
            parallel: Some(true),
            max_concurrency: Some(5),
            auto_approve: Some(true),
            ..Default::default()
        };
        let config = OrchestratorConfig::resolve(&project, &overrides).unwrap();
        assert!(config.parallel);
        assert_eq!(config.max_concurrency, 5);
        assert!(config.auto_approve);
    }

    #[test]
    fn test_invalid_config_rejected() {
        let project = ProjectConfig::default();
        let overrides = ConfigOverrides {
            run_tests: Some(true),
            ..Default::default()
        };
        assert!(matches!(
            OrchestratorConfig::resolve(&project, &overrides),
            Err(CadenceError::Config(_))
        ));

        let overrides = ConfigOverrides {
            max_iterations: Some(0),
            ..Default::default()
        };
        assert!(OrchestratorConfig::resolve(&project, &overrides).is_err());
    }

    #[test]
    fn test_load_missing_uses_defaults() {
        let dir = tempdir().unwrap();
        let config = ProjectConfig::load_or_default(dir.path()).unwrap();
        assert_eq!(config, ProjectConfig::default());
    }

    #[test]
    fn test_write_then_load_default() {
        let dir = tempdir().unwrap();
        ProjectConfig::write_default(dir.path()).unwrap();
        let config = ProjectConfig::load_or_default(dir.path()).unwrap();
        assert_eq!(config.roles.architect, vec!["claude", "gemini"]);
        assert_eq!(config.adapters["codex"].kind, AdapterKind::Command);
    }

    #[test]
    fn test_load_partial_file() {
        let dir = tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join(".cadence")).unwrap();
        std::fs::write(
            dir.path().join(".cadence/config.toml"),
            r#"
[orchestrator]
max_iterations = 2
pipeline = true

[orchestrator.custom_prompts]
auditor = "Be strict about error handling."

[adapters.claude]
kind = "command"
program = "claude"
args = ["-p"]

[adapters.api]
kind = "anthropic"
model = "claude-sonnet-4-5"
api_key_env = "ANTHROPIC_API_KEY"

[roles]
planner = ["claude", "api"]
executor = ["claude"]
auditor = ["api"]
"#,
        )
        .unwrap();

        let config = ProjectConfig::load_or_default(dir.path()).unwrap();
        assert_eq!(config.orchestrator.max_iterations, 2);
        assert!(config.orchestrator.pipeline);
        assert_eq!(config.orchestrator.timeout_secs, 300);
        assert_eq!(
            config.orchestrator.prompt_prefix(AgentRole::Auditor),
            Some("Be strict about error handling.")
        );
        assert_eq!(config.roles.architect, vec!["claude", "api"]);
        assert!(config.roles.consultant.is_empty());
    }

    #[test]
    fn test_unknown_adapter_rejected() {
        let mut config = ProjectConfig::default();
        config.roles.executor = vec!["missing".to_string()];
        assert!(matches!(
            config.validate_roles(),
            Err(CadenceError::Config(_))
        ));
    }
}
