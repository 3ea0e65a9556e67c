//! Configuration for ivan.
//!
//! Settings are read from `~/.ivan/config.toml` and layered
//! file → environment → CLI:
//!
//! ```toml
//! [executor]
//! backend = "session"          # or "process"
//! command = "claude"
//! model = "sonnet"
//! allowed_tools = ["Read", "Edit", "Write", "Bash(npm test:*)"]
//!
//! [github]
//! auth = "cli"                 # or "token"
//! draft = false
//!
//! [workflow]
//! name = "ivan"                # branch prefix and worktree directory suffix
//! max_commit_attempts = 3
//! review_wait_minutes = 30
//! install_dependencies = true
//!
//! [repos."acme/widgets"]
//! instructions = "Run `npm run lint` before finishing."
//! ```

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Which agent backend executes tasks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutorBackend {
    /// Structured stream-json session, resumable by session id.
    #[default]
    Session,
    /// Long-lived interactive subprocess with live stdout/stderr.
    Process,
}

impl std::fmt::Display for ExecutorBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExecutorBackend::Session => write!(f, "session"),
            ExecutorBackend::Process => write!(f, "process"),
        }
    }
}

impl std::str::FromStr for ExecutorBackend {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "session" | "sdk" => Ok(ExecutorBackend::Session),
            "process" | "cli" => Ok(ExecutorBackend::Process),
            _ => anyhow::bail!("Invalid executor backend '{}'. Valid values: session, process", s),
        }
    }
}

/// How ivan authenticates against GitHub.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GithubAuth {
    /// Delegate to an authenticated `gh` CLI.
    #[default]
    Cli,
    /// Bearer token against the REST/GraphQL API.
    Token,
}

impl std::str::FromStr for GithubAuth {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "cli" | "gh" => Ok(GithubAuth::Cli),
            "token" | "pat" => Ok(GithubAuth::Token),
            _ => anyhow::bail!("Invalid GitHub auth mode '{}'. Valid values: cli, token", s),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorSection {
    #[serde(default)]
    pub backend: ExecutorBackend,
    /// Agent CLI command (default: "claude")
    #[serde(default = "default_command")]
    pub command: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    /// Tool allow-list passed to the agent in addition to repository permissions
    #[serde(default)]
    pub allowed_tools: Vec<String>,
}

fn default_command() -> String {
    "claude".to_string()
}

impl Default for ExecutorSection {
    fn default() -> Self {
        Self {
            backend: ExecutorBackend::default(),
            command: default_command(),
            model: None,
            allowed_tools: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GithubSection {
    #[serde(default)]
    pub auth: GithubAuth,
    /// Token for `auth = "token"`; usually supplied through GITHUB_TOKEN instead
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    /// Open pull requests as drafts
    #[serde(default)]
    pub draft: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowSection {
    /// Branch prefix and worktree directory suffix
    #[serde(default = "default_name")]
    pub name: String,
    #[serde(default = "default_max_commit_attempts")]
    pub max_commit_attempts: u32,
    #[serde(default = "default_review_wait_minutes")]
    pub review_wait_minutes: u64,
    /// Run the project's dependency install inside fresh worktrees
    #[serde(default = "default_install_dependencies")]
    pub install_dependencies: bool,
}

fn default_name() -> String {
    "ivan".to_string()
}

fn default_max_commit_attempts() -> u32 {
    3
}

fn default_review_wait_minutes() -> u64 {
    30
}

fn default_install_dependencies() -> bool {
    true
}

impl Default for WorkflowSection {
    fn default() -> Self {
        Self {
            name: default_name(),
            max_commit_attempts: default_max_commit_attempts(),
            review_wait_minutes: default_review_wait_minutes(),
            install_dependencies: default_install_dependencies(),
        }
    }
}

/// Per-repository settings keyed by `owner/name`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RepoSettings {
    #[serde(default)]
    pub instructions: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IvanConfig {
    #[serde(default)]
    pub executor: ExecutorSection,
    #[serde(default)]
    pub github: GithubSection,
    #[serde(default)]
    pub workflow: WorkflowSection,
    #[serde(default)]
    pub repos: HashMap<String, RepoSettings>,
    /// SQLite database location (default: ~/.ivan/db.sqlite)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub db_path: Option<PathBuf>,
}

impl IvanConfig {
    /// Directory holding config.toml and the database.
    pub fn home_dir() -> Result<PathBuf> {
        let home = dirs::home_dir().context("Could not determine home directory")?;
        Ok(home.join(".ivan"))
    }

    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse config.toml")
    }

    pub fn load_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::parse(&content)
    }

    /// Load `~/.ivan/config.toml` (defaults if absent) and apply environment overrides.
    pub fn load() -> Result<Self> {
        let path = Self::home_dir()?.join("config.toml");
        let mut config = if path.exists() {
            Self::load_file(&path)?
        } else {
            Self::default()
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// Apply environment overrides through `lookup` (injectable for tests).
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(backend) = lookup("IVAN_EXECUTOR") {
            self.executor.backend = backend.parse()?;
        }
        if let Some(model) = lookup("IVAN_MODEL") {
            self.executor.model = Some(model);
        }
        if let Some(cmd) = lookup("CLAUDE_CMD") {
            self.executor.command = cmd;
        }
        if let Some(auth) = lookup("IVAN_GITHUB_AUTH") {
            self.github.auth = auth.parse()?;
        }
        if let Some(token) = lookup("GITHUB_TOKEN").filter(|t| !t.trim().is_empty()) {
            self.github.token = Some(token);
        }
        if let Some(path) = lookup("IVAN_DB_PATH") {
            self.db_path = Some(PathBuf::from(path));
        }
        Ok(())
    }

    pub fn db_path(&self) -> Result<PathBuf> {
        match &self.db_path {
            Some(path) => Ok(path.clone()),
            None => Ok(Self::home_dir()?.join("db.sqlite")),
        }
    }

    /// Extra prompt instructions configured for `owner/name`.
    pub fn repo_instructions(&self, repo_slug: &str) -> Option<&str> {
        self.repos
            .get(repo_slug)
            .and_then(|r| r.instructions.as_deref())
            .filter(|s| !s.trim().is_empty())
    }

    /// Validate the configuration and return any warnings.
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();

        if self.github.auth == GithubAuth::Token && self.github.token.is_none() {
            warnings.push(
                "github.auth = \"token\" but no token is configured (set GITHUB_TOKEN)".to_string(),
            );
        }
        if self.workflow.max_commit_attempts == 0 {
            warnings.push("workflow.max_commit_attempts is 0; commits will never be attempted".to_string());
        }
        if self.workflow.name.trim().is_empty() || self.workflow.name.contains('/') {
            warnings.push(format!(
                "workflow.name '{}' must be a non-empty single path segment",
                self.workflow.name
            ));
        }
        if self.executor.command.trim().is_empty() {
            warnings.push("executor.command is empty".to_string());
        }

        warnings
    }
}
