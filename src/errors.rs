//! Typed error hierarchy for the ivan orchestrator.
//!
//! `IvanError` is the single taxonomy surfaced by the executor, worktree,
//! code-host and orchestrator layers. Plumbing code (store, configuration,
//! git helpers) works in `anyhow::Result` and is folded into
//! `IvanError::Other` at the boundary.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum IvanError {
    /// A required external tool is missing. Fatal, never retried.
    #[error("{tool} is not installed or not on PATH. {hint}")]
    NotInstalled { tool: String, hint: String },

    /// The code-hosting platform (or agent) rejected or lacks credentials.
    #[error("Authentication required: {0}")]
    AuthenticationRequired(String),

    /// The agent call itself failed.
    #[error("Agent execution failed{}{}", exit_suffix(.exit_code), stderr_suffix(.stderr))]
    ExecutionFailed {
        exit_code: Option<i32>,
        stderr: Option<String>,
    },

    /// Pre-submit hooks still failing after the repair loop gave up.
    #[error("Could not satisfy pre-submit checks after {attempts} attempts:\n{output}")]
    ValidationFailed { attempts: u32, output: String },

    /// Worktree creation could not be reconciled even after a forced recreate.
    #[error("Worktree conflict on branch {branch}: {message}")]
    WorktreeConflict { branch: String, message: String },

    /// Push or pull-request creation failed.
    #[error("Publish failed: {0}")]
    PublishFailed(String),

    /// The operator interrupted the run.
    #[error("Cancelled by user")]
    Cancelled,

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

fn exit_suffix(code: &Option<i32>) -> String {
    match code {
        Some(c) => format!(" with exit code {}", c),
        None => String::new(),
    }
}

fn stderr_suffix(stderr: &Option<String>) -> String {
    match stderr.as_deref().map(str::trim) {
        Some(s) if !s.is_empty() => format!(": {}", s),
        _ => String::new(),
    }
}

impl IvanError {
    pub fn not_installed(tool: &str, hint: &str) -> Self {
        Self::NotInstalled {
            tool: tool.to_string(),
            hint: hint.to_string(),
        }
    }

    pub fn execution_failed(exit_code: Option<i32>, stderr: impl Into<String>) -> Self {
        let stderr = stderr.into();
        Self::ExecutionFailed {
            exit_code,
            stderr: if stderr.trim().is_empty() {
                None
            } else {
                Some(stderr)
            },
        }
    }

    /// Errors that abort the whole run instead of just the current task.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::NotInstalled { .. } | Self::AuthenticationRequired(_) | Self::Cancelled
        )
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

pub type IvanResult<T> = std::result::Result<T, IvanError>;
