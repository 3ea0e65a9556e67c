//! Text generation for commit messages, pull request descriptions and
//! review instructions.
//!
//! These are one-shot calls to the agent CLI in `--print` mode. They are
//! conveniences, not workflow steps: [`ResilientGenerator`] turns every
//! failure into a deterministic fallback so a flaky generator never aborts
//! a task.

use std::process::Stdio;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use tokio::process::Command;

use crate::config::IvanConfig;
use crate::util::{extract_json_object, truncate_chars};

/// Diffs are cut to this many characters before being sent to the generator.
const MAX_DIFF_CHARS: usize = 20_000;

pub const FALLBACK_COMMIT_MESSAGE: &str = "chore: apply automated changes";
pub const FALLBACK_PR_BODY: &str =
    "This pull request was opened automatically. See the commits for details.";

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct PrContent {
    pub title: String,
    pub body: String,
}

/// Abstraction over the text generator.
/// Real implementation: `AgentTextGenerator`. Tests use fakes.
#[async_trait]
pub trait TextGenerator: Send + Sync {
    async fn commit_message(&self, diff: &str) -> Result<String>;

    async fn pr_content(&self, diff: &str, description: &str) -> Result<PrContent>;

    /// Turn a reviewer's comment into concrete instructions for the agent.
    async fn review_instructions(&self, comment: &str, path: &str, line: Option<i64>) -> Result<String>;
}

/// Text generator backed by `<agent> --print`.
pub struct AgentTextGenerator {
    program: String,
    model: Option<String>,
}

impl AgentTextGenerator {
    pub fn new(program: impl Into<String>, model: Option<String>) -> Self {
        Self {
            program: program.into(),
            model,
        }
    }

    pub fn from_config(config: &IvanConfig) -> Self {
        Self::new(config.executor.command.clone(), config.executor.model.clone())
    }

    async fn call(&self, prompt: &str) -> Result<String> {
        let mut cmd = Command::new(&self.program);
        cmd.args(["--print", "--output-format", "text", "-p", prompt]);
        if let Some(model) = &self.model {
            cmd.args(["--model", model]);
        }
        let output = cmd
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
            .with_context(|| format!("Failed to run {} for text generation", self.program))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            anyhow::bail!("Text generation failed: {}", stderr.trim());
        }
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }
}

#[async_trait]
impl TextGenerator for AgentTextGenerator {
    async fn commit_message(&self, diff: &str) -> Result<String> {
        let prompt = format!(
            "Write a git commit message for the following diff. Use the conventional commits \
             format (`type: summary`), a summary line under 72 characters, and an optional short \
             body. Reply with the commit message only.\n\n```diff\n{}\n```",
            truncate_chars(diff, MAX_DIFF_CHARS)
        );
        let raw = self.call(&prompt).await?;
        clean_commit_message(&raw).context("Generator returned an empty commit message")
    }

    async fn pr_content(&self, diff: &str, description: &str) -> Result<PrContent> {
        let prompt = format!(
            "Write a pull request title and description for this change.\n\n\
             Request: {}\n\n```diff\n{}\n```\n\n\
             Respond with JSON only: {{\"title\": \"...\", \"body\": \"...\"}}. \
             The body is Markdown with a short summary and a list of notable changes.",
            description,
            truncate_chars(diff, MAX_DIFF_CHARS)
        );
        let raw = self.call(&prompt).await?;
        parse_pr_content(&raw)
    }

    async fn review_instructions(&self, comment: &str, path: &str, line: Option<i64>) -> Result<String> {
        let location = match line {
            Some(l) => format!("{}:{}", path, l),
            None => path.to_string(),
        };
        let prompt = format!(
            "A code reviewer left this comment on {}:\n\n{}\n\n\
             Rewrite it as precise, actionable instructions for a coding agent that will make \
             the change. Reply with the instructions only.",
            location, comment
        );
        let raw = self.call(&prompt).await?;
        let text = raw.trim();
        if text.is_empty() {
            anyhow::bail!("Generator returned empty review instructions");
        }
        Ok(text.to_string())
    }
}

/// Strip code fences and quotes from a generated commit message.
pub fn clean_commit_message(raw: &str) -> Option<String> {
    let lines: Vec<&str> = raw
        .trim()
        .lines()
        .filter(|l| !l.trim_start().starts_with("```"))
        .collect();
    let message = lines.join("\n");
    let message = message.trim().trim_matches('"').trim();
    if message.is_empty() {
        None
    } else {
        Some(message.to_string())
    }
}

pub fn parse_pr_content(raw: &str) -> Result<PrContent> {
    let json = extract_json_object(raw).context("No JSON object in pull request response")?;
    let content: PrContent =
        serde_json::from_str(&json).context("Failed to parse pull request JSON")?;
    if content.title.trim().is_empty() {
        anyhow::bail!("Pull request title is empty");
    }
    Ok(PrContent {
        title: content.title.trim().to_string(),
        body: content.body.trim().to_string(),
    })
}

/// Wraps a [`TextGenerator`] so every call yields usable text.
#[derive(Clone)]
pub struct ResilientGenerator {
    inner: Arc<dyn TextGenerator>,
}

impl ResilientGenerator {
    pub fn new(inner: Arc<dyn TextGenerator>) -> Self {
        Self { inner }
    }

    pub async fn commit_message(&self, diff: &str) -> String {
        match self.inner.commit_message(diff).await {
            Ok(message) => message,
            Err(e) => {
                tracing::warn!(error = %e, "commit message generation failed, using fallback");
                FALLBACK_COMMIT_MESSAGE.to_string()
            }
        }
    }

    pub async fn pr_content(&self, diff: &str, description: &str) -> PrContent {
        match self.inner.pr_content(diff, description).await {
            Ok(content) => content,
            Err(e) => {
                tracing::warn!(error = %e, "pull request description generation failed, using fallback");
                fallback_pr_content(description)
            }
        }
    }

    pub async fn review_instructions(&self, comment: &str, path: &str, line: Option<i64>) -> String {
        match self.inner.review_instructions(comment, path, line).await {
            Ok(text) => text,
            Err(e) => {
                tracing::warn!(error = %e, "review instruction generation failed, using comment as-is");
                comment.trim().to_string()
            }
        }
    }
}

pub fn fallback_pr_content(description: &str) -> PrContent {
    let first_line = description.lines().next().unwrap_or("").trim();
    let title = if first_line.is_empty() {
        "Automated changes".to_string()
    } else {
        truncate_chars(first_line, 72)
    };
    PrContent {
        title,
        body: format!("{}\n\n## Request\n\n{}", FALLBACK_PR_BODY, description.trim()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FailingGenerator;

    #[async_trait]
    impl TextGenerator for FailingGenerator {
        async fn commit_message(&self, _diff: &str) -> Result<String> {
            anyhow::bail!("offline")
        }
        async fn pr_content(&self, _diff: &str, _description: &str) -> Result<PrContent> {
            anyhow::bail!("offline")
        }
        async fn review_instructions(&self, _c: &str, _p: &str, _l: Option<i64>) -> Result<String> {
            anyhow::bail!("offline")
        }
    }

    #[test]
    fn test_clean_commit_message() {
        assert_eq!(
            clean_commit_message("```\nfix: correct typo in README\n```\n").as_deref(),
            Some("fix: correct typo in README")
        );
        assert_eq!(
            clean_commit_message("\"feat: add x\"").as_deref(),
            Some("feat: add x")
        );
        assert!(clean_commit_message("  \n```\n```").is_none());
    }

    #[test]
    fn test_parse_pr_content() {
        let raw = "Sure!\n{\"title\": \"Fix typo\", \"body\": \"Fixes a typo in README.\"}";
        let content = parse_pr_content(raw).unwrap();
        assert_eq!(content.title, "Fix typo");
        assert_eq!(content.body, "Fixes a typo in README.");
        assert!(parse_pr_content("no json").is_err());
        assert!(parse_pr_content(r#"{"title": " ", "body": "x"}"#).is_err());
    }

    #[test]
    fn test_fallback_pr_content() {
        let content = fallback_pr_content("fix typo\nin the readme");
        assert_eq!(content.title, "fix typo");
        assert!(content.body.contains("in the readme"));
        assert_eq!(fallback_pr_content("").title, "Automated changes");
    }

    #[tokio::test]
    async fn test_resilient_generator_falls_back() {
        let generator = ResilientGenerator::new(Arc::new(FailingGenerator));
        assert_eq!(generator.commit_message("diff").await, FALLBACK_COMMIT_MESSAGE);
        assert_eq!(generator.pr_content("diff", "fix typo").await.title, "fix typo");
        assert_eq!(
            generator.review_instructions(" rename x ", "a.rs", Some(1)).await,
            "rename x"
        );
    }

    #[tokio::test]
    async fn test_agent_generator_missing_binary_errors() {
        let generator = AgentTextGenerator::new("definitely-not-a-generator-xyz", None);
        assert!(generator.commit_message("diff").await.is_err());
    }
}
