//! Tool permissions for the agent.
//!
//! Worktrees carry no local `.claude/` settings of their own, so permissions
//! are read from the origin checkout the worktree was created from.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;

#[derive(Debug, Default, Deserialize)]
struct SettingsFile {
    #[serde(default)]
    permissions: Permissions,
}

#[derive(Debug, Default, Deserialize)]
struct Permissions {
    #[serde(default)]
    allow: Vec<String>,
}

/// Resolve the original checkout for `dir`.
///
/// In a linked worktree `.git` is a file holding
/// `gitdir: <origin>/.git/worktrees/<name>`; the origin is the parent of
/// that `.git` directory. A regular checkout resolves to itself. Returns
/// `None` when `dir` is not a git checkout at all.
pub fn origin_checkout(dir: &Path) -> Option<PathBuf> {
    let dot_git = dir.join(".git");
    if dot_git.is_dir() {
        return Some(dir.to_path_buf());
    }
    let content = std::fs::read_to_string(&dot_git).ok()?;
    let gitdir = content
        .lines()
        .find_map(|line| line.strip_prefix("gitdir:"))?
        .trim();
    let gitdir = if Path::new(gitdir).is_absolute() {
        PathBuf::from(gitdir)
    } else {
        dir.join(gitdir)
    };

    gitdir
        .ancestors()
        .find(|p| p.file_name().is_some_and(|n| n == ".git"))
        .and_then(Path::parent)
        .map(Path::to_path_buf)
}

/// Read the `permissions.allow` list of a settings file. Missing file ⇒ empty.
fn read_allow_list(path: &Path) -> Result<Vec<String>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let settings: SettingsFile = serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse {}", path.display()))?;
    Ok(settings.permissions.allow)
}

/// Allowed tools for an agent running in `working_dir`: the configured list
/// followed by the origin checkout's `.claude/settings.json` and
/// `.claude/settings.local.json` entries, deduplicated in order.
pub fn resolve_allowed_tools(working_dir: &Path, configured: &[String]) -> Vec<String> {
    let mut tools: Vec<String> = configured.to_vec();

    if let Some(origin) = origin_checkout(working_dir) {
        let claude_dir = origin.join(".claude");
        for name in ["settings.json", "settings.local.json"] {
            match read_allow_list(&claude_dir.join(name)) {
                Ok(allow) => tools.extend(allow),
                Err(e) => tracing::warn!(error = %e, "ignoring unreadable agent settings"),
            }
        }
    }

    let mut seen = std::collections::HashSet::new();
    tools.retain(|t| seen.insert(t.clone()));
    tools
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_origin_of_regular_checkout_is_itself() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join(".git")).unwrap();
        assert_eq!(origin_checkout(dir.path()), Some(dir.path().to_path_buf()));
    }

    #[test]
    fn test_origin_of_worktree_follows_gitlink() {
        let root = tempfile::tempdir().unwrap();
        let origin = root.path().join("repo");
        let worktree = root.path().join(".repo-ivan-worktrees").join("ivan").join("fix-000001");
        std::fs::create_dir_all(origin.join(".git/worktrees/fix-000001")).unwrap();
        std::fs::create_dir_all(&worktree).unwrap();
        std::fs::write(
            worktree.join(".git"),
            format!("gitdir: {}\n", origin.join(".git/worktrees/fix-000001").display()),
        )
        .unwrap();

        assert_eq!(origin_checkout(&worktree), Some(origin));
    }

    #[test]
    fn test_origin_of_non_checkout_is_none() {
        let dir = tempfile::tempdir().unwrap();
        assert!(origin_checkout(dir.path()).is_none());
    }

    #[test]
    fn test_resolve_allowed_tools_merges_and_dedupes() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join(".git")).unwrap();
        std::fs::create_dir_all(dir.path().join(".claude")).unwrap();
        std::fs::write(
            dir.path().join(".claude/settings.local.json"),
            r#"{"permissions":{"allow":["Bash(npm test:*)","Edit"]}}"#,
        )
        .unwrap();

        let tools = resolve_allowed_tools(dir.path(), &["Edit".to_string(), "Read".to_string()]);
        assert_eq!(tools, vec!["Edit", "Read", "Bash(npm test:*)"]);
    }

    #[test]
    fn test_resolve_allowed_tools_ignores_bad_json() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join(".git")).unwrap();
        std::fs::create_dir_all(dir.path().join(".claude")).unwrap();
        std::fs::write(dir.path().join(".claude/settings.json"), "{not json").unwrap();

        let tools = resolve_allowed_tools(dir.path(), &["Read".to_string()]);
        assert_eq!(tools, vec!["Read"]);
    }
}
