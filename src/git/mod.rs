//! Git operations.
//!
//! Mutating commands (worktrees, commits, pushes) shell out to the `git`
//! binary so repository hooks run exactly as they would for a developer.
//! Read-only inspection (status, diffs against the working tree) uses `git2`.
//! Every function takes the directory it operates on explicitly; nothing
//! here changes the process working directory.

pub mod repo;
pub mod worktree;

use std::path::Path;
use std::process::Stdio;

use anyhow::{Context, Result};
use tokio::process::Command;

use crate::errors::{IvanError, IvanResult};

pub use repo::CommitOutcome;
pub use worktree::WorktreeManager;

/// Captured result of a git invocation.
#[derive(Debug, Clone)]
pub struct GitOutput {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
}

impl GitOutput {
    /// Stdout and stderr together, as a hook failure would show them.
    pub fn combined(&self) -> String {
        let stdout = self.stdout.trim();
        let stderr = self.stderr.trim();
        match (stdout.is_empty(), stderr.is_empty()) {
            (true, _) => stderr.to_string(),
            (false, true) => stdout.to_string(),
            (false, false) => format!("{}\n{}", stdout, stderr),
        }
    }
}

/// Run `git <args>` in `dir` without failing on a non-zero exit.
pub async fn run(dir: &Path, args: &[&str]) -> Result<GitOutput> {
    let output = Command::new("git")
        .args(args)
        .current_dir(dir)
        .stdin(Stdio::null())
        .env("GIT_TERMINAL_PROMPT", "0")
        .output()
        .await
        .with_context(|| format!("Failed to run git {}", args.join(" ")))?;

    Ok(GitOutput {
        success: output.status.success(),
        stdout: String::from_utf8_lossy(&output.stdout).to_string(),
        stderr: String::from_utf8_lossy(&output.stderr).to_string(),
    })
}

/// Run `git <args>` in `dir`, returning trimmed stdout or failing with stderr.
pub async fn run_ok(dir: &Path, args: &[&str]) -> Result<String> {
    let output = run(dir, args).await?;
    if !output.success {
        anyhow::bail!("git {} failed: {}", args.join(" "), output.stderr.trim());
    }
    Ok(output.stdout.trim().to_string())
}

/// Fail with `NotInstalled` when `git` is missing.
pub async fn ensure_installed() -> IvanResult<()> {
    match Command::new("git").arg("--version").output().await {
        Ok(out) if out.status.success() => Ok(()),
        Ok(_) => Err(IvanError::not_installed("git", "`git --version` failed.")),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(IvanError::not_installed(
            "git",
            "Install git from https://git-scm.com/downloads.",
        )),
        Err(e) => Err(anyhow::Error::new(e).context("Failed to run git --version").into()),
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::path::{Path, PathBuf};

    /// Run git synchronously in tests, panicking on failure.
    pub fn git(dir: &Path, args: &[&str]) -> String {
        let out = std::process::Command::new("git")
            .args(args)
            .current_dir(dir)
            .output()
            .unwrap();
        assert!(
            out.status.success(),
            "git {:?} failed: {}",
            args,
            String::from_utf8_lossy(&out.stderr)
        );
        String::from_utf8_lossy(&out.stdout).trim().to_string()
    }

    /// A repository with one commit on `main`, cloned from a bare `origin`.
    pub struct TestRepo {
        pub _root: tempfile::TempDir,
        pub origin: PathBuf,
        pub repo: PathBuf,
    }

    pub fn repo_with_origin() -> TestRepo {
        let root = tempfile::tempdir().unwrap();
        let origin = root.path().join("origin.git");
        let seed = root.path().join("seed");
        let repo = root.path().join("repo");

        git(root.path(), &["init", "--bare", "-b", "main", origin.to_str().unwrap()]);
        git(root.path(), &["init", "-b", "main", seed.to_str().unwrap()]);
        configure(&seed);
        std::fs::write(seed.join("README.md"), "# Demo\n\nTeh quick brown fox.\n").unwrap();
        git(&seed, &["add", "-A"]);
        git(&seed, &["commit", "-m", "initial"]);
        git(&seed, &["remote", "add", "origin", origin.to_str().unwrap()]);
        git(&seed, &["push", "-u", "origin", "main"]);

        git(root.path(), &["clone", origin.to_str().unwrap(), repo.to_str().unwrap()]);
        configure(&repo);

        TestRepo {
            _root: root,
            origin,
            repo,
        }
    }

    pub fn configure(dir: &Path) {
        git(dir, &["config", "user.name", "Test User"]);
        git(dir, &["config", "user.email", "test@example.com"]);
        git(dir, &["config", "commit.gpgsign", "false"]);
    }
}
