use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tokio::process::Command;

use super::repo::{default_branch, has_origin, ref_exists};
use super::{GitOutput, run, run_ok};
use crate::errors::{IvanError, IvanResult};

/// Creates and removes per-branch worktrees next to the main clone.
///
/// For a clone at `/src/widgets` and name `ivan`, the worktree of branch
/// `ivan/fix-typo-123456` lives at
/// `/src/.widgets-ivan-worktrees/ivan/fix-typo-123456`.
#[derive(Debug, Clone)]
pub struct WorktreeManager {
    repo_root: PathBuf,
    suffix: String,
    install_dependencies: bool,
}

/// Dependency installation step detected from a checkout's manifests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallStep {
    pub program: &'static str,
    pub args: Vec<&'static str>,
}

/// Pick the dependency install command for `dir`, if it needs one.
pub fn detect_install_step(dir: &Path) -> Option<InstallStep> {
    if !dir.join("package.json").exists() {
        return None;
    }
    let step = if dir.join("pnpm-lock.yaml").exists() {
        InstallStep {
            program: "pnpm",
            args: vec!["install", "--frozen-lockfile"],
        }
    } else if dir.join("yarn.lock").exists() {
        InstallStep {
            program: "yarn",
            args: vec!["install", "--frozen-lockfile"],
        }
    } else if dir.join("package-lock.json").exists() {
        InstallStep {
            program: "npm",
            args: vec!["ci"],
        }
    } else {
        InstallStep {
            program: "npm",
            args: vec!["install"],
        }
    };
    Some(step)
}

fn is_checked_out_elsewhere(stderr: &str) -> bool {
    stderr.contains("already checked out") || stderr.contains("is already used by worktree")
}

fn is_path_conflict(stderr: &str) -> bool {
    stderr.contains("already exists")
}

impl WorktreeManager {
    pub fn new(repo_root: impl Into<PathBuf>, suffix: impl Into<String>) -> Self {
        Self {
            repo_root: repo_root.into(),
            suffix: suffix.into(),
            install_dependencies: true,
        }
    }

    pub fn with_dependency_install(mut self, enabled: bool) -> Self {
        self.install_dependencies = enabled;
        self
    }

    pub fn repo_root(&self) -> &Path {
        &self.repo_root
    }

    /// Sibling directory holding all worktrees of this clone.
    pub fn worktrees_root(&self) -> PathBuf {
        let name = self
            .repo_root
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "repo".to_string());
        let parent = self.repo_root.parent().unwrap_or(&self.repo_root);
        parent.join(format!(".{}-{}-worktrees", name, self.suffix))
    }

    pub fn worktree_path(&self, branch: &str) -> PathBuf {
        self.worktrees_root().join(branch)
    }

    /// Create a fresh worktree for `branch` and return its path.
    ///
    /// Stale registrations are cleared first. An existing remote branch is
    /// fetched and the local ref moved to it unless the local branch only
    /// adds unpushed commits, so the checkout starts from the latest pushed
    /// state. A branch checked out elsewhere is forced;
    /// a leftover directory is removed and the add retried once.
    pub async fn create_worktree(&self, branch: &str) -> IvanResult<PathBuf> {
        let path = self.worktree_path(branch);
        let path_str = path
            .to_str()
            .context("Worktree path contains invalid UTF-8")?
            .to_string();

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }

        self.clear_registration(&path_str).await?;

        let remote = has_origin(&self.repo_root).await?;
        if remote {
            let fetch = run(&self.repo_root, &["fetch", "--prune", "origin"]).await?;
            if !fetch.success {
                tracing::warn!(error = %fetch.stderr.trim(), "fetch from origin failed, using local refs");
            }
        }

        let local_ref = format!("refs/heads/{}", branch);
        let remote_ref = format!("refs/remotes/origin/{}", branch);
        let mut local_exists = ref_exists(&self.repo_root, &local_ref).await?;
        let remote_exists = remote && ref_exists(&self.repo_root, &remote_ref).await?;

        if remote_exists {
            if local_exists {
                self.sync_to_remote(branch, &local_ref, &remote_ref).await?;
            } else {
                run_ok(
                    &self.repo_root,
                    &["branch", "--track", branch, &format!("origin/{}", branch)],
                )
                .await?;
                local_exists = true;
            }
        }

        let base = if local_exists {
            None
        } else {
            Some(self.base_ref().await?)
        };

        let mut output = self.add(&path_str, branch, base.as_deref(), false).await?;

        if !output.success && is_checked_out_elsewhere(&output.stderr) {
            tracing::info!(branch, "branch checked out elsewhere, forcing worktree checkout");
            output = self.add(&path_str, branch, base.as_deref(), true).await?;
        }

        if !output.success && is_path_conflict(&output.stderr) {
            tracing::info!(branch, path = %path.display(), "worktree path exists, recreating");
            self.clear_registration(&path_str).await?;
            if path.exists() {
                tokio::fs::remove_dir_all(&path)
                    .await
                    .with_context(|| format!("Failed to remove {}", path.display()))?;
            }
            // The branch may have been created by the failed attempt
            let base = if ref_exists(&self.repo_root, &local_ref).await? {
                None
            } else {
                base
            };
            output = self.add(&path_str, branch, base.as_deref(), true).await?;
        }

        if !output.success {
            return Err(IvanError::WorktreeConflict {
                branch: branch.to_string(),
                message: output.stderr.trim().to_string(),
            });
        }

        self.normalize_permissions(&path)?;
        self.copy_identity(&path).await?;
        if self.install_dependencies {
            install_dependencies(&path).await;
        }

        tracing::info!(branch, path = %path.display(), "worktree ready");
        Ok(path)
    }

    /// Remove the worktree for `branch`, its registration and any residual directory.
    pub async fn remove_worktree(&self, branch: &str) -> Result<()> {
        let path = self.worktree_path(branch);
        let path_str = path
            .to_str()
            .context("Worktree path contains invalid UTF-8")?
            .to_string();

        self.clear_registration(&path_str).await?;
        if path.exists() {
            tokio::fs::remove_dir_all(&path)
                .await
                .with_context(|| format!("Failed to remove {}", path.display()))?;
        }

        // Drop now-empty parents (`ivan/` and the worktrees root)
        let root = self.worktrees_root();
        let mut dir = path.parent();
        while let Some(d) = dir {
            if !d.starts_with(&root) || std::fs::remove_dir(d).is_err() {
                break;
            }
            if d == root {
                break;
            }
            dir = d.parent();
        }

        tracing::debug!(branch, "worktree removed");
        Ok(())
    }

    async fn clear_registration(&self, path: &str) -> Result<()> {
        let removed = run(&self.repo_root, &["worktree", "remove", "--force", path]).await?;
        if !removed.success {
            tracing::debug!(path, error = %removed.stderr.trim(), "no worktree to remove");
        }
        run_ok(&self.repo_root, &["worktree", "prune"]).await?;
        Ok(())
    }

    async fn add(
        &self,
        path: &str,
        branch: &str,
        base: Option<&str>,
        force: bool,
    ) -> Result<GitOutput> {
        let mut args = vec!["worktree", "add"];
        if force {
            args.push("--force");
        }
        match base {
            Some(base) => args.extend(["-b", branch, path, base]),
            None => args.extend([path, branch]),
        }
        run(&self.repo_root, &args).await
    }

    /// Bring the local branch in line with the remote tip.
    ///
    /// A local branch strictly ahead of origin keeps its unpushed commits so
    /// they can still be published. Behind or diverged, it is moved to the
    /// remote tip.
    async fn sync_to_remote(&self, branch: &str, local_ref: &str, remote_ref: &str) -> Result<()> {
        let local = run_ok(&self.repo_root, &["rev-parse", local_ref]).await?;
        let remote = run_ok(&self.repo_root, &["rev-parse", remote_ref]).await?;
        if local == remote {
            return Ok(());
        }
        let local_ahead = run(
            &self.repo_root,
            &["merge-base", "--is-ancestor", remote_ref, local_ref],
        )
        .await?;
        if local_ahead.success {
            tracing::info!(branch, "local branch is ahead of origin, keeping unpushed commits");
            return Ok(());
        }

        let behind = run(
            &self.repo_root,
            &["merge-base", "--is-ancestor", local_ref, remote_ref],
        )
        .await?;
        run_ok(&self.repo_root, &["update-ref", local_ref, &remote]).await?;
        if behind.success {
            tracing::info!(branch, "fast-forwarded local branch to origin");
        } else {
            tracing::warn!(branch, discarded = %local, "local branch diverged from origin, reset to remote tip");
        }
        Ok(())
    }

    /// Starting point for a brand-new branch.
    async fn base_ref(&self) -> Result<String> {
        let default = default_branch(&self.repo_root).await?;
        let remote_default = format!("refs/remotes/origin/{}", default);
        if ref_exists(&self.repo_root, &remote_default).await? {
            Ok(format!("origin/{}", default))
        } else {
            Ok(default)
        }
    }

    #[cfg(unix)]
    fn normalize_permissions(&self, path: &Path) -> Result<()> {
        use std::os::unix::fs::PermissionsExt;
        let mode = std::fs::metadata(&self.repo_root)
            .context("Failed to read repository permissions")?
            .permissions()
            .mode();
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))
            .with_context(|| format!("Failed to set permissions on {}", path.display()))?;
        Ok(())
    }

    #[cfg(not(unix))]
    fn normalize_permissions(&self, _path: &Path) -> Result<()> {
        Ok(())
    }

    /// Make the worktree commit as the same author as the main checkout.
    async fn copy_identity(&self, path: &Path) -> Result<()> {
        for key in ["user.name", "user.email"] {
            let source = run(&self.repo_root, &["config", "--get", key]).await?;
            if !source.success {
                continue;
            }
            let value = source.stdout.trim();
            let current = run(path, &["config", "--get", key]).await?;
            if current.success && current.stdout.trim() == value {
                continue;
            }
            run_ok(path, &["config", key, value]).await?;
        }
        Ok(())
    }
}

/// Run the project's dependency install so hooks inside the worktree work.
/// Failures are logged; the task may still succeed without them.
async fn install_dependencies(dir: &Path) {
    let Some(step) = detect_install_step(dir) else {
        return;
    };
    tracing::info!(program = step.program, dir = %dir.display(), "installing dependencies");
    let result = Command::new(step.program)
        .args(&step.args)
        .current_dir(dir)
        .stdin(std::process::Stdio::null())
        .output()
        .await;
    match result {
        Ok(out) if out.status.success() => {}
        Ok(out) => tracing::warn!(
            program = step.program,
            error = %String::from_utf8_lossy(&out.stderr).trim(),
            "dependency install failed"
        ),
        Err(e) => tracing::warn!(program = step.program, error = %e, "could not run dependency install"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::git::test_support::{configure, git, repo_with_origin};

    fn manager(repo: &Path) -> WorktreeManager {
        WorktreeManager::new(repo, "ivan").with_dependency_install(false)
    }

    fn registered_worktrees(repo: &Path) -> String {
        git(repo, &["worktree", "list", "--porcelain"])
    }

    #[test]
    fn test_worktree_path_layout() {
        let m = WorktreeManager::new("/src/widgets", "ivan");
        assert_eq!(
            m.worktree_path("ivan/fix-typo-123456"),
            PathBuf::from("/src/.widgets-ivan-worktrees/ivan/fix-typo-123456")
        );
    }

    #[test]
    fn test_detect_install_step() {
        let dir = tempfile::tempdir().unwrap();
        assert!(detect_install_step(dir.path()).is_none());

        std::fs::write(dir.path().join("package.json"), "{}").unwrap();
        assert_eq!(detect_install_step(dir.path()).unwrap().args, vec!["install"]);

        std::fs::write(dir.path().join("package-lock.json"), "{}").unwrap();
        assert_eq!(detect_install_step(dir.path()).unwrap().program, "npm");
        assert_eq!(detect_install_step(dir.path()).unwrap().args, vec!["ci"]);

        std::fs::write(dir.path().join("yarn.lock"), "").unwrap();
        assert_eq!(detect_install_step(dir.path()).unwrap().program, "yarn");

        std::fs::write(dir.path().join("pnpm-lock.yaml"), "").unwrap();
        assert_eq!(detect_install_step(dir.path()).unwrap().program, "pnpm");
    }

    #[test]
    fn test_error_classification() {
        assert!(is_checked_out_elsewhere("fatal: 'main' is already checked out at '/src/repo'"));
        assert!(is_checked_out_elsewhere("fatal: 'x' is already used by worktree at '/tmp/x'"));
        assert!(is_path_conflict("fatal: '/tmp/x' already exists"));
        assert!(!is_path_conflict("fatal: invalid reference: nope"));
    }

    #[tokio::test]
    async fn test_create_then_remove_leaves_nothing() {
        let t = repo_with_origin();
        let m = manager(&t.repo);
        let branch = "ivan/fix-typo-123456";

        let path = m.create_worktree(branch).await.unwrap();
        assert_eq!(path, m.worktree_path(branch));
        assert!(path.join("README.md").exists());
        assert_eq!(git(&path, &["rev-parse", "--abbrev-ref", "HEAD"]), branch);
        assert!(registered_worktrees(&t.repo).contains("fix-typo-123456"));

        m.remove_worktree(branch).await.unwrap();
        assert!(!path.exists());
        assert!(!m.worktrees_root().exists());
        assert!(!registered_worktrees(&t.repo).contains("fix-typo-123456"));
    }

    #[tokio::test]
    async fn test_create_is_idempotent_over_stale_state() {
        let t = repo_with_origin();
        let m = manager(&t.repo);
        let branch = "ivan/stale-000001";

        let first = m.create_worktree(branch).await.unwrap();
        std::fs::write(first.join("scratch.txt"), "leftover").unwrap();
        // Second create without remove: stale registration is replaced
        let second = m.create_worktree(branch).await.unwrap();
        assert_eq!(first, second);
        assert!(!second.join("scratch.txt").exists());
        m.remove_worktree(branch).await.unwrap();
    }

    #[tokio::test]
    async fn test_create_over_unregistered_directory() {
        let t = repo_with_origin();
        let m = manager(&t.repo);
        let branch = "ivan/leftover-000002";
        let path = m.worktree_path(branch);
        std::fs::create_dir_all(&path).unwrap();
        std::fs::write(path.join("junk"), "x").unwrap();

        let created = m.create_worktree(branch).await.unwrap();
        assert!(created.join("README.md").exists());
        assert!(!created.join("junk").exists());
        m.remove_worktree(branch).await.unwrap();
    }

    #[tokio::test]
    async fn test_branch_checked_out_in_main_clone_is_forced() {
        let t = repo_with_origin();
        let m = manager(&t.repo);
        git(&t.repo, &["checkout", "-b", "ivan/busy-000003"]);

        let path = m.create_worktree("ivan/busy-000003").await.unwrap();
        assert_eq!(git(&path, &["rev-parse", "--abbrev-ref", "HEAD"]), "ivan/busy-000003");
        m.remove_worktree("ivan/busy-000003").await.unwrap();
    }

    #[tokio::test]
    async fn test_existing_remote_branch_is_fast_forwarded() {
        let t = repo_with_origin();
        let m = manager(&t.repo);
        let branch = "ivan/review-000004";

        // Local branch at the initial commit
        git(&t.repo, &["branch", branch]);

        // Someone else pushes a new commit to the same branch
        let other = t._root.path().join("other");
        git(t._root.path(), &["clone", t.origin.to_str().unwrap(), other.to_str().unwrap()]);
        configure(&other);
        git(&other, &["checkout", "-b", branch]);
        std::fs::write(other.join("pushed.txt"), "from remote\n").unwrap();
        git(&other, &["add", "-A"]);
        git(&other, &["commit", "-m", "remote change"]);
        git(&other, &["push", "origin", branch]);
        let remote_tip = git(&other, &["rev-parse", "HEAD"]);

        let path = m.create_worktree(branch).await.unwrap();
        assert_eq!(git(&path, &["rev-parse", "HEAD"]), remote_tip);
        assert!(path.join("pushed.txt").exists());
        m.remove_worktree(branch).await.unwrap();
    }

    fn push_from_other_clone(t: &crate::git::test_support::TestRepo, branch: &str, file: &str) -> String {
        let other = t._root.path().join(format!("other-{}", file));
        git(t._root.path(), &["clone", t.origin.to_str().unwrap(), other.to_str().unwrap()]);
        configure(&other);
        git(&other, &["checkout", "-b", branch]);
        std::fs::write(other.join(file), "from remote\n").unwrap();
        git(&other, &["add", "-A"]);
        git(&other, &["commit", "-m", "remote change"]);
        git(&other, &["push", "origin", branch]);
        git(&other, &["rev-parse", "HEAD"])
    }

    #[tokio::test]
    async fn test_diverged_local_branch_is_reset_to_remote() {
        let t = repo_with_origin();
        let m = manager(&t.repo);
        let branch = "ivan/diverged-000008";

        // Local branch with a commit that was never pushed
        git(&t.repo, &["checkout", "-b", branch]);
        std::fs::write(t.repo.join("local.txt"), "local only\n").unwrap();
        git(&t.repo, &["add", "-A"]);
        git(&t.repo, &["commit", "-m", "local change"]);
        git(&t.repo, &["checkout", "main"]);

        let remote_tip = push_from_other_clone(&t, branch, "pushed.txt");

        let path = m.create_worktree(branch).await.unwrap();
        assert_eq!(git(&path, &["rev-parse", "HEAD"]), remote_tip);
        assert!(path.join("pushed.txt").exists());
        assert!(!path.join("local.txt").exists());
        assert_eq!(git(&t.repo, &["rev-parse", branch]), remote_tip);
        m.remove_worktree(branch).await.unwrap();
    }

    #[tokio::test]
    async fn test_local_branch_ahead_of_remote_keeps_commits() {
        let t = repo_with_origin();
        let m = manager(&t.repo);
        let branch = "ivan/ahead-000009";

        git(&t.repo, &["checkout", "-b", branch]);
        git(&t.repo, &["push", "origin", branch]);
        std::fs::write(t.repo.join("unpushed.txt"), "pending\n").unwrap();
        git(&t.repo, &["add", "-A"]);
        git(&t.repo, &["commit", "-m", "unpushed change"]);
        let local_tip = git(&t.repo, &["rev-parse", "HEAD"]);
        git(&t.repo, &["checkout", "main"]);

        let path = m.create_worktree(branch).await.unwrap();
        assert_eq!(git(&path, &["rev-parse", "HEAD"]), local_tip);
        assert!(path.join("unpushed.txt").exists());
        m.remove_worktree(branch).await.unwrap();
    }

    #[tokio::test]
    async fn test_remote_only_branch_is_tracked() {
        let t = repo_with_origin();
        let m = manager(&t.repo);
        let branch = "ivan/remote-only-000005";
        git(&t.repo, &["push", "origin", &format!("main:refs/heads/{}", branch)]);

        let path = m.create_worktree(branch).await.unwrap();
        assert_eq!(git(&path, &["rev-parse", "--abbrev-ref", "HEAD"]), branch);
        m.remove_worktree(branch).await.unwrap();
    }

    #[tokio::test]
    async fn test_worktree_copies_identity() {
        let t = repo_with_origin();
        let m = manager(&t.repo);
        let path = m.create_worktree("ivan/who-000006").await.unwrap();
        assert_eq!(git(&path, &["config", "--get", "user.email"]), "test@example.com");
        m.remove_worktree("ivan/who-000006").await.unwrap();
    }

    #[tokio::test]
    async fn test_remove_missing_worktree_is_ok() {
        let t = repo_with_origin();
        manager(&t.repo).remove_worktree("ivan/never-000007").await.unwrap();
    }
}
