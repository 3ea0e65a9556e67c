//! Job and task orchestration.
//!
//! [`TaskOrchestrator`] owns the task state machine
//! (`not_started → active → completed`, or `active → retry_eligible` on
//! failure) and sequences every workflow step: worktree, agent, diff,
//! commit, push and publish. Work on a branch always happens in a worktree
//! that is removed afterwards, whatever the outcome.
//!
//! - `build`: new work from a natural-language request, one PR per task or
//!   one shared PR for the whole job.
//! - `address`: inline review comments and failing CI checks on an existing PR.

pub mod address;
pub mod build;
pub mod prompts;

use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::IvanConfig;
use crate::errors::{IvanError, IvanResult};
use crate::executor::Executor;
use crate::generate::{ResilientGenerator, TextGenerator};
use crate::git::{self, CommitOutcome, WorktreeManager};
use crate::github::CodeHost;
use crate::store::{Job, StoreHandle, Task, TaskStatus};

/// State of one task at the end of a run.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskOutcome {
    pub task_id: i64,
    pub description: String,
    pub status: TaskStatus,
    pub branch: Option<String>,
    pub commit_sha: Option<String>,
    pub pr_link: Option<String>,
    pub comment_url: Option<String>,
    /// Why the task failed in this run.
    pub error: Option<String>,
}

impl TaskOutcome {
    fn from_task(task: Task, error: Option<String>) -> Self {
        Self {
            task_id: task.id,
            description: task.description,
            status: task.status,
            branch: task.branch,
            commit_sha: task.commit_sha,
            pr_link: task.pr_link,
            comment_url: task.comment_url,
            error,
        }
    }
}

#[derive(Debug, Clone)]
pub struct JobReport {
    pub job: Job,
    pub outcomes: Vec<TaskOutcome>,
}

impl JobReport {
    pub fn failed(&self) -> usize {
        self.outcomes.iter().filter(|o| o.error.is_some()).count()
    }
}

/// What one agent run left behind after committing.
pub(crate) struct CommittedWork {
    /// `None` when the agent changed nothing.
    pub sha: Option<String>,
    pub last_message: String,
    pub session_id: Option<String>,
}

pub struct TaskOrchestrator {
    store: StoreHandle,
    executor: Arc<dyn Executor>,
    host: Arc<dyn CodeHost>,
    text: ResilientGenerator,
    worktrees: WorktreeManager,
    config: IvanConfig,
    cancel: CancellationToken,
}

impl TaskOrchestrator {
    pub fn new(
        store: StoreHandle,
        executor: Arc<dyn Executor>,
        host: Arc<dyn CodeHost>,
        generator: Arc<dyn TextGenerator>,
        repo_root: impl Into<PathBuf>,
        config: IvanConfig,
        cancel: CancellationToken,
    ) -> Self {
        let worktrees = WorktreeManager::new(repo_root, config.workflow.name.clone())
            .with_dependency_install(config.workflow.install_dependencies);
        Self {
            store,
            executor,
            host,
            text: ResilientGenerator::new(generator),
            worktrees,
            config,
            cancel,
        }
    }

    pub fn repo_root(&self) -> &Path {
        self.worktrees.repo_root()
    }

    pub fn worktrees(&self) -> &WorktreeManager {
        &self.worktrees
    }

    /// Fail fast when the agent, git or code-host credentials are missing.
    pub async fn preflight(&self) -> IvanResult<()> {
        self.executor.validate_installation().await?;
        git::ensure_installed().await?;
        self.host.ensure_authenticated().await?;
        debug!(executor = self.executor.name(), host = self.host.name(), "preflight passed");
        Ok(())
    }

    /// Extra prompt instructions configured for this repository.
    async fn repo_instructions(&self) -> Option<String> {
        let slug = git::repo::repo_slug(self.repo_root()).await.ok()?;
        self.config.repo_instructions(&slug).map(str::to_string)
    }

    fn check_cancelled(&self) -> IvanResult<()> {
        if self.cancel.is_cancelled() {
            return Err(IvanError::Cancelled);
        }
        Ok(())
    }

    /// Run `f` inside a fresh worktree for `branch`, removing it afterwards
    /// whether or not `f` succeeded.
    async fn in_worktree<F, Fut, T>(&self, branch: &str, f: F) -> IvanResult<T>
    where
        F: FnOnce(PathBuf) -> Fut,
        Fut: Future<Output = IvanResult<T>>,
    {
        let dir = self.worktrees.create_worktree(branch).await?;
        let result = f(dir).await;
        if let Err(e) = self.worktrees.remove_worktree(branch).await {
            warn!(branch, error = %e, "failed to remove worktree");
        }
        result
    }

    // ── Store helpers ─────────────────────────────────────────────────

    async fn set_status(&self, task_id: i64, status: TaskStatus) -> IvanResult<Task> {
        Ok(self
            .store
            .call(move |s| s.update_task_status(task_id, status))
            .await?)
    }

    async fn append_log(&self, task_id: i64, text: String) -> IvanResult<()> {
        Ok(self
            .store
            .call(move |s| s.append_execution_log(task_id, &text))
            .await?)
    }

    async fn outcome(&self, task_id: i64, error: Option<String>) -> IvanResult<TaskOutcome> {
        let task = self
            .store
            .call(move |s| s.get_task(task_id)?.context("Task not found"))
            .await?;
        Ok(TaskOutcome::from_task(task, error))
    }

    /// Log an `ERROR:` line and make an active task retry-eligible.
    async fn fail_task(&self, task_id: i64, err: &IvanError) {
        error!(task_id, error = %err, "task failed");
        let line = format!("\nERROR: {}\n", err);
        let result = self
            .store
            .call(move |s| {
                s.append_execution_log(task_id, &line)?;
                let task = s.get_task(task_id)?.context("Task not found")?;
                if task.status == TaskStatus::Active {
                    s.update_task_status(task_id, TaskStatus::RetryEligible)?;
                }
                Ok(())
            })
            .await;
        if let Err(e) = result {
            error!(task_id, error = %e, "could not record task failure");
        }
    }

    /// Record a failure after the worktree may have been left dirty.
    async fn fail_in_worktree(&self, task_id: i64, dir: &Path, err: &IvanError) {
        self.fail_task(task_id, err).await;
        if let Err(e) = git::repo::discard_changes(dir).await {
            warn!(task_id, error = %e, "could not discard leftover changes");
        }
    }

    // ── Execute, commit, repair ───────────────────────────────────────

    /// Mark `task` active, run the agent in `dir` and commit what it changed.
    pub(crate) async fn execute_and_commit(
        &self,
        task: &Task,
        dir: &Path,
        prompt: &str,
        session_id: Option<String>,
    ) -> IvanResult<CommittedWork> {
        self.check_cancelled()?;
        self.set_status(task.id, TaskStatus::Active).await?;
        info!(task_id = task.id, dir = %dir.display(), "executing task");

        let result = self
            .executor
            .execute_task(prompt, dir, session_id.as_deref())
            .await?;
        self.append_log(
            task.id,
            format!("=== Agent ({}) ===\n{}\n", self.executor.name(), result.transcript),
        )
        .await?;
        let session_id = result.session_id.or(session_id);

        let changed = git::repo::changed_files(dir)?;
        if changed.is_empty() {
            info!(task_id = task.id, "agent made no changes");
            return Ok(CommittedWork {
                sha: None,
                last_message: result.last_message,
                session_id,
            });
        }
        debug!(task_id = task.id, files = ?changed, "changed files");

        let diff = git::repo::diff(dir)?;
        let message = self.text.commit_message(&diff).await;
        let (sha, session_id) = self
            .commit_with_repair(task.id, dir, &message, session_id)
            .await?;

        if let Some(sha) = sha.clone() {
            let task_id = task.id;
            self.store
                .call(move |s| s.set_commit_sha(task_id, &sha))
                .await?;
        }

        Ok(CommittedWork {
            sha,
            last_message: result.last_message,
            session_id,
        })
    }

    /// Commit the working tree. A hook rejection hands the raw output back to
    /// the agent and retries the same commit, up to the configured number of
    /// attempts.
    pub(crate) async fn commit_with_repair(
        &self,
        task_id: i64,
        dir: &Path,
        message: &str,
        mut session_id: Option<String>,
    ) -> IvanResult<(Option<String>, Option<String>)> {
        let max_attempts = self.config.workflow.max_commit_attempts.max(1);
        let mut attempt = 1;

        loop {
            match git::repo::commit_changes(dir, message).await? {
                CommitOutcome::Committed { sha } => {
                    info!(task_id, attempt, sha = %sha, "committed");
                    self.append_log(task_id, format!("\nCommitted {} on attempt {}\n", sha, attempt))
                        .await?;
                    return Ok((Some(sha), session_id));
                }
                CommitOutcome::NothingToCommit => {
                    info!(task_id, attempt, "nothing left to commit");
                    return Ok((None, session_id));
                }
                CommitOutcome::Rejected { output } => {
                    warn!(task_id, attempt, "commit rejected by pre-commit checks");
                    self.append_log(
                        task_id,
                        format!("\nCommit attempt {} rejected:\n{}\n", attempt, output),
                    )
                    .await?;
                    if attempt >= max_attempts {
                        return Err(IvanError::ValidationFailed {
                            attempts: attempt,
                            output,
                        });
                    }

                    attempt += 1;
                    let prompt = prompts::repair_prompt(&output, attempt, max_attempts);
                    let repair = self
                        .executor
                        .execute_task(&prompt, dir, session_id.as_deref())
                        .await?;
                    self.append_log(
                        task_id,
                        format!(
                            "\n=== Repair before commit attempt {} ===\n{}\n",
                            attempt, repair.transcript
                        ),
                    )
                    .await?;
                    session_id = repair.session_id.or(session_id);
                }
            }
        }
    }
}
