//! Build jobs: plan a request, implement each task, publish pull requests.

use std::collections::HashMap;
use std::path::Path;

use anyhow::Context;
use tracing::{info, warn};

use super::{JobReport, TaskOrchestrator, TaskOutcome, prompts};
use crate::errors::{IvanError, IvanResult};
use crate::git;
use crate::github::PullRequestRequest;
use crate::store::{Job, NewTask, Task, TaskStatus};
use crate::util::branch_name;

fn unix_now() -> u64 {
    chrono::Utc::now().timestamp().max(0) as u64
}

impl TaskOrchestrator {
    /// Create a job for `description`, break it into tasks and run them.
    ///
    /// With `single_pr`, every task lands on one branch and one pull request
    /// is opened after the last task; otherwise each task gets its own.
    pub async fn run_build_job(&self, description: &str, single_pr: bool) -> IvanResult<JobReport> {
        self.preflight().await?;
        let base = git::repo::cleanup_and_sync_main(self.repo_root()).await?;

        let desc = description.to_string();
        let working_directory = self.repo_root().display().to_string();
        let job = self
            .store
            .call(move |s| s.create_job(&desc, &working_directory))
            .await?;
        info!(job_id = job.id, "created job");

        let subtasks = match self
            .executor
            .generate_breakdown(description, self.repo_root())
            .await
        {
            Ok(subtasks) => subtasks,
            Err(e) if e.is_fatal() => return Err(e),
            Err(e) => {
                warn!(error = %e, "task breakdown failed, running the request as one task");
                vec![description.to_string()]
            }
        };
        info!(job_id = job.id, tasks = subtasks.len(), "planned tasks");

        let job_id = job.id;
        self.store
            .call(move |s| {
                for subtask in &subtasks {
                    s.create_task(job_id, &NewTask::build(subtask.clone()))?;
                }
                Ok(())
            })
            .await?;

        self.run_pending(job, &base, single_pr).await
    }

    /// Run the unfinished tasks of an existing job again.
    ///
    /// Tasks left `active` by an interrupted run are made retry-eligible
    /// first.
    pub async fn retry_job(&self, job_id: i64, single_pr: bool) -> IvanResult<JobReport> {
        self.preflight().await?;
        let job = self
            .store
            .call(move |s| s.get_job(job_id)?.with_context(|| format!("Job {} not found", job_id)))
            .await?;
        let reset = self
            .store
            .call(move |s| s.reset_stale_active(job_id))
            .await?;
        if reset > 0 {
            info!(job_id, reset, "reset interrupted tasks");
        }
        let base = git::repo::cleanup_and_sync_main(self.repo_root()).await?;
        self.run_pending(job, &base, single_pr).await
    }

    async fn run_pending(&self, job: Job, base: &str, single_pr: bool) -> IvanResult<JobReport> {
        let job_id = job.id;
        let tasks = self.store.call(move |s| s.pending_tasks(job_id)).await?;
        if tasks.is_empty() {
            info!(job_id, "no pending tasks");
        }
        let instructions = self.repo_instructions().await;

        let outcomes = if single_pr {
            self.run_shared_branch(&job, tasks, base, instructions.as_deref())
                .await?
        } else {
            self.run_per_task(tasks, base, instructions.as_deref()).await?
        };
        Ok(JobReport { job, outcomes })
    }

    /// The task's branch, assigning a new one on first execution.
    async fn ensure_branch(&self, task: &Task, description: &str) -> IvanResult<String> {
        if let Some(branch) = &task.branch {
            return Ok(branch.clone());
        }
        let branch = branch_name(&self.config.workflow.name, description, unix_now());
        let task_id = task.id;
        let assigned = branch.clone();
        self.store
            .call(move |s| s.assign_branch(task_id, &assigned))
            .await?;
        Ok(branch)
    }

    async fn run_per_task(
        &self,
        tasks: Vec<Task>,
        base: &str,
        instructions: Option<&str>,
    ) -> IvanResult<Vec<TaskOutcome>> {
        let mut outcomes = Vec::with_capacity(tasks.len());
        for task in &tasks {
            self.check_cancelled()?;
            let error = match self.run_build_task(task, base, instructions).await {
                Ok(()) => None,
                Err(e) => {
                    self.fail_task(task.id, &e).await;
                    if e.is_fatal() {
                        return Err(e);
                    }
                    Some(e.to_string())
                }
            };
            outcomes.push(self.outcome(task.id, error).await?);
        }
        Ok(outcomes)
    }

    /// One task on its own branch and pull request.
    async fn run_build_task(&self, task: &Task, base: &str, instructions: Option<&str>) -> IvanResult<()> {
        let branch = self.ensure_branch(task, &task.description).await?;
        let branch = branch.as_str();

        self.in_worktree(branch, |dir| async move {
            let prompt = prompts::build_prompt(&task.description, instructions);
            self.execute_and_commit(task, &dir, &prompt, None).await?;

            // A retry can find the work already committed by a run whose
            // publish failed, so publishing follows the branch, not this run.
            if !self.has_unpublished_commits(&dir, base).await? {
                info!(task_id = task.id, "nothing to publish");
                self.set_status(task.id, TaskStatus::Completed).await?;
                return Ok(());
            }

            let url = self
                .publish(&dir, branch, base, &task.description, task.pr_link.clone())
                .await?;
            let task_id = task.id;
            self.store
                .call(move |s| s.set_pr_link(task_id, &url))
                .await?;
            self.set_status(task.id, TaskStatus::Completed).await?;
            Ok(())
        })
        .await
    }

    /// All pending tasks on one branch, one agent session and one pull request.
    async fn run_shared_branch(
        &self,
        job: &Job,
        tasks: Vec<Task>,
        base: &str,
        instructions: Option<&str>,
    ) -> IvanResult<Vec<TaskOutcome>> {
        if tasks.is_empty() {
            return Ok(Vec::new());
        }
        let job_id = job.id;
        let earlier = self.store.call(move |s| s.list_tasks_for_job(job_id)).await?;
        let branch = match earlier.iter().find_map(|t| t.branch.clone()) {
            Some(branch) => branch,
            None => branch_name(&self.config.workflow.name, &job.description, unix_now()),
        };
        let existing_pr = earlier.iter().find_map(|t| t.pr_link.clone());
        let branch = branch.as_str();

        self.in_worktree(branch, |dir| async move {
            let mut session: Option<String> = None;
            let mut errors: HashMap<i64, String> = HashMap::new();
            // Tasks stay active until the branch is published
            let mut succeeded: Vec<i64> = Vec::new();

            for task in &tasks {
                self.check_cancelled()?;
                match self
                    .run_shared_task(task, &dir, branch, session.clone(), instructions)
                    .await
                {
                    Ok(next_session) => {
                        session = next_session;
                        succeeded.push(task.id);
                    }
                    Err(e) => {
                        self.fail_in_worktree(task.id, &dir, &e).await;
                        if e.is_fatal() {
                            return Err(e);
                        }
                        errors.insert(task.id, e.to_string());
                    }
                }
            }

            if !succeeded.is_empty() {
                let published = match self.has_unpublished_commits(&dir, base).await {
                    Ok(true) => self
                        .publish(&dir, branch, base, &job.description, existing_pr)
                        .await
                        .map(Some),
                    Ok(false) => Ok(None),
                    Err(e) => Err(e),
                };
                match published {
                    Ok(url) => {
                        for &task_id in &succeeded {
                            if let Some(url) = url.clone() {
                                self.store
                                    .call(move |s| s.set_pr_link(task_id, &url))
                                    .await?;
                            }
                            self.set_status(task_id, TaskStatus::Completed).await?;
                        }
                    }
                    Err(e) => {
                        for &task_id in &succeeded {
                            self.fail_task(task_id, &e).await;
                            errors.insert(task_id, e.to_string());
                        }
                        if e.is_fatal() {
                            return Err(e);
                        }
                    }
                }
            }

            let mut outcomes = Vec::with_capacity(tasks.len());
            for task in &tasks {
                outcomes.push(self.outcome(task.id, errors.remove(&task.id)).await?);
            }
            Ok(outcomes)
        })
        .await
    }

    /// Execute and commit one task of a shared branch. Returns the session
    /// to continue with.
    async fn run_shared_task(
        &self,
        task: &Task,
        dir: &Path,
        branch: &str,
        session: Option<String>,
        instructions: Option<&str>,
    ) -> IvanResult<Option<String>> {
        let task_id = task.id;
        let assigned = branch.to_string();
        self.store
            .call(move |s| s.assign_branch(task_id, &assigned))
            .await?;

        let prompt = prompts::build_prompt(&task.description, instructions);
        let work = self.execute_and_commit(task, dir, &prompt, session).await?;
        Ok(work.session_id)
    }

    /// `origin/<base>` when it exists, otherwise the local `base`.
    async fn base_ref(&self, dir: &Path, base: &str) -> IvanResult<String> {
        let remote_base = format!("origin/{}", base);
        if git::repo::ref_exists(dir, &remote_base).await? {
            Ok(remote_base)
        } else {
            Ok(base.to_string())
        }
    }

    /// Whether the worktree's branch carries commits that `base` lacks.
    async fn has_unpublished_commits(&self, dir: &Path, base: &str) -> IvanResult<bool> {
        let base_ref = self.base_ref(dir, base).await?;
        Ok(git::repo::commits_ahead(dir, &base_ref, "HEAD").await? > 0)
    }

    /// Push `branch` and open a pull request describing everything it adds
    /// over `base`. With an `existing` pull request the push updates it and
    /// no new one is opened.
    async fn publish(
        &self,
        dir: &Path,
        branch: &str,
        base: &str,
        description: &str,
        existing: Option<String>,
    ) -> IvanResult<String> {
        git::repo::push_branch(dir, branch).await?;
        if let Some(url) = existing {
            info!(branch, url = %url, "updated pull request");
            return Ok(url);
        }

        let base_ref = self.base_ref(dir, base).await?;
        let diff = git::repo::diff_refs(dir, &base_ref, "HEAD")
            .await
            .map_err(|e| IvanError::PublishFailed(format!("{:#}", e)))?;
        let content = self.text.pr_content(&diff, description).await;
        let url = self
            .host
            .create_pull_request(&PullRequestRequest {
                title: content.title,
                body: content.body,
                head: branch.to_string(),
                base: base.to_string(),
                draft: self.config.github.draft,
            })
            .await?;
        info!(branch, url = %url, "opened pull request");
        Ok(url)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use tokio_util::sync::CancellationToken;

    use std::sync::atomic::Ordering;

    use super::*;
    use crate::config::IvanConfig;
    use crate::git::test_support::{git, repo_with_origin};
    use crate::orchestrator::test_support::*;
    use crate::store::StoreHandle;

    fn orchestrator(
        repo: &Path,
        executor: Arc<ScriptedExecutor>,
        host: Arc<RecordingHost>,
    ) -> TaskOrchestrator {
        let mut config = IvanConfig::default();
        config.workflow.install_dependencies = false;
        TaskOrchestrator::new(
            StoreHandle::in_memory().unwrap(),
            executor,
            host,
            Arc::new(FixedGenerator),
            repo,
            config,
            CancellationToken::new(),
        )
    }

    fn fix_readme() -> Step {
        step(|dir| std::fs::write(dir.join("README.md"), "# Demo\n\nThe quick brown fox.\n").unwrap())
    }

    #[tokio::test]
    async fn test_build_job_opens_pull_request() {
        let t = repo_with_origin();
        // First call answers the breakdown, second fixes the typo
        let executor = ScriptedExecutor::new(vec![step(|_| {}), fix_readme()]);
        let host = Arc::new(RecordingHost::default());
        let orch = orchestrator(&t.repo, executor.clone(), host.clone());

        let report = orch.run_build_job("fix typo", false).await.unwrap();
        assert_eq!(report.outcomes.len(), 1);
        let outcome = &report.outcomes[0];
        assert!(outcome.error.is_none());
        assert_eq!(outcome.status, TaskStatus::Completed);
        assert_eq!(
            outcome.pr_link.as_deref(),
            Some("https://github.com/acme/widgets/pull/1")
        );

        let branch = outcome.branch.clone().unwrap();
        assert!(branch.starts_with("ivan/fix-typo-"));
        let created = host.created.lock().unwrap();
        assert_eq!(created[0].head, branch);
        assert_eq!(created[0].base, "main");

        let message = git(&t.origin, &["log", "-1", "--format=%s", &branch]);
        assert_eq!(message, "fix: correct typo in README");
        assert!(!orch.worktrees().worktree_path(&branch).exists());
    }

    #[tokio::test]
    async fn test_no_changes_completes_without_publishing() {
        let t = repo_with_origin();
        let executor = ScriptedExecutor::new(vec![]);
        let host = Arc::new(RecordingHost::default());
        let orch = orchestrator(&t.repo, executor, host.clone());

        let report = orch.run_build_job("check the docs", false).await.unwrap();
        let outcome = &report.outcomes[0];
        assert_eq!(outcome.status, TaskStatus::Completed);
        assert!(outcome.commit_sha.is_none());
        assert!(outcome.pr_link.is_none());
        assert!(host.created.lock().unwrap().is_empty());
        let remote_branches = git(&t.origin, &["branch", "--list", "ivan/*"]);
        assert!(remote_branches.is_empty());
    }

    #[tokio::test]
    async fn test_shared_branch_single_pull_request() {
        let t = repo_with_origin();
        let executor = ScriptedExecutor::new(vec![
            step(|dir| std::fs::write(dir.join("a.txt"), "a\n").unwrap()),
            step(|dir| std::fs::write(dir.join("b.txt"), "b\n").unwrap()),
        ]);
        let host = Arc::new(RecordingHost::default());
        let orch = orchestrator(&t.repo, executor.clone(), host.clone());

        let job = orch
            .store
            .call(|s| {
                let job = s.create_job("add a and b", "/tmp")?;
                s.create_task(job.id, &NewTask::build("add a"))?;
                s.create_task(job.id, &NewTask::build("add b"))?;
                Ok(job)
            })
            .await
            .unwrap();

        let report = orch.run_pending(job, "main", true).await.unwrap();
        assert_eq!(report.failed(), 0);
        assert!(report.outcomes.iter().all(|o| o.status == TaskStatus::Completed));
        assert_eq!(report.outcomes[0].branch, report.outcomes[1].branch);
        assert_eq!(report.outcomes[0].pr_link, report.outcomes[1].pr_link);
        assert_eq!(host.created.lock().unwrap().len(), 1);

        // Second task resumed the first task's session
        let sessions = executor.sessions.lock().unwrap();
        assert_eq!(sessions[0], None);
        assert_eq!(sessions[1].as_deref(), Some("session-1"));

        let branch = report.outcomes[0].branch.clone().unwrap();
        let files = git(&t.origin, &["ls-tree", "--name-only", &branch]);
        assert!(files.contains("a.txt") && files.contains("b.txt"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_validation_failure_marks_task_retry_eligible() {
        use std::os::unix::fs::PermissionsExt;
        let t = repo_with_origin();
        // Hooks are shared by every worktree of the clone
        let hook = t.repo.join(".git/hooks/pre-commit");
        std::fs::write(&hook, "#!/bin/sh\necho 'tests failed' >&2\nexit 1\n").unwrap();
        std::fs::set_permissions(&hook, std::fs::Permissions::from_mode(0o755)).unwrap();

        let executor = ScriptedExecutor::new(vec![step(|_| {}), fix_readme()]);
        let host = Arc::new(RecordingHost::default());
        let orch = orchestrator(&t.repo, executor.clone(), host.clone());

        let report = orch.run_build_job("fix typo", false).await.unwrap();
        let outcome = &report.outcomes[0];
        assert_eq!(outcome.status, TaskStatus::RetryEligible);
        assert!(outcome.error.as_deref().unwrap().contains("pre-submit checks"));
        // Breakdown, task, two repairs
        assert_eq!(executor.calls(), 4);
        assert!(host.created.lock().unwrap().is_empty());

        let task_id = outcome.task_id;
        let task = orch.store.call(move |s| s.get_task(task_id)).await.unwrap().unwrap();
        assert!(task.execution_log.contains("ERROR: Could not satisfy pre-submit checks"));
        let branch = outcome.branch.clone().unwrap();
        assert!(!orch.worktrees().worktree_path(&branch).exists());
    }

    // ── Publish failures and retries ──────────────────────────────────

    #[cfg(unix)]
    fn install_hook(repo: &Path, name: &str, script: &str) -> std::path::PathBuf {
        use std::os::unix::fs::PermissionsExt;
        let hook = repo.join(".git/hooks").join(name);
        std::fs::write(&hook, script).unwrap();
        std::fs::set_permissions(&hook, std::fs::Permissions::from_mode(0o755)).unwrap();
        hook
    }

    async fn task_log(orch: &TaskOrchestrator, task_id: i64) -> String {
        orch.store
            .call(move |s| s.get_task(task_id))
            .await
            .unwrap()
            .unwrap()
            .execution_log
    }

    #[tokio::test]
    async fn test_rejected_pull_request_cleans_up_worktree() {
        let t = repo_with_origin();
        let executor = ScriptedExecutor::new(vec![step(|_| {}), fix_readme()]);
        let host = Arc::new(RecordingHost::default());
        host.reject_pull_requests.store(true, Ordering::SeqCst);
        let orch = orchestrator(&t.repo, executor, host.clone());

        let report = orch.run_build_job("fix typo", false).await.unwrap();
        let outcome = &report.outcomes[0];
        assert_eq!(outcome.status, TaskStatus::RetryEligible);
        assert!(outcome.pr_link.is_none());
        assert!(outcome.error.as_deref().unwrap().starts_with("Publish failed"));

        let log = task_log(&orch, outcome.task_id).await;
        assert!(log.contains("\nERROR: Publish failed: HTTP 422"));

        let branch = outcome.branch.clone().unwrap();
        assert!(!orch.worktrees().worktree_path(&branch).exists());
        let registered = git(&t.repo, &["worktree", "list", "--porcelain"]);
        assert!(!registered.contains(&branch));
    }

    #[tokio::test]
    async fn test_retry_opens_pull_request_for_existing_push() {
        let t = repo_with_origin();
        // The retry's agent run finds nothing left to change
        let executor = ScriptedExecutor::new(vec![step(|_| {}), fix_readme()]);
        let host = Arc::new(RecordingHost::default());
        host.reject_pull_requests.store(true, Ordering::SeqCst);
        let orch = orchestrator(&t.repo, executor.clone(), host.clone());

        let first = orch.run_build_job("fix typo", false).await.unwrap();
        assert_eq!(first.outcomes[0].status, TaskStatus::RetryEligible);

        host.reject_pull_requests.store(false, Ordering::SeqCst);
        let retry = orch.retry_job(first.job.id, false).await.unwrap();
        let outcome = &retry.outcomes[0];
        assert_eq!(outcome.status, TaskStatus::Completed);
        assert_eq!(
            outcome.pr_link.as_deref(),
            Some("https://github.com/acme/widgets/pull/1")
        );
        assert_eq!(host.created.lock().unwrap().len(), 1);
        assert_eq!(executor.calls(), 3);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_retry_publishes_commit_left_by_failed_push() {
        let t = repo_with_origin();
        let hook = install_hook(
            &t.repo,
            "pre-push",
            "#!/bin/sh\necho 'remote unavailable' >&2\nexit 1\n",
        );
        let executor = ScriptedExecutor::new(vec![step(|_| {}), fix_readme()]);
        let host = Arc::new(RecordingHost::default());
        let orch = orchestrator(&t.repo, executor, host.clone());

        let first = orch.run_build_job("fix typo", false).await.unwrap();
        let outcome = &first.outcomes[0];
        assert_eq!(outcome.status, TaskStatus::RetryEligible);
        assert!(outcome.error.as_deref().unwrap().contains("remote unavailable"));
        assert!(outcome.commit_sha.is_some());
        let branch = outcome.branch.clone().unwrap();
        assert!(git(&t.origin, &["branch", "--list", &branch]).is_empty());

        std::fs::remove_file(hook).unwrap();
        let retry = orch.retry_job(first.job.id, false).await.unwrap();
        let outcome = &retry.outcomes[0];
        assert_eq!(outcome.status, TaskStatus::Completed);
        assert!(outcome.pr_link.is_some());
        assert_eq!(outcome.branch.as_deref(), Some(branch.as_str()));

        let subject = git(&t.origin, &["log", "-1", "--format=%s", &branch]);
        assert_eq!(subject, "fix: correct typo in README");
        let created = host.created.lock().unwrap();
        assert_eq!(created.len(), 1);
        assert_eq!(created[0].head, branch);
    }

    #[tokio::test]
    async fn test_shared_branch_retry_publishes_after_failed_pull_request() {
        let t = repo_with_origin();
        let executor = ScriptedExecutor::new(vec![
            step(|dir| std::fs::write(dir.join("a.txt"), "a\n").unwrap()),
        ]);
        let host = Arc::new(RecordingHost::default());
        host.reject_pull_requests.store(true, Ordering::SeqCst);
        let orch = orchestrator(&t.repo, executor, host.clone());

        let job = orch
            .store
            .call(|s| {
                let job = s.create_job("add a", "/tmp")?;
                s.create_task(job.id, &NewTask::build("add a"))?;
                Ok(job)
            })
            .await
            .unwrap();

        let first = orch.run_pending(job.clone(), "main", true).await.unwrap();
        assert_eq!(first.outcomes[0].status, TaskStatus::RetryEligible);

        host.reject_pull_requests.store(false, Ordering::SeqCst);
        let retry = orch.run_pending(job, "main", true).await.unwrap();
        assert_eq!(retry.outcomes[0].status, TaskStatus::Completed);
        assert!(retry.outcomes[0].pr_link.is_some());
        assert_eq!(host.created.lock().unwrap().len(), 1);
    }

    // ── Cancellation ─────────────────────────────────────────────────

    /// Agent that answers the plan, then blocks until the run is cancelled.
    struct BlockingExecutor {
        cancel: CancellationToken,
        working_dir: std::sync::Mutex<Option<std::path::PathBuf>>,
    }

    #[async_trait::async_trait]
    impl crate::executor::Executor for BlockingExecutor {
        fn name(&self) -> &'static str {
            "blocking"
        }

        async fn validate_installation(&self) -> IvanResult<()> {
            Ok(())
        }

        async fn execute_task(
            &self,
            prompt: &str,
            working_dir: &Path,
            _session_id: Option<&str>,
        ) -> IvanResult<crate::executor::ExecutionResult> {
            if prompt.contains("Break the following request") {
                return Ok(crate::executor::ExecutionResult {
                    last_message: "[\"fix typo\"]".to_string(),
                    ..Default::default()
                });
            }
            std::fs::write(working_dir.join("README.md"), "half done\n").unwrap();
            *self.working_dir.lock().unwrap() = Some(working_dir.to_path_buf());
            self.cancel.cancelled().await;
            Err(IvanError::Cancelled)
        }
    }

    #[tokio::test]
    async fn test_cancel_during_agent_run_cleans_up() {
        let t = repo_with_origin();
        let cancel = CancellationToken::new();
        let executor = Arc::new(BlockingExecutor {
            cancel: cancel.clone(),
            working_dir: std::sync::Mutex::new(None),
        });
        let mut config = IvanConfig::default();
        config.workflow.install_dependencies = false;
        let orch = TaskOrchestrator::new(
            StoreHandle::in_memory().unwrap(),
            executor.clone(),
            Arc::new(RecordingHost::default()),
            Arc::new(FixedGenerator),
            &t.repo,
            config,
            cancel.clone(),
        );

        let canceller = async {
            loop {
                let dir = executor.working_dir.lock().unwrap().clone();
                if let Some(dir) = dir {
                    assert!(dir.exists());
                    cancel.cancel();
                    return dir;
                }
                tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            }
        };
        let (result, dir) = tokio::join!(orch.run_build_job("fix typo", false), canceller);

        assert!(matches!(result, Err(IvanError::Cancelled)));
        assert!(!dir.exists());
        let registered = git(&t.repo, &["worktree", "list", "--porcelain"]);
        assert!(!registered.contains("fix-typo"));

        let tasks = orch
            .store
            .call(|s| {
                let job = s.list_jobs(1)?.remove(0);
                s.list_tasks_for_job(job.id)
            })
            .await
            .unwrap();
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].status, TaskStatus::RetryEligible);
        assert!(tasks[0].execution_log.contains("ERROR: Cancelled by user"));
        assert!(tasks[0].commit_sha.is_none());
    }
}
