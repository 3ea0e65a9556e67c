//! Follow-up work on an open pull request: inline review comments and
//! failing CI checks.

use std::path::Path;
use std::time::Duration;

use tracing::{info, warn};

use super::prompts::{self, AddressPromptInput};
use super::{JobReport, TaskOrchestrator};
use crate::cancel::sleep_or_cancel;
use crate::errors::{IvanError, IvanResult};
use crate::git;
use crate::github::review::{self, UnaddressedComment};
use crate::store::{Job, NewTask, Provenance, Task, TaskStatus, TaskType};
use crate::util::truncate_chars;

/// Earlier fixes on the same file included in an address prompt.
const PRIOR_RESOLUTIONS: i64 = 5;

fn address_description(comment: &UnaddressedComment) -> String {
    let location = match comment.line {
        Some(line) => format!("{}:{}", comment.path, line),
        None => comment.path.clone(),
    };
    format!(
        "{} on {}: {}",
        comment.author,
        location,
        truncate_chars(comment.body.trim(), 500)
    )
}

impl TaskOrchestrator {
    async fn create_follow_up_job(&self, description: String) -> IvanResult<Job> {
        let working_directory = self.repo_root().display().to_string();
        let job = self
            .store
            .call(move |s| s.create_job(&description, &working_directory))
            .await?;
        info!(job_id = job.id, description = %job.description, "created job");
        Ok(job)
    }

    /// Turn every unaddressed inline comment on `pr_number` into an address
    /// task, fix them in order on the PR's branch and reply in each thread.
    ///
    /// Returns `None` when there is nothing to address.
    pub async fn address_pull_request(&self, pr_number: i64) -> IvanResult<Option<JobReport>> {
        self.preflight().await?;
        let pr = self.host.pull_request(pr_number).await?;
        let comments = review::get_unaddressed_comments(self.host.as_ref(), pr_number).await?;
        if comments.is_empty() {
            info!(pr = pr_number, "no unaddressed review comments");
            return Ok(None);
        }

        let job = self
            .create_follow_up_job(format!("Address review comments on PR #{}", pr_number))
            .await?;

        let mut work = Vec::with_capacity(comments.len());
        for comment in comments {
            let new_task = NewTask {
                description: address_description(&comment),
                task_type: TaskType::Address,
                branch: Some(pr.head_branch.clone()),
                comment_url: None,
                provenance: comment.provenance(pr_number),
            };
            let job_id = job.id;
            let task = self
                .store
                .call(move |s| s.create_task(job_id, &new_task))
                .await?;
            work.push((task, comment));
        }

        let instructions = self.repo_instructions().await;
        let branch = pr.head_branch.as_str();
        let outcomes = self
            .in_worktree(branch, |dir| async move {
                let mut session: Option<String> = None;
                let mut outcomes = Vec::with_capacity(work.len());
                for (task, comment) in &work {
                    self.check_cancelled()?;
                    let result = self
                        .address_comment(
                            task,
                            comment,
                            &dir,
                            branch,
                            &mut session,
                            instructions.as_deref(),
                        )
                        .await;
                    let error = match result {
                        Ok(()) => None,
                        Err(e) => {
                            self.fail_in_worktree(task.id, &dir, &e).await;
                            if e.is_fatal() {
                                return Err(e);
                            }
                            Some(e.to_string())
                        }
                    };
                    outcomes.push(self.outcome(task.id, error).await?);
                }
                Ok(outcomes)
            })
            .await?;

        Ok(Some(JobReport { job, outcomes }))
    }

    /// Address review comments on every open pull request whose head branch
    /// was created by this tool (`<workflow.name>/...`).
    ///
    /// A pull request that fails is logged and skipped; fatal errors stop
    /// the sweep.
    pub async fn address_open_pull_requests(&self) -> IvanResult<Vec<JobReport>> {
        self.preflight().await?;
        let prefix = format!("{}/", self.config.workflow.name);
        let prs: Vec<_> = self
            .host
            .open_pull_requests()
            .await?
            .into_iter()
            .filter(|pr| pr.head_branch.starts_with(&prefix))
            .collect();
        info!(count = prs.len(), "open pull requests to review");

        let mut reports = Vec::new();
        for pr in prs {
            self.check_cancelled()?;
            match self.address_pull_request(pr.number).await {
                Ok(Some(report)) => reports.push(report),
                Ok(None) => {}
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => warn!(pr = pr.number, error = %e, "could not address pull request"),
            }
        }
        Ok(reports)
    }

    /// Fix one comment, push, and reply in its thread.
    async fn address_comment(
        &self,
        task: &Task,
        comment: &UnaddressedComment,
        dir: &Path,
        branch: &str,
        session: &mut Option<String>,
        repo_instructions: Option<&str>,
    ) -> IvanResult<()> {
        let path = comment.path.clone();
        let prior = self
            .store
            .call(move |s| s.completed_address_tasks_for_path(&path, PRIOR_RESOLUTIONS))
            .await?;
        let prior = prompts::prior_resolution_context(&prior);
        let instructions = self
            .text
            .review_instructions(&comment.body, &comment.path, comment.line)
            .await;

        let prompt = prompts::address_prompt(
            &AddressPromptInput {
                author: &comment.author,
                path: &comment.path,
                line: comment.line,
                comment: &comment.body,
                instructions: &instructions,
                prior_context: prior.as_deref(),
            },
            repo_instructions,
        );

        let work = self
            .execute_and_commit(task, dir, &prompt, session.clone())
            .await?;
        *session = work.session_id.clone();

        let reply = match &work.sha {
            Some(sha) => {
                git::repo::push_branch(dir, branch).await?;
                let short = git::repo::short_sha(dir, sha).await?;
                prompts::fixed_reply(&short, &work.last_message)
            }
            None => prompts::no_change_reply(&work.last_message),
        };

        let thread_id = self
            .resolve_thread(task.provenance.pr_number, &task.provenance, &comment.thread_id)
            .await;
        let url = self.host.reply_to_thread(&thread_id, &reply).await?;
        info!(task_id = task.id, thread = %thread_id, url = %url, "replied to review thread");

        let task_id = task.id;
        self.store
            .call(move |s| {
                s.set_comment_url(task_id, &url)?;
                s.append_execution_log(task_id, &format!("\nReplied: {}\n", url))
            })
            .await?;
        self.set_status(task.id, TaskStatus::Completed).await?;
        Ok(())
    }

    /// Re-match a task to its live review thread, falling back to the thread
    /// it was created from.
    async fn resolve_thread(
        &self,
        pr_number: Option<i64>,
        provenance: &Provenance,
        fallback: &str,
    ) -> String {
        let Some(pr_number) = pr_number else {
            return fallback.to_string();
        };
        match self.host.review_threads(pr_number).await {
            Ok(threads) => review::find_thread_for_task(&threads, provenance)
                .map(|t| t.id.clone())
                .unwrap_or_else(|| fallback.to_string()),
            Err(e) => {
                warn!(pr = pr_number, error = %e, "could not refresh review threads");
                fallback.to_string()
            }
        }
    }

    /// Fix the failing test and lint checks of `pr_number` with a single
    /// `lint_and_test` task on the PR's branch.
    ///
    /// Returns `None` when no such check is failing.
    pub async fn fix_failing_checks(&self, pr_number: i64) -> IvanResult<Option<JobReport>> {
        self.preflight().await?;
        let pr = self.host.pull_request(pr_number).await?;
        let git_ref = if pr.head_sha.is_empty() {
            pr.head_branch.clone()
        } else {
            pr.head_sha.clone()
        };
        let runs = self.host.check_runs(&git_ref).await?;
        let failing = review::failing_test_or_lint_checks(&runs);
        if failing.is_empty() {
            info!(pr = pr_number, checks = runs.len(), "no failing test or lint checks");
            return Ok(None);
        }

        let mut failures = Vec::with_capacity(failing.len());
        for check in &failing {
            let log = match self.host.failed_job_log(check).await {
                Ok(log) => log,
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    warn!(check = %check.name, error = %e, "could not fetch check log");
                    format!("(log unavailable: {})", e)
                }
            };
            failures.push((check.name.clone(), log));
        }
        let names = failing
            .iter()
            .map(|c| c.name.as_str())
            .collect::<Vec<_>>()
            .join(", ");

        let job = self
            .create_follow_up_job(format!("Fix failing checks on PR #{}", pr_number))
            .await?;
        let new_task = NewTask {
            description: format!("Fix failing checks: {}", names),
            task_type: TaskType::LintAndTest,
            branch: Some(pr.head_branch.clone()),
            comment_url: None,
            provenance: Provenance {
                pr_number: Some(pr_number),
                check_names: Some(names),
                ..Default::default()
            },
        };
        let job_id = job.id;
        let task = self
            .store
            .call(move |s| s.create_task(job_id, &new_task))
            .await?;

        let instructions = self.repo_instructions().await;
        let branch = pr.head_branch.as_str();
        let task_ref = &task;
        let result = self
            .in_worktree(branch, |dir| async move {
                let prompt = prompts::checks_prompt(&failures, instructions.as_deref());
                let work = self.execute_and_commit(task_ref, &dir, &prompt, None).await?;
                if work.sha.is_some() {
                    git::repo::push_branch(&dir, branch).await?;
                } else {
                    warn!(task_id = task_ref.id, "agent made no changes for failing checks");
                }
                self.set_status(task_ref.id, TaskStatus::Completed).await?;
                Ok(())
            })
            .await;

        let error = match result {
            Ok(()) => None,
            Err(e) => {
                self.fail_task(task.id, &e).await;
                if e.is_fatal() {
                    return Err(e);
                }
                Some(e.to_string())
            }
        };
        let outcomes = vec![self.outcome(task.id, error).await?];
        Ok(Some(JobReport { job, outcomes }))
    }

    /// Wait for reviewers, then address their comments.
    pub async fn wait_then_address(
        &self,
        pr_number: i64,
        minutes: Option<u64>,
    ) -> IvanResult<Option<JobReport>> {
        let minutes = minutes.unwrap_or(self.config.workflow.review_wait_minutes);
        info!(pr = pr_number, minutes, "waiting for review");
        if !sleep_or_cancel(&self.cancel, Duration::from_secs(minutes * 60)).await {
            return Err(IvanError::Cancelled);
        }
        self.address_pull_request(pr_number).await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use tokio_util::sync::CancellationToken;

    use super::*;
    use crate::config::IvanConfig;
    use crate::git::test_support::{git, repo_with_origin};
    use crate::github::{CheckRun, PullRequest, ReviewComment, ReviewThread};
    use crate::orchestrator::test_support::*;
    use crate::store::StoreHandle;

    const BRANCH: &str = "ivan/feature-000001";

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

    fn push_feature_branch(repo: &Path) {
        git(repo, &["checkout", "-b", BRANCH]);
        std::fs::write(repo.join("lib.txt"), "fn foo() {}\n").unwrap();
        git(repo, &["add", "-A"]);
        git(repo, &["commit", "-m", "feat: foo"]);
        git(repo, &["push", "-u", "origin", BRANCH]);
        git(repo, &["checkout", "main"]);
    }

    fn pull_request() -> PullRequest {
        PullRequest {
            number: 7,
            title: "Add foo".into(),
            url: "https://github.com/acme/widgets/pull/7".into(),
            head_branch: BRANCH.into(),
            head_sha: String::new(),
            base_branch: "main".into(),
            author: "ivan-bot".into(),
            state: "open".into(),
        }
    }

    fn thread(id: &str, author: &str, body: &str, line: i64) -> ReviewThread {
        ReviewThread {
            id: id.into(),
            is_resolved: false,
            path: Some("lib.txt".into()),
            line: Some(line),
            total_comments: 1,
            comments: vec![ReviewComment {
                id: format!("c-{}", id),
                url: format!("https://github.com/acme/widgets/pull/7#discussion_{}", id),
                author: author.into(),
                body: body.into(),
                path: Some("lib.txt".into()),
                line: Some(line),
            }],
        }
    }

    #[tokio::test]
    async fn test_address_commit_and_no_change_replies() {
        let t = repo_with_origin();
        push_feature_branch(&t.repo);

        let executor = ScriptedExecutor::new(vec![
            step(|dir| std::fs::write(dir.join("lib.txt"), "fn parse_header() {}\n").unwrap()),
            step(|_| {}),
        ]);
        let host = Arc::new(RecordingHost::default());
        *host.pull_request.lock().unwrap() = Some(pull_request());
        *host.threads.lock().unwrap() = vec![
            thread("T1", "alice", "Please rename foo to parse_header", 1),
            thread("T2", "bob", "Is this function still needed?", 1),
        ];
        let orch = orchestrator(&t.repo, executor.clone(), host.clone());

        let report = orch.address_pull_request(7).await.unwrap().unwrap();
        assert_eq!(report.outcomes.len(), 2);
        assert!(report.outcomes.iter().all(|o| o.status == TaskStatus::Completed));

        let head = git(&t.origin, &["rev-parse", BRANCH]);
        let replies = host.replies.lock().unwrap();
        assert_eq!(replies.len(), 2);
        assert_eq!(replies[0].0, "T1");
        let short = git(&t.repo, &["rev-parse", "--short", &head]);
        assert!(replies[0].1.starts_with(&format!("Addressed in {}.", short)));
        assert_eq!(replies[1].0, "T2");
        assert!(replies[1].1.contains("No code changes were necessary"));

        assert_eq!(report.outcomes[0].commit_sha.as_deref(), Some(head.as_str()));
        assert!(report.outcomes[1].commit_sha.is_none());
        assert!(report.outcomes[1].comment_url.is_some());
        // Only one new commit on the branch
        assert_eq!(git(&t.origin, &["rev-list", "--count", &format!("main..{}", BRANCH)]), "2");

        // Second comment continued the first comment's session
        let sessions = executor.sessions.lock().unwrap();
        assert_eq!(sessions[1].as_deref(), Some("session-1"));
    }

    #[tokio::test]
    async fn test_address_skips_replied_and_resolved_threads() {
        let t = repo_with_origin();
        push_feature_branch(&t.repo);

        let executor = ScriptedExecutor::new(vec![]);
        let host = Arc::new(RecordingHost::default());
        *host.pull_request.lock().unwrap() = Some(pull_request());
        let mut replied = thread("T1", "alice", "nit", 1);
        replied.total_comments = 2;
        let mut resolved = thread("T2", "bob", "nit", 1);
        resolved.is_resolved = true;
        *host.threads.lock().unwrap() = vec![replied, resolved];
        let orch = orchestrator(&t.repo, executor.clone(), host.clone());

        assert!(orch.address_pull_request(7).await.unwrap().is_none());
        assert_eq!(executor.calls(), 0);
    }

    #[tokio::test]
    async fn test_address_open_pull_requests_only_touches_own_branches() {
        let t = repo_with_origin();
        push_feature_branch(&t.repo);

        let executor = ScriptedExecutor::new(vec![step(|dir| {
            std::fs::write(dir.join("lib.txt"), "fn parse_header() {}\n").unwrap()
        })]);
        let host = Arc::new(RecordingHost::default());
        *host.pull_request.lock().unwrap() = Some(pull_request());
        let mut foreign = pull_request();
        foreign.number = 8;
        foreign.head_branch = "alice/experiment".into();
        host.other_pull_requests.lock().unwrap().push(foreign);
        *host.threads.lock().unwrap() = vec![thread("T1", "alice", "Please rename foo", 1)];
        let orch = orchestrator(&t.repo, executor.clone(), host.clone());

        let reports = orch.address_open_pull_requests().await.unwrap();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].outcomes.len(), 1);
        assert_eq!(reports[0].outcomes[0].status, TaskStatus::Completed);
        assert_eq!(host.replies.lock().unwrap().len(), 1);
        assert_eq!(executor.calls(), 1);
    }

    #[tokio::test]
    async fn test_prior_resolutions_reach_the_prompt() {
        let t = repo_with_origin();
        push_feature_branch(&t.repo);

        let executor = ScriptedExecutor::new(vec![]);
        let host = Arc::new(RecordingHost::default());
        *host.pull_request.lock().unwrap() = Some(pull_request());
        *host.threads.lock().unwrap() = vec![
            thread("T1", "alice", "first remark", 1),
            thread("T2", "alice", "second remark", 1),
        ];
        let orch = orchestrator(&t.repo, executor.clone(), host.clone());

        orch.address_pull_request(7).await.unwrap();
        let prompts = executor.prompts.lock().unwrap();
        assert!(!prompts[0].contains("Earlier review fixes"));
        assert!(prompts[1].contains("Earlier review fixes"));
        assert!(prompts[1].contains("first remark (no change needed)"));
    }

    #[tokio::test]
    async fn test_fix_failing_checks_single_task() {
        let t = repo_with_origin();
        push_feature_branch(&t.repo);

        let executor = ScriptedExecutor::new(vec![step(|dir| {
            std::fs::write(dir.join("lib.txt"), "fn foo() { 1 }\n").unwrap()
        })]);
        let host = Arc::new(RecordingHost::default());
        *host.pull_request.lock().unwrap() = Some(pull_request());
        let check = |id: i64, name: &str, conclusion: &str| CheckRun {
            id,
            name: name.into(),
            status: "completed".into(),
            conclusion: Some(conclusion.into()),
            details_url: None,
        };
        *host.checks.lock().unwrap() = vec![
            check(1, "unit-tests", "failure"),
            check(2, "clippy", "failure"),
            check(3, "deploy-preview", "failure"),
            check(4, "build", "success"),
        ];
        let orch = orchestrator(&t.repo, executor.clone(), host.clone());

        let report = orch.fix_failing_checks(7).await.unwrap().unwrap();
        assert_eq!(report.outcomes.len(), 1);
        assert_eq!(report.outcomes[0].status, TaskStatus::Completed);
        assert_eq!(executor.calls(), 1);

        let prompt = &executor.prompts.lock().unwrap()[0];
        assert!(prompt.contains("## unit-tests"));
        assert!(prompt.contains("## clippy"));
        assert!(!prompt.contains("deploy-preview"));

        let task_id = report.outcomes[0].task_id;
        let task = orch.store.call(move |s| s.get_task(task_id)).await.unwrap().unwrap();
        assert_eq!(task.task_type, TaskType::LintAndTest);
        assert_eq!(task.provenance.check_names.as_deref(), Some("unit-tests, clippy"));
        assert_eq!(git(&t.origin, &["show", &format!("{}:lib.txt", BRANCH)]), "fn foo() { 1 }");
    }

    #[tokio::test]
    async fn test_wait_is_cancellable() {
        let t = repo_with_origin();
        let orch = orchestrator(&t.repo, ScriptedExecutor::new(vec![]), Arc::new(RecordingHost::default()));
        orch.cancel.cancel();
        let err = orch.wait_then_address(7, Some(30)).await.unwrap_err();
        assert!(err.is_cancelled());
    }
}
