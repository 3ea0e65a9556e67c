//! Code-hosting platform access.
//!
//! [`CodeHost`] is the only surface the orchestrator sees. [`GhCliHost`]
//! drives an authenticated `gh` CLI; [`RestHost`] talks to the REST and
//! GraphQL APIs with a bearer token. [`create_code_host`] picks one from
//! configuration.

pub mod cli;
pub mod graphql;
pub mod rest;
pub mod review;

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::{GithubAuth, IvanConfig};
use crate::errors::{IvanError, IvanResult};

pub use cli::GhCliHost;
pub use rest::RestHost;
pub use review::{ReviewComment, ReviewThread, UnaddressedComment};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PullRequestRequest {
    pub title: String,
    pub body: String,
    pub head: String,
    pub base: String,
    pub draft: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PullRequest {
    pub number: i64,
    pub title: String,
    pub url: String,
    pub head_branch: String,
    pub head_sha: String,
    pub base_branch: String,
    pub author: String,
    pub state: String,
}

/// A CI check run on a commit (REST `check-runs` shape).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckRun {
    pub id: i64,
    pub name: String,
    pub status: String,
    pub conclusion: Option<String>,
    #[serde(default)]
    pub details_url: Option<String>,
}

impl CheckRun {
    pub fn is_failed(&self) -> bool {
        matches!(
            self.conclusion.as_deref(),
            Some("failure") | Some("timed_out")
        )
    }
}

#[derive(Debug, Deserialize)]
pub(crate) struct CheckRunsResponse {
    #[serde(default)]
    pub total_count: Option<usize>,
    #[serde(default)]
    pub check_runs: Vec<CheckRun>,
}

/// Abstraction over the code-hosting platform.
/// Real implementations: `GhCliHost`, `RestHost`. Tests use fakes.
#[async_trait]
pub trait CodeHost: Send + Sync {
    fn name(&self) -> &'static str;

    /// Fail with `NotInstalled`/`AuthenticationRequired` before any work starts.
    async fn ensure_authenticated(&self) -> IvanResult<()>;

    /// Open a pull request and return its URL.
    async fn create_pull_request(&self, request: &PullRequestRequest) -> IvanResult<String>;

    /// All open pull requests of the repository.
    async fn open_pull_requests(&self) -> IvanResult<Vec<PullRequest>>;

    async fn pull_request(&self, number: i64) -> IvanResult<PullRequest>;

    async fn review_threads(&self, number: i64) -> IvanResult<Vec<ReviewThread>>;

    /// Reply inside an existing review thread; returns the reply's URL.
    async fn reply_to_thread(&self, thread_id: &str, body: &str) -> IvanResult<String>;

    async fn check_runs(&self, git_ref: &str) -> IvanResult<Vec<CheckRun>>;

    /// Log output of a failed check's job.
    async fn failed_job_log(&self, check: &CheckRun) -> IvanResult<String>;
}

/// Build the configured code host for the repository at `repo_dir`.
pub async fn create_code_host(config: &IvanConfig, repo_dir: &Path) -> IvanResult<Arc<dyn CodeHost>> {
    let slug = crate::git::repo::repo_slug(repo_dir).await?;
    match config.github.auth {
        GithubAuth::Cli => Ok(Arc::new(GhCliHost::new(slug))),
        GithubAuth::Token => {
            let token = config.github.token.clone().ok_or_else(|| {
                IvanError::AuthenticationRequired(
                    "github.auth is \"token\" but GITHUB_TOKEN is not set".to_string(),
                )
            })?;
            Ok(Arc::new(RestHost::new(slug, token)?))
        }
    }
}
