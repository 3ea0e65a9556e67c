use std::process::Stdio;

use anyhow::Context;
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use tokio::process::Command;

use super::graphql::{self, GraphqlTransport};
use super::{CheckRun, CodeHost, PullRequest, PullRequestRequest, ReviewThread};
use crate::errors::{IvanError, IvanResult};

const GH_HINT: &str = "Install the GitHub CLI from https://cli.github.com and run `gh auth login`.";

const PR_FIELDS: &str = "number,title,url,headRefName,headRefOid,baseRefName,author,state";

/// Code host backed by the `gh` CLI, using whatever account it is logged into.
pub struct GhCliHost {
    owner_repo: String,
    program: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GhPullRequest {
    number: i64,
    title: String,
    url: String,
    head_ref_name: String,
    #[serde(default)]
    head_ref_oid: String,
    base_ref_name: String,
    author: Option<GhAuthor>,
    state: String,
}

#[derive(Debug, Deserialize)]
struct GhAuthor {
    login: String,
}

impl From<GhPullRequest> for PullRequest {
    fn from(pr: GhPullRequest) -> Self {
        PullRequest {
            number: pr.number,
            title: pr.title,
            url: pr.url,
            head_branch: pr.head_ref_name,
            head_sha: pr.head_ref_oid,
            base_branch: pr.base_ref_name,
            author: pr.author.map(|a| a.login).unwrap_or_default(),
            state: pr.state.to_lowercase(),
        }
    }
}

/// `gh api graphql` arguments: strings via `-f`, numbers and booleans via `-F`.
pub(crate) fn graphql_args(query: &str, variables: &Value) -> Vec<String> {
    let mut args = vec![
        "api".to_string(),
        "graphql".to_string(),
        "-f".to_string(),
        format!("query={}", query),
    ];
    if let Some(map) = variables.as_object() {
        for (key, value) in map {
            match value {
                Value::Null => {}
                Value::String(s) => {
                    args.push("-f".to_string());
                    args.push(format!("{}={}", key, s));
                }
                other => {
                    args.push("-F".to_string());
                    args.push(format!("{}={}", key, other));
                }
            }
        }
    }
    args
}

/// URL printed by `gh pr create` (last non-empty stdout line).
pub(crate) fn parse_created_url(stdout: &str) -> Option<String> {
    stdout
        .lines()
        .map(str::trim)
        .rfind(|l| l.starts_with("https://"))
        .map(str::to_string)
}

impl GhCliHost {
    pub fn new(owner_repo: impl Into<String>) -> Self {
        Self {
            owner_repo: owner_repo.into(),
            program: "gh".to_string(),
        }
    }

    async fn gh(&self, args: &[String]) -> IvanResult<std::process::Output> {
        match Command::new(&self.program)
            .args(args)
            .stdin(Stdio::null())
            .env("GH_PROMPT_DISABLED", "1")
            .output()
            .await
        {
            Ok(output) => Ok(output),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(IvanError::not_installed("gh", GH_HINT))
            }
            Err(e) => Err(anyhow::Error::new(e).context("Failed to run gh").into()),
        }
    }

    /// Run gh and return stdout, mapping auth failures to `AuthenticationRequired`.
    async fn gh_ok(&self, args: &[String]) -> IvanResult<String> {
        let output = self.gh(args).await?;
        let stderr = String::from_utf8_lossy(&output.stderr).to_string();
        if !output.status.success() {
            if stderr.contains("gh auth login") || stderr.contains("HTTP 401") {
                return Err(IvanError::AuthenticationRequired(stderr.trim().to_string()));
            }
            return Err(anyhow::anyhow!(
                "gh {} failed: {}",
                args.first().map(String::as_str).unwrap_or(""),
                stderr.trim()
            )
            .into());
        }
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    fn args(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }
}

#[async_trait]
impl GraphqlTransport for GhCliHost {
    async fn graphql(&self, query: &str, variables: Value) -> IvanResult<Value> {
        let stdout = self.gh_ok(&graphql_args(query, &variables)).await?;
        let response: Value =
            serde_json::from_str(&stdout).context("Failed to parse gh api graphql output")?;
        Ok(graphql::extract_data(response)?)
    }
}

#[async_trait]
impl CodeHost for GhCliHost {
    fn name(&self) -> &'static str {
        "gh"
    }

    async fn ensure_authenticated(&self) -> IvanResult<()> {
        let output = self.gh(&Self::args(&["auth", "status"])).await?;
        if !output.status.success() {
            return Err(IvanError::AuthenticationRequired(format!(
                "gh is not logged in. {}",
                GH_HINT
            )));
        }
        Ok(())
    }

    async fn create_pull_request(&self, request: &PullRequestRequest) -> IvanResult<String> {
        let mut args = Self::args(&[
            "pr",
            "create",
            "--repo",
            &self.owner_repo,
            "--title",
            &request.title,
            "--body",
            &request.body,
            "--head",
            &request.head,
            "--base",
            &request.base,
        ]);
        if request.draft {
            args.push("--draft".to_string());
        }
        let output = self.gh(&args).await?;
        if !output.status.success() {
            return Err(IvanError::PublishFailed(format!(
                "gh pr create failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        parse_created_url(&String::from_utf8_lossy(&output.stdout)).ok_or_else(|| {
            IvanError::PublishFailed("gh pr create did not print a pull request URL".to_string())
        })
    }

    async fn open_pull_requests(&self) -> IvanResult<Vec<PullRequest>> {
        let stdout = self
            .gh_ok(&Self::args(&[
                "pr",
                "list",
                "--repo",
                &self.owner_repo,
                "--state",
                "open",
                "--limit",
                "1000",
                "--json",
                PR_FIELDS,
            ]))
            .await?;
        let prs: Vec<GhPullRequest> =
            serde_json::from_str(&stdout).context("Failed to parse gh pr list output")?;
        Ok(prs.into_iter().map(Into::into).collect())
    }

    async fn pull_request(&self, number: i64) -> IvanResult<PullRequest> {
        let stdout = self
            .gh_ok(&Self::args(&[
                "pr",
                "view",
                &number.to_string(),
                "--repo",
                &self.owner_repo,
                "--json",
                PR_FIELDS,
            ]))
            .await?;
        let pr: GhPullRequest =
            serde_json::from_str(&stdout).context("Failed to parse gh pr view output")?;
        Ok(pr.into())
    }

    async fn review_threads(&self, number: i64) -> IvanResult<Vec<ReviewThread>> {
        graphql::fetch_review_threads(self, &self.owner_repo, number).await
    }

    async fn reply_to_thread(&self, thread_id: &str, body: &str) -> IvanResult<String> {
        graphql::reply_to_thread(self, thread_id, body).await
    }

    async fn check_runs(&self, git_ref: &str) -> IvanResult<Vec<CheckRun>> {
        let path = format!(
            "repos/{}/commits/{}/check-runs?per_page=100",
            self.owner_repo, git_ref
        );
        let stdout = self
            .gh_ok(&Self::args(&["api", "--paginate", "--jq", ".check_runs[]", &path]))
            .await?;
        Ok(parse_check_run_lines(&stdout)?)
    }

    async fn failed_job_log(&self, check: &CheckRun) -> IvanResult<String> {
        self.gh_ok(&Self::args(&[
            "run",
            "view",
            "--repo",
            &self.owner_repo,
            "--job",
            &check.id.to_string(),
            "--log-failed",
        ]))
        .await
    }
}

/// `gh api --paginate --jq '.check_runs[]'` prints one check run per line,
/// across all pages.
fn parse_check_run_lines(stdout: &str) -> anyhow::Result<Vec<CheckRun>> {
    stdout
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| serde_json::from_str(line).context("Failed to parse check run"))
        .collect()
}
