use anyhow::Context;
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Value, json};

use super::graphql::{self, GraphqlTransport};
use super::{
    CheckRun, CheckRunsResponse, CodeHost, PullRequest, PullRequestRequest,
    ReviewThread,
};
use crate::errors::{IvanError, IvanResult};

const GITHUB_API_URL: &str = "https://api.github.com";
const USER_AGENT: &str = "ivan";

/// Code host backed by the GitHub REST and GraphQL APIs with a bearer token.
pub struct RestHost {
    owner_repo: String,
    token: String,
    api_url: String,
    client: reqwest::Client,
}

#[derive(Debug, Deserialize)]
struct RestPullRequest {
    number: i64,
    title: String,
    html_url: String,
    state: String,
    #[serde(default)]
    merged_at: Option<String>,
    head: RestRef,
    base: RestRef,
    user: Option<RestUser>,
}

#[derive(Debug, Deserialize)]
struct RestRef {
    #[serde(rename = "ref")]
    name: String,
    #[serde(default)]
    sha: String,
}

#[derive(Debug, Deserialize)]
struct RestUser {
    login: String,
}

impl From<RestPullRequest> for PullRequest {
    fn from(pr: RestPullRequest) -> Self {
        let state = if pr.merged_at.is_some() {
            "merged".to_string()
        } else {
            pr.state
        };
        PullRequest {
            number: pr.number,
            title: pr.title,
            url: pr.html_url,
            head_branch: pr.head.name,
            head_sha: pr.head.sha,
            base_branch: pr.base.name,
            author: pr.user.map(|u| u.login).unwrap_or_default(),
            state,
        }
    }
}

const PER_PAGE: usize = 100;

/// Whether another page of check runs should be requested after one with
/// `page_len` entries, `seen` so far out of `total`.
fn has_more_check_runs(page_len: usize, seen: usize, total: Option<usize>) -> bool {
    match total {
        Some(total) => page_len > 0 && seen < total,
        None => page_len == PER_PAGE,
    }
}

impl RestHost {
    pub fn new(owner_repo: impl Into<String>, token: impl Into<String>) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self {
            owner_repo: owner_repo.into(),
            token: token.into(),
            api_url: GITHUB_API_URL.to_string(),
            client,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.api_url, path.trim_start_matches('/'))
    }

    fn get(&self, path: &str) -> reqwest::RequestBuilder {
        self.client
            .get(self.url(path))
            .bearer_auth(&self.token)
            .header("Accept", "application/vnd.github+json")
    }

    fn post(&self, path: &str) -> reqwest::RequestBuilder {
        self.client
            .post(self.url(path))
            .bearer_auth(&self.token)
            .header("Accept", "application/vnd.github+json")
    }

    /// Send a request, turning 401 into `AuthenticationRequired`.
    async fn send(&self, request: reqwest::RequestBuilder, what: &str) -> IvanResult<reqwest::Response> {
        let resp = request
            .send()
            .await
            .with_context(|| format!("Failed to send {} request to GitHub", what))?;
        let status = resp.status();
        if status == reqwest::StatusCode::UNAUTHORIZED {
            return Err(IvanError::AuthenticationRequired(format!(
                "GitHub rejected the token ({})",
                what
            )));
        }
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(anyhow::anyhow!(
                "GitHub {} request failed with {}: {}",
                what,
                status,
                crate::util::truncate_chars(body.trim(), 500)
            )
            .into());
        }
        Ok(resp)
    }
}

#[async_trait]
impl GraphqlTransport for RestHost {
    async fn graphql(&self, query: &str, variables: Value) -> IvanResult<Value> {
        let resp = self
            .send(
                self.post("graphql")
                    .json(&json!({ "query": query, "variables": variables })),
                "GraphQL",
            )
            .await?;
        let body: Value = resp
            .json()
            .await
            .context("Failed to parse GraphQL response")?;
        Ok(graphql::extract_data(body)?)
    }
}

#[async_trait]
impl CodeHost for RestHost {
    fn name(&self) -> &'static str {
        "rest"
    }

    async fn ensure_authenticated(&self) -> IvanResult<()> {
        if self.token.trim().is_empty() {
            return Err(IvanError::AuthenticationRequired(
                "GITHUB_TOKEN is empty".to_string(),
            ));
        }
        self.send(self.get("user"), "user").await?;
        Ok(())
    }

    async fn create_pull_request(&self, request: &PullRequestRequest) -> IvanResult<String> {
        let path = format!("repos/{}/pulls", self.owner_repo);
        let resp = self
            .post(&path)
            .json(request)
            .send()
            .await
            .map_err(|e| IvanError::PublishFailed(format!("Failed to create pull request: {}", e)))?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(IvanError::PublishFailed(format!(
                "GitHub refused the pull request ({}): {}",
                status,
                body.trim()
            )));
        }
        let pr: RestPullRequest = resp
            .json()
            .await
            .context("Failed to parse pull request response")?;
        Ok(pr.html_url)
    }

    async fn open_pull_requests(&self) -> IvanResult<Vec<PullRequest>> {
        let path = format!("repos/{}/pulls", self.owner_repo);
        let mut all = Vec::new();
        let mut page = 1u32;

        loop {
            let page_str = page.to_string();
            let resp = self
                .send(
                    self.get(&path).query(&[
                        ("state", "open"),
                        ("per_page", "100"),
                        ("page", page_str.as_str()),
                    ]),
                    "pull request list",
                )
                .await?;
            let batch: Vec<RestPullRequest> = resp
                .json()
                .await
                .context("Failed to parse pull request list")?;
            let count = batch.len();
            all.extend(batch.into_iter().map(PullRequest::from));
            if count < PER_PAGE {
                break; // Last page
            }
            page += 1;
        }

        Ok(all)
    }

    async fn pull_request(&self, number: i64) -> IvanResult<PullRequest> {
        let path = format!("repos/{}/pulls/{}", self.owner_repo, number);
        let resp = self.send(self.get(&path), "pull request").await?;
        let pr: RestPullRequest = resp
            .json()
            .await
            .context("Failed to parse pull request")?;
        Ok(pr.into())
    }

    async fn review_threads(&self, number: i64) -> IvanResult<Vec<ReviewThread>> {
        graphql::fetch_review_threads(self, &self.owner_repo, number).await
    }

    async fn reply_to_thread(&self, thread_id: &str, body: &str) -> IvanResult<String> {
        graphql::reply_to_thread(self, thread_id, body).await
    }

    async fn check_runs(&self, git_ref: &str) -> IvanResult<Vec<CheckRun>> {
        let path = format!("repos/{}/commits/{}/check-runs", self.owner_repo, git_ref);
        let mut all = Vec::new();
        let mut page = 1u32;

        loop {
            let page_str = page.to_string();
            let resp = self
                .send(
                    self.get(&path)
                        .query(&[("per_page", "100"), ("page", page_str.as_str())]),
                    "check runs",
                )
                .await?;
            let body: CheckRunsResponse = resp
                .json()
                .await
                .context("Failed to parse check runs")?;
            let count = body.check_runs.len();
            all.extend(body.check_runs);
            if !has_more_check_runs(count, all.len(), body.total_count) {
                break;
            }
            page += 1;
        }

        Ok(all)
    }

    async fn failed_job_log(&self, check: &CheckRun) -> IvanResult<String> {
        // Actions check runs share their id with the job
        let path = format!("repos/{}/actions/jobs/{}/logs", self.owner_repo, check.id);
        let resp = self.send(self.get(&path), "job log").await?;
        Ok(resp.text().await.context("Failed to read job log")?)
    }
}
