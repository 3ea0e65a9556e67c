//! GraphQL queries shared by both code-host backends.
//!
//! Review threads and thread replies only exist in GitHub's GraphQL API.
//! Each backend provides a transport; query text and response parsing live
//! here.

use anyhow::Context;
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Value, json};

use super::review::{ReviewComment, ReviewThread};
use crate::errors::IvanResult;

/// Sends one GraphQL request and returns the `data` object.
#[async_trait]
pub trait GraphqlTransport: Send + Sync {
    async fn graphql(&self, query: &str, variables: Value) -> IvanResult<Value>;
}

pub const REVIEW_THREADS_QUERY: &str = r#"
query($owner: String!, $name: String!, $number: Int!, $cursor: String) {
  repository(owner: $owner, name: $name) {
    pullRequest(number: $number) {
      reviewThreads(first: 100, after: $cursor) {
        pageInfo { hasNextPage endCursor }
        nodes {
          id
          isResolved
          path
          line
          originalLine
          comments(first: 1) {
            totalCount
            nodes { id url body path line originalLine author { login } }
          }
        }
      }
    }
  }
}
"#;

pub const REPLY_MUTATION: &str = r#"
mutation($threadId: ID!, $body: String!) {
  addPullRequestReviewThreadReply(input: {pullRequestReviewThreadId: $threadId, body: $body}) {
    comment { id url }
  }
}
"#;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PageInfo {
    has_next_page: bool,
    end_cursor: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ThreadNode {
    id: String,
    is_resolved: bool,
    path: Option<String>,
    line: Option<i64>,
    original_line: Option<i64>,
    comments: CommentConnection,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CommentConnection {
    total_count: usize,
    #[serde(default)]
    nodes: Vec<CommentNode>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CommentNode {
    id: String,
    #[serde(default)]
    url: String,
    #[serde(default)]
    body: String,
    path: Option<String>,
    line: Option<i64>,
    original_line: Option<i64>,
    author: Option<Author>,
}

#[derive(Debug, Deserialize)]
struct Author {
    login: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ThreadConnection {
    page_info: PageInfo,
    #[serde(default)]
    nodes: Vec<ThreadNode>,
}

impl From<ThreadNode> for ReviewThread {
    fn from(node: ThreadNode) -> Self {
        ReviewThread {
            id: node.id,
            is_resolved: node.is_resolved,
            path: node.path,
            line: node.line.or(node.original_line),
            total_comments: node.comments.total_count,
            comments: node
                .comments
                .nodes
                .into_iter()
                .map(|c| ReviewComment {
                    id: c.id,
                    url: c.url,
                    // Deleted accounts come back as null
                    author: c.author.map(|a| a.login).unwrap_or_else(|| "ghost".to_string()),
                    body: c.body,
                    path: c.path,
                    line: c.line.or(c.original_line),
                })
                .collect(),
        }
    }
}

/// One page of review threads plus the cursor of the next page.
pub fn parse_review_threads_page(data: &Value) -> anyhow::Result<(Vec<ReviewThread>, Option<String>)> {
    let connection = data
        .pointer("/repository/pullRequest/reviewThreads")
        .context("Response has no reviewThreads (pull request not found?)")?;
    let connection: ThreadConnection = serde_json::from_value(connection.clone())
        .context("Failed to parse reviewThreads")?;

    let next = if connection.page_info.has_next_page {
        connection.page_info.end_cursor
    } else {
        None
    };
    Ok((connection.nodes.into_iter().map(Into::into).collect(), next))
}

/// All review threads of a pull request, following pagination.
pub async fn fetch_review_threads(
    transport: &dyn GraphqlTransport,
    owner_repo: &str,
    number: i64,
) -> IvanResult<Vec<ReviewThread>> {
    let (owner, name) = owner_repo
        .split_once('/')
        .with_context(|| format!("Invalid repository slug: {}", owner_repo))?;

    let mut threads = Vec::new();
    let mut cursor: Option<String> = None;
    loop {
        let variables = json!({
            "owner": owner,
            "name": name,
            "number": number,
            "cursor": cursor,
        });
        let data = transport.graphql(REVIEW_THREADS_QUERY, variables).await?;
        let (page, next) = parse_review_threads_page(&data)?;
        threads.extend(page);
        match next {
            Some(c) => cursor = Some(c),
            None => break,
        }
    }
    Ok(threads)
}

/// Reply inside a review thread; returns the new comment's URL.
pub async fn reply_to_thread(
    transport: &dyn GraphqlTransport,
    thread_id: &str,
    body: &str,
) -> IvanResult<String> {
    let data = transport
        .graphql(
            REPLY_MUTATION,
            json!({ "threadId": thread_id, "body": body }),
        )
        .await?;
    let url = data
        .pointer("/addPullRequestReviewThreadReply/comment/url")
        .and_then(|v| v.as_str())
        .context("Reply mutation returned no comment")?;
    Ok(url.to_string())
}

/// Unwrap a raw GraphQL response body into its `data`, surfacing `errors`.
pub fn extract_data(response: Value) -> anyhow::Result<Value> {
    if let Some(errors) = response.get("errors").and_then(|e| e.as_array())
        && !errors.is_empty()
    {
        let messages: Vec<&str> = errors
            .iter()
            .filter_map(|e| e.get("message").and_then(|m| m.as_str()))
            .collect();
        anyhow::bail!("GraphQL error: {}", messages.join("; "));
    }
    response
        .get("data")
        .cloned()
        .filter(|d| !d.is_null())
        .context("GraphQL response has no data")
}
