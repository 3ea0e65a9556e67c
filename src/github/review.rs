//! Review threads and CI checks: which ones need work.

use serde::{Deserialize, Serialize};

use super::{CheckRun, CodeHost};
use crate::errors::IvanResult;
use crate::store::Provenance;

/// Number of leading characters of a comment body stored to re-match it later.
pub const BODY_PREFIX_CHARS: usize = 120;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReviewComment {
    pub id: String,
    pub url: String,
    pub author: String,
    pub body: String,
    pub path: Option<String>,
    pub line: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReviewThread {
    pub id: String,
    pub is_resolved: bool,
    pub path: Option<String>,
    pub line: Option<i64>,
    /// Total comments in the thread, which may exceed `comments.len()`.
    pub total_comments: usize,
    pub comments: Vec<ReviewComment>,
}

impl ReviewThread {
    pub fn first_comment(&self) -> Option<&ReviewComment> {
        self.comments.first()
    }

    fn anchor_path(&self) -> Option<&str> {
        self.path
            .as_deref()
            .or_else(|| self.first_comment().and_then(|c| c.path.as_deref()))
            .filter(|p| !p.is_empty())
    }

    fn anchor_line(&self) -> Option<i64> {
        self.line.or_else(|| self.first_comment().and_then(|c| c.line))
    }

    /// Unresolved, not yet replied to, and anchored to a file.
    pub fn is_addressable(&self) -> bool {
        !self.is_resolved
            && self.total_comments == 1
            && self.first_comment().is_some()
            && self.anchor_path().is_some()
    }
}

/// A review comment that still needs a fix, with the thread to reply into.
#[derive(Debug, Clone, PartialEq)]
pub struct UnaddressedComment {
    pub thread_id: String,
    pub comment_url: String,
    pub author: String,
    pub body: String,
    pub path: String,
    pub line: Option<i64>,
}

impl UnaddressedComment {
    /// Provenance recorded on the address task created for this comment.
    pub fn provenance(&self, pr_number: i64) -> Provenance {
        Provenance {
            pr_number: Some(pr_number),
            comment_author: Some(self.author.clone()),
            comment_path: Some(self.path.clone()),
            comment_line: self.line,
            comment_body: Some(body_prefix(&self.body)),
            check_names: None,
        }
    }
}

pub fn body_prefix(body: &str) -> String {
    body.trim().chars().take(BODY_PREFIX_CHARS).collect()
}

/// Keep only addressable threads, one entry per thread.
pub fn filter_unaddressed(threads: &[ReviewThread]) -> Vec<UnaddressedComment> {
    threads
        .iter()
        .filter(|t| t.is_addressable())
        .filter_map(|t| {
            let comment = t.first_comment()?;
            Some(UnaddressedComment {
                thread_id: t.id.clone(),
                comment_url: comment.url.clone(),
                author: comment.author.clone(),
                body: comment.body.clone(),
                path: t.anchor_path()?.to_string(),
                line: t.anchor_line(),
            })
        })
        .collect()
}

pub async fn get_unaddressed_comments(
    host: &dyn CodeHost,
    pr_number: i64,
) -> IvanResult<Vec<UnaddressedComment>> {
    let threads = host.review_threads(pr_number).await?;
    let unaddressed = filter_unaddressed(&threads);
    tracing::info!(
        pr = pr_number,
        threads = threads.len(),
        unaddressed = unaddressed.len(),
        "fetched review threads"
    );
    Ok(unaddressed)
}

/// Find the live thread a task was created from: same author, same body
/// prefix, same path and line.
pub fn find_thread_for_task<'a>(
    threads: &'a [ReviewThread],
    provenance: &Provenance,
) -> Option<&'a ReviewThread> {
    threads.iter().find(|t| {
        let Some(first) = t.first_comment() else {
            return false;
        };
        provenance.comment_author.as_deref() == Some(first.author.as_str())
            && provenance.comment_path.as_deref() == t.anchor_path()
            && provenance.comment_line == t.anchor_line()
            && provenance
                .comment_body
                .as_deref()
                .is_some_and(|prefix| body_prefix(&first.body) == prefix)
    })
}

const CHECK_KEYWORDS: &[&str] = &[
    "test", "lint", "tsc", "mypy", "clippy", "eslint", "pytest", "jest", "ruff", "rustfmt",
    "typecheck", "type-check", "format", "prettier", "flake8",
];

/// Whether a CI check name looks like a test or lint job.
pub fn classify_check(name: &str) -> bool {
    let name = name.to_lowercase();
    CHECK_KEYWORDS.iter().any(|k| name.contains(k))
}

/// Failed checks that a code change can fix.
pub fn failing_test_or_lint_checks(runs: &[CheckRun]) -> Vec<CheckRun> {
    runs.iter()
        .filter(|r| r.is_failed() && classify_check(&r.name))
        .cloned()
        .collect()
}
