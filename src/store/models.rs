use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// One user request. Immutable after creation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Job {
    pub id: i64,
    pub description: String,
    pub created_at: String,
    pub working_directory: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    NotStarted,
    Active,
    Completed,
    /// Failed during execution; picked up again on the next run.
    RetryEligible,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotStarted => "not_started",
            Self::Active => "active",
            Self::Completed => "completed",
            Self::RetryEligible => "retry_eligible",
        }
    }

    /// Allowed transitions of the task state machine.
    pub fn can_transition_to(&self, next: TaskStatus) -> bool {
        matches!(
            (self, next),
            (Self::NotStarted, Self::Active)
                | (Self::RetryEligible, Self::Active)
                | (Self::Active, Self::Completed)
                | (Self::Active, Self::RetryEligible)
                | (Self::Active, Self::NotStarted)
        )
    }
}

impl FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "not_started" => Ok(Self::NotStarted),
            "active" => Ok(Self::Active),
            "completed" => Ok(Self::Completed),
            "retry_eligible" => Ok(Self::RetryEligible),
            _ => Err(format!("Invalid task status: {}", s)),
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    /// Implement new work described in natural language.
    Build,
    /// Resolve one inline review comment.
    Address,
    /// Fix the failing test/lint checks of a branch.
    LintAndTest,
}

impl TaskType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Build => "build",
            Self::Address => "address",
            Self::LintAndTest => "lint_and_test",
        }
    }
}

impl FromStr for TaskType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "build" => Ok(Self::Build),
            "address" => Ok(Self::Address),
            "lint_and_test" => Ok(Self::LintAndTest),
            _ => Err(format!("Invalid task type: {}", s)),
        }
    }
}

/// Where an address or lint_and_test task came from.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Provenance {
    pub pr_number: Option<i64>,
    pub comment_author: Option<String>,
    pub comment_path: Option<String>,
    pub comment_line: Option<i64>,
    /// Leading part of the review comment, used to re-match the live thread.
    pub comment_body: Option<String>,
    pub check_names: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Task {
    pub id: i64,
    pub job_id: i64,
    pub description: String,
    pub status: TaskStatus,
    pub task_type: TaskType,
    pub branch: Option<String>,
    pub pr_link: Option<String>,
    pub execution_log: String,
    pub commit_sha: Option<String>,
    pub comment_url: Option<String>,
    pub provenance: Provenance,
    pub created_at: String,
    pub updated_at: String,
}

/// Fields for inserting a task.
#[derive(Debug, Clone)]
pub struct NewTask {
    pub description: String,
    pub task_type: TaskType,
    pub branch: Option<String>,
    pub comment_url: Option<String>,
    pub provenance: Provenance,
}

impl NewTask {
    pub fn build(description: impl Into<String>) -> Self {
        Self {
            description: description.into(),
            task_type: TaskType::Build,
            branch: None,
            comment_url: None,
            provenance: Provenance::default(),
        }
    }
}

/// Raw row before enum parsing.
pub(crate) struct TaskRow {
    pub id: i64,
    pub job_id: i64,
    pub description: String,
    pub status: String,
    pub task_type: String,
    pub branch: Option<String>,
    pub pr_link: Option<String>,
    pub execution_log: String,
    pub commit_sha: Option<String>,
    pub comment_url: Option<String>,
    pub pr_number: Option<i64>,
    pub comment_author: Option<String>,
    pub comment_path: Option<String>,
    pub comment_line: Option<i64>,
    pub comment_body: Option<String>,
    pub check_names: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

impl TaskRow {
    pub(crate) fn into_task(self) -> anyhow::Result<Task> {
        Ok(Task {
            id: self.id,
            job_id: self.job_id,
            description: self.description,
            status: self.status.parse().map_err(|e: String| anyhow::anyhow!(e))?,
            task_type: self.task_type.parse().map_err(|e: String| anyhow::anyhow!(e))?,
            branch: self.branch,
            pr_link: self.pr_link,
            execution_log: self.execution_log,
            commit_sha: self.commit_sha,
            comment_url: self.comment_url,
            provenance: Provenance {
                pr_number: self.pr_number,
                comment_author: self.comment_author,
                comment_path: self.comment_path,
                comment_line: self.comment_line,
                comment_body: self.comment_body,
                check_names: self.check_names,
            },
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_round_trip_strings() {
        for status in [
            TaskStatus::NotStarted,
            TaskStatus::Active,
            TaskStatus::Completed,
            TaskStatus::RetryEligible,
        ] {
            assert_eq!(status.as_str().parse::<TaskStatus>().unwrap(), status);
        }
        assert!("failed".parse::<TaskStatus>().is_err());
    }

    #[test]
    fn test_valid_transitions() {
        assert!(TaskStatus::NotStarted.can_transition_to(TaskStatus::Active));
        assert!(TaskStatus::Active.can_transition_to(TaskStatus::Completed));
        assert!(TaskStatus::Active.can_transition_to(TaskStatus::RetryEligible));
        assert!(TaskStatus::RetryEligible.can_transition_to(TaskStatus::Active));
    }

    #[test]
    fn test_invalid_transitions() {
        assert!(!TaskStatus::NotStarted.can_transition_to(TaskStatus::Completed));
        assert!(!TaskStatus::Completed.can_transition_to(TaskStatus::Active));
        assert!(!TaskStatus::Completed.can_transition_to(TaskStatus::NotStarted));
        assert!(!TaskStatus::RetryEligible.can_transition_to(TaskStatus::Completed));
    }

    #[test]
    fn test_task_type_strings() {
        assert_eq!(TaskType::LintAndTest.as_str(), "lint_and_test");
        assert_eq!("address".parse::<TaskType>().unwrap(), TaskType::Address);
        assert!("deploy".parse::<TaskType>().is_err());
    }
}
