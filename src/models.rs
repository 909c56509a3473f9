use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Inferred lifecycle state of a tracked workflow run.
///
/// `Completed` and `Error` are terminal; a run in either state is never
/// re-queried against GitHub.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Completed,
    Error,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Completed => "completed",
            Self::Error => "error",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Error)
    }
}

impl FromStr for RunStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "completed" => Ok(Self::Completed),
            "error" => Ok(Self::Error),
            _ => Err(format!("Invalid run status: {}", s)),
        }
    }
}

/// Status label shown next to a chat, derived from its most recent run.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ChatRunStatus {
    Queued,
    Running,
    Completed,
    Error,
}

impl ChatRunStatus {
    /// Classify a run row by its timestamp columns. Error wins over
    /// completed; a started but unresolved run is running; otherwise queued.
    pub fn classify(
        started_at: Option<&str>,
        completed_at: Option<&str>,
        error_at: Option<&str>,
    ) -> Self {
        if error_at.is_some() {
            Self::Error
        } else if completed_at.is_some() {
            Self::Completed
        } else if started_at.is_some() {
            Self::Running
        } else {
            Self::Queued
        }
    }
}

/// One ledger row tracking an external GitHub Actions workflow run,
/// joined with the source repository's full name where linked.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowRun {
    pub id: String,
    pub workflow_run_id: i64,
    pub user_id: String,
    pub repo: Option<String>,
    pub source_repo: Option<String>,
    pub prompt: Option<String>,
    pub pr_url: Option<String>,
    pub error_message: Option<String>,
    pub chat_id: Option<String>,
    pub started_at: Option<String>,
    pub completed_at: Option<String>,
    pub error_at: Option<String>,
    pub archived_at: Option<String>,
    pub created_at: String,
}

/// Subset of a run row needed by the status reconciler.
#[derive(Debug, Clone)]
pub struct RunForReconcile {
    pub id: String,
    pub workflow_run_id: i64,
    pub user_id: String,
    pub repo: Option<String>,
    pub source_repo: Option<String>,
    pub completed_at: Option<String>,
    pub error_at: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Chat {
    pub id: String,
    pub user_id: String,
    pub title: String,
    pub repo: Option<String>,
    pub source_repo_id: Option<String>,
    pub archived_at: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

/// A chat plus the rollup shown in list views.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatWithSummary {
    #[serde(flatten)]
    pub chat: Chat,
    pub last_prompt: Option<String>,
    pub run_count: i64,
    pub latest_run_status: Option<ChatRunStatus>,
}

/// Metadata for an API key. The key value itself is only surfaced once,
/// at creation time.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiKeyInfo {
    pub id: String,
    pub name: Option<String>,
    pub description: Option<String>,
    pub created_at: String,
}

/// An authenticated API key holder.
#[derive(Debug, Clone)]
pub struct ApiKeyAuth {
    pub key_id: String,
    pub user_id: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_status_roundtrip() {
        for status in [RunStatus::Pending, RunStatus::Completed, RunStatus::Error] {
            assert_eq!(RunStatus::from_str(status.as_str()).unwrap(), status);
        }
    }

    #[test]
    fn test_run_status_invalid() {
        assert!(RunStatus::from_str("queued").is_err());
    }

    #[test]
    fn test_terminal_states() {
        assert!(!RunStatus::Pending.is_terminal());
        assert!(RunStatus::Completed.is_terminal());
        assert!(RunStatus::Error.is_terminal());
    }

    #[test]
    fn test_chat_run_status_error_wins() {
        let status = ChatRunStatus::classify(Some("t"), Some("t"), Some("t"));
        assert_eq!(status, ChatRunStatus::Error);
    }

    #[test]
    fn test_chat_run_status_completed() {
        let status = ChatRunStatus::classify(Some("t"), Some("t"), None);
        assert_eq!(status, ChatRunStatus::Completed);
    }

    #[test]
    fn test_chat_run_status_running() {
        let status = ChatRunStatus::classify(Some("t"), None, None);
        assert_eq!(status, ChatRunStatus::Running);
    }

    #[test]
    fn test_chat_run_status_queued() {
        let status = ChatRunStatus::classify(None, None, None);
        assert_eq!(status, ChatRunStatus::Queued);
    }

    #[test]
    fn test_run_status_serializes_snake_case() {
        assert_eq!(
            serde_json::to_string(&RunStatus::Completed).unwrap(),
            "\"completed\""
        );
        assert_eq!(
            serde_json::to_string(&ChatRunStatus::Queued).unwrap(),
            "\"queued\""
        );
    }
}
