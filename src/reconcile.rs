//! Status reconciliation.
//!
//! A ledger row starts pending and is driven to `completed` or `error` by
//! inspecting the GitHub Actions jobs of its workflow run. The caller (the
//! workflow's completion step, or a polling UI) calls this repeatedly; a
//! `Pending` answer writes nothing and means "ask again later". Terminal
//! rows short-circuit without touching GitHub, and the terminal writes
//! themselves are conditional updates, so two racing reconciles cannot both
//! transition the same row.

use std::sync::Arc;

use thiserror::Error;

use crate::db::DbHandle;
use crate::errors::GitHubError;
use crate::github::{CredentialCache, GitHubClient, Job};
use crate::models::{RunForReconcile, RunStatus};

/// Identifier of the agent action; the step that runs it carries this in
/// its name (`uses: smithery-ai/flamecast@v1`), matched case-insensitively.
pub const AGENT_STEP_MARKER: &str = "smithery-ai/flamecast";

const MISSING_PREREQS_MESSAGE: &str =
    "Unable to infer status: missing GitHub token or source repo";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// The row was terminal before this call; nothing was written.
    AlreadyResolved,
    /// The agent step has not concluded yet; nothing was written.
    Pending,
    Completed,
    Error,
}

impl ReconcileOutcome {
    /// The status to report to the caller; `None` for the short-circuit,
    /// which reports `alreadyResolved` instead.
    pub fn status(&self) -> Option<RunStatus> {
        match self {
            Self::AlreadyResolved => None,
            Self::Pending => Some(RunStatus::Pending),
            Self::Completed => Some(RunStatus::Completed),
            Self::Error => Some(RunStatus::Error),
        }
    }
}

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("Not found")]
    NotFound,

    #[error(transparent)]
    GitHub(#[from] GitHubError),

    #[error(transparent)]
    Ledger(#[from] anyhow::Error),
}

/// What a jobs scan produced: the agent step's conclusion (when it has one)
/// and the head branch to search pull requests with.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct AgentStepScan {
    pub conclusion: Option<String>,
    pub head_branch: Option<String>,
}

/// Linear scan over jobs in response order. The first step whose name
/// contains the agent marker (case-insensitive) and that already has a
/// conclusion wins; until then the head branch tracks the job most recently
/// visited, matching the branch the conclusive job ran on.
pub fn scan_agent_step(jobs: &[Job]) -> AgentStepScan {
    let mut scan = AgentStepScan::default();
    for job in jobs {
        scan.head_branch = job.head_branch.clone();
        let conclusion = job
            .steps
            .iter()
            .find(|step| step.name.to_lowercase().contains(AGENT_STEP_MARKER))
            .and_then(|step| step.conclusion.clone())
            .filter(|conclusion| !conclusion.is_empty());
        if conclusion.is_some() {
            scan.conclusion = conclusion;
            break;
        }
    }
    scan
}

fn split_repo(full_name: &str) -> Option<(String, String)> {
    let mut parts = full_name.splitn(2, '/');
    let owner = parts.next()?.to_string();
    let repo = parts.next()?.to_string();
    if owner.is_empty() || repo.is_empty() {
        return None;
    }
    Some((owner, repo))
}

async fn mark_error(
    db: &DbHandle,
    run_id: &str,
    message: String,
) -> Result<ReconcileOutcome, ReconcileError> {
    let run_id = run_id.to_string();
    let updated = db
        .call(move |db| db.resolve_run_error(&run_id, &message))
        .await?;
    Ok(if updated {
        ReconcileOutcome::Error
    } else {
        ReconcileOutcome::AlreadyResolved
    })
}

/// Reconcile one ledger row against GitHub, scoped to the requesting user.
pub async fn reconcile_run(
    db: &DbHandle,
    github_base: &str,
    run_row_id: &str,
    user_id: &str,
) -> Result<ReconcileOutcome, ReconcileError> {
    let row_id = run_row_id.to_string();
    let uid = user_id.to_string();
    let run: RunForReconcile = db
        .call(move |db| db.get_run_for_reconcile(&row_id, &uid))
        .await?
        .ok_or(ReconcileError::NotFound)?;

    // Idempotent short-circuit: terminal rows are never re-queried.
    if run.completed_at.is_some() || run.error_at.is_some() {
        return Ok(ReconcileOutcome::AlreadyResolved);
    }

    let uid = run.user_id.clone();
    let token = db.call(move |db| db.get_github_token(&uid)).await?;

    let (Some(token), Some(source_repo)) = (token, run.source_repo.clone()) else {
        return mark_error(db, &run.id, MISSING_PREREQS_MESSAGE.to_string()).await;
    };
    let Some((source_owner, source_name)) = split_repo(&source_repo) else {
        return mark_error(db, &run.id, MISSING_PREREQS_MESSAGE.to_string()).await;
    };

    let gh = GitHubClient::new(github_base, Arc::new(CredentialCache::new(token)))?;

    let jobs = match gh
        .list_jobs(&source_owner, &source_name, run.workflow_run_id, None)
        .await
    {
        Ok(jobs) => jobs,
        Err(err) => {
            // A refusal from GitHub resolves into the row rather than the
            // response; transport failures stay request-level.
            let Some(status) = err.status() else {
                return Err(err.into());
            };
            return mark_error(db, &run.id, format!("GitHub API error: {}", status)).await;
        }
    };

    let scan = scan_agent_step(&jobs);

    match scan.conclusion.as_deref() {
        Some("success") => {
            let pr_url = match (&run.repo, &scan.head_branch) {
                (Some(target_repo), Some(head_branch)) => {
                    discover_pr_url(&gh, target_repo, &source_owner, head_branch).await
                }
                _ => None,
            };
            let run_id = run.id.clone();
            let updated = db
                .call(move |db| db.resolve_run_completed(&run_id, pr_url.as_deref()))
                .await?;
            Ok(if updated {
                ReconcileOutcome::Completed
            } else {
                ReconcileOutcome::AlreadyResolved
            })
        }
        Some(conclusion @ ("failure" | "cancelled" | "timed_out")) => {
            mark_error(db, &run.id, format!("Workflow step {}", conclusion)).await
        }
        // Unknown conclusion, step not reached, or step not found.
        _ => Ok(ReconcileOutcome::Pending),
    }
}

/// Best-effort lookup of the PR the agent opened on the target repo: head
/// filter `<source owner>:<head branch>`, any state, first match.
async fn discover_pr_url(
    gh: &GitHubClient,
    target_repo: &str,
    source_owner: &str,
    head_branch: &str,
) -> Option<String> {
    let (owner, repo) = split_repo(target_repo)?;
    let head = format!("{}:{}", source_owner, head_branch);
    match gh.list_pulls(&owner, &repo, "all", Some(&head), 1).await {
        Ok(pulls) => pulls.into_iter().next().map(|pr| pr.html_url),
        Err(err) => {
            tracing::debug!(error = %err, "PR discovery failed");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job(head_branch: &str, steps: serde_json::Value) -> Job {
        serde_json::from_value(serde_json::json!({
            "id": 1,
            "name": "flamecast",
            "status": "completed",
            "conclusion": null,
            "head_branch": head_branch,
            "steps": steps,
        }))
        .unwrap()
    }

    #[test]
    fn test_scan_finds_concluded_agent_step() {
        let jobs = vec![job(
            "flamecast/u/fix",
            serde_json::json!([
                {"name": "Register workflow run", "status": "completed", "conclusion": "success", "number": 1},
                {"name": "Run smithery-ai/flamecast@v1", "status": "completed", "conclusion": "success", "number": 2},
            ]),
        )];
        let scan = scan_agent_step(&jobs);
        assert_eq!(scan.conclusion.as_deref(), Some("success"));
        assert_eq!(scan.head_branch.as_deref(), Some("flamecast/u/fix"));
    }

    #[test]
    fn test_scan_match_is_case_insensitive() {
        let jobs = vec![job(
            "b",
            serde_json::json!([
                {"name": "Run Smithery-AI/Flamecast action", "status": "completed", "conclusion": "failure", "number": 1},
            ]),
        )];
        assert_eq!(scan_agent_step(&jobs).conclusion.as_deref(), Some("failure"));
    }

    #[test]
    fn test_scan_without_matching_step_is_inconclusive() {
        let jobs = vec![job(
            "main",
            serde_json::json!([
                {"name": "checkout", "status": "completed", "conclusion": "success", "number": 1},
            ]),
        )];
        let scan = scan_agent_step(&jobs);
        assert!(scan.conclusion.is_none());
        assert_eq!(scan.head_branch.as_deref(), Some("main"));
    }

    #[test]
    fn test_scan_pending_step_is_inconclusive() {
        let jobs = vec![job(
            "main",
            serde_json::json!([
                {"name": "smithery-ai/flamecast", "status": "in_progress", "conclusion": null, "number": 1},
            ]),
        )];
        assert!(scan_agent_step(&jobs).conclusion.is_none());
    }

    #[test]
    fn test_scan_stops_at_first_conclusive_job() {
        let jobs = vec![
            job(
                "first-branch",
                serde_json::json!([
                    {"name": "smithery-ai/flamecast run", "status": "completed", "conclusion": "cancelled", "number": 1},
                ]),
            ),
            job(
                "second-branch",
                serde_json::json!([
                    {"name": "smithery-ai/flamecast run", "status": "completed", "conclusion": "success", "number": 1},
                ]),
            ),
        ];
        let scan = scan_agent_step(&jobs);
        assert_eq!(scan.conclusion.as_deref(), Some("cancelled"));
        assert_eq!(scan.head_branch.as_deref(), Some("first-branch"));
    }

    #[test]
    fn test_scan_empty_jobs() {
        let scan = scan_agent_step(&[]);
        assert_eq!(scan, AgentStepScan::default());
    }

    #[test]
    fn test_split_repo() {
        assert_eq!(
            split_repo("octo/flamecast"),
            Some(("octo".into(), "flamecast".into()))
        );
        assert_eq!(split_repo("octo"), None);
        assert_eq!(split_repo("/repo"), None);
        assert_eq!(split_repo("octo/"), None);
        // Extra segments stay in the repo part, as GitHub would reject them.
        assert_eq!(split_repo("a/b/c"), Some(("a".into(), "b/c".into())));
    }
}
