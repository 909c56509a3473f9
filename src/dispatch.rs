//! Dispatch orchestration.
//!
//! Triggering a workflow is a fire-and-forget call on GitHub's side: the
//! dispatch endpoint returns no run id. The orchestrator therefore records
//! the dispatch time first, fires the dispatch, then polls the run listing
//! for a `workflow_dispatch` run created at or after that timestamp (minus
//! a 30-second slack for clock skew and propagation). Only when a run id is
//! discovered does a ledger row appear; a quiet poll window still counts as
//! a successful dispatch.

use chrono::{DateTime, Duration, SecondsFormat, Utc};
use thiserror::Error;

use crate::db::{DbHandle, DispatchedRun};
use crate::errors::GitHubError;
use crate::github::{GitHubClient, WorkflowRunSummary};
use crate::retry::RetryPolicy;
use crate::workflow::WORKFLOW_FILE;

/// Window before the recorded dispatch instant within which a run's
/// `created_at` still counts as ours.
const DISCOVERY_SLACK_SECS: i64 = 30;

#[derive(Debug, Clone)]
pub struct DispatchParams {
    pub owner: String,
    pub repo: String,
    /// Trimmed, non-empty. Empty prompts are rejected at the HTTP layer
    /// before this module is reached.
    pub prompt: String,
    pub base_branch: Option<String>,
    pub git_ref: Option<String>,
    pub target_repo: Option<String>,
    pub chat_id: Option<String>,
}

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error(transparent)]
    GitHub(#[from] GitHubError),

    #[error(transparent)]
    Ledger(#[from] anyhow::Error),
}

/// Outcome of a dispatch. `run_row_id` is present only when run discovery
/// succeeded within the poll window.
#[derive(Debug)]
pub struct DispatchOutcome {
    pub workflow_run_id: Option<i64>,
    pub run_row_id: Option<String>,
}

/// First run in the listing created at or after `dispatched_at - 30s`.
/// The boundary is inclusive; unparseable timestamps never match.
pub fn find_recent_run(
    runs: &[WorkflowRunSummary],
    dispatched_at: DateTime<Utc>,
) -> Option<i64> {
    let cutoff = dispatched_at - Duration::seconds(DISCOVERY_SLACK_SECS);
    runs.iter()
        .find(|run| {
            DateTime::parse_from_rfc3339(&run.created_at)
                .map(|created| created.with_timezone(&Utc) >= cutoff)
                .unwrap_or(false)
        })
        .map(|run| run.id)
}

/// Build the `workflow_dispatch` inputs map: `prompt` always, `base_branch`
/// only when it differs from the implicit default, `target_repo` when set.
pub fn dispatch_inputs(params: &DispatchParams) -> serde_json::Value {
    let mut inputs = serde_json::Map::new();
    inputs.insert("prompt".into(), params.prompt.clone().into());
    if let Some(base_branch) = &params.base_branch {
        if base_branch != "main" {
            inputs.insert("base_branch".into(), base_branch.clone().into());
        }
    }
    if let Some(target_repo) = &params.target_repo {
        inputs.insert("target_repo".into(), target_repo.clone().into());
    }
    serde_json::Value::Object(inputs)
}

pub async fn dispatch(
    db: &DbHandle,
    gh: &GitHubClient,
    user_id: &str,
    params: DispatchParams,
    retry: RetryPolicy,
) -> Result<DispatchOutcome, DispatchError> {
    let inputs = dispatch_inputs(&params);

    // Caller-supplied ref wins; otherwise the repo's default branch, and
    // "main" when even that lookup fails.
    let git_ref = match &params.git_ref {
        Some(git_ref) => git_ref.clone(),
        None => match gh.get_repo(&params.owner, &params.repo).await {
            Ok(repo) => repo.default_branch,
            Err(err) => {
                tracing::debug!(error = %err, "default branch lookup failed, dispatching on main");
                "main".to_string()
            }
        },
    };

    // The lower bound for run discovery; recorded before the dispatch call
    // so a fast-starting run can never predate it.
    let dispatched_at = Utc::now();

    gh.dispatch_workflow(&params.owner, &params.repo, WORKFLOW_FILE, &git_ref, &inputs)
        .await?;

    let workflow_run_id = retry
        .run_until(|| async {
            match gh
                .list_dispatch_runs(&params.owner, &params.repo, WORKFLOW_FILE)
                .await
            {
                Ok(runs) => find_recent_run(&runs, dispatched_at),
                // A flaky listing call just spends one attempt.
                Err(err) => {
                    tracing::debug!(error = %err, "run listing failed during discovery");
                    None
                }
            }
        })
        .await;

    let Some(workflow_run_id) = workflow_run_id else {
        tracing::warn!(
            owner = %params.owner,
            repo = %params.repo,
            "dispatched workflow but no run appeared within the poll window"
        );
        return Ok(DispatchOutcome {
            workflow_run_id: None,
            run_row_id: None,
        });
    };

    let user_id = user_id.to_string();
    let source_repo = format!("{}/{}", params.owner, params.repo);
    let target_repo = params
        .target_repo
        .clone()
        .unwrap_or_else(|| source_repo.clone());
    let prompt = params.prompt.clone();
    let chat_id = params.chat_id.clone();
    let dispatched_at_iso = dispatched_at.to_rfc3339_opts(SecondsFormat::Micros, true);

    let run_row_id = db
        .call(move |db| {
            let source_repo_id = db.upsert_source_repo(&user_id, &source_repo)?;
            let chat_id = db.get_or_create_chat(
                chat_id.as_deref(),
                &user_id,
                &prompt,
                Some(&target_repo),
                Some(&source_repo_id),
            )?;
            db.record_dispatched_run(&DispatchedRun {
                workflow_run_id,
                user_id: user_id.clone(),
                repo: target_repo,
                source_repo_id,
                prompt,
                chat_id,
                dispatched_at: dispatched_at_iso,
            })
        })
        .await?;

    Ok(DispatchOutcome {
        workflow_run_id: Some(workflow_run_id),
        run_row_id: Some(run_row_id),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(id: i64, created_at: &str) -> WorkflowRunSummary {
        serde_json::from_value(serde_json::json!({
            "id": id,
            "head_branch": "main",
            "status": "queued",
            "conclusion": null,
            "created_at": created_at,
            "html_url": format!("https://github.com/o/r/actions/runs/{}", id),
        }))
        .unwrap()
    }

    fn at(ts: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(ts).unwrap().with_timezone(&Utc)
    }

    #[test]
    fn test_find_recent_run_matches_after_dispatch() {
        let dispatched = at("2025-06-01T12:00:00Z");
        let runs = vec![run(900, "2025-06-01T12:00:05Z")];
        assert_eq!(find_recent_run(&runs, dispatched), Some(900));
    }

    #[test]
    fn test_find_recent_run_slack_boundary_inclusive() {
        let dispatched = at("2025-06-01T12:00:30Z");
        // Exactly dispatched_at - 30s.
        let runs = vec![run(901, "2025-06-01T12:00:00Z")];
        assert_eq!(find_recent_run(&runs, dispatched), Some(901));
    }

    #[test]
    fn test_find_recent_run_rejects_older_runs() {
        let dispatched = at("2025-06-01T12:00:31Z");
        let runs = vec![run(902, "2025-06-01T12:00:00Z")];
        assert_eq!(find_recent_run(&runs, dispatched), None);
    }

    #[test]
    fn test_find_recent_run_takes_first_match_in_order() {
        let dispatched = at("2025-06-01T12:00:00Z");
        let runs = vec![
            run(1, "2025-06-01T11:00:00Z"),
            run(2, "2025-06-01T12:00:02Z"),
            run(3, "2025-06-01T12:00:03Z"),
        ];
        assert_eq!(find_recent_run(&runs, dispatched), Some(2));
    }

    #[test]
    fn test_find_recent_run_ignores_bad_timestamps() {
        let dispatched = at("2025-06-01T12:00:00Z");
        let runs = vec![run(1, "not a timestamp")];
        assert_eq!(find_recent_run(&runs, dispatched), None);
    }

    #[test]
    fn test_dispatch_inputs_always_carry_prompt() {
        let params = DispatchParams {
            owner: "o".into(),
            repo: "r".into(),
            prompt: "fix it".into(),
            base_branch: None,
            git_ref: None,
            target_repo: None,
            chat_id: None,
        };
        let inputs = dispatch_inputs(&params);
        assert_eq!(inputs, serde_json::json!({"prompt": "fix it"}));
    }

    #[test]
    fn test_dispatch_inputs_omit_default_base_branch() {
        let mut params = DispatchParams {
            owner: "o".into(),
            repo: "r".into(),
            prompt: "p".into(),
            base_branch: Some("main".into()),
            git_ref: None,
            target_repo: None,
            chat_id: None,
        };
        assert_eq!(dispatch_inputs(&params), serde_json::json!({"prompt": "p"}));

        params.base_branch = Some("develop".into());
        params.target_repo = Some("octo/target".into());
        assert_eq!(
            dispatch_inputs(&params),
            serde_json::json!({
                "prompt": "p",
                "base_branch": "develop",
                "target_repo": "octo/target",
            })
        );
    }
}
