//! Workflow outputs and raw logs.
//!
//! The agent workflow uploads a `flamecast-outputs` artifact — a zip holding
//! `outputs.json` with `pr_url` and `claude_logs` — and GitHub separately
//! serves the run's raw logs as a zip of per-step text files. Both paths
//! follow the same rule: anything missing or malformed degrades to the
//! "not available" default instead of failing the request.
//!
//! The zip/JSON handling is pure (`parse_outputs_archive`,
//! `combine_log_archive`) so it can be exercised on in-memory archives; the
//! `fetch_*` functions add the GitHub calls on top.

use std::io::{Cursor, Read};

use chrono::DateTime;
use serde::{Deserialize, Serialize};

use crate::errors::GitHubError;
use crate::github::{Artifact, GitHubClient};
use crate::workflow::OUTPUT_ARTIFACT_NAME;

pub const MAX_CLAUDE_LOGS_CHARS: usize = 200_000;
pub const MAX_WORKFLOW_LOG_CHARS: usize = 300_000;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunOutputs {
    pub available: bool,
    pub pr_url: Option<String>,
    pub claude_logs: Option<String>,
    pub claude_logs_truncated: bool,
}

impl Default for RunOutputs {
    fn default() -> Self {
        Self {
            available: false,
            pr_url: None,
            claude_logs: None,
            claude_logs_truncated: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct RunLogs {
    pub download_url: Option<String>,
    pub content: Option<String>,
    pub truncated: bool,
}

#[derive(Debug, Deserialize)]
struct OutputsFile {
    pr_url: Option<serde_json::Value>,
    claude_logs: Option<serde_json::Value>,
}

fn read_entry(archive: &mut zip::ZipArchive<Cursor<&[u8]>>, name: &str) -> Option<String> {
    let mut entry = archive.by_name(name).ok()?;
    let mut content = String::new();
    entry.read_to_string(&mut content).ok()?;
    Some(content)
}

/// Parse the outputs artifact. The JSON entry is located by suffix:
/// `outputs.json` preferred, any `.json` as fallback (upload paths nest the
/// file under a directory whose name we do not control).
pub fn parse_outputs_archive(archive: &[u8]) -> RunOutputs {
    let Ok(mut zip) = zip::ZipArchive::new(Cursor::new(archive)) else {
        return RunOutputs::default();
    };

    let names: Vec<String> = zip.file_names().map(str::to_string).collect();
    let entry_name = names
        .iter()
        .find(|name| name.ends_with("outputs.json"))
        .or_else(|| names.iter().find(|name| name.ends_with(".json")));
    let Some(entry_name) = entry_name.cloned() else {
        return RunOutputs::default();
    };

    let Some(content) = read_entry(&mut zip, &entry_name) else {
        return RunOutputs::default();
    };
    let Ok(outputs) = serde_json::from_str::<OutputsFile>(&content) else {
        return RunOutputs::default();
    };

    let pr_url = match outputs.pr_url {
        Some(serde_json::Value::String(url)) if !url.is_empty() => Some(url),
        _ => None,
    };
    let claude_logs = match outputs.claude_logs {
        Some(serde_json::Value::String(logs)) => Some(logs),
        _ => None,
    };

    let claude_logs_truncated = claude_logs
        .as_ref()
        .is_some_and(|logs| logs.chars().count() > MAX_CLAUDE_LOGS_CHARS);
    let claude_logs =
        claude_logs.map(|logs| logs.chars().take(MAX_CLAUDE_LOGS_CHARS).collect());

    RunOutputs {
        available: true,
        pr_url,
        claude_logs,
        claude_logs_truncated,
    }
}

/// Concatenate every entry of a raw-logs archive, sorted by entry name and
/// prefixed with a `===== <name> =====` header. `None` when the archive is
/// unreadable or empty.
pub fn combine_log_archive(archive: &[u8], cap: usize) -> Option<(String, bool)> {
    let mut zip = zip::ZipArchive::new(Cursor::new(archive)).ok()?;

    let mut names: Vec<String> = zip.file_names().map(str::to_string).collect();
    names.sort();
    if names.is_empty() {
        return None;
    }

    let mut sections = Vec::with_capacity(names.len());
    for name in &names {
        let content = read_entry(&mut zip, name).unwrap_or_default();
        sections.push(format!("===== {} =====\n{}", name, content));
    }
    let combined = sections.join("\n\n");

    if combined.chars().count() <= cap {
        Some((combined, false))
    } else {
        Some((combined.chars().take(cap).collect(), true))
    }
}

/// Pick the artifact to extract: the documented name, not expired, and the
/// most recently created when re-runs produced several.
pub fn select_outputs_artifact(artifacts: Vec<Artifact>) -> Option<Artifact> {
    artifacts
        .into_iter()
        .filter(|artifact| artifact.name == OUTPUT_ARTIFACT_NAME && !artifact.expired)
        .max_by_key(|artifact| {
            artifact
                .created_at
                .as_deref()
                .and_then(|ts| DateTime::parse_from_rfc3339(ts).ok())
                .map(|dt| dt.timestamp_millis())
                .unwrap_or(0)
        })
}

/// Download and parse the outputs artifact for a run. GitHub 403/404 on the
/// artifact listing, a missing artifact, or a failed download all come back
/// as the unavailable default; other GitHub failures propagate.
pub async fn fetch_run_outputs(
    gh: &GitHubClient,
    owner: &str,
    repo: &str,
    run_id: i64,
) -> Result<RunOutputs, GitHubError> {
    let artifacts = match gh.list_artifacts(owner, repo, run_id).await {
        Ok(artifacts) => artifacts,
        Err(err) if err.is_not_available() => return Ok(RunOutputs::default()),
        Err(err) => return Err(err),
    };

    let Some(artifact) = select_outputs_artifact(artifacts) else {
        return Ok(RunOutputs::default());
    };

    match gh.download_archive(&artifact.archive_download_url).await {
        Ok(bytes) => Ok(parse_outputs_archive(&bytes)),
        Err(_) => Ok(RunOutputs::default()),
    }
}

/// Fetch and combine the run's raw logs. 403/404 mean not-yet/no-longer
/// available and yield the empty default; a download URL without a readable
/// archive still reports the URL.
pub async fn fetch_run_logs(
    gh: &GitHubClient,
    owner: &str,
    repo: &str,
    run_id: i64,
) -> Result<RunLogs, GitHubError> {
    let download = gh.run_logs(owner, repo, run_id).await?;

    let Some(download_url) = download.download_url else {
        return Ok(RunLogs::default());
    };

    let combined = download
        .archive
        .as_deref()
        .and_then(|bytes| combine_log_archive(bytes, MAX_WORKFLOW_LOG_CHARS));

    Ok(match combined {
        Some((content, truncated)) => RunLogs {
            download_url: Some(download_url),
            content: Some(content),
            truncated,
        },
        None => RunLogs {
            download_url: Some(download_url),
            content: None,
            truncated: false,
        },
    })
}
