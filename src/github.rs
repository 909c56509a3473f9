//! GitHub REST API client.
//!
//! One `GitHubClient` is built per authenticated request from the caller's
//! stored OAuth token. The response types are deliberately thin — only the
//! fields this backend reads — and deserialization failures surface as
//! `GitHubError::Decode` rather than panics.
//!
//! Redirect following is disabled on the underlying client: GitHub hands out
//! pre-signed blob-storage URLs via 302 for log and artifact downloads, and
//! those must be fetched without the `Authorization` header. The download
//! helpers follow that single hop manually.

use std::sync::{Arc, RwLock};

use serde::Deserialize;

use crate::errors::GitHubError;

pub const GITHUB_API_BASE: &str = "https://api.github.com";

const USER_AGENT: &str = "flamecast-backend";
const ACCEPT: &str = "application/vnd.github.v3+json";

/// Known GitHub token prefixes.
/// See: https://github.blog/2021-04-05-behind-githubs-new-authentication-token-formats/
const GITHUB_TOKEN_PREFIXES: &[&str] = &[
    "ghp_",        // Personal access tokens (classic)
    "github_pat_", // Fine-grained personal access tokens
    "gho_",        // OAuth access tokens
    "ghu_",        // GitHub App user-to-server tokens
    "ghs_",        // GitHub App server-to-server tokens
    "ghr_",        // GitHub App refresh tokens
];

/// Format check only — does not verify the token is active or scoped.
/// Used to reject obvious garbage before it is persisted.
pub fn is_valid_github_token(token: &str) -> bool {
    if token.is_empty() {
        return false;
    }
    GITHUB_TOKEN_PREFIXES
        .iter()
        .any(|prefix| token.starts_with(prefix))
}

// ── Credentials ───────────────────────────────────────────────────────

/// Holder for the bearer credential the client authenticates with.
///
/// Explicit object rather than ambient state: the cache is created per
/// request, handed to the client by reference, and invalidated when GitHub
/// answers 401 so subsequent calls in the same request fail fast with
/// `MissingToken` instead of hammering GitHub.
#[derive(Debug, Default)]
pub struct CredentialCache {
    token: RwLock<Option<String>>,
}

impl CredentialCache {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: RwLock::new(Some(token.into())),
        }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn get(&self) -> Option<String> {
        self.token.read().ok().and_then(|guard| guard.clone())
    }

    pub fn store(&self, token: impl Into<String>) {
        if let Ok(mut guard) = self.token.write() {
            *guard = Some(token.into());
        }
    }

    pub fn invalidate(&self) {
        if let Ok(mut guard) = self.token.write() {
            *guard = None;
        }
    }
}

// ── Response types (subset of fields we read) ─────────────────────────

#[derive(Debug, Deserialize)]
pub struct GitHubUser {
    pub login: String,
}

#[derive(Debug, Deserialize)]
pub struct Repository {
    pub default_branch: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WorkflowRunSummary {
    pub id: i64,
    pub head_branch: Option<String>,
    pub status: Option<String>,
    pub conclusion: Option<String>,
    pub created_at: String,
    pub html_url: String,
}

#[derive(Debug, Deserialize)]
pub struct WorkflowRunsPage {
    #[serde(default)]
    pub workflow_runs: Vec<WorkflowRunSummary>,
}

#[derive(Debug, Deserialize)]
pub struct RunDetail {
    pub id: i64,
    pub html_url: String,
    pub status: Option<String>,
    pub conclusion: Option<String>,
    pub run_started_at: Option<String>,
    pub updated_at: String,
    pub head_sha: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct JobStep {
    pub name: String,
    pub status: Option<String>,
    pub conclusion: Option<String>,
    pub number: Option<i64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Job {
    pub id: i64,
    pub name: String,
    pub status: Option<String>,
    pub conclusion: Option<String>,
    pub head_branch: Option<String>,
    #[serde(default)]
    pub steps: Vec<JobStep>,
}

#[derive(Debug, Deserialize)]
pub struct JobsResponse {
    #[serde(default)]
    pub jobs: Vec<Job>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Artifact {
    pub name: String,
    pub expired: bool,
    pub created_at: Option<String>,
    pub archive_download_url: String,
}

#[derive(Debug, Deserialize)]
struct ArtifactsPage {
    #[serde(default)]
    artifacts: Vec<Artifact>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PullHead {
    #[serde(rename = "ref")]
    pub branch: String,
    pub sha: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PullRequest {
    pub number: i64,
    pub title: Option<String>,
    pub state: Option<String>,
    /// Only present on single-PR fetches, not list responses.
    #[serde(default)]
    pub merged: bool,
    pub mergeable: Option<bool>,
    pub html_url: String,
    pub head: PullHead,
    pub created_at: Option<String>,
    pub updated_at: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct CreatedPull {
    pub number: i64,
    pub html_url: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CheckRun {
    pub id: i64,
    pub name: String,
    pub status: String,
    pub conclusion: Option<String>,
    pub html_url: Option<String>,
    pub started_at: Option<String>,
    pub completed_at: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CheckRunsPage {
    #[serde(default)]
    check_runs: Vec<CheckRun>,
}

#[derive(Debug, Deserialize)]
pub struct ActionsPublicKey {
    pub key: String,
    pub key_id: String,
}

#[derive(Debug, Deserialize)]
pub struct RepoContents {
    #[serde(rename = "type")]
    pub content_type: String,
    pub sha: String,
    pub content: String,
}

#[derive(Debug, Deserialize)]
pub struct GitRef {
    pub object: GitObject,
}

#[derive(Debug, Deserialize)]
pub struct GitObject {
    pub sha: String,
}

/// Result of the run-logs endpoint: the pre-signed download URL (when GitHub
/// offered one) plus the fetched archive bytes (when the fetch succeeded).
#[derive(Debug, Default)]
pub struct LogsDownload {
    pub download_url: Option<String>,
    pub archive: Option<Vec<u8>>,
}

// ── Client ────────────────────────────────────────────────────────────

pub struct GitHubClient {
    http: reqwest::Client,
    base_url: String,
    credentials: Arc<CredentialCache>,
}

impl GitHubClient {
    /// `base_url` is `GITHUB_API_BASE` in production; tests point it at a
    /// local stand-in server.
    pub fn new(
        base_url: impl Into<String>,
        credentials: Arc<CredentialCache>,
    ) -> Result<Self, GitHubError> {
        let http = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .build()?;
        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            credentials,
        })
    }

    pub fn credentials(&self) -> &CredentialCache {
        &self.credentials
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn request(
        &self,
        method: reqwest::Method,
        path: &str,
    ) -> Result<reqwest::RequestBuilder, GitHubError> {
        let token = self.credentials.get().ok_or(GitHubError::MissingToken)?;
        Ok(self
            .http
            .request(method, self.url(path))
            .header("Authorization", format!("token {}", token))
            .header("Accept", ACCEPT)
            .header("User-Agent", USER_AGENT))
    }

    /// Send and require a 2xx answer. A 401 invalidates the credential
    /// cache before the error is returned.
    async fn send(
        &self,
        req: reqwest::RequestBuilder,
    ) -> Result<reqwest::Response, GitHubError> {
        let resp = req.send().await?;
        let status = resp.status();
        if status.as_u16() == 401 {
            self.credentials.invalidate();
        }
        if status.is_success() {
            Ok(resp)
        } else {
            Err(GitHubError::Status {
                status: status.as_u16(),
                body: resp.text().await.unwrap_or_default(),
            })
        }
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<T, GitHubError> {
        let req = self.request(reqwest::Method::GET, path)?.query(query);
        self.send(req).await?.json().await.map_err(GitHubError::Decode)
    }

    // ── Users and repositories ────────────────────────────────────────

    pub async fn get_authenticated_user(&self) -> Result<GitHubUser, GitHubError> {
        self.get_json("/user", &[]).await
    }

    pub async fn get_repo(&self, owner: &str, repo: &str) -> Result<Repository, GitHubError> {
        self.get_json(&format!("/repos/{}/{}", owner, repo), &[]).await
    }

    pub async fn create_user_repo(
        &self,
        name: &str,
        description: &str,
    ) -> Result<(), GitHubError> {
        let req = self
            .request(reqwest::Method::POST, "/user/repos")?
            .json(&serde_json::json!({
                "name": name,
                "description": description,
                "private": false,
                "auto_init": true,
            }));
        self.send(req).await.map(|_| ())
    }

    /// Fetch a file's metadata and content; `Ok(None)` when the path does
    /// not exist on the given ref.
    pub async fn get_contents(
        &self,
        owner: &str,
        repo: &str,
        path: &str,
        git_ref: Option<&str>,
    ) -> Result<Option<RepoContents>, GitHubError> {
        let mut query = Vec::new();
        if let Some(git_ref) = git_ref {
            query.push(("ref", git_ref.to_string()));
        }
        match self
            .get_json(&format!("/repos/{}/{}/contents/{}", owner, repo, path), &query)
            .await
        {
            Ok(contents) => Ok(Some(contents)),
            Err(err) if err.status() == Some(404) => Ok(None),
            Err(err) => Err(err),
        }
    }

    pub async fn put_contents(
        &self,
        owner: &str,
        repo: &str,
        path: &str,
        message: &str,
        content_base64: &str,
        branch: Option<&str>,
        sha: Option<&str>,
    ) -> Result<(), GitHubError> {
        let mut body = serde_json::json!({
            "message": message,
            "content": content_base64,
        });
        if let Some(branch) = branch {
            body["branch"] = serde_json::Value::from(branch);
        }
        if let Some(sha) = sha {
            body["sha"] = serde_json::Value::from(sha);
        }
        let req = self
            .request(
                reqwest::Method::PUT,
                &format!("/repos/{}/{}/contents/{}", owner, repo, path),
            )?
            .json(&body);
        self.send(req).await.map(|_| ())
    }

    pub async fn get_branch_ref(
        &self,
        owner: &str,
        repo: &str,
        branch: &str,
    ) -> Result<GitRef, GitHubError> {
        self.get_json(
            &format!("/repos/{}/{}/git/ref/heads/{}", owner, repo, branch),
            &[],
        )
        .await
    }

    pub async fn create_branch(
        &self,
        owner: &str,
        repo: &str,
        branch: &str,
        sha: &str,
    ) -> Result<(), GitHubError> {
        let req = self
            .request(
                reqwest::Method::POST,
                &format!("/repos/{}/{}/git/refs", owner, repo),
            )?
            .json(&serde_json::json!({
                "ref": format!("refs/heads/{}", branch),
                "sha": sha,
            }));
        self.send(req).await.map(|_| ())
    }

    pub async fn delete_branch(
        &self,
        owner: &str,
        repo: &str,
        branch: &str,
    ) -> Result<(), GitHubError> {
        let req = self.request(
            reqwest::Method::DELETE,
            &format!("/repos/{}/{}/git/refs/heads/{}", owner, repo, branch),
        )?;
        self.send(req).await.map(|_| ())
    }

    // ── Actions workflows and runs ────────────────────────────────────

    pub async fn dispatch_workflow(
        &self,
        owner: &str,
        repo: &str,
        workflow_file: &str,
        git_ref: &str,
        inputs: &serde_json::Value,
    ) -> Result<(), GitHubError> {
        let req = self
            .request(
                reqwest::Method::POST,
                &format!(
                    "/repos/{}/{}/actions/workflows/{}/dispatches",
                    owner, repo, workflow_file
                ),
            )?
            .json(&serde_json::json!({ "ref": git_ref, "inputs": inputs }));
        self.send(req).await.map(|_| ())
    }

    /// Recent `workflow_dispatch` runs of a workflow file, newest first.
    pub async fn list_dispatch_runs(
        &self,
        owner: &str,
        repo: &str,
        workflow_file: &str,
    ) -> Result<Vec<WorkflowRunSummary>, GitHubError> {
        let page: WorkflowRunsPage = self
            .get_json(
                &format!(
                    "/repos/{}/{}/actions/workflows/{}/runs",
                    owner, repo, workflow_file
                ),
                &[
                    ("event", "workflow_dispatch".to_string()),
                    ("per_page", "20".to_string()),
                ],
            )
            .await?;
        Ok(page.workflow_runs)
    }

    pub async fn list_workflow_runs(
        &self,
        owner: &str,
        repo: &str,
        workflow_file: &str,
        branch: Option<&str>,
        per_page: u32,
    ) -> Result<Vec<WorkflowRunSummary>, GitHubError> {
        let mut query = vec![("per_page", per_page.to_string())];
        if let Some(branch) = branch {
            query.push(("branch", branch.to_string()));
        }
        let page: WorkflowRunsPage = self
            .get_json(
                &format!(
                    "/repos/{}/{}/actions/workflows/{}/runs",
                    owner, repo, workflow_file
                ),
                &query,
            )
            .await?;
        Ok(page.workflow_runs)
    }

    pub async fn get_run(
        &self,
        owner: &str,
        repo: &str,
        run_id: i64,
    ) -> Result<RunDetail, GitHubError> {
        self.get_json(&format!("/repos/{}/{}/actions/runs/{}", owner, repo, run_id), &[])
            .await
    }

    pub async fn list_jobs(
        &self,
        owner: &str,
        repo: &str,
        run_id: i64,
        per_page: Option<u32>,
    ) -> Result<Vec<Job>, GitHubError> {
        let mut query = Vec::new();
        if let Some(per_page) = per_page {
            query.push(("per_page", per_page.to_string()));
        }
        let resp: JobsResponse = self
            .get_json(
                &format!("/repos/{}/{}/actions/runs/{}/jobs", owner, repo, run_id),
                &query,
            )
            .await?;
        Ok(resp.jobs)
    }

    pub async fn list_artifacts(
        &self,
        owner: &str,
        repo: &str,
        run_id: i64,
    ) -> Result<Vec<Artifact>, GitHubError> {
        let page: ArtifactsPage = self
            .get_json(
                &format!(
                    "/repos/{}/{}/actions/runs/{}/artifacts",
                    owner, repo, run_id
                ),
                &[("per_page", "100".to_string())],
            )
            .await?;
        Ok(page.artifacts)
    }

    /// Download an archive URL that may answer directly or via a single
    /// pre-signed redirect. The second hop is fetched without credentials.
    pub async fn download_archive(&self, url: &str) -> Result<Vec<u8>, GitHubError> {
        let token = self.credentials.get().ok_or(GitHubError::MissingToken)?;
        let resp = self
            .http
            .get(url)
            .header("Authorization", format!("token {}", token))
            .header("Accept", ACCEPT)
            .header("User-Agent", USER_AGENT)
            .send()
            .await?;

        let status = resp.status();
        if status.is_redirection() {
            let location = resp
                .headers()
                .get("location")
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
                .ok_or(GitHubError::Status {
                    status: status.as_u16(),
                    body: "redirect without location".to_string(),
                })?;
            let follow = self
                .http
                .get(&location)
                .header("User-Agent", USER_AGENT)
                .send()
                .await?;
            if !follow.status().is_success() {
                return Err(GitHubError::Status {
                    status: follow.status().as_u16(),
                    body: follow.text().await.unwrap_or_default(),
                });
            }
            return Ok(follow.bytes().await?.to_vec());
        }

        if status.as_u16() == 401 {
            self.credentials.invalidate();
        }
        if !status.is_success() {
            return Err(GitHubError::Status {
                status: status.as_u16(),
                body: resp.text().await.unwrap_or_default(),
            });
        }
        Ok(resp.bytes().await?.to_vec())
    }

    /// The run-logs endpoint. GitHub answers 302 with a pre-signed URL;
    /// 403/404 mean the logs are gone or not yet available and come back as
    /// an empty `LogsDownload` rather than an error.
    pub async fn run_logs(
        &self,
        owner: &str,
        repo: &str,
        run_id: i64,
    ) -> Result<LogsDownload, GitHubError> {
        let url = self.url(&format!(
            "/repos/{}/{}/actions/runs/{}/logs",
            owner, repo, run_id
        ));
        let token = self.credentials.get().ok_or(GitHubError::MissingToken)?;
        let resp = self
            .http
            .get(&url)
            .header("Authorization", format!("token {}", token))
            .header("Accept", ACCEPT)
            .header("User-Agent", USER_AGENT)
            .send()
            .await?;

        let status = resp.status();
        if status.is_redirection() {
            let Some(location) = resp
                .headers()
                .get("location")
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
            else {
                return Ok(LogsDownload::default());
            };
            let follow = self
                .http
                .get(&location)
                .header("User-Agent", USER_AGENT)
                .send()
                .await?;
            let archive = if follow.status().is_success() {
                Some(follow.bytes().await?.to_vec())
            } else {
                None
            };
            return Ok(LogsDownload {
                download_url: Some(location),
                archive,
            });
        }

        match status.as_u16() {
            200 => Ok(LogsDownload {
                download_url: Some(url),
                archive: Some(resp.bytes().await?.to_vec()),
            }),
            403 | 404 => Ok(LogsDownload::default()),
            code => {
                if code == 401 {
                    self.credentials.invalidate();
                }
                Err(GitHubError::Status {
                    status: code,
                    body: resp.text().await.unwrap_or_default(),
                })
            }
        }
    }

    // ── Pull requests and checks ──────────────────────────────────────

    pub async fn list_pulls(
        &self,
        owner: &str,
        repo: &str,
        state: &str,
        head: Option<&str>,
        per_page: u32,
    ) -> Result<Vec<PullRequest>, GitHubError> {
        let mut query = vec![
            ("state", state.to_string()),
            ("per_page", per_page.to_string()),
        ];
        if let Some(head) = head {
            query.push(("head", head.to_string()));
        }
        self.get_json(&format!("/repos/{}/{}/pulls", owner, repo), &query)
            .await
    }

    pub async fn get_pull(
        &self,
        owner: &str,
        repo: &str,
        number: i64,
    ) -> Result<PullRequest, GitHubError> {
        self.get_json(&format!("/repos/{}/{}/pulls/{}", owner, repo, number), &[])
            .await
    }

    pub async fn merge_pull(
        &self,
        owner: &str,
        repo: &str,
        number: i64,
    ) -> Result<(), GitHubError> {
        let req = self
            .request(
                reqwest::Method::PUT,
                &format!("/repos/{}/{}/pulls/{}/merge", owner, repo, number),
            )?
            .json(&serde_json::json!({ "merge_method": "squash" }));
        self.send(req).await.map(|_| ())
    }

    pub async fn close_pull(
        &self,
        owner: &str,
        repo: &str,
        number: i64,
    ) -> Result<(), GitHubError> {
        let req = self
            .request(
                reqwest::Method::PATCH,
                &format!("/repos/{}/{}/pulls/{}", owner, repo, number),
            )?
            .json(&serde_json::json!({ "state": "closed" }));
        self.send(req).await.map(|_| ())
    }

    pub async fn create_pull(
        &self,
        owner: &str,
        repo: &str,
        title: &str,
        head: &str,
        base: &str,
        body: &str,
    ) -> Result<CreatedPull, GitHubError> {
        let req = self
            .request(
                reqwest::Method::POST,
                &format!("/repos/{}/{}/pulls", owner, repo),
            )?
            .json(&serde_json::json!({
                "title": title,
                "head": head,
                "base": base,
                "body": body,
            }));
        self.send(req)
            .await?
            .json()
            .await
            .map_err(GitHubError::Decode)
    }

    pub async fn get_check_runs(
        &self,
        owner: &str,
        repo: &str,
        sha: &str,
    ) -> Result<Vec<CheckRun>, GitHubError> {
        let page: CheckRunsPage = self
            .get_json(
                &format!("/repos/{}/{}/commits/{}/check-runs", owner, repo, sha),
                &[("per_page", "100".to_string())],
            )
            .await?;
        Ok(page.check_runs)
    }

    // ── Actions secrets ───────────────────────────────────────────────

    pub async fn get_actions_public_key(
        &self,
        owner: &str,
        repo: &str,
    ) -> Result<ActionsPublicKey, GitHubError> {
        self.get_json(
            &format!("/repos/{}/{}/actions/secrets/public-key", owner, repo),
            &[],
        )
        .await
    }

    pub async fn put_actions_secret(
        &self,
        owner: &str,
        repo: &str,
        name: &str,
        encrypted_value: &str,
        key_id: &str,
    ) -> Result<(), GitHubError> {
        let req = self
            .request(
                reqwest::Method::PUT,
                &format!("/repos/{}/{}/actions/secrets/{}", owner, repo, name),
            )?
            .json(&serde_json::json!({
                "encrypted_value": encrypted_value,
                "key_id": key_id,
            }));
        self.send(req).await.map(|_| ())
    }

    /// Presence check for a secret; any GitHub-side refusal reads as absent.
    pub async fn actions_secret_exists(
        &self,
        owner: &str,
        repo: &str,
        name: &str,
    ) -> Result<bool, GitHubError> {
        let req = self.request(
            reqwest::Method::GET,
            &format!("/repos/{}/{}/actions/secrets/{}", owner, repo, name),
        )?;
        match self.send(req).await {
            Ok(_) => Ok(true),
            Err(GitHubError::Status { .. }) => Ok(false),
            Err(err) => Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // ── is_valid_github_token ────────────────────────────────────────

    #[test]
    fn test_valid_token_prefixes() {
        for token in [
            "ghp_abc123",
            "github_pat_abc123",
            "gho_abc123",
            "ghu_xyz789",
            "ghs_xyz789",
            "ghr_refresh123",
        ] {
            assert!(is_valid_github_token(token), "should accept {}", token);
        }
    }

    #[test]
    fn test_invalid_tokens_rejected() {
        for token in ["", "not-a-token", "GHP_abc123", " ghp_abc123", "ghx_abc"] {
            assert!(!is_valid_github_token(token), "should reject {:?}", token);
        }
    }

    // ── CredentialCache ──────────────────────────────────────────────

    #[test]
    fn test_credential_cache_store_and_invalidate() {
        let cache = CredentialCache::new("gho_token");
        assert_eq!(cache.get().as_deref(), Some("gho_token"));

        cache.invalidate();
        assert_eq!(cache.get(), None);

        cache.store("gho_other");
        assert_eq!(cache.get().as_deref(), Some("gho_other"));
    }

    #[test]
    fn test_client_without_token_fails_fast() {
        let client =
            GitHubClient::new(GITHUB_API_BASE, Arc::new(CredentialCache::empty())).unwrap();
        let err = client.request(reqwest::Method::GET, "/user").unwrap_err();
        assert!(matches!(err, GitHubError::MissingToken));
    }

    #[test]
    fn test_base_url_trailing_slash_trimmed() {
        let client = GitHubClient::new(
            "http://127.0.0.1:9/",
            Arc::new(CredentialCache::new("gho_t")),
        )
        .unwrap();
        assert_eq!(client.url("/user"), "http://127.0.0.1:9/user");
    }

    // ── Response deserialization ─────────────────────────────────────

    #[test]
    fn test_workflow_runs_page_deserialize() {
        let json = r#"{
            "total_count": 1,
            "workflow_runs": [{
                "id": 42,
                "head_branch": "main",
                "status": "queued",
                "conclusion": null,
                "created_at": "2025-01-01T00:00:00Z",
                "html_url": "https://github.com/o/r/actions/runs/42"
            }]
        }"#;
        let page: WorkflowRunsPage = serde_json::from_str(json).unwrap();
        assert_eq!(page.workflow_runs.len(), 1);
        assert_eq!(page.workflow_runs[0].id, 42);
        assert!(page.workflow_runs[0].conclusion.is_none());
    }

    #[test]
    fn test_jobs_response_defaults_missing_steps() {
        let json = r#"{"jobs": [{"id": 1, "name": "flamecast", "status": "queued", "conclusion": null, "head_branch": "flamecast/u/x"}]}"#;
        let resp: JobsResponse = serde_json::from_str(json).unwrap();
        assert_eq!(resp.jobs[0].name, "flamecast");
        assert!(resp.jobs[0].steps.is_empty());
    }

    #[test]
    fn test_artifacts_page_defaults_missing_list() {
        let page: ArtifactsPage = serde_json::from_str("{}").unwrap();
        assert!(page.artifacts.is_empty());
    }

    #[test]
    fn test_pull_request_list_shape_defaults_merged() {
        let json = r#"{
            "number": 7,
            "title": "Add feature",
            "state": "open",
            "html_url": "https://github.com/o/r/pull/7",
            "head": {"ref": "flamecast/u/feature", "sha": "abc"},
            "created_at": "2025-01-01T00:00:00Z",
            "updated_at": "2025-01-02T00:00:00Z"
        }"#;
        let pr: PullRequest = serde_json::from_str(json).unwrap();
        assert_eq!(pr.number, 7);
        assert!(!pr.merged);
        assert_eq!(pr.head.branch, "flamecast/u/feature");
        assert!(pr.mergeable.is_none());
    }
}
