use std::collections::BTreeMap;
use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{delete, get, patch, post},
    Json, Router,
};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use chrono::Utc;
use serde::Deserialize;
use uuid::Uuid;

use crate::db::{DbHandle, RegisterRun};
use crate::dispatch::{self, DispatchError, DispatchParams};
use crate::errors::{GitHubError, SealError};
use crate::github::{self, CredentialCache, GitHubClient};
use crate::models::{ApiKeyAuth, ChatWithSummary};
use crate::outputs;
use crate::reconcile::{self, ReconcileError};
use crate::retry::RetryPolicy;
use crate::seal;
use crate::workflow::{WORKFLOW_CONTENT, WORKFLOW_FILE, WORKFLOW_PATH, workflow_content_base64};

/// Name of the companion repository holding the workflow, created under the
/// user's account by the setup flow.
const COMPANION_REPO: &str = "flamecast";

const MAX_API_KEYS: i64 = 20;

const SECRET_CLAUDE_TOKEN: &str = "CLAUDE_CODE_OAUTH_TOKEN";
const SECRET_AGENT_PAT: &str = "FLAMECAST_PAT";
const SECRET_API_KEY: &str = "FLAMECAST_API_KEY";

// ── Shared application state ──────────────────────────────────────────

pub struct AppState {
    pub db: DbHandle,
    /// GitHub REST base URL; tests point this at a local stand-in.
    pub github_base: String,
    /// Poll policy for dispatched-run discovery.
    pub run_discovery: RetryPolicy,
}

pub type SharedState = Arc<AppState>;

// ── Error handling ────────────────────────────────────────────────────

pub enum ApiError {
    Unauthorized,
    Forbidden(String),
    NotFound(String),
    BadRequest(String),
    Conflict(String),
    /// Pass-through of a GitHub refusal, keeping its status code.
    Upstream { status: u16, message: String },
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::Unauthorized => (StatusCode::UNAUTHORIZED, "Unauthorized".to_string()),
            ApiError::Forbidden(msg) => (StatusCode::FORBIDDEN, msg),
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, msg),
            ApiError::Upstream { status, message } => (
                StatusCode::from_u16(status).unwrap_or(StatusCode::BAD_GATEWAY),
                message,
            ),
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };
        (status, Json(serde_json::json!({"error": message}))).into_response()
    }
}

impl From<GitHubError> for ApiError {
    fn from(err: GitHubError) -> Self {
        match err {
            GitHubError::Status { status, body } => {
                let message = if body.trim().is_empty() {
                    format!("GitHub API error: {}", status)
                } else {
                    body
                };
                ApiError::Upstream { status, message }
            }
            GitHubError::MissingToken => ApiError::Forbidden("GitHub token not found".into()),
            GitHubError::Decode(_) => ApiError::Upstream {
                status: 502,
                message: "Invalid GitHub response".into(),
            },
            GitHubError::Transport(err) => ApiError::Internal(err.to_string()),
        }
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        ApiError::Internal(err.to_string())
    }
}

impl From<SealError> for ApiError {
    fn from(err: SealError) -> Self {
        ApiError::Internal(err.to_string())
    }
}

// ── Authentication ────────────────────────────────────────────────────

/// Extract the API key from a `Bearer <uuid>` header. The scheme match is
/// case-insensitive; anything that is not a hyphenated UUID is rejected
/// before the database is consulted.
fn parse_bearer_key(header: Option<&str>) -> Option<String> {
    let value = header?.trim();
    let (scheme, rest) = value.split_once(char::is_whitespace)?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }
    let key = rest.trim();
    if key.len() == 36 && Uuid::parse_str(key).is_ok() {
        Some(key.to_string())
    } else {
        None
    }
}

async fn authenticate(state: &SharedState, headers: &HeaderMap) -> Result<ApiKeyAuth, ApiError> {
    let header = headers
        .get("authorization")
        .and_then(|value| value.to_str().ok());
    let key = parse_bearer_key(header).ok_or(ApiError::Unauthorized)?;
    state
        .db
        .call(move |db| db.find_api_key(&key))
        .await?
        .ok_or(ApiError::Unauthorized)
}

/// Build a GitHub client from the user's stored access token; 403 when the
/// user has not connected GitHub.
async fn github_client_for(state: &SharedState, user_id: &str) -> Result<GitHubClient, ApiError> {
    let uid = user_id.to_string();
    let token = state
        .db
        .call(move |db| db.get_github_token(&uid))
        .await?
        .ok_or_else(|| ApiError::Forbidden("GitHub token not found".into()))?;
    Ok(GitHubClient::new(
        &state.github_base,
        Arc::new(CredentialCache::new(token)),
    )?)
}

// ── Request payload types ─────────────────────────────────────────────

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterRunRequest {
    pub workflow_run_id: i64,
    pub repo: Option<String>,
    pub source_repo: Option<String>,
    pub prompt: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListRunsQuery {
    pub repo: Option<String>,
    pub limit: Option<i64>,
    pub include_archived: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GitHubRunQuery {
    pub owner: String,
    pub repo: String,
    pub run_id: i64,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateChatRequest {
    pub title: String,
    pub repo: Option<String>,
    pub source_repo_id: Option<String>,
}

#[derive(Deserialize)]
pub struct UpdateChatRequest {
    pub title: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListChatsQuery {
    pub repo: Option<String>,
    pub limit: Option<i64>,
    pub cursor: Option<String>,
    pub include_archived: Option<String>,
}

#[derive(Deserialize)]
pub struct CreateApiKeyRequest {
    pub name: Option<String>,
    pub description: Option<String>,
}

#[derive(Deserialize)]
pub struct StoreTokenRequest {
    pub token: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DispatchRequest {
    pub prompt: String,
    pub base_branch: Option<String>,
    #[serde(rename = "ref")]
    pub git_ref: Option<String>,
    pub target_repo: Option<String>,
    pub chat_id: Option<String>,
}

#[derive(Deserialize)]
pub struct RepoRunsQuery {
    pub branch: Option<String>,
}

#[derive(Deserialize)]
pub struct AgentPullsQuery {
    pub user: Option<String>,
}

#[derive(Deserialize)]
pub struct SaveSecretsRequest {
    pub repo: String,
    pub secrets: BTreeMap<String, String>,
}

// ── Router ────────────────────────────────────────────────────────────

pub fn api_router() -> Router<SharedState> {
    Router::new()
        .route(
            "/workflow-runs",
            post(register_workflow_run).get(list_workflow_runs),
        )
        .route("/workflow-runs/github-run", get(get_github_run))
        .route("/workflow-runs/github-run/jobs", get(get_github_run_jobs))
        .route("/workflow-runs/github-run/logs", get(get_github_run_logs))
        .route(
            "/workflow-runs/github-run/outputs",
            get(get_github_run_outputs),
        )
        .route(
            "/workflow-runs/github-run/checks",
            get(get_github_run_checks),
        )
        .route("/workflow-runs/{id}", patch(reconcile_workflow_run))
        .route("/workflow-runs/{id}/archive", patch(archive_workflow_run))
        .route(
            "/workflow-runs/{id}/unarchive",
            patch(unarchive_workflow_run),
        )
        .route("/chats", post(create_chat).get(list_chats))
        .route("/chats/{id}", get(get_chat).patch(update_chat))
        .route("/chats/{id}/archive", patch(archive_chat))
        .route("/chats/{id}/unarchive", patch(unarchive_chat))
        .route("/api-keys", get(list_api_keys).post(create_api_key))
        .route("/api-keys/{id}", delete(delete_api_key))
        .route(
            "/github/token",
            post(store_github_token).delete(remove_github_token),
        )
        .route(
            "/github/repos/{owner}/{repo}/workflows/dispatch",
            post(dispatch_workflow),
        )
        .route(
            "/github/repos/{owner}/{repo}/workflows/runs",
            get(list_repo_workflow_runs),
        )
        .route(
            "/github/repos/{owner}/{repo}/workflows/runs/{run_id}",
            get(get_repo_workflow_run),
        )
        .route(
            "/github/repos/{owner}/{repo}/workflows/runs/{run_id}/logs",
            get(get_repo_run_logs_url),
        )
        .route("/github/repos/{owner}/{repo}/pulls", get(list_agent_pulls))
        .route(
            "/github/repos/{owner}/{repo}/pulls/{number}/status",
            get(get_pull_status),
        )
        .route(
            "/github/repos/{owner}/{repo}/pulls/{number}/merge",
            post(merge_pull),
        )
        .route(
            "/github/repos/{owner}/{repo}/pulls/{number}/close",
            post(close_pull),
        )
        .route("/setup/status", get(setup_status))
        .route("/setup/repo", post(setup_repo))
        .route("/setup/secrets", post(setup_secrets))
        .route("/setup/workflow/update", post(setup_workflow_update))
        .route("/setup/workflow/reset", post(setup_workflow_reset))
        .route("/health", get(health_check))
}

// ── Workflow run handlers ─────────────────────────────────────────────

async fn health_check() -> &'static str {
    "ok"
}

/// POST /workflow-runs — self-registration callback from the workflow's
/// first step. Returns the ledger row id the workflow reports back with.
async fn register_workflow_run(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Json(req): Json<RegisterRunRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let auth = authenticate(&state, &headers).await?;

    let prompt = req
        .prompt
        .as_deref()
        .map(str::trim)
        .filter(|prompt| !prompt.is_empty())
        .map(str::to_string);

    let user_id = auth.user_id;
    let id = state
        .db
        .call(move |db| {
            let source_repo_id = match &req.source_repo {
                Some(source_repo) => Some(db.upsert_source_repo(&user_id, source_repo)?),
                None => None,
            };
            db.register_run(&RegisterRun {
                workflow_run_id: req.workflow_run_id,
                user_id,
                repo: req.repo,
                source_repo_id,
                prompt,
            })
        })
        .await?;

    Ok(Json(serde_json::json!({"success": true, "id": id})))
}

/// GET /workflow-runs — newest-first listing for the authenticated user.
async fn list_workflow_runs(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Query(query): Query<ListRunsQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let auth = authenticate(&state, &headers).await?;

    let limit = query.limit.unwrap_or(20).clamp(1, 100);
    let include_archived = query.include_archived.as_deref() == Some("true");
    let runs = state
        .db
        .call(move |db| {
            db.list_workflow_runs(
                &auth.user_id,
                query.repo.as_deref(),
                include_archived,
                limit,
            )
        })
        .await?;

    Ok(Json(serde_json::json!({"runs": runs})))
}

/// PATCH /workflow-runs/{id} — infer the run's status from GitHub Actions
/// and settle the ledger row.
async fn reconcile_workflow_run(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let auth = authenticate(&state, &headers).await?;

    let outcome = reconcile::reconcile_run(&state.db, &state.github_base, &id, &auth.user_id)
        .await
        .map_err(|err| match err {
            ReconcileError::NotFound => ApiError::NotFound("Not found".into()),
            ReconcileError::GitHub(err) => err.into(),
            ReconcileError::Ledger(err) => err.into(),
        })?;

    let body = match outcome.status() {
        None => serde_json::json!({"success": true, "alreadyResolved": true}),
        Some(status) => serde_json::json!({"success": true, "status": status}),
    };
    Ok(Json(body))
}

async fn set_run_archived(
    state: SharedState,
    headers: HeaderMap,
    id: String,
    archived: bool,
) -> Result<Json<serde_json::Value>, ApiError> {
    let auth = authenticate(&state, &headers).await?;
    let updated = state
        .db
        .call(move |db| db.set_run_archived(&id, &auth.user_id, archived))
        .await?;
    if !updated {
        return Err(ApiError::NotFound("Not found".into()));
    }
    Ok(Json(serde_json::json!({"success": true})))
}

async fn archive_workflow_run(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    set_run_archived(state, headers, id, true).await
}

async fn unarchive_workflow_run(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    set_run_archived(state, headers, id, false).await
}

// ── GitHub pass-through handlers ──────────────────────────────────────

/// GET /workflow-runs/github-run — single Actions run, as GitHub reports it.
async fn get_github_run(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Query(query): Query<GitHubRunQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let auth = authenticate(&state, &headers).await?;
    let gh = github_client_for(&state, &auth.user_id).await?;

    let run = gh.get_run(&query.owner, &query.repo, query.run_id).await?;
    Ok(Json(serde_json::json!({
        "id": run.id,
        "html_url": run.html_url,
        "status": run.status,
        "conclusion": run.conclusion,
        "run_started_at": run.run_started_at,
        "updated_at": run.updated_at,
    })))
}

/// GET /workflow-runs/github-run/jobs — job list; 403/404 degrade to empty.
async fn get_github_run_jobs(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Query(query): Query<GitHubRunQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let auth = authenticate(&state, &headers).await?;
    let gh = github_client_for(&state, &auth.user_id).await?;

    let jobs = match gh
        .list_jobs(&query.owner, &query.repo, query.run_id, Some(50))
        .await
    {
        Ok(jobs) => jobs,
        Err(err) if err.is_not_available() => Vec::new(),
        Err(err) => return Err(err.into()),
    };

    let jobs: Vec<serde_json::Value> = jobs
        .into_iter()
        .map(|job| {
            serde_json::json!({
                "id": job.id,
                "name": job.name,
                "status": job.status,
                "conclusion": job.conclusion,
            })
        })
        .collect();
    Ok(Json(serde_json::json!({"jobs": jobs})))
}

/// GET /workflow-runs/github-run/logs — combined raw logs (capped).
async fn get_github_run_logs(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Query(query): Query<GitHubRunQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let auth = authenticate(&state, &headers).await?;
    let gh = github_client_for(&state, &auth.user_id).await?;

    let logs = outputs::fetch_run_logs(&gh, &query.owner, &query.repo, query.run_id).await?;
    Ok(Json(logs))
}

/// GET /workflow-runs/github-run/outputs — parsed outputs artifact.
async fn get_github_run_outputs(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Query(query): Query<GitHubRunQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let auth = authenticate(&state, &headers).await?;
    let gh = github_client_for(&state, &auth.user_id).await?;

    let outputs = outputs::fetch_run_outputs(&gh, &query.owner, &query.repo, query.run_id).await?;
    Ok(Json(outputs))
}

/// GET /workflow-runs/github-run/checks — check runs for the run's head
/// commit. Every failure path degrades to an empty list.
async fn get_github_run_checks(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Query(query): Query<GitHubRunQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let auth = authenticate(&state, &headers).await?;
    let gh = github_client_for(&state, &auth.user_id).await?;

    let empty = serde_json::json!({"checks": []});

    let Ok(run) = gh.get_run(&query.owner, &query.repo, query.run_id).await else {
        return Ok(Json(empty));
    };
    let Some(head_sha) = run.head_sha else {
        return Ok(Json(empty));
    };
    let Ok(checks) = gh.get_check_runs(&query.owner, &query.repo, &head_sha).await else {
        return Ok(Json(empty));
    };

    let checks: Vec<serde_json::Value> = checks
        .into_iter()
        .map(|check| {
            serde_json::json!({
                "id": check.id,
                "name": check.name,
                "status": check.status,
                "conclusion": check.conclusion,
                "html_url": check.html_url,
                "started_at": check.started_at,
                "completed_at": check.completed_at,
            })
        })
        .collect();
    Ok(Json(serde_json::json!({"checks": checks})))
}

// ── Chat handlers ─────────────────────────────────────────────────────

async fn create_chat(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Json(req): Json<CreateChatRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let auth = authenticate(&state, &headers).await?;

    let chat = state
        .db
        .call(move |db| {
            db.create_chat(
                &auth.user_id,
                &req.title,
                req.repo.as_deref(),
                req.source_repo_id.as_deref(),
            )
        })
        .await?;
    Ok(Json(serde_json::json!({"success": true, "id": chat.id})))
}

/// GET /chats — cursor-paginated, newest first, each chat with its rollup.
async fn list_chats(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Query(query): Query<ListChatsQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let auth = authenticate(&state, &headers).await?;

    let limit = query.limit.unwrap_or(10).clamp(1, 100);
    let include_archived = query.include_archived.as_deref() == Some("true");

    let (chats, has_more) = state
        .db
        .call(move |db| {
            // One extra row decides hasMore without a count query.
            let mut page = db.list_chats(
                &auth.user_id,
                query.repo.as_deref(),
                include_archived,
                query.cursor.as_deref(),
                limit + 1,
            )?;
            let has_more = page.len() as i64 > limit;
            page.truncate(limit as usize);

            let mut chats = Vec::with_capacity(page.len());
            for chat in page {
                let (run_count, last_prompt, latest_run_status) = db.chat_summary(&chat.id)?;
                chats.push(ChatWithSummary {
                    chat,
                    last_prompt,
                    run_count,
                    latest_run_status,
                });
            }
            Ok((chats, has_more))
        })
        .await?;

    let next_cursor = if has_more {
        chats.last().map(|entry| entry.chat.updated_at.clone())
    } else {
        None
    };

    Ok(Json(serde_json::json!({
        "chats": chats,
        "hasMore": has_more,
        "nextCursor": next_cursor,
    })))
}

/// GET /chats/{id} — the chat plus its runs in conversation order.
async fn get_chat(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let auth = authenticate(&state, &headers).await?;

    let (chat, runs) = state
        .db
        .call(move |db| {
            let chat = db.get_chat(&id, &auth.user_id)?;
            match chat {
                Some(chat) => {
                    let runs = db.list_chat_runs(&chat.id)?;
                    Ok(Some((chat, runs)))
                }
                None => Ok(None),
            }
        })
        .await?
        .ok_or_else(|| ApiError::NotFound("Not found".into()))?;

    let mut body = serde_json::to_value(&chat).map_err(|e| ApiError::Internal(e.to_string()))?;
    body["runs"] = serde_json::to_value(&runs).map_err(|e| ApiError::Internal(e.to_string()))?;
    Ok(Json(body))
}

async fn update_chat(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Json(req): Json<UpdateChatRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let auth = authenticate(&state, &headers).await?;

    let Some(title) = req.title.filter(|title| !title.is_empty()) else {
        return Err(ApiError::BadRequest("title is required".into()));
    };
    let updated = state
        .db
        .call(move |db| db.update_chat_title(&id, &auth.user_id, &title))
        .await?;
    if !updated {
        return Err(ApiError::NotFound("Not found".into()));
    }
    Ok(Json(serde_json::json!({"success": true})))
}

async fn set_chat_archived(
    state: SharedState,
    headers: HeaderMap,
    id: String,
    archived: bool,
) -> Result<Json<serde_json::Value>, ApiError> {
    let auth = authenticate(&state, &headers).await?;
    let updated = state
        .db
        .call(move |db| db.set_chat_archived(&id, &auth.user_id, archived))
        .await?;
    if !updated {
        return Err(ApiError::NotFound("Not found".into()));
    }
    Ok(Json(serde_json::json!({"success": true})))
}

async fn archive_chat(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    set_chat_archived(state, headers, id, true).await
}

async fn unarchive_chat(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    set_chat_archived(state, headers, id, false).await
}

// ── API key handlers ──────────────────────────────────────────────────

async fn list_api_keys(
    State(state): State<SharedState>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ApiError> {
    let auth = authenticate(&state, &headers).await?;
    let keys = state
        .db
        .call(move |db| db.list_api_keys(&auth.user_id))
        .await?;
    Ok(Json(serde_json::json!({"keys": keys})))
}

async fn create_api_key(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Json(req): Json<CreateApiKeyRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let auth = authenticate(&state, &headers).await?;

    let (id, key) = state
        .db
        .call(move |db| {
            if db.count_api_keys(&auth.user_id)? >= MAX_API_KEYS {
                anyhow::bail!("Maximum number of API keys reached (20)");
            }
            db.create_api_key(&auth.user_id, req.name.as_deref(), req.description.as_deref())
        })
        .await
        .map_err(|err| {
            let msg = err.to_string();
            if msg.contains("Maximum number") {
                ApiError::BadRequest(msg)
            } else {
                ApiError::Internal(msg)
            }
        })?;
    Ok(Json(serde_json::json!({"key": key, "id": id})))
}

async fn delete_api_key(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let auth = authenticate(&state, &headers).await?;
    state
        .db
        .call(move |db| db.delete_api_key(&id, &auth.user_id))
        .await?;
    Ok(Json(serde_json::json!({"success": true})))
}

// ── GitHub token handlers ─────────────────────────────────────────────

async fn store_github_token(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Json(req): Json<StoreTokenRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let auth = authenticate(&state, &headers).await?;

    let token = req.token.trim().to_string();
    if !github::is_valid_github_token(&token) {
        return Err(ApiError::BadRequest("Invalid GitHub token format".into()));
    }
    state
        .db
        .call(move |db| db.set_github_token(&auth.user_id, &token))
        .await?;
    Ok(Json(serde_json::json!({"success": true})))
}

async fn remove_github_token(
    State(state): State<SharedState>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ApiError> {
    let auth = authenticate(&state, &headers).await?;
    state
        .db
        .call(move |db| db.delete_github_token(&auth.user_id))
        .await?;
    Ok(Json(serde_json::json!({"success": true})))
}

// ── Dispatch and repo workflow handlers ───────────────────────────────

/// POST /github/repos/{owner}/{repo}/workflows/dispatch
async fn dispatch_workflow(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Path((owner, repo)): Path<(String, String)>,
    Json(req): Json<DispatchRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let auth = authenticate(&state, &headers).await?;

    // Reject before the orchestrator runs; it assumes a usable prompt.
    let prompt = req.prompt.trim().to_string();
    if prompt.is_empty() {
        return Err(ApiError::BadRequest("prompt is required".into()));
    }

    let gh = github_client_for(&state, &auth.user_id).await?;
    let params = DispatchParams {
        owner,
        repo,
        prompt,
        base_branch: req.base_branch,
        git_ref: req.git_ref,
        target_repo: req.target_repo,
        chat_id: req.chat_id,
    };

    dispatch::dispatch(&state.db, &gh, &auth.user_id, params, state.run_discovery)
        .await
        .map_err(|err| match err {
            DispatchError::GitHub(err) => ApiError::from(err),
            DispatchError::Ledger(err) => ApiError::from(err),
        })?;

    // Run discovery may have come up empty; the workflow is still triggered.
    Ok(Json(serde_json::json!({"success": true})))
}

/// GET /github/repos/{owner}/{repo}/workflows/runs — last few runs.
async fn list_repo_workflow_runs(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Path((owner, repo)): Path<(String, String)>,
    Query(query): Query<RepoRunsQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let auth = authenticate(&state, &headers).await?;
    let gh = github_client_for(&state, &auth.user_id).await?;

    let runs = gh
        .list_workflow_runs(&owner, &repo, WORKFLOW_FILE, query.branch.as_deref(), 5)
        .await?;
    let runs: Vec<serde_json::Value> = runs
        .into_iter()
        .map(|run| {
            serde_json::json!({
                "id": run.id,
                "headBranch": run.head_branch,
                "status": run.status,
                "conclusion": run.conclusion,
                "createdAt": run.created_at,
                "url": run.html_url,
            })
        })
        .collect();
    Ok(Json(serde_json::json!(runs)))
}

/// GET /github/repos/{owner}/{repo}/workflows/runs/{run_id} — jobs + steps.
async fn get_repo_workflow_run(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Path((owner, repo, run_id)): Path<(String, String, i64)>,
) -> Result<impl IntoResponse, ApiError> {
    let auth = authenticate(&state, &headers).await?;
    let gh = github_client_for(&state, &auth.user_id).await?;

    let jobs = gh.list_jobs(&owner, &repo, run_id, None).await?;
    let jobs: Vec<serde_json::Value> = jobs
        .into_iter()
        .map(|job| {
            let steps: Vec<serde_json::Value> = job
                .steps
                .iter()
                .map(|step| {
                    serde_json::json!({
                        "name": step.name,
                        "status": step.status,
                        "conclusion": step.conclusion,
                        "number": step.number,
                    })
                })
                .collect();
            serde_json::json!({
                "id": job.id,
                "status": job.status,
                "conclusion": job.conclusion,
                "steps": steps,
            })
        })
        .collect();
    Ok(Json(serde_json::json!({"jobs": jobs})))
}

/// GET /github/repos/{owner}/{repo}/workflows/runs/{run_id}/logs — the
/// pre-signed download URL only.
async fn get_repo_run_logs_url(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Path((owner, repo, run_id)): Path<(String, String, i64)>,
) -> Result<impl IntoResponse, ApiError> {
    let auth = authenticate(&state, &headers).await?;
    let gh = github_client_for(&state, &auth.user_id).await?;

    let download = gh.run_logs(&owner, &repo, run_id).await?;
    Ok(Json(
        serde_json::json!({"downloadUrl": download.download_url}),
    ))
}

// ── Pull request handlers ─────────────────────────────────────────────

/// GET /github/repos/{owner}/{repo}/pulls — open PRs created by the agent,
/// recognized by their `flamecast/` head-branch prefix.
async fn list_agent_pulls(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Path((owner, repo)): Path<(String, String)>,
    Query(query): Query<AgentPullsQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let auth = authenticate(&state, &headers).await?;
    let gh = github_client_for(&state, &auth.user_id).await?;

    let prefix = match &query.user {
        Some(user) => format!("flamecast/{}/", user),
        None => "flamecast/".to_string(),
    };

    let pulls = gh.list_pulls(&owner, &repo, "open", None, 100).await?;
    let pulls: Vec<serde_json::Value> = pulls
        .into_iter()
        .filter(|pr| pr.head.branch.starts_with(&prefix))
        .map(|pr| {
            serde_json::json!({
                "number": pr.number,
                "title": pr.title,
                "headRefName": pr.head.branch,
                "url": pr.html_url,
                "createdAt": pr.created_at,
                "updatedAt": pr.updated_at,
            })
        })
        .collect();
    Ok(Json(serde_json::json!(pulls)))
}

/// GET /github/repos/{owner}/{repo}/pulls/{number}/status — PR state plus a
/// rollup of its head commit's check runs.
async fn get_pull_status(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Path((owner, repo, number)): Path<(String, String, i64)>,
) -> Result<impl IntoResponse, ApiError> {
    let auth = authenticate(&state, &headers).await?;
    let gh = github_client_for(&state, &auth.user_id).await?;

    let pr = gh.get_pull(&owner, &repo, number).await?;

    let check_runs = match &pr.head.sha {
        Some(sha) => gh
            .get_check_runs(&owner, &repo, sha)
            .await
            .unwrap_or_default(),
        None => Vec::new(),
    };

    let completed = check_runs
        .iter()
        .filter(|check| check.status == "completed")
        .count();
    let successful = check_runs
        .iter()
        .filter(|check| {
            check.status == "completed" && check.conclusion.as_deref() == Some("success")
        })
        .count();
    let failed = check_runs
        .iter()
        .filter(|check| {
            check.status == "completed"
                && matches!(
                    check.conclusion.as_deref(),
                    Some("failure") | Some("cancelled") | Some("timed_out")
                )
        })
        .count();
    let pending = check_runs.len() - completed;

    let state_label = if pr.merged {
        "merged".to_string()
    } else {
        pr.state.unwrap_or_else(|| "open".to_string())
    };
    let check_runs: Vec<serde_json::Value> = check_runs
        .iter()
        .map(|check| {
            serde_json::json!({
                "name": check.name,
                "status": check.status,
                "conclusion": check.conclusion,
            })
        })
        .collect();

    Ok(Json(serde_json::json!({
        "state": state_label,
        "mergeable": pr.mergeable.unwrap_or(false),
        "checks": {
            "total": check_runs.len(),
            "completed": completed,
            "successful": successful,
            "pending": pending,
            "failed": failed,
        },
        "checkRuns": check_runs,
    })))
}

/// POST .../pulls/{number}/merge — squash-merge, then best-effort branch
/// deletion; a failed deletion never fails the merge response.
async fn merge_pull(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Path((owner, repo, number)): Path<(String, String, i64)>,
) -> Result<impl IntoResponse, ApiError> {
    let auth = authenticate(&state, &headers).await?;
    let gh = github_client_for(&state, &auth.user_id).await?;

    let pr = gh.get_pull(&owner, &repo, number).await?;
    gh.merge_pull(&owner, &repo, number).await?;

    if let Err(err) = gh.delete_branch(&owner, &repo, &pr.head.branch).await {
        tracing::debug!(error = %err, branch = %pr.head.branch, "branch deletion after merge failed");
    }

    Ok(Json(serde_json::json!({"success": true, "merged": true})))
}

/// POST .../pulls/{number}/close — close without merging, same branch
/// cleanup rule.
async fn close_pull(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Path((owner, repo, number)): Path<(String, String, i64)>,
) -> Result<impl IntoResponse, ApiError> {
    let auth = authenticate(&state, &headers).await?;
    let gh = github_client_for(&state, &auth.user_id).await?;

    let pr = gh.get_pull(&owner, &repo, number).await?;
    gh.close_pull(&owner, &repo, number).await?;

    if let Err(err) = gh.delete_branch(&owner, &repo, &pr.head.branch).await {
        tracing::debug!(error = %err, branch = %pr.head.branch, "branch deletion after close failed");
    }

    Ok(Json(serde_json::json!({"success": true, "closed": true})))
}

// ── Setup handlers ────────────────────────────────────────────────────

/// GET /setup/status — companion repo and secret provisioning state.
async fn setup_status(
    State(state): State<SharedState>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ApiError> {
    let auth = authenticate(&state, &headers).await?;
    let gh = github_client_for(&state, &auth.user_id).await?;

    let username = gh
        .get_authenticated_user()
        .await
        .map_err(|_| ApiError::Internal("Failed to get GitHub user".into()))?
        .login;

    let repo_exists = gh.get_repo(&username, COMPANION_REPO).await.is_ok();

    let (mut has_claude_token, mut has_agent_pat, mut has_api_key) = (false, false, false);
    if repo_exists {
        has_claude_token = gh
            .actions_secret_exists(&username, COMPANION_REPO, SECRET_CLAUDE_TOKEN)
            .await
            .unwrap_or(false);
        has_agent_pat = gh
            .actions_secret_exists(&username, COMPANION_REPO, SECRET_AGENT_PAT)
            .await
            .unwrap_or(false);
        has_api_key = gh
            .actions_secret_exists(&username, COMPANION_REPO, SECRET_API_KEY)
            .await
            .unwrap_or(false);
    }

    Ok(Json(serde_json::json!({
        "username": username,
        "repoExists": repo_exists,
        "hasClaudeToken": has_claude_token,
        "hasFlamecastPat": has_agent_pat,
        "hasFlamecastApiKey": has_api_key,
    })))
}

/// POST /setup/repo — create the companion repo and commit the workflow.
async fn setup_repo(
    State(state): State<SharedState>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ApiError> {
    let auth = authenticate(&state, &headers).await?;
    let gh = github_client_for(&state, &auth.user_id).await?;

    let username = gh
        .get_authenticated_user()
        .await
        .map_err(|_| ApiError::Internal("Failed to get GitHub user".into()))?
        .login;

    if gh.get_repo(&username, COMPANION_REPO).await.is_ok() {
        return Err(ApiError::Conflict("Repository already exists".into()));
    }

    gh.create_user_repo(COMPANION_REPO, "Flamecast workflow repository")
        .await?;
    gh.put_contents(
        &username,
        COMPANION_REPO,
        WORKFLOW_PATH,
        "Add flamecast workflow",
        &workflow_content_base64(),
        None,
        None,
    )
    .await?;

    Ok(Json(serde_json::json!({
        "created": true,
        "repo": format!("{}/{}", username, COMPANION_REPO),
    })))
}

/// POST /setup/secrets — seal and store Actions secrets on a repo.
async fn setup_secrets(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Json(req): Json<SaveSecretsRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let auth = authenticate(&state, &headers).await?;

    let Some((owner, name)) = req.repo.split_once('/') else {
        return Err(ApiError::BadRequest("Invalid repo format".into()));
    };
    if owner.is_empty() || name.is_empty() {
        return Err(ApiError::BadRequest("Invalid repo format".into()));
    }

    let gh = github_client_for(&state, &auth.user_id).await?;

    let public_key = gh
        .get_actions_public_key(owner, name)
        .await
        .map_err(|_| ApiError::Internal("Failed to get repo public key".into()))?;

    for (secret_name, secret_value) in &req.secrets {
        if secret_value.is_empty() {
            continue;
        }
        let sealed = seal::seal(secret_value.as_bytes(), &public_key.key)?;
        gh.put_actions_secret(owner, name, secret_name, &sealed, &public_key.key_id)
            .await?;
    }

    Ok(Json(serde_json::json!({"success": true})))
}

/// Open a PR replacing the workflow file with the embedded definition.
/// Shared by the update and reset flows.
async fn open_workflow_pr(
    gh: &GitHubClient,
    username: &str,
    kind: &str,
    title: &str,
    body: &str,
) -> Result<Json<serde_json::Value>, ApiError> {
    let repo = gh
        .get_repo(username, COMPANION_REPO)
        .await
        .map_err(|_| ApiError::NotFound("Repository not found. Create it first.".into()))?;
    let default_branch = repo.default_branch;

    let mut workflow_sha = None;
    match gh
        .get_contents(username, COMPANION_REPO, WORKFLOW_PATH, Some(&default_branch))
        .await
    {
        Ok(Some(existing)) => {
            if existing.content_type != "file" {
                return Err(ApiError::Conflict(
                    "Workflow path exists but is not a file.".into(),
                ));
            }
            // The contents API wraps base64 across lines.
            let packed: String = existing
                .content
                .chars()
                .filter(|c| !c.is_whitespace())
                .collect();
            if let Ok(decoded) = BASE64.decode(packed) {
                if decoded == WORKFLOW_CONTENT.as_bytes() {
                    return Err(ApiError::Conflict("Workflow is already up to date.".into()));
                }
            }
            workflow_sha = Some(existing.sha);
        }
        Ok(None) => {}
        Err(_) => {
            return Err(ApiError::Internal("Failed to check workflow file".into()));
        }
    }

    let base_ref = gh
        .get_branch_ref(username, COMPANION_REPO, &default_branch)
        .await
        .map_err(|_| ApiError::Internal("Failed to get base ref".into()))?;

    let branch_name = format!(
        "flamecast/{}/workflow-{}-{}",
        username,
        kind,
        Utc::now().timestamp_millis()
    );
    gh.create_branch(username, COMPANION_REPO, &branch_name, &base_ref.object.sha)
        .await?;
    gh.put_contents(
        username,
        COMPANION_REPO,
        WORKFLOW_PATH,
        title,
        &workflow_content_base64(),
        Some(&branch_name),
        workflow_sha.as_deref(),
    )
    .await?;

    let pull = gh
        .create_pull(
            username,
            COMPANION_REPO,
            title,
            &branch_name,
            &default_branch,
            body,
        )
        .await?;

    Ok(Json(serde_json::json!({
        "success": true,
        "branchName": branch_name,
        "prNumber": pull.number,
        "prUrl": pull.html_url,
    })))
}

/// POST /setup/workflow/update — provision the API key secret, then PR the
/// workflow update.
async fn setup_workflow_update(
    State(state): State<SharedState>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ApiError> {
    let auth = authenticate(&state, &headers).await?;
    let gh = github_client_for(&state, &auth.user_id).await?;

    let username = gh
        .get_authenticated_user()
        .await
        .map_err(|_| ApiError::Internal("Failed to get GitHub user".into()))?
        .login;

    let user_id = auth.user_id.clone();
    let (_, api_key) = state
        .db
        .call(move |db| db.get_or_create_workflow_api_key(&user_id))
        .await?;

    let public_key = gh
        .get_actions_public_key(&username, COMPANION_REPO)
        .await
        .map_err(|_| ApiError::Internal("Failed to get repo public key".into()))?;
    let sealed = seal::seal(api_key.as_bytes(), &public_key.key)?;
    gh.put_actions_secret(
        &username,
        COMPANION_REPO,
        SECRET_API_KEY,
        &sealed,
        &public_key.key_id,
    )
    .await?;

    open_workflow_pr(
        &gh,
        &username,
        "update",
        "chore: update flamecast workflow with status tracking",
        "Updates `.github/workflows/flamecast.yml` to include workflow status tracking.\n\n\
         Also sets `FLAMECAST_API_KEY` as a repository secret.",
    )
    .await
}

/// POST /setup/workflow/reset — PR the pristine workflow file back in.
async fn setup_workflow_reset(
    State(state): State<SharedState>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ApiError> {
    let auth = authenticate(&state, &headers).await?;
    let gh = github_client_for(&state, &auth.user_id).await?;

    let username = gh
        .get_authenticated_user()
        .await
        .map_err(|_| ApiError::Internal("Failed to get GitHub user".into()))?
        .login;

    open_workflow_pr(
        &gh,
        &username,
        "reset",
        "chore: reset flamecast workflow",
        "Reset `.github/workflows/flamecast.yml` to the latest Flamecast workflow.",
    )
    .await
}

#[cfg(test)]
mod tests {
    use super::*;

    // ── parse_bearer_key ─────────────────────────────────────────────

    const KEY: &str = "0b7b9249-05cc-46f4-8434-a54b59a08a9e";

    #[test]
    fn test_parse_bearer_accepts_uuid_key() {
        let header = format!("Bearer {}", KEY);
        assert_eq!(parse_bearer_key(Some(&header)).as_deref(), Some(KEY));
    }

    #[test]
    fn test_parse_bearer_scheme_case_insensitive() {
        for scheme in ["bearer", "BEARER", "BeArEr"] {
            let header = format!("{} {}", scheme, KEY);
            assert_eq!(parse_bearer_key(Some(&header)).as_deref(), Some(KEY));
        }
    }

    #[test]
    fn test_parse_bearer_rejects_non_uuid() {
        assert!(parse_bearer_key(Some("Bearer not-a-uuid")).is_none());
        assert!(parse_bearer_key(Some("Bearer ghp_sometoken")).is_none());
        // Simple (unhyphenated) UUID form is rejected: keys are stored
        // hyphenated and matched verbatim.
        assert!(parse_bearer_key(Some("Bearer 0b7b924905cc46f48434a54b59a08a9e")).is_none());
    }

    #[test]
    fn test_parse_bearer_rejects_other_schemes_and_garbage() {
        assert!(parse_bearer_key(None).is_none());
        assert!(parse_bearer_key(Some("")).is_none());
        assert!(parse_bearer_key(Some(KEY)).is_none());
        let header = format!("Basic {}", KEY);
        assert!(parse_bearer_key(Some(&header)).is_none());
    }

    #[test]
    fn test_parse_bearer_tolerates_extra_whitespace() {
        let header = format!("  Bearer   {}  ", KEY);
        assert_eq!(parse_bearer_key(Some(&header)).as_deref(), Some(KEY));
    }
}
