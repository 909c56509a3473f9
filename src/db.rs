use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use uuid::Uuid;

use crate::models::*;

/// Current time in the fixed-width RFC 3339 form the ledger stores.
/// A single format keeps string comparison usable for cursors.
pub fn now_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Async-safe handle to the ledger database.
///
/// Wraps `LedgerDb` behind `Arc<Mutex>` and runs all access on tokio's
/// blocking thread pool via `spawn_blocking`, preventing synchronous SQLite
/// I/O from tying up async worker threads.
#[derive(Clone)]
pub struct DbHandle {
    inner: Arc<std::sync::Mutex<LedgerDb>>,
}

impl DbHandle {
    pub fn new(db: LedgerDb) -> Self {
        Self {
            inner: Arc::new(std::sync::Mutex::new(db)),
        }
    }

    /// Run a closure with access to the database on a blocking thread.
    /// All data passed into `f` must be owned (`'static`).
    pub async fn call<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&LedgerDb) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let db = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            let guard = db
                .lock()
                .map_err(|e| anyhow::anyhow!("DB lock poisoned: {}", e))?;
            f(&guard)
        })
        .await
        .context("DB task panicked")?
    }
}

pub struct LedgerDb {
    conn: Connection,
}

/// Arguments for the workflow self-registration upsert.
#[derive(Debug, Clone, Default)]
pub struct RegisterRun {
    pub workflow_run_id: i64,
    pub user_id: String,
    pub repo: Option<String>,
    pub source_repo_id: Option<String>,
    pub prompt: Option<String>,
}

/// Arguments for the dispatch-side upsert, stamped with the dispatch time.
#[derive(Debug, Clone)]
pub struct DispatchedRun {
    pub workflow_run_id: i64,
    pub user_id: String,
    pub repo: String,
    pub source_repo_id: String,
    pub prompt: String,
    pub chat_id: String,
    pub dispatched_at: String,
}

impl LedgerDb {
    /// Open (or create) the ledger at the given path and run migrations.
    pub fn new(path: &Path) -> Result<Self> {
        let conn = Connection::open(path).context("Failed to open SQLite database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    /// In-memory ledger (for testing).
    pub fn new_in_memory() -> Result<Self> {
        let conn =
            Connection::open_in_memory().context("Failed to open in-memory SQLite database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    fn init(&self) -> Result<()> {
        self.conn
            .execute_batch("PRAGMA foreign_keys = ON;")
            .context("Failed to enable foreign keys")?;
        self.run_migrations().context("Failed to run migrations")?;
        Ok(())
    }

    fn run_migrations(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "
                CREATE TABLE IF NOT EXISTS user_source_repos (
                    id TEXT PRIMARY KEY,
                    user_id TEXT NOT NULL,
                    source_repo TEXT NOT NULL,
                    created_at TEXT NOT NULL,
                    UNIQUE(user_id, source_repo)
                );

                CREATE TABLE IF NOT EXISTS chats (
                    id TEXT PRIMARY KEY,
                    user_id TEXT NOT NULL,
                    title TEXT NOT NULL,
                    repo TEXT,
                    source_repo_id TEXT REFERENCES user_source_repos(id),
                    archived_at TEXT,
                    created_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS workflow_runs (
                    id TEXT PRIMARY KEY,
                    workflow_run_id INTEGER NOT NULL,
                    user_id TEXT NOT NULL,
                    pr_url TEXT,
                    repo TEXT,
                    source_repo_id TEXT REFERENCES user_source_repos(id),
                    prompt TEXT,
                    error_message TEXT,
                    chat_id TEXT REFERENCES chats(id),
                    started_at TEXT,
                    completed_at TEXT,
                    error_at TEXT,
                    archived_at TEXT,
                    created_at TEXT NOT NULL,
                    UNIQUE(workflow_run_id, user_id)
                );

                CREATE TABLE IF NOT EXISTS api_keys (
                    id TEXT PRIMARY KEY,
                    key TEXT NOT NULL UNIQUE,
                    user_id TEXT NOT NULL,
                    name TEXT,
                    description TEXT,
                    created_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS github_tokens (
                    user_id TEXT PRIMARY KEY,
                    access_token TEXT NOT NULL,
                    created_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL
                );

                CREATE INDEX IF NOT EXISTS idx_workflow_runs_user ON workflow_runs(user_id);
                CREATE INDEX IF NOT EXISTS idx_workflow_runs_repo ON workflow_runs(repo);
                CREATE INDEX IF NOT EXISTS idx_workflow_runs_chat ON workflow_runs(chat_id);
                CREATE INDEX IF NOT EXISTS idx_chats_user ON chats(user_id);
                CREATE INDEX IF NOT EXISTS idx_chats_repo ON chats(repo);
                CREATE INDEX IF NOT EXISTS idx_api_keys_user ON api_keys(user_id);
                ",
            )
            .context("Failed to create tables")?;
        Ok(())
    }

    // ── Source repos ──────────────────────────────────────────────────

    /// Insert-or-refresh the `(user, source repo)` pair and return its id.
    pub fn upsert_source_repo(&self, user_id: &str, source_repo: &str) -> Result<String> {
        let now = now_iso();
        self.conn
            .execute(
                "INSERT INTO user_source_repos (id, user_id, source_repo, created_at)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(user_id, source_repo) DO UPDATE SET created_at = excluded.created_at",
                params![Uuid::new_v4().to_string(), user_id, source_repo, now],
            )
            .context("Failed to upsert source repo")?;
        self.conn
            .query_row(
                "SELECT id FROM user_source_repos WHERE user_id = ?1 AND source_repo = ?2",
                params![user_id, source_repo],
                |row| row.get(0),
            )
            .context("Source repo not found after upsert")
    }

    // ── Chats ─────────────────────────────────────────────────────────

    pub fn create_chat(
        &self,
        user_id: &str,
        title: &str,
        repo: Option<&str>,
        source_repo_id: Option<&str>,
    ) -> Result<Chat> {
        let id = Uuid::new_v4().to_string();
        let now = now_iso();
        self.conn
            .execute(
                "INSERT INTO chats (id, user_id, title, repo, source_repo_id, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)",
                params![id, user_id, title, repo, source_repo_id, now],
            )
            .context("Failed to insert chat")?;
        self.get_chat(&id, user_id)?
            .context("Chat not found after insert")
    }

    /// Reuse a caller-supplied chat when it exists and belongs to the user;
    /// otherwise create a one-off chat titled from the prompt.
    pub fn get_or_create_chat(
        &self,
        chat_id: Option<&str>,
        user_id: &str,
        title: &str,
        repo: Option<&str>,
        source_repo_id: Option<&str>,
    ) -> Result<String> {
        if let Some(chat_id) = chat_id {
            if let Some(existing) = self.get_chat(chat_id, user_id)? {
                return Ok(existing.id);
            }
        }
        let mut truncated: String = title.chars().take(80).collect();
        if truncated.is_empty() {
            truncated = "Untitled".to_string();
        }
        Ok(self
            .create_chat(user_id, &truncated, repo, source_repo_id)?
            .id)
    }

    pub fn get_chat(&self, id: &str, user_id: &str) -> Result<Option<Chat>> {
        self.conn
            .query_row(
                "SELECT id, user_id, title, repo, source_repo_id, archived_at, created_at, updated_at
                 FROM chats WHERE id = ?1 AND user_id = ?2",
                params![id, user_id],
                |row| {
                    Ok(Chat {
                        id: row.get(0)?,
                        user_id: row.get(1)?,
                        title: row.get(2)?,
                        repo: row.get(3)?,
                        source_repo_id: row.get(4)?,
                        archived_at: row.get(5)?,
                        created_at: row.get(6)?,
                        updated_at: row.get(7)?,
                    })
                },
            )
            .optional()
            .context("Failed to query chat")
    }

    /// Newest-first page of chats. `cursor` is an exclusive upper bound on
    /// `updated_at`; callers pass `limit + 1` to detect a further page.
    pub fn list_chats(
        &self,
        user_id: &str,
        repo: Option<&str>,
        include_archived: bool,
        cursor: Option<&str>,
        limit: i64,
    ) -> Result<Vec<Chat>> {
        let mut sql = String::from(
            "SELECT id, user_id, title, repo, source_repo_id, archived_at, created_at, updated_at
             FROM chats WHERE user_id = ?1",
        );
        let mut args: Vec<Box<dyn rusqlite::ToSql>> = vec![Box::new(user_id.to_string())];
        if let Some(repo) = repo {
            args.push(Box::new(repo.to_string()));
            sql.push_str(&format!(" AND repo = ?{}", args.len()));
        }
        if !include_archived {
            sql.push_str(" AND archived_at IS NULL");
        }
        if let Some(cursor) = cursor {
            args.push(Box::new(cursor.to_string()));
            sql.push_str(&format!(" AND updated_at < ?{}", args.len()));
        }
        args.push(Box::new(limit));
        sql.push_str(&format!(" ORDER BY updated_at DESC LIMIT ?{}", args.len()));

        let mut stmt = self.conn.prepare(&sql).context("Failed to prepare list_chats")?;
        let rows = stmt
            .query_map(rusqlite::params_from_iter(args), |row| {
                Ok(Chat {
                    id: row.get(0)?,
                    user_id: row.get(1)?,
                    title: row.get(2)?,
                    repo: row.get(3)?,
                    source_repo_id: row.get(4)?,
                    archived_at: row.get(5)?,
                    created_at: row.get(6)?,
                    updated_at: row.get(7)?,
                })
            })
            .context("Failed to query chats")?;
        let mut chats = Vec::new();
        for row in rows {
            chats.push(row.context("Failed to read chat row")?);
        }
        Ok(chats)
    }

    /// Rollup for a chat's list entry: run count, latest prompt, and the
    /// latest run's status classification.
    pub fn chat_summary(
        &self,
        chat_id: &str,
    ) -> Result<(i64, Option<String>, Option<ChatRunStatus>)> {
        let run_count: i64 = self
            .conn
            .query_row(
                "SELECT COUNT(*) FROM workflow_runs WHERE chat_id = ?1",
                params![chat_id],
                |row| row.get(0),
            )
            .context("Failed to count chat runs")?;

        let latest = self
            .conn
            .query_row(
                "SELECT prompt, started_at, completed_at, error_at FROM workflow_runs
                 WHERE chat_id = ?1 ORDER BY created_at DESC LIMIT 1",
                params![chat_id],
                |row| {
                    Ok((
                        row.get::<_, Option<String>>(0)?,
                        row.get::<_, Option<String>>(1)?,
                        row.get::<_, Option<String>>(2)?,
                        row.get::<_, Option<String>>(3)?,
                    ))
                },
            )
            .optional()
            .context("Failed to query latest chat run")?;

        match latest {
            Some((prompt, started, completed, errored)) => {
                let status = ChatRunStatus::classify(
                    started.as_deref(),
                    completed.as_deref(),
                    errored.as_deref(),
                );
                Ok((run_count, prompt, Some(status)))
            }
            None => Ok((run_count, None, None)),
        }
    }

    pub fn update_chat_title(&self, id: &str, user_id: &str, title: &str) -> Result<bool> {
        let rows = self
            .conn
            .execute(
                "UPDATE chats SET title = ?3, updated_at = ?4 WHERE id = ?1 AND user_id = ?2",
                params![id, user_id, title, now_iso()],
            )
            .context("Failed to update chat title")?;
        Ok(rows > 0)
    }

    pub fn set_chat_archived(&self, id: &str, user_id: &str, archived: bool) -> Result<bool> {
        let archived_at = archived.then(now_iso);
        let rows = self
            .conn
            .execute(
                "UPDATE chats SET archived_at = ?3 WHERE id = ?1 AND user_id = ?2",
                params![id, user_id, archived_at],
            )
            .context("Failed to update chat archive state")?;
        Ok(rows > 0)
    }

    // ── Workflow runs ─────────────────────────────────────────────────

    /// Upsert from the workflow's self-registration callback. Only the
    /// fields actually supplied overwrite what an earlier dispatch wrote.
    pub fn register_run(&self, run: &RegisterRun) -> Result<String> {
        let now = now_iso();
        self.conn
            .execute(
                "INSERT INTO workflow_runs
                     (id, workflow_run_id, user_id, repo, source_repo_id, prompt, started_at, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7)
                 ON CONFLICT(workflow_run_id, user_id) DO UPDATE SET
                     started_at = excluded.started_at,
                     repo = COALESCE(excluded.repo, workflow_runs.repo),
                     source_repo_id = COALESCE(excluded.source_repo_id, workflow_runs.source_repo_id),
                     prompt = COALESCE(excluded.prompt, workflow_runs.prompt)",
                params![
                    Uuid::new_v4().to_string(),
                    run.workflow_run_id,
                    run.user_id,
                    run.repo,
                    run.source_repo_id,
                    run.prompt,
                    now,
                ],
            )
            .context("Failed to register workflow run")?;
        self.run_row_id(run.workflow_run_id, &run.user_id)
    }

    /// Upsert from the dispatch orchestrator after run discovery.
    pub fn record_dispatched_run(&self, run: &DispatchedRun) -> Result<String> {
        self.conn
            .execute(
                "INSERT INTO workflow_runs
                     (id, workflow_run_id, user_id, repo, source_repo_id, prompt, chat_id, started_at, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?8)
                 ON CONFLICT(workflow_run_id, user_id) DO UPDATE SET
                     repo = excluded.repo,
                     source_repo_id = excluded.source_repo_id,
                     prompt = excluded.prompt,
                     chat_id = excluded.chat_id,
                     started_at = excluded.started_at,
                     created_at = excluded.created_at",
                params![
                    Uuid::new_v4().to_string(),
                    run.workflow_run_id,
                    run.user_id,
                    run.repo,
                    run.source_repo_id,
                    run.prompt,
                    run.chat_id,
                    run.dispatched_at,
                ],
            )
            .context("Failed to record dispatched run")?;
        self.run_row_id(run.workflow_run_id, &run.user_id)
    }

    fn run_row_id(&self, workflow_run_id: i64, user_id: &str) -> Result<String> {
        self.conn
            .query_row(
                "SELECT id FROM workflow_runs WHERE workflow_run_id = ?1 AND user_id = ?2",
                params![workflow_run_id, user_id],
                |row| row.get(0),
            )
            .context("Workflow run not found after upsert")
    }

    pub fn get_run_for_reconcile(
        &self,
        id: &str,
        user_id: &str,
    ) -> Result<Option<RunForReconcile>> {
        self.conn
            .query_row(
                "SELECT w.id, w.workflow_run_id, w.user_id, w.repo, s.source_repo,
                        w.completed_at, w.error_at
                 FROM workflow_runs w
                 LEFT JOIN user_source_repos s ON w.source_repo_id = s.id
                 WHERE w.id = ?1 AND w.user_id = ?2",
                params![id, user_id],
                |row| {
                    Ok(RunForReconcile {
                        id: row.get(0)?,
                        workflow_run_id: row.get(1)?,
                        user_id: row.get(2)?,
                        repo: row.get(3)?,
                        source_repo: row.get(4)?,
                        completed_at: row.get(5)?,
                        error_at: row.get(6)?,
                    })
                },
            )
            .optional()
            .context("Failed to query run for reconcile")
    }

    fn run_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<WorkflowRun> {
        Ok(WorkflowRun {
            id: row.get(0)?,
            workflow_run_id: row.get(1)?,
            user_id: row.get(2)?,
            repo: row.get(3)?,
            source_repo: row.get(4)?,
            prompt: row.get(5)?,
            pr_url: row.get(6)?,
            error_message: row.get(7)?,
            chat_id: row.get(8)?,
            started_at: row.get(9)?,
            completed_at: row.get(10)?,
            error_at: row.get(11)?,
            archived_at: row.get(12)?,
            created_at: row.get(13)?,
        })
    }

    const RUN_COLUMNS: &'static str =
        "w.id, w.workflow_run_id, w.user_id, w.repo, s.source_repo, w.prompt, w.pr_url,
         w.error_message, w.chat_id, w.started_at, w.completed_at, w.error_at, w.archived_at,
         w.created_at";

    pub fn list_workflow_runs(
        &self,
        user_id: &str,
        repo: Option<&str>,
        include_archived: bool,
        limit: i64,
    ) -> Result<Vec<WorkflowRun>> {
        let mut sql = format!(
            "SELECT {} FROM workflow_runs w
             LEFT JOIN user_source_repos s ON w.source_repo_id = s.id
             WHERE w.user_id = ?1",
            Self::RUN_COLUMNS
        );
        let mut args: Vec<Box<dyn rusqlite::ToSql>> = vec![Box::new(user_id.to_string())];
        if let Some(repo) = repo {
            args.push(Box::new(repo.to_string()));
            sql.push_str(&format!(" AND w.repo = ?{}", args.len()));
        }
        if !include_archived {
            sql.push_str(" AND w.archived_at IS NULL");
        }
        args.push(Box::new(limit));
        sql.push_str(&format!(" ORDER BY w.created_at DESC LIMIT ?{}", args.len()));

        let mut stmt = self
            .conn
            .prepare(&sql)
            .context("Failed to prepare list_workflow_runs")?;
        let rows = stmt
            .query_map(rusqlite::params_from_iter(args), Self::run_from_row)
            .context("Failed to query workflow runs")?;
        let mut runs = Vec::new();
        for row in rows {
            runs.push(row.context("Failed to read workflow run row")?);
        }
        Ok(runs)
    }

    /// Runs belonging to a chat, oldest first (conversation order).
    pub fn list_chat_runs(&self, chat_id: &str) -> Result<Vec<WorkflowRun>> {
        let sql = format!(
            "SELECT {} FROM workflow_runs w
             LEFT JOIN user_source_repos s ON w.source_repo_id = s.id
             WHERE w.chat_id = ?1 ORDER BY w.created_at ASC",
            Self::RUN_COLUMNS
        );
        let mut stmt = self
            .conn
            .prepare(&sql)
            .context("Failed to prepare list_chat_runs")?;
        let rows = stmt
            .query_map(params![chat_id], Self::run_from_row)
            .context("Failed to query chat runs")?;
        let mut runs = Vec::new();
        for row in rows {
            runs.push(row.context("Failed to read chat run row")?);
        }
        Ok(runs)
    }

    pub fn set_run_archived(&self, id: &str, user_id: &str, archived: bool) -> Result<bool> {
        let archived_at = archived.then(now_iso);
        let rows = self
            .conn
            .execute(
                "UPDATE workflow_runs SET archived_at = ?3 WHERE id = ?1 AND user_id = ?2",
                params![id, user_id, archived_at],
            )
            .context("Failed to update run archive state")?;
        Ok(rows > 0)
    }

    /// Transition a run to completed. Conditional on the row still being
    /// non-terminal; returns false when another caller resolved it first,
    /// so terminal-state exclusivity holds under concurrent reconciles.
    pub fn resolve_run_completed(&self, id: &str, pr_url: Option<&str>) -> Result<bool> {
        let rows = self
            .conn
            .execute(
                "UPDATE workflow_runs
                 SET completed_at = ?2, pr_url = COALESCE(?3, pr_url)
                 WHERE id = ?1 AND completed_at IS NULL AND error_at IS NULL",
                params![id, now_iso(), pr_url],
            )
            .context("Failed to mark run completed")?;
        Ok(rows > 0)
    }

    /// Transition a run to the error state, same conditional rule.
    pub fn resolve_run_error(&self, id: &str, message: &str) -> Result<bool> {
        let rows = self
            .conn
            .execute(
                "UPDATE workflow_runs
                 SET error_at = ?2, error_message = ?3
                 WHERE id = ?1 AND completed_at IS NULL AND error_at IS NULL",
                params![id, now_iso(), message],
            )
            .context("Failed to mark run errored")?;
        Ok(rows > 0)
    }

    // ── API keys ──────────────────────────────────────────────────────

    pub fn find_api_key(&self, key: &str) -> Result<Option<ApiKeyAuth>> {
        self.conn
            .query_row(
                "SELECT id, user_id FROM api_keys WHERE key = ?1",
                params![key],
                |row| {
                    Ok(ApiKeyAuth {
                        key_id: row.get(0)?,
                        user_id: row.get(1)?,
                    })
                },
            )
            .optional()
            .context("Failed to query api key")
    }

    pub fn count_api_keys(&self, user_id: &str) -> Result<i64> {
        self.conn
            .query_row(
                "SELECT COUNT(*) FROM api_keys WHERE user_id = ?1",
                params![user_id],
                |row| row.get(0),
            )
            .context("Failed to count api keys")
    }

    /// Create a key and return `(id, key value)`. The key value is a UUID
    /// and is the bearer credential itself.
    pub fn create_api_key(
        &self,
        user_id: &str,
        name: Option<&str>,
        description: Option<&str>,
    ) -> Result<(String, String)> {
        let id = Uuid::new_v4().to_string();
        let key = Uuid::new_v4().to_string();
        self.conn
            .execute(
                "INSERT INTO api_keys (id, key, user_id, name, description, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![id, key, user_id, name, description, now_iso()],
            )
            .context("Failed to insert api key")?;
        Ok((id, key))
    }

    pub fn list_api_keys(&self, user_id: &str) -> Result<Vec<ApiKeyInfo>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, name, description, created_at FROM api_keys
                 WHERE user_id = ?1 ORDER BY created_at ASC",
            )
            .context("Failed to prepare list_api_keys")?;
        let rows = stmt
            .query_map(params![user_id], |row| {
                Ok(ApiKeyInfo {
                    id: row.get(0)?,
                    name: row.get(1)?,
                    description: row.get(2)?,
                    created_at: row.get(3)?,
                })
            })
            .context("Failed to query api keys")?;
        let mut keys = Vec::new();
        for row in rows {
            keys.push(row.context("Failed to read api key row")?);
        }
        Ok(keys)
    }

    pub fn delete_api_key(&self, id: &str, user_id: &str) -> Result<bool> {
        let rows = self
            .conn
            .execute(
                "DELETE FROM api_keys WHERE id = ?1 AND user_id = ?2",
                params![id, user_id],
            )
            .context("Failed to delete api key")?;
        Ok(rows > 0)
    }

    /// The key the setup flow installs into the workflow repo as a secret.
    /// Reuses the user's first key when one exists.
    pub fn get_or_create_workflow_api_key(&self, user_id: &str) -> Result<(String, String)> {
        let existing = self
            .conn
            .query_row(
                "SELECT id, key FROM api_keys WHERE user_id = ?1 ORDER BY created_at ASC LIMIT 1",
                params![user_id],
                |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)),
            )
            .optional()
            .context("Failed to query workflow api key")?;
        match existing {
            Some(pair) => Ok(pair),
            None => self.create_api_key(
                user_id,
                Some("Workflow API Key"),
                Some("Auto-created for workflow status tracking"),
            ),
        }
    }

    // ── GitHub tokens ─────────────────────────────────────────────────

    pub fn set_github_token(&self, user_id: &str, access_token: &str) -> Result<()> {
        let now = now_iso();
        self.conn
            .execute(
                "INSERT INTO github_tokens (user_id, access_token, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?3)
                 ON CONFLICT(user_id) DO UPDATE SET
                     access_token = excluded.access_token,
                     updated_at = excluded.updated_at",
                params![user_id, access_token, now],
            )
            .context("Failed to store github token")?;
        Ok(())
    }

    pub fn get_github_token(&self, user_id: &str) -> Result<Option<String>> {
        self.conn
            .query_row(
                "SELECT access_token FROM github_tokens WHERE user_id = ?1",
                params![user_id],
                |row| row.get(0),
            )
            .optional()
            .context("Failed to query github token")
    }

    pub fn delete_github_token(&self, user_id: &str) -> Result<bool> {
        let rows = self
            .conn
            .execute(
                "DELETE FROM github_tokens WHERE user_id = ?1",
                params![user_id],
            )
            .context("Failed to delete github token")?;
        Ok(rows > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn db() -> LedgerDb {
        LedgerDb::new_in_memory().unwrap()
    }

    #[test]
    fn test_migrations_create_all_tables() -> Result<()> {
        let db = db();
        let table_count: i32 = db.conn.query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name IN
             ('workflow_runs', 'user_source_repos', 'chats', 'api_keys', 'github_tokens')",
            [],
            |row| row.get(0),
        )?;
        assert_eq!(table_count, 5, "Expected 5 tables to exist");
        Ok(())
    }

    #[test]
    fn test_ledger_persists_across_reopen() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("ledger.db");
        {
            let db = LedgerDb::new(&path)?;
            db.register_run(&RegisterRun {
                workflow_run_id: 42,
                user_id: "u".into(),
                ..Default::default()
            })?;
        }
        let db = LedgerDb::new(&path)?;
        assert_eq!(db.list_workflow_runs("u", None, true, 10)?.len(), 1);
        Ok(())
    }

    #[test]
    fn test_source_repo_upsert_is_stable() -> Result<()> {
        let db = db();
        let first = db.upsert_source_repo("user-1", "octo/flamecast")?;
        let second = db.upsert_source_repo("user-1", "octo/flamecast")?;
        assert_eq!(first, second);

        let count: i64 = db.conn.query_row(
            "SELECT COUNT(*) FROM user_source_repos WHERE user_id = 'user-1'",
            [],
            |row| row.get(0),
        )?;
        assert_eq!(count, 1);

        // A different user gets a distinct row for the same repo name.
        let other = db.upsert_source_repo("user-2", "octo/flamecast")?;
        assert_ne!(other, first);
        Ok(())
    }

    #[test]
    fn test_register_run_upsert_keeps_single_row() -> Result<()> {
        let db = db();
        let first = db.register_run(&RegisterRun {
            workflow_run_id: 101,
            user_id: "user-1".into(),
            repo: Some("octo/target".into()),
            prompt: Some("fix the bug".into()),
            ..Default::default()
        })?;
        let second = db.register_run(&RegisterRun {
            workflow_run_id: 101,
            user_id: "user-1".into(),
            ..Default::default()
        })?;
        assert_eq!(first, second);

        let count: i64 = db.conn.query_row(
            "SELECT COUNT(*) FROM workflow_runs WHERE workflow_run_id = 101 AND user_id = 'user-1'",
            [],
            |row| row.get(0),
        )?;
        assert_eq!(count, 1);

        // The re-registration carried no repo/prompt; earlier values survive.
        let runs = db.list_workflow_runs("user-1", None, true, 10)?;
        assert_eq!(runs[0].repo.as_deref(), Some("octo/target"));
        assert_eq!(runs[0].prompt.as_deref(), Some("fix the bug"));
        Ok(())
    }

    #[test]
    fn test_same_run_id_different_users_are_distinct_rows() -> Result<()> {
        let db = db();
        let a = db.register_run(&RegisterRun {
            workflow_run_id: 7,
            user_id: "user-a".into(),
            ..Default::default()
        })?;
        let b = db.register_run(&RegisterRun {
            workflow_run_id: 7,
            user_id: "user-b".into(),
            ..Default::default()
        })?;
        assert_ne!(a, b);
        Ok(())
    }

    #[test]
    fn test_dispatched_run_overwrites_prompt_and_chat() -> Result<()> {
        let db = db();
        let source = db.upsert_source_repo("user-1", "octo/flamecast")?;
        let chat = db.create_chat("user-1", "first", None, None)?;

        db.record_dispatched_run(&DispatchedRun {
            workflow_run_id: 55,
            user_id: "user-1".into(),
            repo: "octo/target".into(),
            source_repo_id: source.clone(),
            prompt: "first prompt".into(),
            chat_id: chat.id.clone(),
            dispatched_at: now_iso(),
        })?;
        db.record_dispatched_run(&DispatchedRun {
            workflow_run_id: 55,
            user_id: "user-1".into(),
            repo: "octo/target".into(),
            source_repo_id: source,
            prompt: "second prompt".into(),
            chat_id: chat.id,
            dispatched_at: now_iso(),
        })?;

        let runs = db.list_workflow_runs("user-1", None, true, 10)?;
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].prompt.as_deref(), Some("second prompt"));
        assert_eq!(runs[0].source_repo.as_deref(), Some("octo/flamecast"));
        Ok(())
    }

    #[test]
    fn test_resolve_completed_is_conditional() -> Result<()> {
        let db = db();
        let id = db.register_run(&RegisterRun {
            workflow_run_id: 1,
            user_id: "u".into(),
            ..Default::default()
        })?;

        assert!(db.resolve_run_completed(&id, Some("https://github.com/o/r/pull/5"))?);
        // Second resolution loses: the row is already terminal.
        assert!(!db.resolve_run_completed(&id, None)?);
        assert!(!db.resolve_run_error(&id, "late failure")?);

        let run = &db.list_workflow_runs("u", None, true, 10)?[0];
        assert!(run.completed_at.is_some());
        assert!(run.error_at.is_none());
        assert_eq!(run.pr_url.as_deref(), Some("https://github.com/o/r/pull/5"));
        Ok(())
    }

    #[test]
    fn test_resolve_error_excludes_completed() -> Result<()> {
        let db = db();
        let id = db.register_run(&RegisterRun {
            workflow_run_id: 2,
            user_id: "u".into(),
            ..Default::default()
        })?;

        assert!(db.resolve_run_error(&id, "Workflow step failure")?);
        assert!(!db.resolve_run_completed(&id, None)?);

        let run = &db.list_workflow_runs("u", None, true, 10)?[0];
        assert!(run.completed_at.is_none());
        assert_eq!(run.error_message.as_deref(), Some("Workflow step failure"));
        Ok(())
    }

    #[test]
    fn test_get_or_create_chat_reuses_owned_chat_only() -> Result<()> {
        let db = db();
        let chat = db.create_chat("user-1", "existing", None, None)?;

        let reused = db.get_or_create_chat(Some(&chat.id), "user-1", "ignored", None, None)?;
        assert_eq!(reused, chat.id);

        // Another user's chat id is not reused; a fresh chat appears.
        let fresh = db.get_or_create_chat(Some(&chat.id), "user-2", "their prompt", None, None)?;
        assert_ne!(fresh, chat.id);
        Ok(())
    }

    #[test]
    fn test_get_or_create_chat_titles() -> Result<()> {
        let db = db();

        let long_title = "x".repeat(120);
        let id = db.get_or_create_chat(None, "u", &long_title, None, None)?;
        let chat = db.get_chat(&id, "u")?.unwrap();
        assert_eq!(chat.title.chars().count(), 80);

        let id = db.get_or_create_chat(None, "u", "", None, None)?;
        let chat = db.get_chat(&id, "u")?.unwrap();
        assert_eq!(chat.title, "Untitled");
        Ok(())
    }

    #[test]
    fn test_chat_summary_classifies_latest_run() -> Result<()> {
        let db = db();
        let chat = db.create_chat("u", "chat", None, None)?;
        let source = db.upsert_source_repo("u", "o/s")?;

        let run_id = db.record_dispatched_run(&DispatchedRun {
            workflow_run_id: 10,
            user_id: "u".into(),
            repo: "o/t".into(),
            source_repo_id: source,
            prompt: "do things".into(),
            chat_id: chat.id.clone(),
            dispatched_at: now_iso(),
        })?;

        let (count, prompt, status) = db.chat_summary(&chat.id)?;
        assert_eq!(count, 1);
        assert_eq!(prompt.as_deref(), Some("do things"));
        assert_eq!(status, Some(ChatRunStatus::Running));

        db.resolve_run_error(&run_id, "Workflow step cancelled")?;
        let (_, _, status) = db.chat_summary(&chat.id)?;
        assert_eq!(status, Some(ChatRunStatus::Error));
        Ok(())
    }

    #[test]
    fn test_list_chats_cursor_pagination() -> Result<()> {
        let db = db();
        for i in 0..3 {
            db.create_chat("u", &format!("chat-{}", i), None, None)?;
            // Distinct updated_at values for a deterministic order.
            std::thread::sleep(std::time::Duration::from_millis(2));
        }

        let page = db.list_chats("u", None, false, None, 2)?;
        assert_eq!(page.len(), 2);
        assert_eq!(page[0].title, "chat-2");

        let next = db.list_chats("u", None, false, Some(&page[1].updated_at), 2)?;
        assert_eq!(next.len(), 1);
        assert_eq!(next[0].title, "chat-0");
        Ok(())
    }

    #[test]
    fn test_archived_chats_hidden_by_default() -> Result<()> {
        let db = db();
        let chat = db.create_chat("u", "hide me", None, None)?;
        assert!(db.set_chat_archived(&chat.id, "u", true)?);

        assert!(db.list_chats("u", None, false, None, 10)?.is_empty());
        assert_eq!(db.list_chats("u", None, true, None, 10)?.len(), 1);

        assert!(db.set_chat_archived(&chat.id, "u", false)?);
        assert_eq!(db.list_chats("u", None, false, None, 10)?.len(), 1);
        Ok(())
    }

    #[test]
    fn test_run_archive_scoped_to_user() -> Result<()> {
        let db = db();
        let id = db.register_run(&RegisterRun {
            workflow_run_id: 3,
            user_id: "owner".into(),
            ..Default::default()
        })?;

        assert!(!db.set_run_archived(&id, "intruder", true)?);
        assert!(db.set_run_archived(&id, "owner", true)?);
        assert!(db.list_workflow_runs("owner", None, false, 10)?.is_empty());
        Ok(())
    }

    #[test]
    fn test_api_key_lookup_roundtrip() -> Result<()> {
        let db = db();
        let (id, key) = db.create_api_key("u", Some("ci"), None)?;

        let auth = db.find_api_key(&key)?.unwrap();
        assert_eq!(auth.key_id, id);
        assert_eq!(auth.user_id, "u");

        assert!(db.find_api_key("not-a-key")?.is_none());
        assert!(db.delete_api_key(&id, "u")?);
        assert!(db.find_api_key(&key)?.is_none());
        Ok(())
    }

    #[test]
    fn test_workflow_api_key_reused() -> Result<()> {
        let db = db();
        let (id1, key1) = db.get_or_create_workflow_api_key("u")?;
        let (id2, key2) = db.get_or_create_workflow_api_key("u")?;
        assert_eq!(id1, id2);
        assert_eq!(key1, key2);
        assert_eq!(db.count_api_keys("u")?, 1);
        Ok(())
    }

    #[test]
    fn test_github_token_upsert() -> Result<()> {
        let db = db();
        assert!(db.get_github_token("u")?.is_none());

        db.set_github_token("u", "gho_first")?;
        db.set_github_token("u", "gho_second")?;
        assert_eq!(db.get_github_token("u")?.as_deref(), Some("gho_second"));

        assert!(db.delete_github_token("u")?);
        assert!(db.get_github_token("u")?.is_none());
        Ok(())
    }
}
