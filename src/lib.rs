//! Flamecast — dispatch an AI coding agent through GitHub Actions and track
//! the resulting runs.
//!
//! ## Overview
//!
//! A user points Flamecast at a repository that hosts the agent workflow
//! (the *source* repo). Dispatching a prompt triggers the workflow via
//! `workflow_dispatch`, discovers the run id GitHub assigned, and records a
//! ledger row. The workflow itself calls back: it registers on start,
//! uploads an `outputs.json` artifact, and asks for reconciliation when it
//! finishes. The reconciler inspects the run's jobs to settle the row as
//! completed or errored, picking up the PR the agent opened on the *target*
//! repo along the way.
//!
//! ## Module Map
//!
//! ```text
//! ┌──────────┐   HTTP   ┌─────────────────────────────────────────────────┐
//! │ Frontend │ ───────> │  server.rs  (axum Router, ServerConfig)         │
//! │ Workflow │          │    └─ api.rs  (route handlers, AppState, auth)  │
//! └──────────┘          │         │                                       │
//!                       │         ├─ dispatch.rs   trigger + discover run │
//!                       │         ├─ reconcile.rs  settle run status      │
//!                       │         ├─ outputs.rs    artifact + raw logs    │
//!                       │         └─ seal.rs       Actions secret sealing │
//!                       │         │                                       │
//!                       │  github.rs  (REST client, CredentialCache)      │
//!                       │  db.rs      (SQLite ledger via DbHandle)        │
//!                       └─────────────────────────────────────────────────┘
//! ```
//!
//! ## Supporting Modules
//!
//! | Module     | Responsibility                                          |
//! |------------|---------------------------------------------------------|
//! | `models`   | Ledger row types and status enums                       |
//! | `errors`   | `GitHubError`, `SealError`                              |
//! | `retry`    | `RetryPolicy` — bounded fixed-delay polling             |
//! | `workflow` | Embedded workflow definition + artifact name            |

pub mod api;
pub mod db;
pub mod dispatch;
pub mod errors;
pub mod github;
pub mod models;
pub mod outputs;
pub mod reconcile;
pub mod retry;
pub mod seal;
pub mod server;
pub mod workflow;
