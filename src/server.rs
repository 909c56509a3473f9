use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::Router;
use tower_http::cors::CorsLayer;

use crate::api::{api_router, AppState, SharedState};
use crate::db::{DbHandle, LedgerDb};
use crate::github::GITHUB_API_BASE;
use crate::retry::RetryPolicy;

/// Configuration for the Flamecast API server.
pub struct ServerConfig {
    pub port: u16,
    pub db_path: PathBuf,
    pub github_base: String,
    /// Permissive CORS + bind on all interfaces, for local frontend dev.
    pub dev_mode: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 8787,
            db_path: PathBuf::from("flamecast.db"),
            github_base: GITHUB_API_BASE.to_string(),
            dev_mode: false,
        }
    }
}

impl ServerConfig {
    /// Environment overrides: `FLAMECAST_PORT`, `FLAMECAST_DB`,
    /// `GITHUB_API_URL` (the latter mainly for tests and proxies).
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(port) = std::env::var("FLAMECAST_PORT")
            .ok()
            .and_then(|value| value.parse().ok())
        {
            config.port = port;
        }
        if let Ok(path) = std::env::var("FLAMECAST_DB") {
            config.db_path = PathBuf::from(path);
        }
        if let Ok(base) = std::env::var("GITHUB_API_URL") {
            config.github_base = base;
        }
        config
    }
}

pub fn build_router(state: SharedState) -> Router {
    api_router().with_state(state)
}

/// Start the API server and run until shutdown.
pub async fn start_server(config: ServerConfig) -> Result<()> {
    if let Some(parent) = config.db_path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent).context("Failed to create database directory")?;
        }
    }

    let db = LedgerDb::new(&config.db_path).context("Failed to initialize ledger database")?;
    let state = Arc::new(AppState {
        db: DbHandle::new(db),
        github_base: config.github_base.clone(),
        run_discovery: RetryPolicy::run_discovery(),
    });

    let mut app = build_router(state);
    if config.dev_mode {
        app = app.layer(CorsLayer::permissive());
    }

    let host = if config.dev_mode { "0.0.0.0" } else { "127.0.0.1" };
    let addr = format!("{}:{}", host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;

    let local_addr = listener.local_addr()?;
    tracing::info!(%local_addr, "flamecast API listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    tracing::info!("server shut down gracefully");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
