use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use flamecast::db::{DbHandle, LedgerDb};
use flamecast::server::{start_server, ServerConfig};

#[derive(Parser)]
#[command(name = "flamecast")]
#[command(version, about = "Dispatch an AI coding agent through GitHub Actions")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the API server
    Serve {
        #[arg(short, long)]
        port: Option<u16>,

        /// Path to the SQLite ledger
        #[arg(long)]
        db: Option<std::path::PathBuf>,

        /// Permissive CORS and bind on all interfaces
        #[arg(long)]
        dev: bool,
    },
    /// Manage stored GitHub access tokens (the OAuth flow lives elsewhere;
    /// this stores its result)
    Token {
        #[command(subcommand)]
        command: TokenCommands,
    },
}

#[derive(Subcommand)]
enum TokenCommands {
    /// Store a user's GitHub access token
    Set { user_id: String, token: String },
    /// Remove a user's GitHub access token
    Clear { user_id: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Serve { port, db, dev } => {
            let mut config = ServerConfig::from_env();
            if let Some(port) = port {
                config.port = port;
            }
            if let Some(db) = db {
                config.db_path = db;
            }
            config.dev_mode = dev;
            start_server(config).await
        }
        Commands::Token { command } => {
            let config = ServerConfig::from_env();
            let db = DbHandle::new(LedgerDb::new(&config.db_path)?);
            match command {
                TokenCommands::Set { user_id, token } => {
                    if !flamecast::github::is_valid_github_token(token.trim()) {
                        anyhow::bail!("token does not look like a GitHub token");
                    }
                    let token = token.trim().to_string();
                    db.call(move |db| db.set_github_token(&user_id, &token))
                        .await?;
                    println!("Token stored.");
                }
                TokenCommands::Clear { user_id } => {
                    let removed = db
                        .call(move |db| db.delete_github_token(&user_id))
                        .await?;
                    println!("{}", if removed { "Token removed." } else { "No token stored." });
                }
            }
            Ok(())
        }
    }
}
