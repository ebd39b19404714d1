//! courierd - Real-time direct-messaging server
//!
//! Accepts newline-delimited JSON connections over TCP, authenticates them
//! against a session, persists every message to SQLite, and delivers live
//! to whichever participants hold an open connection. Presence lives in
//! Redis when configured, otherwise in an in-process map.

use anyhow::{Context, Result};
use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use courier::chatserver::{session, ChatServer, ChatStore, PresenceDirectory, SessionManager};

/// courierd - persisted direct messaging with live delivery
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Address to listen on
    #[arg(short, long, default_value = "127.0.0.1:7670")]
    listen: SocketAddr,

    /// Directory for the SQLite database
    ///
    /// Defaults to ~/.courier (or /tmp/courier without a home directory).
    #[arg(short, long)]
    data_dir: Option<PathBuf>,

    /// Redis URL for the shared presence directory
    ///
    /// Example: redis://localhost:6379. When omitted or unreachable, presence
    /// falls back to an in-process map.
    #[arg(short, long)]
    redis_url: Option<String>,

    /// Presence binding TTL in seconds
    #[arg(long, default_value = "3600")]
    presence_ttl: u64,

    /// Seed demo users userA/userB (password "123") and their friendship
    #[arg(long)]
    seed: bool,
}

fn default_data_dir() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
    PathBuf::from(home).join(".courier")
}

/// First-run bootstrap: two users who are already friends.
fn seed_demo_users(store: &ChatStore) -> Result<()> {
    if store.get_user_by_name("userA")?.is_some() {
        info!("Demo users already present, skipping seed");
        return Ok(());
    }

    let a = store.create_user("userA", &session::hash_password("123"))?;
    let b = store.create_user("userB", &session::hash_password("123"))?;
    store.add_friend(a.id, b.id)?;

    info!("Seeded demo users userA ({}) and userB ({})", a.id, b.id);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let data_dir = cli.data_dir.unwrap_or_else(default_data_dir);

    let store = Arc::new(
        ChatStore::new(&data_dir)
            .with_context(|| format!("Failed to open store in {:?}", data_dir))?,
    );

    if cli.seed {
        seed_demo_users(&store)?;
    }

    let sessions = Arc::new(SessionManager::new(store.clone()));
    let presence = PresenceDirectory::connect(
        cli.redis_url.as_deref(),
        Duration::from_secs(cli.presence_ttl),
    )
    .await;

    let server = ChatServer::start(cli.listen, store, sessions, presence)
        .await
        .context("Failed to start chat server")?;

    info!("courierd listening on {}", server.local_addr());
    info!("Data directory: {:?}", data_dir);

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;

    info!("Shutting down");
    server.shutdown().await?;

    Ok(())
}
