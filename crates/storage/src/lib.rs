//! Storage layer: SQLite schema and the two durable stores.
//!
//! Holds DB pool setup, the migration runner, the record cache and the
//! feedback (vote) store.

use anyhow::Context;
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::SqlitePool;

pub mod cache;
pub mod feedback;
pub mod models;

pub use cache::{CacheBatch, CacheStore, UpsertOutcome};
pub use feedback::FeedbackStore;
pub use models::{Label, RecordRow};

pub async fn connect(database_url: &str) -> anyhow::Result<SqlitePool> {
    let mut url = database_url.to_string();
    if !database_url.starts_with("sqlite:") {
        let path = std::path::PathBuf::from(database_url);
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating database directory {}", parent.display()))?;
        }
        let norm = path.to_string_lossy().replace('\\', "/");
        if path.is_absolute() {
            url = format!("sqlite:///{}?mode=rwc", norm.trim_start_matches('/'));
        } else {
            url = format!("sqlite://{}?mode=rwc", norm);
        }
    }
    let mut opts = SqlitePoolOptions::new();
    if url.contains("memory") {
        // Every connection to an unnamed in-memory DB is a fresh database.
        opts = opts.max_connections(1).idle_timeout(None).max_lifetime(None);
    } else {
        opts = opts.max_connections(5);
    }
    let pool = opts
        .connect(&url)
        .await
        .with_context(|| format!("opening database {database_url}"))?;
    Ok(pool)
}

pub async fn migrate(pool: &SqlitePool) -> anyhow::Result<()> {
    // Applies SQLx migrations located in crates/storage/migrations.
    // Safe to run multiple times (idempotent).
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

/// Connects and migrates in one step. Used by tests and the CLI.
pub async fn open(database_url: &str) -> anyhow::Result<SqlitePool> {
    let pool = connect(database_url).await?;
    migrate(&pool).await?;
    Ok(pool)
}
