use crate::config::AppConfig;
use crate::rate_limit::RateLimiter;
use crate::retry::{retry, RetryConfig};
use crate::sync::{SyncEngine, SyncError, SyncReport, SyncStart};
use crate::votes::{self, VoteImport};
use anyhow::Context;
use providers::hypnohub::{HypnohubClient, HypnohubConfig};
use providers::RemoteIndex;
use sqlx::SqlitePool;
use std::time::Duration;
use storage::{CacheStore, FeedbackStore};
use tracing::info;

/// Both stores over one pool.
pub struct Stores {
    pub pool: SqlitePool,
    pub cache: CacheStore,
    pub feedback: FeedbackStore,
}

impl Stores {
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            cache: CacheStore::new(pool.clone()),
            feedback: FeedbackStore::new(pool.clone()),
            pool,
        }
    }

    pub async fn open(database_url: &str) -> anyhow::Result<Self> {
        let pool = storage::connect(database_url).await.context("db connect")?;
        storage::migrate(&pool).await.context("db migrate")?;
        Ok(Self::new(pool))
    }
}

pub async fn open_stores(config: &AppConfig) -> anyhow::Result<Stores> {
    Stores::open(&config.database.path).await
}

pub fn build_remote(config: &AppConfig) -> anyhow::Result<HypnohubClient> {
    let client = HypnohubClient::new(HypnohubConfig {
        base_url: config.remote.base_url.clone(),
        user_agent: config.remote.user_agent.clone(),
        timeout: Duration::from_secs(config.remote.timeout_secs),
        max_page_size: config.remote.max_page_size,
    })
    .context("building http client")?;
    Ok(client)
}

/// Runs a sync, starting over whenever it fails transiently. Committed pages
/// survive a failure, so a `Resume` retry continues where the last attempt
/// stopped; an explicit start re-walks from that id, which costs fetches but
/// no writes.
pub async fn sync_with_retry(
    remote: &dyn RemoteIndex,
    cache: &CacheStore,
    limiter: &RateLimiter,
    page_limit: u32,
    start: SyncStart,
    retry_cfg: &RetryConfig,
) -> Result<SyncReport, SyncError> {
    let engine = SyncEngine::new(remote, cache, limiter, page_limit);
    retry("sync", retry_cfg, SyncError::is_transient, || engine.run(start)).await
}

/// Syncs the configured database against the configured remote.
pub async fn run_sync(config: &AppConfig, start: SyncStart) -> anyhow::Result<SyncReport> {
    let stores = open_stores(config).await?;
    let remote = build_remote(config)?;
    let limiter = RateLimiter::from_config(&config.rate_limit);
    info!(remote = %config.remote.base_url, db = %config.database.path, "Syncing");
    let report = sync_with_retry(
        &remote,
        &stores.cache,
        &limiter,
        config.remote.page_limit,
        start,
        &RetryConfig::from_sync(&config.sync),
    )
    .await?;
    Ok(report)
}

/// Imports `user`'s remote votes into the configured database, retrying
/// transient failures.
pub async fn run_vote_import(
    config: &AppConfig,
    user: &str,
    levels: &[u8],
) -> anyhow::Result<VoteImport> {
    let stores = open_stores(config).await?;
    let remote = build_remote(config)?;
    let limiter = RateLimiter::from_config(&config.rate_limit);
    let summary = retry(
        "vote import",
        &RetryConfig::from_sync(&config.sync),
        SyncError::is_transient,
        || {
            votes::import_remote_votes(
                &remote,
                &stores.feedback,
                &limiter,
                user,
                levels,
                config.remote.page_limit,
            )
        },
    )
    .await?;
    Ok(summary)
}
