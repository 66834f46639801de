//! Versioned JSON export of the cache and the votes.
//!
//! Importing replays the exported records through [`SyncEngine`] against an
//! in-memory index, so imported data is validated, orphan-resolved and
//! stored exactly the way a live sync would store it.

use crate::rate_limit::RateLimiter;
use crate::record::Record;
use crate::sync::{SyncEngine, SyncReport, SyncStart};
use anyhow::{bail, Context};
use chrono::{DateTime, Utc};
use providers::memory::StaticIndex;
use providers::RawRecord;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::Path;
use storage::{CacheStore, FeedbackStore, Label};
use tracing::{info, warn};

pub const SNAPSHOT_VERSION: u32 = 1;

const IMPORT_PAGE_LIMIT: u32 = 1000;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    pub version: u32,
    pub exported_at: DateTime<Utc>,
    pub good: Vec<i64>,
    pub bad: Vec<i64>,
    pub records: Vec<RawRecord>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ImportSummary {
    pub sync: SyncReport,
    pub good: usize,
    pub bad: usize,
    /// Ids listed as both good and bad. Neither vote is applied.
    pub conflicting: Vec<i64>,
}

pub async fn collect(cache: &CacheStore, feedback: &FeedbackStore) -> anyhow::Result<Snapshot> {
    let mut records = Vec::new();
    for row in cache.all().await? {
        let id = row.id;
        let record = Record::try_from(row).with_context(|| format!("cached record #{id}"))?;
        records.push(record.to_raw());
    }
    Ok(Snapshot {
        version: SNAPSHOT_VERSION,
        exported_at: Utc::now(),
        good: feedback.ids(Label::Good).await?,
        bad: feedback.ids(Label::Bad).await?,
        records,
    })
}

pub async fn export(
    cache: &CacheStore,
    feedback: &FeedbackStore,
    path: &Path,
) -> anyhow::Result<Snapshot> {
    let snapshot = collect(cache, feedback).await?;
    let json = serde_json::to_vec_pretty(&snapshot)?;
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("creating {}", parent.display()))?;
    }
    tokio::fs::write(path, json)
        .await
        .with_context(|| format!("writing snapshot to {}", path.display()))?;
    info!(
        records = snapshot.records.len(),
        good = snapshot.good.len(),
        bad = snapshot.bad.len(),
        path = %path.display(),
        "Exported snapshot"
    );
    Ok(snapshot)
}

pub async fn read(path: &Path) -> anyhow::Result<Snapshot> {
    let bytes = tokio::fs::read(path)
        .await
        .with_context(|| format!("reading snapshot {}", path.display()))?;
    let snapshot: Snapshot = serde_json::from_slice(&bytes)
        .with_context(|| format!("parsing snapshot {}", path.display()))?;
    if snapshot.version != SNAPSHOT_VERSION {
        bail!(
            "unsupported snapshot version {} (expected {})",
            snapshot.version,
            SNAPSHOT_VERSION
        );
    }
    Ok(snapshot)
}

/// Loads `snapshot` into empty stores. Refuses when the cache or the votes
/// hold anything, unless `replace` is set, in which case both are emptied
/// first and end up holding exactly what the snapshot holds.
pub async fn import(
    snapshot: Snapshot,
    cache: &CacheStore,
    feedback: &FeedbackStore,
    replace: bool,
) -> anyhow::Result<ImportSummary> {
    let existing = cache.count().await?;
    let (good_votes, bad_votes) = feedback.counts().await?;
    let votes = good_votes + bad_votes;
    if existing + votes > 0 {
        if !replace {
            bail!(
                "database already holds {existing} records and {votes} votes; \
                 refusing to import over them without replace"
            );
        }
        let records = cache.clear().await?;
        let votes = feedback.clear_all().await?;
        warn!(records, votes, "Cleared the database before importing");
    }

    let index = StaticIndex::new(snapshot.records);
    let limiter = RateLimiter::unlimited();
    let engine = SyncEngine::new(&index, cache, &limiter, IMPORT_PAGE_LIMIT);
    let sync = engine.run(SyncStart::FromId(1)).await?;

    let good: BTreeSet<i64> = snapshot.good.into_iter().collect();
    let bad: BTreeSet<i64> = snapshot.bad.into_iter().collect();
    let conflicting: Vec<i64> = good.intersection(&bad).copied().collect();
    if !conflicting.is_empty() {
        warn!(?conflicting, "Snapshot labels some records both good and bad; skipping them");
    }

    let mut summary = ImportSummary {
        sync,
        ..ImportSummary::default()
    };
    for (ids, label) in [(&good, Label::Good), (&bad, Label::Bad)] {
        for id in ids.iter().filter(|id| !conflicting.contains(*id)) {
            feedback.vote(*id, label).await?;
            match label {
                Label::Good => summary.good += 1,
                Label::Bad => summary.bad += 1,
            }
        }
    }
    summary.conflicting = conflicting;
    info!(
        records = summary.sync.inserted + summary.sync.updated,
        good = summary.good,
        bad = summary.bad,
        "Imported snapshot"
    );
    Ok(summary)
}
