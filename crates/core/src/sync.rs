//! Brings the record cache up to date with the remote index.
//!
//! A run walks the remote in ascending id order from a start id, one page at
//! a time, and applies each page in its own transaction. Three things make
//! this more than a copy loop:
//!
//! * the remote is rate limited, so every call goes through [`RateLimiter`];
//! * a record may name a parent that has not been fetched yet. Such records
//!   are set aside as orphans and retried in bounded passes once the stream
//!   is exhausted; whatever still has no parent after a pass that made no
//!   progress is stored unlinked. The declared parent is kept in the row,
//!   and every run links such records once their parent is cached;
//! * the remote deletes records silently. Any cached id that falls strictly
//!   between two consecutive ids the remote reports no longer exists and is
//!   removed.
//!
//! Upserts only write when a column changed, so a run against an unchanged
//! remote performs no mutations.

use crate::rate_limit::RateLimiter;
use crate::record::{Incoming, Record, Removal};
use providers::{Filter, ProviderError, RemoteIndex};
use serde::Serialize;
use storage::{CacheBatch, CacheStore, RecordRow, UpsertOutcome};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Where a run starts reading the remote.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncStart {
    /// One past the highest cached id.
    Resume,
    /// An explicit id. `FromId(1)` re-walks everything, which is what lets
    /// gap deletion see records removed below the cache's high-water mark.
    FromId(i64),
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("fetching records from id {from_id} failed: {source}")]
    Fetch {
        from_id: i64,
        #[source]
        source: ProviderError,
    },
    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

impl SyncError {
    pub fn is_transient(&self) -> bool {
        match self {
            SyncError::Fetch { source, .. } => source.is_transient(),
            SyncError::Storage(_) => false,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    pub start_id: i64,
    pub pages: usize,
    pub fetched: usize,
    pub inserted: usize,
    pub updated: usize,
    /// Removed because the remote flagged them or sent them malformed.
    pub deleted: usize,
    /// Removed because the remote skipped over their id.
    pub gap_deleted: usize,
    pub orphan_passes: usize,
    pub orphans_resolved: usize,
    pub orphans_forced: usize,
    /// Records stored unlinked earlier whose parent has since been cached.
    pub orphans_relinked: usize,
    pub remote_highest: Option<i64>,
    pub last_seen: Option<i64>,
}

impl SyncReport {
    /// Number of writes that changed the cache.
    pub fn mutations(&self) -> usize {
        self.inserted + self.updated + self.deleted + self.gap_deleted + self.orphans_relinked
    }
}

pub struct SyncEngine<'a> {
    remote: &'a dyn RemoteIndex,
    cache: &'a CacheStore,
    limiter: &'a RateLimiter,
    page_limit: u32,
}

impl<'a> SyncEngine<'a> {
    pub fn new(
        remote: &'a dyn RemoteIndex,
        cache: &'a CacheStore,
        limiter: &'a RateLimiter,
        page_limit: u32,
    ) -> Self {
        Self {
            remote,
            cache,
            limiter,
            page_limit,
        }
    }

    /// Page size actually requested: the configured limit, capped by what
    /// the remote accepts.
    pub fn page_size(&self) -> u32 {
        let limit = match self.remote.max_page_size() {
            Some(cap) => self.page_limit.min(cap),
            None => self.page_limit,
        };
        limit.max(1)
    }

    pub async fn run(&self, start: SyncStart) -> Result<SyncReport, SyncError> {
        let start_id = match start {
            SyncStart::Resume => self.cache.highest_id().await?.map_or(1, |h| h + 1),
            SyncStart::FromId(id) => id.max(1),
        };
        let limit = self.page_size();
        let mut report = SyncReport {
            start_id,
            remote_highest: self.remote_highest().await,
            ..SyncReport::default()
        };
        info!(start_id, limit, remote_highest = ?report.remote_highest, "Starting cache sync");

        let mut orphans: Vec<Record> = Vec::new();
        let streamed = self.stream(start_id, limit, &mut orphans, &mut report).await;
        if streamed.is_err() && !orphans.is_empty() {
            // A resumed run starts above these ids; they are stored unlinked
            // and picked up by the relink step of a later run.
            warn!(pending = orphans.len(), "Sync aborted with orphans pending");
        }
        self.resolve_orphans(orphans, &mut report).await?;
        self.relink(&mut report).await?;
        streamed?;

        info!(
            fetched = report.fetched,
            inserted = report.inserted,
            updated = report.updated,
            deleted = report.deleted + report.gap_deleted,
            orphans_forced = report.orphans_forced,
            "Cache sync complete"
        );
        Ok(report)
    }

    /// Fetches and applies pages until the remote runs dry. Records whose
    /// parent is not cached yet are collected into `orphans`.
    async fn stream(
        &self,
        start_id: i64,
        limit: u32,
        orphans: &mut Vec<Record>,
        report: &mut SyncReport,
    ) -> Result<(), SyncError> {
        // Ids up to and including this one have been accounted for.
        let mut last_processed = start_id - 1;

        loop {
            let from_id = last_processed + 1;
            let filter = Filter::AscendingFrom { from_id };
            self.limiter.wait().await;
            let batch = self
                .remote
                .fetch(&filter, 1, limit)
                .await
                .map_err(|source| SyncError::Fetch { from_id, source })?;
            self.limiter.record_batch(batch.len()).await;

            if batch.is_empty() {
                return Ok(());
            }
            report.pages += 1;
            report.fetched += batch.len();

            let before = last_processed;
            let mut tx = self.cache.begin().await?;
            for raw in batch {
                let incoming = Incoming::from(raw);
                let id = incoming.id();
                if id <= last_processed {
                    warn!(id, last_processed, "Remote returned an id out of order; skipping");
                    continue;
                }

                for gone in tx.delete_between(last_processed, id).await? {
                    info!(id = gone, "Deleting #{} because it no longer exists on the remote", gone);
                    report.gap_deleted += 1;
                }
                last_processed = id;

                match incoming {
                    Incoming::Removed { id, reason } => {
                        if let Removal::Malformed(e) = &reason {
                            debug!(id, error = %e, "Treating malformed record as deleted");
                        }
                        if tx.delete(id).await? {
                            info!(id, %reason, "Deleting #{}", id);
                            report.deleted += 1;
                        }
                    }
                    Incoming::Live(record) => {
                        let parent_missing = match record.parent_id {
                            Some(parent) => !tx.contains(parent).await?,
                            None => false,
                        };
                        if parent_missing {
                            debug!(id, parent = ?record.parent_id, "Setting aside a temporarily orphaned record");
                            orphans.push(record);
                        } else {
                            apply(&mut tx, &record.to_row(), report).await?;
                        }
                    }
                }
            }
            tx.commit().await?;
            report.last_seen = Some(last_processed);

            match report.remote_highest {
                Some(highest) => info!(
                    "({}/{}) pages: {}, orphans: {}",
                    last_processed,
                    highest,
                    report.pages,
                    orphans.len()
                ),
                None => info!(
                    "({}) pages: {}, orphans: {}",
                    last_processed,
                    report.pages,
                    orphans.len()
                ),
            }

            if last_processed == before {
                warn!(from_id, "Remote ignored the id filter; stopping");
                return Ok(());
            }
        }
    }

    /// Retries orphans until every parent is cached or a pass stalls. A
    /// stalled pass means the remaining parents never arrived, so those
    /// children are stored without one.
    async fn resolve_orphans(
        &self,
        mut orphans: Vec<Record>,
        report: &mut SyncReport,
    ) -> Result<(), SyncError> {
        if orphans.is_empty() {
            return Ok(());
        }
        orphans.sort_by_key(|r| r.id);
        info!("Un-orphaning {} records...", orphans.len());

        while !orphans.is_empty() {
            report.orphan_passes += 1;
            let pending = orphans.len();
            let mut remaining = Vec::with_capacity(pending);
            let mut tx = self.cache.begin().await?;
            for record in orphans {
                let resolved = match record.parent_id {
                    Some(parent) => tx.contains(parent).await?,
                    None => true,
                };
                if resolved {
                    apply(&mut tx, &record.to_row(), report).await?;
                    report.orphans_resolved += 1;
                } else {
                    remaining.push(record);
                }
            }
            tx.commit().await?;
            debug!(pass = report.orphan_passes, left = remaining.len(), "Orphan pass finished");

            if remaining.len() == pending {
                self.force_orphans(remaining, report).await?;
                break;
            }
            orphans = remaining;
        }
        Ok(())
    }

    async fn force_orphans(
        &self,
        orphans: Vec<Record>,
        report: &mut SyncReport,
    ) -> Result<(), SyncError> {
        warn!(
            "Failed to get the parents for {} records; saving them unlinked",
            orphans.len()
        );
        let mut tx = self.cache.begin().await?;
        for record in orphans {
            warn!(child = record.id, parent = ?record.parent_id, "Orphan has no parent in the cache");
            let mut row = record.to_row();
            row.parent_id = None;
            apply(&mut tx, &row, report).await?;
            report.orphans_forced += 1;
        }
        tx.commit().await?;
        Ok(())
    }

    /// Links records stored unlinked by this or an earlier run whose parent
    /// is cached now.
    async fn relink(&self, report: &mut SyncReport) -> Result<(), SyncError> {
        let mut tx = self.cache.begin().await?;
        let relinked = tx.relink_orphans().await?;
        tx.commit().await?;
        for id in &relinked {
            debug!(id, "Re-linked a record to its parent");
        }
        if !relinked.is_empty() {
            info!(count = relinked.len(), "Re-linked orphans whose parent arrived");
        }
        report.orphans_relinked += relinked.len();
        Ok(())
    }

    async fn remote_highest(&self) -> Option<i64> {
        self.limiter.wait().await;
        let highest = self.remote.highest_id().await;
        self.limiter.record_batch(1).await;
        match highest {
            Ok(h) => h,
            Err(e) => {
                warn!(error = %e, "Could not read the remote's highest id; progress will be unbounded");
                None
            }
        }
    }
}

async fn apply(
    tx: &mut CacheBatch,
    row: &RecordRow,
    report: &mut SyncReport,
) -> anyhow::Result<()> {
    match tx.upsert(row).await? {
        UpsertOutcome::Inserted => report.inserted += 1,
        UpsertOutcome::Updated => report.updated += 1,
        UpsertOutcome::Unchanged => {}
    }
    Ok(())
}
