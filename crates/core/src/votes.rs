//! Pulls a remote user's votes into the feedback store.
//!
//! The remote keeps three vote levels per user. Levels 3 (favorite) and 2
//! (great) count as good by default. Votes only fill in ids that have no
//! local verdict; a label set locally always wins.

use crate::rate_limit::RateLimiter;
use crate::sync::SyncError;
use providers::{Filter, RemoteIndex};
use serde::Serialize;
use std::collections::BTreeSet;
use storage::{FeedbackStore, Label};
use tracing::{debug, info, warn};

pub const GOOD_VOTE_LEVELS: [u8; 2] = [3, 2];

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct VoteImport {
    pub user: String,
    pub levels: Vec<u8>,
    pub pages: usize,
    /// Distinct ids the user voted on at any of `levels`.
    pub found: usize,
    pub added: usize,
    /// Ids that already carried a local label and were left alone.
    pub kept: usize,
}

/// Every id `user` voted on at `level`, walking the remote by ascending id.
pub async fn voted_ids(
    remote: &dyn RemoteIndex,
    limiter: &RateLimiter,
    user: &str,
    level: u8,
    page_limit: u32,
    pages: &mut usize,
) -> Result<BTreeSet<i64>, SyncError> {
    let limit = match remote.max_page_size() {
        Some(cap) => page_limit.min(cap),
        None => page_limit,
    }
    .max(1);

    let mut ids = BTreeSet::new();
    let mut from_id = 1;
    loop {
        let filter = Filter::VotedBy {
            user: user.to_string(),
            level,
            from_id,
        };
        limiter.wait().await;
        let batch = remote
            .fetch(&filter, 1, limit)
            .await
            .map_err(|source| SyncError::Fetch { from_id, source })?;
        limiter.record_batch(batch.len()).await;

        let Some(highest) = batch.iter().map(|r| r.id).max() else {
            break;
        };
        *pages += 1;
        ids.extend(batch.iter().map(|r| r.id));
        debug!(user, level, from_id, found = ids.len(), "Fetched a page of votes");
        if highest < from_id {
            warn!(from_id, "Remote ignored the id filter; stopping");
            break;
        }
        from_id = highest + 1;
    }
    Ok(ids)
}

/// Labels good every id `user` voted on at one of `levels`.
pub async fn import_remote_votes(
    remote: &dyn RemoteIndex,
    feedback: &FeedbackStore,
    limiter: &RateLimiter,
    user: &str,
    levels: &[u8],
    page_limit: u32,
) -> Result<VoteImport, SyncError> {
    let mut summary = VoteImport {
        user: user.to_string(),
        levels: levels.to_vec(),
        ..VoteImport::default()
    };
    let mut ids = BTreeSet::new();
    for &level in levels {
        let found = voted_ids(remote, limiter, user, level, page_limit, &mut summary.pages).await?;
        info!(user, level, count = found.len(), "Fetched remote votes");
        ids.extend(found);
    }

    let ids: Vec<i64> = ids.into_iter().collect();
    summary.found = ids.len();
    summary.added = feedback.vote_missing(&ids, Label::Good).await?;
    summary.kept = summary.found - summary.added;
    info!(
        user,
        found = summary.found,
        added = summary.added,
        kept = summary.kept,
        "Imported remote votes"
    );
    Ok(summary)
}
