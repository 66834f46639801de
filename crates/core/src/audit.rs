//! Spot-checks the cache against the remote, one id at a time.
//!
//! Ids are sampled uniformly from `1..=highest cached id`, so the check also
//! catches records the cache is missing, not only ones it holds.

use crate::rate_limit::RateLimiter;
use crate::record::{Incoming, Record};
use crate::sync::SyncError;
use providers::{Filter, RemoteIndex};
use rand::Rng;
use serde::Serialize;
use storage::CacheStore;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Discrepancy {
    /// Live on the remote, absent from the cache.
    Missing,
    /// Cached, but deleted or never returned by the remote.
    Stale,
    /// Present on both sides with different contents.
    Differs,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct AuditReport {
    pub highest_cached: Option<i64>,
    pub checked: usize,
    pub discrepancies: Vec<(i64, Discrepancy)>,
}

impl AuditReport {
    pub fn is_clean(&self) -> bool {
        self.discrepancies.is_empty()
    }
}

pub async fn audit<R: Rng + ?Sized>(
    remote: &dyn RemoteIndex,
    cache: &CacheStore,
    limiter: &RateLimiter,
    sample: usize,
    rng: &mut R,
) -> Result<AuditReport, SyncError> {
    let mut report = AuditReport {
        highest_cached: cache.highest_id().await?,
        ..AuditReport::default()
    };
    let Some(highest) = report.highest_cached else {
        info!("Cache is empty; nothing to audit");
        return Ok(report);
    };

    let population = usize::try_from(highest).unwrap_or(0);
    let amount = sample.min(population);
    let mut ids: Vec<i64> = rand::seq::index::sample(rng, population, amount)
        .into_iter()
        .map(|i| i as i64 + 1)
        .collect();
    ids.sort_unstable();

    for (n, id) in ids.iter().copied().enumerate() {
        info!("[{}/{}] Checking #{}", n + 1, amount, id);
        limiter.wait().await;
        let batch = remote
            .fetch(&Filter::Id(id), 1, 1)
            .await
            .map_err(|source| SyncError::Fetch { from_id: id, source })?;
        limiter.record_batch(batch.len()).await;

        let remote_record = batch
            .into_iter()
            .find(|r| r.id == id)
            .and_then(|raw| match Incoming::from(raw) {
                Incoming::Live(record) => Some(record),
                Incoming::Removed { .. } => None,
            });
        let cached = match cache.get(id).await? {
            Some(row) => Some(Record::try_from(row).map_err(anyhow::Error::new)?),
            None => None,
        };
        report.checked += 1;

        let found = match (&cached, &remote_record) {
            (None, Some(_)) => Some(Discrepancy::Missing),
            (Some(_), None) => Some(Discrepancy::Stale),
            (Some(ours), Some(theirs)) if ours != theirs => Some(Discrepancy::Differs),
            _ => None,
        };
        if let Some(kind) = found {
            warn!(id, ?kind, "Cache disagrees with the remote");
            report.discrepancies.push((id, kind));
        }
    }

    info!(
        checked = report.checked,
        discrepancies = report.discrepancies.len(),
        "Audit complete"
    );
    Ok(report)
}
