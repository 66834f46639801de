//! An index held entirely in memory. Backs snapshot imports and stands in
//! for the real remote in tests.

use crate::{Filter, ProviderError, RawRecord, RemoteIndex};
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::RwLock;

#[derive(Debug, Default)]
pub struct StaticIndex {
    records: RwLock<Vec<RawRecord>>,
    /// (user, level) -> voted ids
    votes: RwLock<HashMap<(String, u8), BTreeSet<i64>>>,
    max_page_size: Option<u32>,
    calls: AtomicUsize,
    failures_left: AtomicUsize,
}

impl StaticIndex {
    pub fn new(mut records: Vec<RawRecord>) -> Self {
        records.sort_by_key(|r| r.id);
        Self {
            records: RwLock::new(records),
            ..Self::default()
        }
    }

    pub fn with_max_page_size(mut self, max: u32) -> Self {
        self.max_page_size = Some(max);
        self
    }

    /// Replaces the whole index.
    pub fn set(&self, mut records: Vec<RawRecord>) {
        records.sort_by_key(|r| r.id);
        *self.records.write().unwrap_or_else(|e| e.into_inner()) = records;
    }

    /// Drops `id` entirely, as if it had been purged remotely.
    pub fn remove(&self, id: i64) {
        self.records
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .retain(|r| r.id != id);
    }

    /// Records that `user` voted on `ids` at `level`.
    pub fn set_votes(&self, user: &str, level: u8, ids: impl IntoIterator<Item = i64>) {
        self.votes
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert((user.to_string(), level), ids.into_iter().collect());
    }

    /// Makes the next `n` fetches fail with a transient error.
    pub fn fail_next(&self, n: usize) {
        self.failures_left.store(n, Ordering::SeqCst);
    }

    /// Number of `fetch` calls served so far, failed ones included.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl RemoteIndex for StaticIndex {
    async fn fetch(
        &self,
        filter: &Filter,
        page: u32,
        limit: u32,
    ) -> Result<Vec<RawRecord>, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let failing = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(ProviderError::Transient("injected failure".into()));
        }

        let limit = self.max_page_size.map_or(limit, |max| limit.min(max)) as usize;
        let skip = (page.max(1) as usize - 1) * limit;
        let records = self.records.read().unwrap_or_else(|e| e.into_inner());
        let page: Vec<RawRecord> = match filter {
            Filter::AscendingFrom { from_id } => records
                .iter()
                .filter(|r| r.id >= *from_id)
                .skip(skip)
                .take(limit)
                .cloned()
                .collect(),
            Filter::Id(id) => records
                .iter()
                .filter(|r| r.id == *id)
                .skip(skip)
                .take(limit)
                .cloned()
                .collect(),
            Filter::NewestFirst => records.iter().rev().skip(skip).take(limit).cloned().collect(),
            Filter::VotedBy {
                user,
                level,
                from_id,
            } => {
                let votes = self.votes.read().unwrap_or_else(|e| e.into_inner());
                let voted = votes.get(&(user.clone(), *level));
                records
                    .iter()
                    .filter(|r| r.id >= *from_id && voted.is_some_and(|ids| ids.contains(&r.id)))
                    .skip(skip)
                    .take(limit)
                    .cloned()
                    .collect()
            }
        };
        Ok(page)
    }

    fn max_page_size(&self) -> Option<u32> {
        self.max_page_size
    }
}
