#![allow(dead_code)]

use async_trait::async_trait;
use finder_core::pipeline::Stores;
use finder_core::rate_limit::RateLimiter;
use finder_core::sync::{SyncEngine, SyncReport, SyncStart};
use providers::memory::StaticIndex;
use providers::{Filter, ProviderError, RawRecord, RemoteIndex};
use std::sync::atomic::{AtomicUsize, Ordering};

pub fn raw(id: i64, tags: &str) -> RawRecord {
    RawRecord {
        id,
        tags: Some(tags.to_string()),
        score: Some(id * 10),
        rating: Some("s".to_string()),
        author: Some("someone".to_string()),
        md5: Some(format!("{id:032x}")),
        file_url: Some(format!("//hypnohub.net/data/image/{id}.png")),
        sample_url: None,
        preview_url: None,
        parent_id: None,
        status: Some("active".to_string()),
        malformed: None,
    }
}

pub fn child(id: i64, tags: &str, parent: i64) -> RawRecord {
    RawRecord {
        parent_id: Some(parent),
        ..raw(id, tags)
    }
}

pub async fn stores() -> Stores {
    Stores::open("sqlite::memory:").await.unwrap()
}

pub async fn sync(remote: &dyn RemoteIndex, stores: &Stores, start: SyncStart) -> SyncReport {
    let limiter = RateLimiter::unlimited();
    SyncEngine::new(remote, &stores.cache, &limiter, 100)
        .run(start)
        .await
        .unwrap()
}

pub async fn cached_ids(stores: &Stores) -> Vec<i64> {
    stores
        .cache
        .all()
        .await
        .unwrap()
        .into_iter()
        .map(|r| r.id)
        .collect()
}

/// Serves pages from a [`StaticIndex`] but fails the `fail_on`-th page
/// fetch (1-based) with the given error, once.
pub struct FailingAt {
    pub inner: StaticIndex,
    fail_on: usize,
    transient: bool,
    page_calls: AtomicUsize,
}

impl FailingAt {
    pub fn new(inner: StaticIndex, fail_on: usize, transient: bool) -> Self {
        Self {
            inner,
            fail_on,
            transient,
            page_calls: AtomicUsize::new(0),
        }
    }

    pub fn page_calls(&self) -> usize {
        self.page_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RemoteIndex for FailingAt {
    async fn fetch(
        &self,
        filter: &Filter,
        page: u32,
        limit: u32,
    ) -> Result<Vec<RawRecord>, ProviderError> {
        if matches!(filter, Filter::AscendingFrom { .. }) {
            let n = self.page_calls.fetch_add(1, Ordering::SeqCst) + 1;
            if n == self.fail_on {
                return Err(if self.transient {
                    ProviderError::Transient("connection reset".into())
                } else {
                    ProviderError::Status {
                        status: 403,
                        body: "forbidden".into(),
                    }
                });
            }
        }
        self.inner.fetch(filter, page, limit).await
    }

    fn max_page_size(&self) -> Option<u32> {
        self.inner.max_page_size()
    }
}
