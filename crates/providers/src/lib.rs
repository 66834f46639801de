//! Remote index abstractions: the paginated, read-only source the cache
//! mirrors.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::warn;

pub mod hypnohub;
pub mod memory;

#[derive(Debug, Error)]
pub enum ProviderError {
    /// Network failure, timeout, or a server-side status worth retrying.
    #[error("transient fetch failure: {0}")]
    Transient(String),
    #[error("remote returned status {status}: {body}")]
    Status { status: u16, body: String },
    #[error("could not parse remote response: {0}")]
    Parse(String),
}

impl ProviderError {
    pub fn is_transient(&self) -> bool {
        matches!(self, ProviderError::Transient(_))
    }
}

impl From<reqwest::Error> for ProviderError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            ProviderError::Parse(e.to_string())
        } else {
            // timeouts, connect and body errors are all worth another try
            ProviderError::Transient(e.to_string())
        }
    }
}

/// Which slice of the index to ask for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Filter {
    /// Ascending by id, starting at `from_id` inclusive.
    AscendingFrom { from_id: i64 },
    /// Exactly one id.
    Id(i64),
    /// Descending by id.
    NewestFirst,
    /// Records `user` voted on at `level` (1 good, 2 great, 3 favorite),
    /// ascending by id from `from_id` inclusive.
    VotedBy {
        user: String,
        level: u8,
        from_id: i64,
    },
}

impl Filter {
    /// Booru search syntax for this filter.
    pub fn to_query(&self) -> String {
        match self {
            Filter::AscendingFrom { from_id } => format!("order:id id:>={from_id}"),
            Filter::Id(id) => format!("id:{id}"),
            Filter::NewestFirst => "order:id_desc".to_string(),
            Filter::VotedBy {
                user,
                level,
                from_id,
            } => format!("vote:{level}:{user} order:id id:>={from_id}"),
        }
    }
}

/// A record as delivered by the remote. Everything except `id` may be
/// missing; validation happens when converting into the domain type.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawRecord {
    pub id: i64,
    #[serde(default)]
    pub tags: Option<String>,
    #[serde(default)]
    pub score: Option<i64>,
    #[serde(default)]
    pub rating: Option<String>,
    #[serde(default)]
    pub author: Option<String>,
    #[serde(default)]
    pub md5: Option<String>,
    #[serde(default)]
    pub file_url: Option<String>,
    #[serde(default)]
    pub sample_url: Option<String>,
    #[serde(default)]
    pub preview_url: Option<String>,
    #[serde(default, deserialize_with = "lenient_id")]
    pub parent_id: Option<i64>,
    #[serde(default)]
    pub status: Option<String>,
    /// Set when the remote's object could not be decoded. Holds the reason;
    /// every other field is then empty.
    #[serde(skip)]
    pub malformed: Option<String>,
}

/// Decodes one page of `/post/index.json`.
///
/// Records are decoded one at a time. A record that does not decode but has
/// a readable id comes back with only that id and [`RawRecord::malformed`]
/// set, so one bad record never costs the rest of the page. Entries without
/// a readable id are skipped.
pub fn parse_page(body: &[u8]) -> Result<Vec<RawRecord>, ProviderError> {
    let values: Vec<Value> =
        serde_json::from_slice(body).map_err(|e| ProviderError::Parse(e.to_string()))?;
    let mut records = Vec::with_capacity(values.len());
    for value in values {
        let id = value.get("id").and_then(readable_id);
        match serde_json::from_value::<RawRecord>(value) {
            Ok(record) => records.push(record),
            Err(e) => match id {
                Some(id) => {
                    warn!(id, error = %e, "Remote record does not decode");
                    records.push(RawRecord {
                        id,
                        malformed: Some(e.to_string()),
                        ..RawRecord::default()
                    });
                }
                None => warn!(error = %e, "Skipping a remote record without a readable id"),
            },
        }
    }
    Ok(records)
}

fn readable_id(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

// Some deployments send parent_id as "" or 0 for "no parent".
fn lenient_id<'de, D>(deserializer: D) -> Result<Option<i64>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(Value::Number(n)) => n.as_i64().filter(|id| *id > 0),
        Some(Value::String(s)) => s.parse::<i64>().ok().filter(|id| *id > 0),
        _ => None,
    })
}

#[async_trait::async_trait]
pub trait RemoteIndex: Send + Sync {
    /// Fetches one page (1-based) of at most `limit` records matching
    /// `filter`, in the order the filter asks for.
    async fn fetch(
        &self,
        filter: &Filter,
        page: u32,
        limit: u32,
    ) -> Result<Vec<RawRecord>, ProviderError>;

    /// Largest page the remote will honour, if it enforces one.
    fn max_page_size(&self) -> Option<u32> {
        None
    }

    /// Highest id currently on the remote.
    async fn highest_id(&self) -> Result<Option<i64>, ProviderError> {
        let newest = self.fetch(&Filter::NewestFirst, 1, 1).await?;
        Ok(newest.first().map(|r| r.id))
    }
}
