//! The validated record type and its conversions to and from the wire and
//! the database row.

use providers::RawRecord;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use storage::RecordRow;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Rating {
    Safe,
    Questionable,
    Explicit,
}

impl Rating {
    pub fn code(&self) -> &'static str {
        match self {
            Rating::Safe => "s",
            Rating::Questionable => "q",
            Rating::Explicit => "e",
        }
    }

    pub fn from_code(code: &str) -> Option<Self> {
        match code {
            "s" | "safe" => Some(Rating::Safe),
            "q" | "questionable" => Some(Rating::Questionable),
            "e" | "explicit" => Some(Rating::Explicit),
            _ => None,
        }
    }
}

/// Live statuses only; removed ones never make it into a [`Record`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordStatus {
    Active,
    Pending,
}

impl RecordStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordStatus::Active => "active",
            RecordStatus::Pending => "pending",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MalformedRecordError {
    #[error("record #{id}: missing required field `{field}`")]
    MissingField { id: i64, field: &'static str },
    #[error("record #{id}: invalid `{field}` value {value:?}")]
    InvalidField {
        id: i64,
        field: &'static str,
        value: String,
    },
    #[error("record id {0} is not positive")]
    InvalidId(i64),
    #[error("record #{id}: could not decode: {reason}")]
    Undecodable { id: i64, reason: String },
}

/// Why an incoming record must not be (or stay) cached.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Removal {
    /// The remote reports it as deleted or flagged for deletion.
    Status(String),
    Malformed(MalformedRecordError),
}

impl fmt::Display for Removal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Removal::Status(s) => write!(f, "status {s}"),
            Removal::Malformed(e) => write!(f, "{e}"),
        }
    }
}

/// An incoming wire record after classification.
#[derive(Debug, Clone, PartialEq)]
pub enum Incoming {
    Live(Record),
    Removed { id: i64, reason: Removal },
}

impl Incoming {
    pub fn id(&self) -> i64 {
        match self {
            Incoming::Live(r) => r.id,
            Incoming::Removed { id, .. } => *id,
        }
    }
}

impl From<RawRecord> for Incoming {
    fn from(raw: RawRecord) -> Self {
        let id = raw.id;
        if let Some(reason) = raw.malformed {
            return Incoming::Removed {
                id,
                reason: Removal::Malformed(MalformedRecordError::Undecodable { id, reason }),
            };
        }
        if let Some(s @ ("deleted" | "flagged")) = raw.status.as_deref() {
            return Incoming::Removed {
                id,
                reason: Removal::Status(s.to_string()),
            };
        }
        match Record::try_from(raw) {
            Ok(record) => Incoming::Live(record),
            Err(e) => Incoming::Removed {
                id,
                reason: Removal::Malformed(e),
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    pub id: i64,
    pub tags: BTreeSet<String>,
    pub score: i64,
    pub rating: Rating,
    pub author: String,
    pub md5: String,
    pub file_url: String,
    pub sample_url: Option<String>,
    pub preview_url: Option<String>,
    pub parent_id: Option<i64>,
    pub status: RecordStatus,
}

impl Record {
    pub fn page_url(&self, base_url: &str) -> String {
        format!("{}/post/show/{}/", base_url.trim_end_matches('/'), self.id)
    }

    /// Tagged with any of `tags`.
    pub fn has_any<S: AsRef<str>>(&self, tags: &[S]) -> bool {
        tags.iter().any(|t| self.tags.contains(t.as_ref()))
    }

    /// Tagged with all of `tags`.
    pub fn has_all<S: AsRef<str>>(&self, tags: &[S]) -> bool {
        tags.iter().all(|t| self.tags.contains(t.as_ref()))
    }

    pub fn tags_string(&self) -> String {
        self.tags.iter().map(String::as_str).collect::<Vec<_>>().join(" ")
    }

    pub fn to_row(&self) -> RecordRow {
        RecordRow {
            id: self.id,
            tags: self.tags_string(),
            score: self.score,
            rating: self.rating.code().to_string(),
            author: self.author.clone(),
            md5: self.md5.clone(),
            file_url: self.file_url.clone(),
            sample_url: self.sample_url.clone(),
            preview_url: self.preview_url.clone(),
            parent_id: self.parent_id,
            declared_parent_id: self.parent_id,
            status: self.status.as_str().to_string(),
        }
    }

    pub fn to_raw(&self) -> RawRecord {
        RawRecord {
            id: self.id,
            tags: Some(self.tags_string()),
            score: Some(self.score),
            rating: Some(self.rating.code().to_string()),
            author: Some(self.author.clone()),
            md5: Some(self.md5.clone()),
            file_url: Some(self.file_url.clone()),
            sample_url: self.sample_url.clone(),
            preview_url: self.preview_url.clone(),
            parent_id: self.parent_id,
            status: Some(self.status.as_str().to_string()),
            malformed: None,
        }
    }
}

impl fmt::Display for Record {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{} +{} by {}", self.id, self.score, self.author)
    }
}

impl TryFrom<RawRecord> for Record {
    type Error = MalformedRecordError;

    fn try_from(raw: RawRecord) -> Result<Self, Self::Error> {
        let id = raw.id;
        if id <= 0 {
            return Err(MalformedRecordError::InvalidId(id));
        }
        let missing = |field| MalformedRecordError::MissingField { id, field };
        let invalid = |field, value: &str| MalformedRecordError::InvalidField {
            id,
            field,
            value: value.to_string(),
        };

        let status = match raw.status.as_deref() {
            None | Some("active") => RecordStatus::Active,
            Some("pending") => RecordStatus::Pending,
            Some(other) => return Err(invalid("status", other)),
        };
        let tags = parse_tags(&raw.tags.ok_or_else(|| missing("tags"))?);
        let score = raw.score.ok_or_else(|| missing("score"))?;
        let rating_code = raw.rating.ok_or_else(|| missing("rating"))?;
        let rating = Rating::from_code(&rating_code).ok_or_else(|| invalid("rating", &rating_code))?;
        let author = non_empty(raw.author).ok_or_else(|| missing("author"))?;
        let md5 = non_empty(raw.md5).ok_or_else(|| missing("md5"))?;
        if md5.len() != 32 || !md5.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(invalid("md5", &md5));
        }
        let file_url = non_empty(raw.file_url)
            .map(|u| absolute_url(&u))
            .ok_or_else(|| missing("file_url"))?;

        Ok(Record {
            id,
            tags,
            score,
            rating,
            author,
            md5: md5.to_ascii_lowercase(),
            file_url,
            sample_url: non_empty(raw.sample_url).map(|u| absolute_url(&u)),
            preview_url: non_empty(raw.preview_url).map(|u| absolute_url(&u)),
            parent_id: raw.parent_id.filter(|p| *p > 0 && *p != id),
            status,
        })
    }
}

impl TryFrom<RecordRow> for Record {
    type Error = MalformedRecordError;

    /// The record carries the parent the remote declared, whether or not
    /// the row could be linked to it.
    fn try_from(row: RecordRow) -> Result<Self, Self::Error> {
        Record::try_from(RawRecord {
            id: row.id,
            tags: Some(row.tags),
            score: Some(row.score),
            rating: Some(row.rating),
            author: Some(row.author),
            md5: Some(row.md5),
            file_url: Some(row.file_url),
            sample_url: row.sample_url,
            preview_url: row.preview_url,
            parent_id: row.declared_parent_id.or(row.parent_id),
            status: Some(row.status),
            malformed: None,
        })
    }
}

pub fn parse_tags(tags: &str) -> BTreeSet<String> {
    tags.split_whitespace().map(str::to_string).collect()
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

// The remote hands out scheme-relative URLs ("//host/data/...").
fn absolute_url(url: &str) -> String {
    if url.starts_with("//") {
        format!("https:{url}")
    } else {
        url.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(id: i64) -> RawRecord {
        RawRecord {
            id,
            tags: Some("b a  a".into()),
            score: Some(3),
            rating: Some("q".into()),
            author: Some("someone".into()),
            md5: Some("D74DCED3BDDD67137E14D084731BBC0F".into()),
            file_url: Some("//example.test/data/image/x.jpg".into()),
            preview_url: Some("//example.test/data/preview/x.jpg".into()),
            status: Some("active".into()),
            ..RawRecord::default()
        }
    }

    #[test]
    fn valid_raw_record_normalises_fields() {
        let record = Record::try_from(raw(7)).unwrap();
        assert_eq!(record.tags.len(), 2);
        assert_eq!(record.tags_string(), "a b");
        assert_eq!(record.rating, Rating::Questionable);
        assert_eq!(record.md5, "d74dced3bddd67137e14d084731bbc0f");
        assert_eq!(record.file_url, "https://example.test/data/image/x.jpg");
        assert_eq!(record.page_url("https://example.test/"), "https://example.test/post/show/7/");
        assert!(record.has_all(&["a", "b"]));
        assert!(!record.has_any(&["c"]));
        assert_eq!(record.to_string(), "#7 +3 by someone");
    }

    #[test]
    fn missing_author_is_malformed_and_becomes_a_removal() {
        let mut r = raw(7);
        r.author = None;
        assert_eq!(
            Record::try_from(r.clone()).unwrap_err(),
            MalformedRecordError::MissingField { id: 7, field: "author" }
        );
        match Incoming::from(r) {
            Incoming::Removed { id, reason: Removal::Malformed(_) } => assert_eq!(id, 7),
            other => panic!("expected removal, got {other:?}"),
        }
    }

    #[test]
    fn deleted_and_flagged_statuses_are_removals() {
        for status in ["deleted", "flagged"] {
            let mut r = raw(3);
            r.status = Some(status.into());
            assert_eq!(
                Incoming::from(r),
                Incoming::Removed {
                    id: 3,
                    reason: Removal::Status(status.into())
                }
            );
        }
    }

    #[test]
    fn bad_rating_and_md5_are_rejected() {
        let mut r = raw(1);
        r.rating = Some("x".into());
        assert!(matches!(
            Record::try_from(r).unwrap_err(),
            MalformedRecordError::InvalidField { field: "rating", .. }
        ));
        let mut r = raw(1);
        r.md5 = Some("nothex".into());
        assert!(matches!(
            Record::try_from(r).unwrap_err(),
            MalformedRecordError::InvalidField { field: "md5", .. }
        ));
    }

    #[test]
    fn self_parent_is_dropped() {
        let mut r = raw(4);
        r.parent_id = Some(4);
        assert_eq!(Record::try_from(r).unwrap().parent_id, None);
    }

    #[test]
    fn undecodable_wire_records_are_removals() {
        let r = RawRecord {
            id: 9,
            malformed: Some("invalid type: string \"oops\", expected i64".into()),
            ..raw(9)
        };
        match Incoming::from(r) {
            Incoming::Removed {
                id,
                reason: Removal::Malformed(MalformedRecordError::Undecodable { .. }),
            } => assert_eq!(id, 9),
            other => panic!("expected removal, got {other:?}"),
        }
    }

    #[test]
    fn unlinked_rows_keep_their_declared_parent() {
        let mut r = raw(12);
        r.parent_id = Some(40);
        let record = Record::try_from(r).unwrap();
        let mut row = record.to_row();
        row.parent_id = None;
        assert_eq!(Record::try_from(row).unwrap().parent_id, Some(40));
    }

    #[test]
    fn row_round_trip_preserves_record() {
        let mut r = raw(12);
        r.parent_id = Some(3);
        let record = Record::try_from(r).unwrap();
        assert_eq!(Record::try_from(record.to_row()).unwrap(), record);
    }
}
