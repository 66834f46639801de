use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// One row of the `records` table. Tags are stored space separated, the
/// same way the remote delivers them.
#[derive(Debug, Clone, PartialEq, Eq, FromRow, Serialize, Deserialize)]
pub struct RecordRow {
    pub id: i64,
    pub tags: String,
    pub score: i64,
    pub rating: String,
    pub author: String,
    pub md5: String,
    pub file_url: String,
    pub sample_url: Option<String>,
    pub preview_url: Option<String>,
    /// Linked parent. Always a cached id, or `None`.
    pub parent_id: Option<i64>,
    /// Parent as the remote reports it, cached or not.
    pub declared_parent_id: Option<i64>,
    pub status: String,
}

/// A user's verdict on a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Label {
    Good,
    Bad,
}

impl Label {
    pub fn as_str(&self) -> &'static str {
        match self {
            Label::Good => "good",
            Label::Bad => "bad",
        }
    }

    pub fn is_good(&self) -> bool {
        matches!(self, Label::Good)
    }
}

impl fmt::Display for Label {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
#[error("unknown label: {0}")]
pub struct UnknownLabel(pub String);

impl FromStr for Label {
    type Err = UnknownLabel;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "good" | "up" | "upvote" => Ok(Label::Good),
            "bad" | "down" | "downvote" => Ok(Label::Bad),
            other => Err(UnknownLabel(other.to_string())),
        }
    }
}
