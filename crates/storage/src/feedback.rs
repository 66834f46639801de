//! Vote storage. A record is good, bad, or absent; one row per id keeps the
//! two sets disjoint.

use crate::models::{Label, RecordRow};
use anyhow::Context;
use sqlx::{Row, SqlitePool};

#[derive(Clone)]
pub struct FeedbackStore {
    pool: SqlitePool,
}

impl FeedbackStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Records a vote. Re-voting overwrites. Returns the previous label.
    pub async fn vote(&self, id: i64, label: Label) -> anyhow::Result<Option<Label>> {
        let mut tx = self.pool.begin().await?;
        let previous: Option<String> =
            sqlx::query_scalar("SELECT label FROM feedback WHERE record_id = ?1")
                .bind(id)
                .fetch_optional(&mut *tx)
                .await?;
        sqlx::query(
            r#"
            INSERT INTO feedback (record_id, label, voted_at)
            VALUES (?1, ?2, strftime('%s','now'))
            ON CONFLICT(record_id) DO UPDATE SET
                label = excluded.label,
                voted_at = excluded.voted_at
            "#,
        )
        .bind(id)
        .bind(label.as_str())
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        previous.as_deref().map(parse_label).transpose()
    }

    /// Labels every id in `ids` that has no vote yet, in one transaction.
    /// Existing votes are left alone. Returns how many votes were added.
    pub async fn vote_missing(&self, ids: &[i64], label: Label) -> anyhow::Result<usize> {
        let mut tx = self.pool.begin().await?;
        let mut added = 0;
        for id in ids {
            let res = sqlx::query(
                "INSERT INTO feedback (record_id, label, voted_at) \
                 VALUES (?1, ?2, strftime('%s','now')) \
                 ON CONFLICT(record_id) DO NOTHING",
            )
            .bind(id)
            .bind(label.as_str())
            .execute(&mut *tx)
            .await?;
            added += res.rows_affected() as usize;
        }
        tx.commit().await?;
        Ok(added)
    }

    /// Removes any label from `id`. Returns true if one existed.
    pub async fn clear(&self, id: i64) -> anyhow::Result<bool> {
        let res = sqlx::query("DELETE FROM feedback WHERE record_id = ?1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(res.rows_affected() > 0)
    }

    /// Removes every vote. Returns how many there were.
    pub async fn clear_all(&self) -> anyhow::Result<u64> {
        let res = sqlx::query("DELETE FROM feedback").execute(&self.pool).await?;
        Ok(res.rows_affected())
    }

    pub async fn label(&self, id: i64) -> anyhow::Result<Option<Label>> {
        let label: Option<String> =
            sqlx::query_scalar("SELECT label FROM feedback WHERE record_id = ?1")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;
        label.as_deref().map(parse_label).transpose()
    }

    pub async fn ids(&self, label: Label) -> anyhow::Result<Vec<i64>> {
        let ids = sqlx::query_scalar("SELECT record_id FROM feedback WHERE label = ?1 ORDER BY record_id")
            .bind(label.as_str())
            .fetch_all(&self.pool)
            .await?;
        Ok(ids)
    }

    /// Every vote, ascending by id.
    pub async fn all(&self) -> anyhow::Result<Vec<(i64, Label)>> {
        let rows = sqlx::query("SELECT record_id, label FROM feedback ORDER BY record_id")
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter()
            .map(|r| {
                let id: i64 = r.try_get("record_id")?;
                let label: String = r.try_get("label")?;
                Ok((id, parse_label(&label)?))
            })
            .collect()
    }

    /// Returns (good, bad) counts.
    pub async fn counts(&self) -> anyhow::Result<(i64, i64)> {
        let row = sqlx::query(
            "SELECT \
               COALESCE(SUM(CASE WHEN label = 'good' THEN 1 ELSE 0 END), 0) AS good, \
               COALESCE(SUM(CASE WHEN label = 'bad' THEN 1 ELSE 0 END), 0) AS bad \
             FROM feedback",
        )
        .fetch_one(&self.pool)
        .await?;
        Ok((row.try_get("good")?, row.try_get("bad")?))
    }

    /// Labeled records that are present in the cache, with their label.
    pub async fn labeled_records(&self) -> anyhow::Result<Vec<(RecordRow, Label)>> {
        let rows = sqlx::query(
            "SELECT r.id, r.tags, r.score, r.rating, r.author, r.md5, r.file_url, r.sample_url, \
                    r.preview_url, r.parent_id, r.declared_parent_id, r.status, f.label \
             FROM feedback f JOIN records r ON r.id = f.record_id \
             ORDER BY r.id",
        )
        .fetch_all(&self.pool)
        .await?;
        let mut out = Vec::with_capacity(rows.len());
        for r in rows {
            let record = RecordRow {
                id: r.try_get("id")?,
                tags: r.try_get("tags")?,
                score: r.try_get("score")?,
                rating: r.try_get("rating")?,
                author: r.try_get("author")?,
                md5: r.try_get("md5")?,
                file_url: r.try_get("file_url")?,
                sample_url: r.try_get("sample_url")?,
                preview_url: r.try_get("preview_url")?,
                parent_id: r.try_get("parent_id")?,
                declared_parent_id: r.try_get("declared_parent_id")?,
                status: r.try_get("status")?,
            };
            let label: String = r.try_get("label")?;
            out.push((record, parse_label(&label)?));
        }
        Ok(out)
    }

    /// Votes whose record is no longer cached.
    pub async fn dangling(&self) -> anyhow::Result<Vec<(i64, Label)>> {
        let rows = sqlx::query(
            "SELECT f.record_id, f.label FROM feedback f \
             LEFT JOIN records r ON r.id = f.record_id \
             WHERE r.id IS NULL ORDER BY f.record_id",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter()
            .map(|r| {
                let id: i64 = r.try_get("record_id")?;
                let label: String = r.try_get("label")?;
                Ok((id, parse_label(&label)?))
            })
            .collect()
    }
}

fn parse_label(s: &str) -> anyhow::Result<Label> {
    s.parse::<Label>()
        .with_context(|| format!("corrupt feedback row with label {s:?}"))
}
