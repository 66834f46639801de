//! The record cache: a durable `id -> record` map.
//!
//! Reads go straight to the pool. Writes go through a [`CacheBatch`], one
//! SQLite transaction per remote page, so an interrupted sync never leaves
//! half a page behind.

use crate::models::RecordRow;
use sqlx::{Sqlite, SqlitePool, Transaction};
use tracing::debug;

const RECORD_COLUMNS: &str = "id, tags, score, rating, author, md5, file_url, sample_url, \
                              preview_url, parent_id, declared_parent_id, status";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted,
    Updated,
    Unchanged,
}

impl UpsertOutcome {
    pub fn is_mutation(&self) -> bool {
        !matches!(self, UpsertOutcome::Unchanged)
    }
}

#[derive(Clone)]
pub struct CacheStore {
    pool: SqlitePool,
}

impl CacheStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn get(&self, id: i64) -> anyhow::Result<Option<RecordRow>> {
        let sql = format!("SELECT {RECORD_COLUMNS} FROM records WHERE id = ?1");
        let row = sqlx::query_as::<_, RecordRow>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }

    pub async fn contains(&self, id: i64) -> anyhow::Result<bool> {
        let found: Option<i64> = sqlx::query_scalar("SELECT id FROM records WHERE id = ?1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(found.is_some())
    }

    /// Highest cached id, or `None` for an empty cache.
    pub async fn highest_id(&self) -> anyhow::Result<Option<i64>> {
        let max: Option<i64> = sqlx::query_scalar("SELECT MAX(id) FROM records")
            .fetch_one(&self.pool)
            .await?;
        Ok(max)
    }

    pub async fn count(&self) -> anyhow::Result<i64> {
        let n: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM records")
            .fetch_one(&self.pool)
            .await?;
        Ok(n)
    }

    /// Every cached record, ascending by id.
    pub async fn all(&self) -> anyhow::Result<Vec<RecordRow>> {
        let sql = format!("SELECT {RECORD_COLUMNS} FROM records ORDER BY id");
        let rows = sqlx::query_as::<_, RecordRow>(&sql)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows)
    }

    /// Cached records that carry no label yet, ascending by id.
    pub async fn unlabeled(&self) -> anyhow::Result<Vec<RecordRow>> {
        let sql = format!(
            "SELECT {cols} FROM records r \
             LEFT JOIN feedback f ON f.record_id = r.id \
             WHERE f.record_id IS NULL ORDER BY r.id",
            cols = prefixed_columns("r")
        );
        let rows = sqlx::query_as::<_, RecordRow>(&sql)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows)
    }

    pub async fn unlabeled_ids(&self) -> anyhow::Result<Vec<i64>> {
        let ids = sqlx::query_scalar(
            "SELECT r.id FROM records r \
             LEFT JOIN feedback f ON f.record_id = r.id \
             WHERE f.record_id IS NULL ORDER BY r.id",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(ids)
    }

    /// Empties the cache. Votes are kept. Returns the number of records
    /// removed.
    pub async fn clear(&self) -> anyhow::Result<u64> {
        let res = sqlx::query("DELETE FROM records").execute(&self.pool).await?;
        debug!(removed = res.rows_affected(), "Cleared record cache");
        Ok(res.rows_affected())
    }

    pub async fn begin(&self) -> anyhow::Result<CacheBatch> {
        let tx = self.pool.begin().await?;
        Ok(CacheBatch { tx })
    }
}

/// A unit of cache writes. Nothing is visible to other connections until
/// [`CacheBatch::commit`]; dropping the batch rolls it back.
pub struct CacheBatch {
    tx: Transaction<'static, Sqlite>,
}

impl CacheBatch {
    pub async fn contains(&mut self, id: i64) -> anyhow::Result<bool> {
        let found: Option<i64> = sqlx::query_scalar("SELECT id FROM records WHERE id = ?1")
            .bind(id)
            .fetch_optional(&mut *self.tx)
            .await?;
        Ok(found.is_some())
    }

    /// Inserts or updates a record, writing only when a column differs.
    pub async fn upsert(&mut self, row: &RecordRow) -> anyhow::Result<UpsertOutcome> {
        let existed = self.contains(row.id).await?;
        let res = sqlx::query(
            r#"
            INSERT INTO records (id, tags, score, rating, author, md5, file_url, sample_url, preview_url, parent_id, declared_parent_id, status)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
            ON CONFLICT(id) DO UPDATE SET
                tags = excluded.tags,
                score = excluded.score,
                rating = excluded.rating,
                author = excluded.author,
                md5 = excluded.md5,
                file_url = excluded.file_url,
                sample_url = excluded.sample_url,
                preview_url = excluded.preview_url,
                parent_id = excluded.parent_id,
                declared_parent_id = excluded.declared_parent_id,
                status = excluded.status,
                synced_at = strftime('%s','now')
            WHERE
                records.tags IS NOT excluded.tags OR
                records.score IS NOT excluded.score OR
                records.rating IS NOT excluded.rating OR
                records.author IS NOT excluded.author OR
                records.md5 IS NOT excluded.md5 OR
                records.file_url IS NOT excluded.file_url OR
                records.sample_url IS NOT excluded.sample_url OR
                records.preview_url IS NOT excluded.preview_url OR
                records.parent_id IS NOT excluded.parent_id OR
                records.declared_parent_id IS NOT excluded.declared_parent_id OR
                records.status IS NOT excluded.status
            "#,
        )
        .bind(row.id)
        .bind(&row.tags)
        .bind(row.score)
        .bind(&row.rating)
        .bind(&row.author)
        .bind(&row.md5)
        .bind(&row.file_url)
        .bind(&row.sample_url)
        .bind(&row.preview_url)
        .bind(row.parent_id)
        .bind(row.declared_parent_id)
        .bind(&row.status)
        .execute(&mut *self.tx)
        .await?;

        Ok(match (existed, res.rows_affected() > 0) {
            (false, _) => UpsertOutcome::Inserted,
            (true, true) => UpsertOutcome::Updated,
            (true, false) => UpsertOutcome::Unchanged,
        })
    }

    /// Returns true if a row was removed.
    pub async fn delete(&mut self, id: i64) -> anyhow::Result<bool> {
        let res = sqlx::query("DELETE FROM records WHERE id = ?1")
            .bind(id)
            .execute(&mut *self.tx)
            .await?;
        Ok(res.rows_affected() > 0)
    }

    /// Deletes every cached id strictly between `after` and `before` and
    /// returns the removed ids in ascending order.
    pub async fn delete_between(&mut self, after: i64, before: i64) -> anyhow::Result<Vec<i64>> {
        if before - after < 2 {
            return Ok(Vec::new());
        }
        let mut ids: Vec<i64> =
            sqlx::query_scalar("DELETE FROM records WHERE id > ?1 AND id < ?2 RETURNING id")
                .bind(after)
                .bind(before)
                .fetch_all(&mut *self.tx)
                .await?;
        ids.sort_unstable();
        if !ids.is_empty() {
            debug!(after, before, removed = ids.len(), "Deleted a gap");
        }
        Ok(ids)
    }

    /// Links every unlinked record whose declared parent is now cached.
    /// Returns the re-linked ids in ascending order.
    pub async fn relink_orphans(&mut self) -> anyhow::Result<Vec<i64>> {
        let mut ids: Vec<i64> = sqlx::query_scalar(
            "UPDATE records SET parent_id = declared_parent_id, synced_at = strftime('%s','now') \
             WHERE parent_id IS NULL \
               AND declared_parent_id IS NOT NULL \
               AND declared_parent_id IN (SELECT id FROM records) \
             RETURNING id",
        )
        .fetch_all(&mut *self.tx)
        .await?;
        ids.sort_unstable();
        Ok(ids)
    }

    pub async fn commit(self) -> anyhow::Result<()> {
        self.tx.commit().await?;
        debug!("Committed cache batch");
        Ok(())
    }
}

fn prefixed_columns(alias: &str) -> String {
    RECORD_COLUMNS
        .split(',')
        .map(|c| format!("{alias}.{}", c.trim()))
        .collect::<Vec<_>>()
        .join(", ")
}
