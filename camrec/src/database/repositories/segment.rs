//! Segment repository.

use async_trait::async_trait;
use sqlx::SqlitePool;

use crate::database::models::{NewSegmentRow, SegmentCursor, SegmentDbModel, SegmentFilter};
use crate::{Error, Result};

use super::segment_tx::SegmentTxOps;

/// Segment repository trait.
#[async_trait]
pub trait SegmentRepository: Send + Sync {
    async fn get_segment(&self, id: i64) -> Result<SegmentDbModel>;
    async fn find_segment(&self, id: i64) -> Result<Option<SegmentDbModel>>;
    async fn find_by_path(&self, file_path: &str) -> Result<Option<SegmentDbModel>>;
    /// Insert a row. A `(camera_id, start_ms)` or path collision is `DuplicateSegment`.
    async fn insert_segment(&self, row: &NewSegmentRow) -> Result<i64>;
    /// Insert a row, dropping any row with the same key or path first.
    async fn replace_segment(&self, row: &NewSegmentRow) -> Result<(i64, Vec<SegmentDbModel>)>;
    /// One page of segments ordered by `(start_ms, id)`, strictly after `after`.
    async fn list_page(
        &self,
        filter: &SegmentFilter,
        after: Option<SegmentCursor>,
        limit: i64,
    ) -> Result<Vec<SegmentDbModel>>;
    async fn list_for_volume(&self, volume_id: &str) -> Result<Vec<SegmentDbModel>>;
    async fn set_locked(&self, id: i64, locked: bool) -> Result<()>;
    async fn total_size(&self, volume_id: &str) -> Result<u64>;
    async fn count_segments(&self) -> Result<i64>;
}

/// SQLx implementation of SegmentRepository.
#[derive(Clone)]
pub struct SqlxSegmentRepository {
    pool: SqlitePool,
}

impl SqlxSegmentRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

pub(crate) fn map_insert_error(err: sqlx::Error, row: &NewSegmentRow) -> Error {
    if let sqlx::Error::Database(db) = &err
        && db.is_unique_violation()
    {
        return Error::DuplicateSegment {
            camera_id: row.camera_id.clone(),
            start_ms: row.start_ms,
        };
    }
    Error::Database(err)
}

#[async_trait]
impl SegmentRepository for SqlxSegmentRepository {
    async fn get_segment(&self, id: i64) -> Result<SegmentDbModel> {
        self.find_segment(id)
            .await?
            .ok_or_else(|| Error::not_found("Segment", id.to_string()))
    }

    async fn find_segment(&self, id: i64) -> Result<Option<SegmentDbModel>> {
        let segment = sqlx::query_as::<_, SegmentDbModel>("SELECT * FROM segments WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(segment)
    }

    async fn find_by_path(&self, file_path: &str) -> Result<Option<SegmentDbModel>> {
        let segment =
            sqlx::query_as::<_, SegmentDbModel>("SELECT * FROM segments WHERE file_path = ?")
                .bind(file_path)
                .fetch_optional(&self.pool)
                .await?;
        Ok(segment)
    }

    async fn insert_segment(&self, row: &NewSegmentRow) -> Result<i64> {
        let mut conn = self.pool.acquire().await?;
        SegmentTxOps::insert(&mut *conn, row).await
    }

    async fn replace_segment(&self, row: &NewSegmentRow) -> Result<(i64, Vec<SegmentDbModel>)> {
        let mut tx = self.pool.begin().await?;
        let mut replaced = Vec::new();
        if let Some(old) = SegmentTxOps::delete_by_key(&mut *tx, &row.camera_id, row.start_ms).await?
        {
            replaced.push(old);
        }
        if let Some(old) = SegmentTxOps::delete_by_path(&mut *tx, &row.file_path).await? {
            replaced.push(old);
        }
        let id = SegmentTxOps::insert(&mut *tx, row).await?;
        tx.commit().await?;
        Ok((id, replaced))
    }

    async fn list_page(
        &self,
        filter: &SegmentFilter,
        after: Option<SegmentCursor>,
        limit: i64,
    ) -> Result<Vec<SegmentDbModel>> {
        let after_start = after.map(|c| c.start_ms);
        let after_id = after.map(|c| c.id);
        let segments = sqlx::query_as::<_, SegmentDbModel>(
            r#"
            SELECT * FROM segments
            WHERE (? IS NULL OR camera_id = ?)
              AND (? IS NULL OR volume_id = ?)
              AND (? IS NULL OR start_ms + duration_ms > ?)
              AND (? IS NULL OR start_ms < ?)
              AND (? IS NULL OR start_ms > ? OR (start_ms = ? AND id > ?))
            ORDER BY start_ms ASC, id ASC
            LIMIT ?
            "#,
        )
        .bind(&filter.camera_id)
        .bind(&filter.camera_id)
        .bind(&filter.volume_id)
        .bind(&filter.volume_id)
        .bind(filter.from_ms)
        .bind(filter.from_ms)
        .bind(filter.to_ms)
        .bind(filter.to_ms)
        .bind(after_start)
        .bind(after_start)
        .bind(after_start)
        .bind(after_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(segments)
    }

    async fn list_for_volume(&self, volume_id: &str) -> Result<Vec<SegmentDbModel>> {
        let segments = sqlx::query_as::<_, SegmentDbModel>(
            "SELECT * FROM segments WHERE volume_id = ? ORDER BY start_ms ASC, id ASC",
        )
        .bind(volume_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(segments)
    }

    async fn set_locked(&self, id: i64, locked: bool) -> Result<()> {
        let result = sqlx::query("UPDATE segments SET locked = ? WHERE id = ?")
            .bind(locked)
            .bind(id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(Error::not_found("Segment", id.to_string()));
        }
        Ok(())
    }

    async fn total_size(&self, volume_id: &str) -> Result<u64> {
        let total: Option<i64> =
            sqlx::query_scalar("SELECT SUM(size_bytes) FROM segments WHERE volume_id = ?")
                .bind(volume_id)
                .fetch_one(&self.pool)
                .await?;
        Ok(total.unwrap_or(0).max(0) as u64)
    }

    async fn count_segments(&self) -> Result<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM segments")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }
}
