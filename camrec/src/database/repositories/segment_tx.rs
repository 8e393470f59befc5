//! Transactional operations for segment rows.
//!
//! These methods operate within an existing transaction and do NOT commit.
//! The caller commits once the matching filesystem change has succeeded.

use sqlx::SqliteConnection;

use crate::Result;
use crate::database::models::{NewSegmentRow, SegmentDbModel};

use super::segment::map_insert_error;

pub struct SegmentTxOps;

impl SegmentTxOps {
    /// Delete a segment row, returning it if it existed.
    pub async fn delete(tx: &mut SqliteConnection, id: i64) -> Result<Option<SegmentDbModel>> {
        let existing =
            sqlx::query_as::<_, SegmentDbModel>("SELECT * FROM segments WHERE id = ?")
                .bind(id)
                .fetch_optional(&mut *tx)
                .await?;

        if existing.is_some() {
            sqlx::query("DELETE FROM segments WHERE id = ?")
                .bind(id)
                .execute(&mut *tx)
                .await?;
        }
        Ok(existing)
    }

    /// Delete whatever row holds `(camera_id, start_ms)`.
    pub async fn delete_by_key(
        tx: &mut SqliteConnection,
        camera_id: &str,
        start_ms: i64,
    ) -> Result<Option<SegmentDbModel>> {
        let existing = sqlx::query_as::<_, SegmentDbModel>(
            "SELECT * FROM segments WHERE camera_id = ? AND start_ms = ?",
        )
        .bind(camera_id)
        .bind(start_ms)
        .fetch_optional(&mut *tx)
        .await?;

        if let Some(row) = &existing {
            sqlx::query("DELETE FROM segments WHERE id = ?")
                .bind(row.id)
                .execute(&mut *tx)
                .await?;
        }
        Ok(existing)
    }

    /// Delete whatever row points at `file_path`.
    pub async fn delete_by_path(
        tx: &mut SqliteConnection,
        file_path: &str,
    ) -> Result<Option<SegmentDbModel>> {
        let existing =
            sqlx::query_as::<_, SegmentDbModel>("SELECT * FROM segments WHERE file_path = ?")
                .bind(file_path)
                .fetch_optional(&mut *tx)
                .await?;

        if let Some(row) = &existing {
            sqlx::query("DELETE FROM segments WHERE id = ?")
                .bind(row.id)
                .execute(&mut *tx)
                .await?;
        }
        Ok(existing)
    }

    pub async fn insert(tx: &mut SqliteConnection, row: &NewSegmentRow) -> Result<i64> {
        let result = sqlx::query(
            r#"
            INSERT INTO segments (camera_id, volume_id, start_ms, duration_ms, size_bytes, file_path, checksum, locked, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, 0, ?)
            "#,
        )
        .bind(&row.camera_id)
        .bind(&row.volume_id)
        .bind(row.start_ms)
        .bind(row.duration_ms)
        .bind(row.size_bytes)
        .bind(&row.file_path)
        .bind(&row.checksum)
        .bind(row.created_at)
        .execute(&mut *tx)
        .await
        .map_err(|e| map_insert_error(e, row))?;

        Ok(result.last_insert_rowid())
    }
}
