//! Segment database models.

use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use crate::domain::{NewSegment, Segment};
use crate::{Error, Result};

/// Row of the `segments` table.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct SegmentDbModel {
    pub id: i64,
    pub camera_id: String,
    pub volume_id: String,
    /// Unix epoch milliseconds (UTC).
    pub start_ms: i64,
    pub duration_ms: i64,
    pub size_bytes: i64,
    pub file_path: String,
    pub checksum: Option<String>,
    pub locked: bool,
    /// Unix epoch milliseconds when the row was written.
    pub created_at: i64,
}

impl SegmentDbModel {
    pub fn into_segment(self) -> Result<Segment> {
        let start = DateTime::<Utc>::from_timestamp_millis(self.start_ms).ok_or_else(|| {
            Error::validation(format!(
                "segment {} has out-of-range start_ms {}",
                self.id, self.start_ms
            ))
        })?;
        Ok(Segment {
            id: self.id,
            camera_id: self.camera_id,
            volume_id: self.volume_id,
            start,
            duration: Duration::from_millis(self.duration_ms.max(0) as u64),
            size_bytes: self.size_bytes.max(0) as u64,
            path: PathBuf::from(self.file_path),
            checksum: self.checksum,
            locked: self.locked,
        })
    }
}

/// Values for inserting a new segment row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewSegmentRow {
    pub camera_id: String,
    pub volume_id: String,
    pub start_ms: i64,
    pub duration_ms: i64,
    pub size_bytes: i64,
    pub file_path: String,
    pub checksum: Option<String>,
    pub created_at: i64,
}

impl NewSegmentRow {
    pub fn new(segment: &NewSegment, size_bytes: u64, checksum: Option<String>) -> Self {
        Self {
            camera_id: segment.camera_id.clone(),
            volume_id: segment.volume_id.clone(),
            start_ms: segment.start.timestamp_millis(),
            duration_ms: i64::try_from(segment.duration.as_millis()).unwrap_or(i64::MAX),
            size_bytes: i64::try_from(size_bytes).unwrap_or(i64::MAX),
            file_path: segment.path.to_string_lossy().into_owned(),
            checksum,
            created_at: Utc::now().timestamp_millis(),
        }
    }
}

/// Position in a `(start_ms, id)` ordered listing. Listing resumes after it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentCursor {
    pub start_ms: i64,
    pub id: i64,
}

impl From<&Segment> for SegmentCursor {
    fn from(segment: &Segment) -> Self {
        Self {
            start_ms: segment.start.timestamp_millis(),
            id: segment.id,
        }
    }
}

/// Filter criteria for listing segments.
///
/// `from_ms`/`to_ms` select segments overlapping `[from_ms, to_ms)`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SegmentFilter {
    pub camera_id: Option<String>,
    pub volume_id: Option<String>,
    pub from_ms: Option<i64>,
    pub to_ms: Option<i64>,
}

impl SegmentFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_camera(mut self, camera_id: impl Into<String>) -> Self {
        self.camera_id = Some(camera_id.into());
        self
    }

    pub fn with_volume(mut self, volume_id: impl Into<String>) -> Self {
        self.volume_id = Some(volume_id.into());
        self
    }

    pub fn with_range(mut self, from: Option<DateTime<Utc>>, to: Option<DateTime<Utc>>) -> Self {
        self.from_ms = from.map(|t| t.timestamp_millis());
        self.to_ms = to.map(|t| t.timestamp_millis());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_new_row_and_back() {
        let start = Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap();
        let new = NewSegment::new(
            "gate",
            "primary",
            start,
            Duration::from_secs(3600),
            "/srv/rec/gate/2026-03-01_12-00-00.mkv",
        );
        let row = NewSegmentRow::new(&new, 1024, None);
        assert_eq!(row.start_ms, start.timestamp_millis());
        assert_eq!(row.duration_ms, 3_600_000);

        let model = SegmentDbModel {
            id: 7,
            camera_id: row.camera_id,
            volume_id: row.volume_id,
            start_ms: row.start_ms,
            duration_ms: row.duration_ms,
            size_bytes: row.size_bytes,
            file_path: row.file_path,
            checksum: None,
            locked: true,
            created_at: row.created_at,
        };
        let segment = model.into_segment().unwrap();
        assert_eq!(segment.start, start);
        assert_eq!(segment.size_bytes, 1024);
        assert!(segment.locked);
        assert_eq!(segment.end(), start + chrono::Duration::hours(1));
    }
}
