//! Recorded segments.

use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A completed recorded file and its metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Segment {
    /// Store-assigned id. Increases with insertion order.
    pub id: i64,
    pub camera_id: String,
    pub volume_id: String,
    pub start: DateTime<Utc>,
    pub duration: Duration,
    pub size_bytes: u64,
    pub path: PathBuf,
    /// Hex SHA-256 of the file, when checksumming is enabled.
    pub checksum: Option<String>,
    /// Must not be evicted (e.g. flagged as evidence).
    pub locked: bool,
}

impl Segment {
    pub fn end(&self) -> DateTime<Utc> {
        self.start + chrono::Duration::from_std(self.duration).unwrap_or_default()
    }

    /// Time elapsed since the segment started. Zero for segments in the future.
    pub fn age(&self, now: DateTime<Utc>) -> Duration {
        (now - self.start).to_std().unwrap_or(Duration::ZERO)
    }

    /// Whether the segment overlaps the half-open range `[from, to)`.
    pub fn overlaps(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> bool {
        self.start < to && self.end() > from
    }
}

/// A closed segment file waiting to be registered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewSegment {
    pub camera_id: String,
    pub volume_id: String,
    pub start: DateTime<Utc>,
    pub duration: Duration,
    pub path: PathBuf,
}

impl NewSegment {
    pub fn new(
        camera_id: impl Into<String>,
        volume_id: impl Into<String>,
        start: DateTime<Utc>,
        duration: Duration,
        path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            camera_id: camera_id.into(),
            volume_id: volume_id.into(),
            start,
            duration,
            path: path.into(),
        }
    }
}
