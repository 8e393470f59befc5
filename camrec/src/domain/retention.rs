//! Retention policy value object.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::Segment;

/// Rules governing segment lifetime and target free capacity on one volume.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetentionPolicy {
    /// Free bytes the volume should keep. Eviction starts below this.
    pub min_free_bytes: u64,
    /// Segments younger than this are never evicted, even under pressure.
    pub min_retention: Duration,
    /// Segments older than this are always deleted. `None` keeps them forever.
    pub max_retention: Option<Duration>,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            min_free_bytes: 50 * (1 << 30),
            min_retention: Duration::from_secs(24 * 60 * 60),
            max_retention: None,
        }
    }
}

impl RetentionPolicy {
    /// Whether a segment must survive capacity-driven eviction.
    pub fn protects(&self, segment: &Segment, now: DateTime<Utc>) -> bool {
        segment.locked || segment.age(now) < self.min_retention
    }

    /// Whether a segment has outlived the maximum retention.
    pub fn is_expired(&self, segment: &Segment, now: DateTime<Utc>) -> bool {
        match self.max_retention {
            Some(max) => !segment.locked && segment.age(now) > max,
            None => false,
        }
    }
}
