//! Retention manager: capacity-driven eviction and lifetime expiry.
//!
//! Eviction walks a volume's segments oldest first (insertion order breaks
//! ties) and never touches locked segments or segments younger than the
//! volume's minimum retention. The whole pass runs under the volume guard,
//! so it sees a consistent segment set.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::Result;
use crate::domain::{RetentionPolicy, Segment, Volume};
use crate::storage::SegmentStore;

/// Whether a reclaim pass reached its target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ReclaimStatus {
    Satisfied,
    /// Every remaining segment is locked or too young.
    RetentionExhausted { shortfall_bytes: u64 },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReclaimReport {
    pub volume_id: String,
    pub target_bytes: u64,
    pub bytes_freed: u64,
    pub deleted: Vec<i64>,
    pub status: ReclaimStatus,
}

impl ReclaimReport {
    pub fn is_exhausted(&self) -> bool {
        matches!(self.status, ReclaimStatus::RetentionExhausted { .. })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SweepReport {
    pub volume_id: String,
    pub bytes_freed: u64,
    pub deleted: Vec<i64>,
}

/// Segments a reclaim pass would delete, in deletion order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReclaimPlan {
    pub victims: Vec<i64>,
    pub bytes: u64,
    pub satisfied: bool,
}

/// Choose eviction victims without touching anything.
///
/// Segments are considered by `(start, id)`. Locked and too-young segments
/// are skipped, never selected.
pub fn plan_reclaim(
    segments: &[Segment],
    target_bytes: u64,
    policy: &RetentionPolicy,
    now: DateTime<Utc>,
) -> ReclaimPlan {
    let mut plan = ReclaimPlan {
        satisfied: target_bytes == 0,
        ..Default::default()
    };
    for segment in candidates(segments, policy, now) {
        if plan.bytes >= target_bytes {
            break;
        }
        plan.victims.push(segment.id);
        plan.bytes += segment.size_bytes;
    }
    plan.satisfied = plan.bytes >= target_bytes;
    plan
}

/// Evictable segments, oldest first.
fn candidates<'a>(
    segments: &'a [Segment],
    policy: &'a RetentionPolicy,
    now: DateTime<Utc>,
) -> impl Iterator<Item = &'a Segment> + 'a {
    let mut ordered: Vec<&Segment> = segments.iter().collect();
    ordered.sort_by_key(|s| (s.start, s.id));
    ordered
        .into_iter()
        .filter(move |s| !policy.protects(s, now))
}

#[derive(Clone)]
pub struct RetentionManager {
    store: SegmentStore,
}

impl RetentionManager {
    pub fn new(store: SegmentStore) -> Self {
        Self { store }
    }

    /// Free at least `target_bytes` on `volume` if retention allows.
    pub async fn reclaim(&self, volume: &Volume, target_bytes: u64) -> Result<ReclaimReport> {
        self.reclaim_at(volume, target_bytes, Utc::now()).await
    }

    pub async fn reclaim_at(
        &self,
        volume: &Volume,
        target_bytes: u64,
        now: DateTime<Utc>,
    ) -> Result<ReclaimReport> {
        let guard = self.store.lock_volume(&volume.id).await;
        let segments = guard.segments().await?;

        let mut bytes_freed = 0;
        let mut deleted = Vec::new();
        for segment in candidates(&segments, &volume.retention, now) {
            if bytes_freed >= target_bytes {
                break;
            }
            match guard.remove(segment.id).await {
                Ok(Some(removed)) => {
                    debug!(
                        volume = %volume.id,
                        segment_id = removed.id,
                        bytes = removed.size_bytes,
                        path = %removed.path.display(),
                        "Evicted segment"
                    );
                    bytes_freed += removed.size_bytes;
                    deleted.push(removed.id);
                }
                Ok(None) => {}
                Err(e) => warn!(
                    volume = %volume.id,
                    segment_id = segment.id,
                    error = %e,
                    "Failed to evict segment"
                ),
            }
        }

        let status = if bytes_freed >= target_bytes {
            ReclaimStatus::Satisfied
        } else {
            ReclaimStatus::RetentionExhausted {
                shortfall_bytes: target_bytes - bytes_freed,
            }
        };

        match status {
            ReclaimStatus::Satisfied if !deleted.is_empty() => info!(
                volume = %volume.id,
                bytes = bytes_freed,
                segments = deleted.len(),
                "Reclaimed space"
            ),
            ReclaimStatus::RetentionExhausted { shortfall_bytes } => warn!(
                volume = %volume.id,
                bytes = bytes_freed,
                shortfall_bytes,
                "Retention exhausted"
            ),
            _ => {}
        }

        Ok(ReclaimReport {
            volume_id: volume.id.clone(),
            target_bytes,
            bytes_freed,
            deleted,
            status,
        })
    }

    /// Delete every segment past the volume's maximum retention.
    pub async fn sweep_expired(&self, volume: &Volume) -> Result<SweepReport> {
        self.sweep_expired_at(volume, Utc::now()).await
    }

    pub async fn sweep_expired_at(&self, volume: &Volume, now: DateTime<Utc>) -> Result<SweepReport> {
        let mut report = SweepReport {
            volume_id: volume.id.clone(),
            ..Default::default()
        };
        if volume.retention.max_retention.is_none() {
            return Ok(report);
        }

        let guard = self.store.lock_volume(&volume.id).await;
        for segment in guard.segments().await? {
            if !volume.retention.is_expired(&segment, now) {
                continue;
            }
            match guard.remove(segment.id).await {
                Ok(Some(removed)) => {
                    report.bytes_freed += removed.size_bytes;
                    report.deleted.push(removed.id);
                }
                Ok(None) => {}
                Err(e) => warn!(
                    volume = %volume.id,
                    segment_id = segment.id,
                    error = %e,
                    "Failed to delete expired segment"
                ),
            }
        }

        if !report.deleted.is_empty() {
            info!(
                volume = %volume.id,
                bytes = report.bytes_freed,
                segments = report.deleted.len(),
                "Deleted expired segments"
            );
        }
        Ok(report)
    }
}
