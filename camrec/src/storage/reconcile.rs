//! Startup reconciliation of on-disk segment files against the index.
//!
//! The filesystem wins: metadata without a file is pruned, and files without
//! metadata are handled by the configured [`OrphanPolicy`].

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use super::store::{SegmentStore, VolumeGuard};
use crate::domain::volume::QUARANTINE_DIR;
use crate::domain::{NewSegment, Volume};
use crate::utils::filename::{has_segment_extension, parse_segment_start};
use crate::utils::fs;
use crate::{Error, Result};

/// What to do with a segment file that has no metadata.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrphanPolicy {
    /// Register it as a valid segment.
    Import,
    /// Move it under the volume's quarantine directory.
    #[default]
    Quarantine,
    /// Delete it.
    Delete,
}

#[derive(Debug, Clone)]
pub struct ReconcileOptions {
    pub orphan_policy: OrphanPolicy,
    /// Segment file extension, without the dot.
    pub extension: String,
}

impl Default for ReconcileOptions {
    fn default() -> Self {
        Self {
            orphan_policy: OrphanPolicy::default(),
            extension: "mkv".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconcileReport {
    /// Metadata records removed because their file is gone.
    pub pruned: usize,
    /// Orphan files registered as segments.
    pub imported: usize,
    /// Orphan files moved to quarantine.
    pub quarantined: usize,
    /// Orphan files deleted.
    pub deleted: usize,
    /// Volumes that could not be scanned.
    pub failed_volumes: Vec<String>,
}

impl ReconcileReport {
    /// Whether the run changed nothing.
    pub fn is_noop(&self) -> bool {
        self.pruned == 0 && self.imported == 0 && self.quarantined == 0 && self.deleted == 0
    }

    fn merge(&mut self, other: ReconcileReport) {
        self.pruned += other.pruned;
        self.imported += other.imported;
        self.quarantined += other.quarantined;
        self.deleted += other.deleted;
        self.failed_volumes.extend(other.failed_volumes);
    }
}

impl SegmentStore {
    /// Bring the index and every volume's recording directory back in sync.
    ///
    /// Running it twice in a row is a no-op the second time.
    pub async fn reconcile(
        &self,
        volumes: &[Volume],
        options: &ReconcileOptions,
    ) -> Result<ReconcileReport> {
        let mut report = ReconcileReport::default();
        for volume in volumes {
            match self.reconcile_volume(volume, options).await {
                Ok(volume_report) => report.merge(volume_report),
                Err(e) if !matches!(e, Error::Database(_)) => {
                    error!(volume = %volume.id, error = %e, "Failed to reconcile volume");
                    report.failed_volumes.push(volume.id.clone());
                }
                Err(e) => return Err(e),
            }
        }
        info!(
            pruned = report.pruned,
            imported = report.imported,
            quarantined = report.quarantined,
            deleted = report.deleted,
            "Reconciliation finished"
        );
        Ok(report)
    }

    async fn reconcile_volume(
        &self,
        volume: &Volume,
        options: &ReconcileOptions,
    ) -> Result<ReconcileReport> {
        let guard = self.lock_volume(&volume.id).await;
        let mut report = ReconcileReport::default();

        let mut known = HashSet::new();
        for segment in guard.segments().await? {
            if fs::exists(&segment.path).await? {
                known.insert(segment.path);
            } else if guard.forget(segment.id).await? {
                warn!(
                    volume = %volume.id,
                    segment_id = segment.id,
                    path = %segment.path.display(),
                    "Pruned metadata with no backing file"
                );
                report.pruned += 1;
            }
        }

        for camera_dir in fs::list_dirs(&volume.root).await? {
            let Some(camera_id) = dir_name(&camera_dir) else {
                continue;
            };
            if camera_id.starts_with('.') || camera_id == QUARANTINE_DIR {
                continue;
            }

            for path in fs::list_files(&camera_dir).await? {
                if known.contains(&path) || !is_segment_file(&path, &options.extension) {
                    continue;
                }
                self.handle_orphan(&guard, volume, &camera_id, &path, options, &mut report)
                    .await?;
            }
        }

        Ok(report)
    }

    async fn handle_orphan(
        &self,
        guard: &VolumeGuard<'_>,
        volume: &Volume,
        camera_id: &str,
        path: &Path,
        options: &ReconcileOptions,
        report: &mut ReconcileReport,
    ) -> Result<()> {
        if fs::file_len(path).await? == 0 {
            fs::remove_file_if_exists(path).await?;
            info!(volume = %volume.id, path = %path.display(), "Deleted empty orphan file");
            report.deleted += 1;
            return Ok(());
        }

        let start = parse_segment_start(path);
        match (options.orphan_policy, start) {
            (OrphanPolicy::Delete, _) => {
                fs::remove_file_if_exists(path).await?;
                info!(volume = %volume.id, path = %path.display(), "Deleted orphan file");
                report.deleted += 1;
            }
            (OrphanPolicy::Import, Some(start)) => {
                let modified = fs::modified_at(path).await?;
                let duration = (modified - start).to_std().unwrap_or(Duration::ZERO);
                let segment = NewSegment::new(camera_id, &volume.id, start, duration, path);
                match guard.register(segment).await {
                    Ok(segment) => {
                        info!(
                            volume = %volume.id,
                            segment_id = segment.id,
                            path = %path.display(),
                            "Imported orphan file"
                        );
                        report.imported += 1;
                    }
                    Err(Error::DuplicateSegment { .. }) => {
                        quarantine_file(volume, camera_id, path).await?;
                        report.quarantined += 1;
                    }
                    Err(e) => return Err(e),
                }
            }
            (OrphanPolicy::Import, None) | (OrphanPolicy::Quarantine, _) => {
                quarantine_file(volume, camera_id, path).await?;
                report.quarantined += 1;
            }
        }
        Ok(())
    }
}

/// Move a file into `<root>/.quarantine/<camera>/`, never overwriting.
pub async fn quarantine_file(volume: &Volume, camera_id: &str, path: &Path) -> Result<PathBuf> {
    let file_name = path
        .file_name()
        .ok_or_else(|| Error::validation(format!("{} has no file name", path.display())))?;
    let dir = volume.quarantine_dir().join(camera_id);
    let mut target = dir.join(file_name);
    let mut n = 1;
    while fs::exists(&target).await? {
        target = dir.join(format!("{}.{}", file_name.to_string_lossy(), n));
        n += 1;
    }
    fs::move_file(path, &target).await?;
    warn!(
        volume = %volume.id,
        camera_id,
        path = %path.display(),
        target = %target.display(),
        "Quarantined file"
    );
    Ok(target)
}

fn dir_name(path: &Path) -> Option<String> {
    path.file_name()
        .and_then(|n| n.to_str())
        .map(str::to_string)
}

fn is_segment_file(path: &Path, extension: &str) -> bool {
    let hidden = path
        .file_name()
        .and_then(|n| n.to_str())
        .is_some_and(|n| n.starts_with('.'));
    !hidden && has_segment_extension(path, extension)
}
