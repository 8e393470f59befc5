//! Durable segment index with per-volume serialization.
//!
//! `register` and `remove` for one volume never interleave. Callers that need
//! a stable view across several operations (retention scans) take the
//! volume guard with [`SegmentStore::lock_volume`] and work through it.

use std::collections::VecDeque;
use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::Stream;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, info, warn};

use crate::database::DbPool;
use crate::database::models::{NewSegmentRow, SegmentCursor, SegmentDbModel, SegmentFilter};
use crate::database::repositories::{SegmentRepository, SegmentTxOps, SqlxSegmentRepository};
use crate::domain::{NewSegment, Segment};
use crate::utils::fs;
use crate::{Error, Result};

/// Rows fetched per page by [`SegmentListing`].
const DEFAULT_PAGE_SIZE: i64 = 256;

/// Read-only metadata query used by playback collaborators.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentQuery {
    pub camera_id: Option<String>,
    pub volume_id: Option<String>,
    /// Inclusive lower bound of the time range.
    pub from: Option<DateTime<Utc>>,
    /// Exclusive upper bound of the time range.
    pub to: Option<DateTime<Utc>>,
}

impl From<&SegmentQuery> for SegmentFilter {
    fn from(query: &SegmentQuery) -> Self {
        SegmentFilter {
            camera_id: query.camera_id.clone(),
            volume_id: query.volume_id.clone(),
            ..Default::default()
        }
        .with_range(query.from, query.to)
    }
}

#[derive(Clone)]
pub struct SegmentStore {
    repo: SqlxSegmentRepository,
    locks: Arc<DashMap<String, Arc<Mutex<()>>>>,
    checksum: bool,
    page_size: i64,
}

impl SegmentStore {
    pub fn new(pool: DbPool) -> Self {
        Self {
            repo: SqlxSegmentRepository::new(pool),
            locks: Arc::new(DashMap::new()),
            checksum: false,
            page_size: DEFAULT_PAGE_SIZE,
        }
    }

    /// Store a SHA-256 of every registered file.
    pub fn with_checksums(mut self, enabled: bool) -> Self {
        self.checksum = enabled;
        self
    }

    pub fn with_page_size(mut self, page_size: i64) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    /// Take the exclusive mutation guard for one volume.
    pub async fn lock_volume(&self, volume_id: &str) -> VolumeGuard<'_> {
        let lock = Arc::clone(&self.locks.entry(volume_id.to_string()).or_default());
        let guard = lock.lock_owned().await;
        VolumeGuard {
            store: self,
            volume_id: volume_id.to_string(),
            _guard: guard,
        }
    }

    /// Append a closed segment. Fails with `DuplicateSegment` if
    /// `(camera, start)` is already recorded.
    pub async fn register(&self, segment: NewSegment) -> Result<Segment> {
        let guard = self.lock_volume(&segment.volume_id).await;
        guard.register(segment).await
    }

    /// Like [`register`](Self::register), but a duplicate key is replaced by
    /// the newer write.
    pub async fn register_or_replace(&self, segment: NewSegment) -> Result<Segment> {
        let guard = self.lock_volume(&segment.volume_id).await;
        match guard.register(segment.clone()).await {
            Err(Error::DuplicateSegment { camera_id, start_ms }) => {
                warn!(
                    camera_id = %camera_id,
                    start_ms,
                    path = %segment.path.display(),
                    "Duplicate segment, keeping the newer write"
                );
                guard.replace(segment).await
            }
            other => other,
        }
    }

    /// Delete a segment's file and metadata. Already-gone segments succeed
    /// with `None`.
    pub async fn remove(&self, id: i64) -> Result<Option<Segment>> {
        let Some(row) = self.repo.find_segment(id).await? else {
            debug!(segment_id = id, "Segment already removed");
            return Ok(None);
        };
        let guard = self.lock_volume(&row.volume_id).await;
        guard.remove(id).await
    }

    pub async fn get(&self, id: i64) -> Result<Segment> {
        self.repo.get_segment(id).await?.into_segment()
    }

    /// Flag or unflag a segment as evidence. Locked segments are never evicted.
    pub async fn set_locked(&self, id: i64, locked: bool) -> Result<()> {
        self.repo.set_locked(id, locked).await?;
        info!(segment_id = id, locked, "Segment lock changed");
        Ok(())
    }

    /// Lazy listing of a volume's segments, oldest first.
    pub fn list(&self, volume_id: &str, filter: SegmentFilter) -> SegmentListing {
        SegmentListing::new(
            self.repo.clone(),
            filter.with_volume(volume_id),
            self.page_size,
        )
    }

    /// Lazy listing across all volumes.
    pub fn list_all(&self, filter: SegmentFilter) -> SegmentListing {
        SegmentListing::new(self.repo.clone(), filter, self.page_size)
    }

    /// Segments overlapping the query's time range, oldest first.
    pub async fn query(&self, query: &SegmentQuery) -> Result<Vec<Segment>> {
        self.list_all(SegmentFilter::from(query)).collect().await
    }

    /// Sum of tracked segment sizes on a volume.
    pub async fn tracked_bytes(&self, volume_id: &str) -> Result<u64> {
        self.repo.total_size(volume_id).await
    }

    pub(crate) fn repository(&self) -> &SqlxSegmentRepository {
        &self.repo
    }

    fn pool(&self) -> &DbPool {
        self.repo.pool()
    }
}

/// Exclusive access to one volume's segment set.
pub struct VolumeGuard<'a> {
    store: &'a SegmentStore,
    volume_id: String,
    _guard: OwnedMutexGuard<()>,
}

impl VolumeGuard<'_> {
    pub fn volume_id(&self) -> &str {
        &self.volume_id
    }

    /// Every segment on the volume, ordered by start then insertion.
    pub async fn segments(&self) -> Result<Vec<Segment>> {
        self.store
            .repo
            .list_for_volume(&self.volume_id)
            .await?
            .into_iter()
            .map(SegmentDbModel::into_segment)
            .collect()
    }

    pub async fn tracked_bytes(&self) -> Result<u64> {
        self.store.repo.total_size(&self.volume_id).await
    }

    pub async fn register(&self, segment: NewSegment) -> Result<Segment> {
        let row = self.prepare(&segment).await?;
        let id = self.store.repo.insert_segment(&row).await?;
        debug!(
            segment_id = id,
            camera_id = %row.camera_id,
            volume = %self.volume_id,
            bytes = row.size_bytes,
            "Segment registered"
        );
        into_registered(id, row)
    }

    async fn replace(&self, segment: NewSegment) -> Result<Segment> {
        let row = self.prepare(&segment).await?;
        let (id, replaced) = self.store.repo.replace_segment(&row).await?;
        for old in replaced {
            if old.file_path != row.file_path {
                fs::remove_file_if_exists(Path::new(&old.file_path)).await?;
            }
        }
        into_registered(id, row)
    }

    async fn prepare(&self, segment: &NewSegment) -> Result<NewSegmentRow> {
        if segment.volume_id != self.volume_id {
            return Err(Error::validation(format!(
                "segment for volume {} registered under volume {}",
                segment.volume_id, self.volume_id
            )));
        }

        fs::sync_file(&segment.path).await?;
        let size = fs::file_len(&segment.path).await?;
        if size == 0 {
            return Err(Error::validation(format!(
                "segment {} is empty",
                segment.path.display()
            )));
        }
        let checksum = if self.store.checksum {
            Some(fs::sha256_file(&segment.path).await?)
        } else {
            None
        };
        Ok(NewSegmentRow::new(segment, size, checksum))
    }

    /// Delete file and metadata as one logical step.
    ///
    /// The row is deleted inside a transaction that only commits once the
    /// file is gone, so a failed delete leaves both in place.
    pub async fn remove(&self, id: i64) -> Result<Option<Segment>> {
        let mut tx = self.store.pool().begin().await?;
        let Some(row) = SegmentTxOps::delete(&mut *tx, id).await? else {
            tx.rollback().await?;
            return Ok(None);
        };
        if row.volume_id != self.volume_id {
            tx.rollback().await?;
            return Err(Error::validation(format!(
                "segment {} lives on volume {}, not {}",
                id, row.volume_id, self.volume_id
            )));
        }

        match fs::remove_file_if_exists(Path::new(&row.file_path)).await {
            Ok(existed) => {
                tx.commit().await?;
                if !existed {
                    debug!(segment_id = id, path = %row.file_path, "Segment file was already gone");
                }
                row.into_segment().map(Some)
            }
            Err(e) => {
                tx.rollback().await?;
                Err(e)
            }
        }
    }

    /// Drop metadata whose file no longer exists.
    pub(crate) async fn forget(&self, id: i64) -> Result<bool> {
        let mut tx = self.store.pool().begin().await?;
        let Some(row) = SegmentTxOps::delete(&mut *tx, id).await? else {
            tx.rollback().await?;
            return Ok(false);
        };
        if fs::exists(Path::new(&row.file_path)).await? {
            tx.rollback().await?;
            return Ok(false);
        }
        tx.commit().await?;
        Ok(true)
    }
}

fn into_registered(id: i64, row: NewSegmentRow) -> Result<Segment> {
    SegmentDbModel {
        id,
        camera_id: row.camera_id,
        volume_id: row.volume_id,
        start_ms: row.start_ms,
        duration_ms: row.duration_ms,
        size_bytes: row.size_bytes,
        file_path: row.file_path,
        checksum: row.checksum,
        locked: false,
        created_at: row.created_at,
    }
    .into_segment()
}

/// Finite, restartable, lazily paged sequence of segments ordered by
/// `(start, id)`.
pub struct SegmentListing {
    repo: SqlxSegmentRepository,
    filter: SegmentFilter,
    page_size: i64,
    cursor: Option<SegmentCursor>,
    buffer: VecDeque<Segment>,
    exhausted: bool,
}

impl SegmentListing {
    fn new(repo: SqlxSegmentRepository, filter: SegmentFilter, page_size: i64) -> Self {
        Self {
            repo,
            filter,
            page_size,
            cursor: None,
            buffer: VecDeque::new(),
            exhausted: false,
        }
    }

    /// Resume after a previously returned position.
    pub fn resume_after(mut self, cursor: SegmentCursor) -> Self {
        self.cursor = Some(cursor);
        self.buffer.clear();
        self.exhausted = false;
        self
    }

    /// Position of the last segment handed out.
    pub fn cursor(&self) -> Option<SegmentCursor> {
        self.cursor
    }

    /// Rewind to the beginning.
    pub fn restart(&mut self) {
        self.cursor = None;
        self.buffer.clear();
        self.exhausted = false;
    }

    pub async fn next(&mut self) -> Result<Option<Segment>> {
        if self.buffer.is_empty() && !self.exhausted {
            let page = self
                .repo
                .list_page(&self.filter, self.cursor, self.page_size)
                .await?;
            if (page.len() as i64) < self.page_size {
                self.exhausted = true;
            }
            for row in page {
                self.buffer.push_back(row.into_segment()?);
            }
        }

        let next = self.buffer.pop_front();
        if let Some(segment) = &next {
            self.cursor = Some(SegmentCursor::from(segment));
        }
        Ok(next)
    }

    pub async fn collect(mut self) -> Result<Vec<Segment>> {
        let mut out = Vec::new();
        while let Some(segment) = self.next().await? {
            out.push(segment);
        }
        Ok(out)
    }

    pub fn into_stream(self) -> impl Stream<Item = Result<Segment>> + Send {
        futures::stream::try_unfold(self, |mut listing| async move {
            Ok(listing.next().await?.map(|segment| (segment, listing)))
        })
    }
}
